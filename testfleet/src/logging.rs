//! Tracing subscriber setup for binaries. The library itself only emits
//! events.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{LabError, Result};

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `level`. `json` switches to one JSON object per line.
pub fn init(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("testfleet={},info", level).into());

    tracing_subscriber::registry()
        .with(filter)
        .with(json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!json).then(tracing_subscriber::fmt::layer))
        .try_init()
        .map_err(|e| LabError::Config(format!("logging already initialized: {}", e)))
}
