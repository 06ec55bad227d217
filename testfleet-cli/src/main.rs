//! testfleet: operator CLI for the device pool and remote device farm
//!
//! Inspect and repair the shared lock table, allocate or release devices by
//! hand, and probe the configured device farm.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, warn};

use testfleet::allocation::{build_allocator, local_pool};
use testfleet::{
    Allocation, Backend, Capabilities, LabConfig, LockTable, Platform, RemoteBroker,
};

#[derive(Parser, Debug)]
#[command(name = "testfleet")]
#[command(about = "Device pool and device farm operations for parallel UI test runs")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "TESTFLEET_CONFIG", default_value = "testfleet.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "TESTFLEET_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, env = "TESTFLEET_LOG_JSON", default_value = "false")]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Show the backend and device availability
    Status,

    /// Print the lock table
    Locks,

    /// Remove lock table entries
    ClearLocks {
        /// Only remove entries older than this many seconds
        #[arg(long)]
        older_than: Option<u64>,
    },

    /// Allocate a device through the configured backend
    Allocate {
        #[arg(short, long)]
        platform: Platform,

        #[arg(short, long)]
        test_id: String,

        /// Extra capability, `key=value` (value parsed as JSON when possible)
        #[arg(short = 'C', long = "capability", value_parser = parse_capability)]
        capabilities: Vec<(String, Value)>,
    },

    /// Release a test's device
    Release {
        #[arg(short, long)]
        test_id: String,

        /// Remote device to release (remote backend; allocations do not
        /// outlive the allocating process otherwise)
        #[arg(long)]
        device_id: Option<String>,

        /// Remote session of the allocation
        #[arg(long)]
        session_id: Option<String>,

        /// Platform of the remote allocation
        #[arg(long, default_value = "android")]
        platform: Platform,
    },

    /// Check device farm health and list its devices
    Probe,
}

fn parse_capability(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {}", raw))?;
    if key.is_empty() {
        return Err(format!("empty capability name in {}", raw));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    testfleet::logging::init(&cli.log_level, cli.log_json)?;

    let mut config = LabConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    config.apply_env()?;
    config.validate()?;

    match cli.command {
        Commands::Status => status(&config).await,
        Commands::Locks => locks(&config),
        Commands::ClearLocks { older_than } => clear_locks(&config, older_than),
        Commands::Allocate {
            platform,
            test_id,
            capabilities,
        } => {
            let caps: Capabilities = capabilities.into_iter().collect();
            allocate(&config, platform, &test_id, &caps).await
        }
        Commands::Release {
            test_id,
            device_id,
            session_id,
            platform,
        } => release(&config, &test_id, device_id, session_id, platform).await,
        Commands::Probe => probe(&config).await,
    }
}

fn lock_table(config: &LabConfig) -> LockTable {
    LockTable::new(config.pool.lock_table.clone(), config.lock_timeout())
}

async fn status(config: &LabConfig) -> anyhow::Result<()> {
    match config.backend {
        Backend::Local => {
            let pool = local_pool(config);
            let available = pool.available();

            println!("Backend:    local");
            println!("Lock table: {}", config.pool.lock_table.display());
            println!();
            for device in pool.devices() {
                let holder = pool
                    .allocations()
                    .into_iter()
                    .find(|a| a.device_id == device.id)
                    .map(|a| a.test_id)
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:<8} {:<24} {:<20} {:<6} {}",
                    device.platform,
                    device.id,
                    device.device_name,
                    if device.in_use { "busy" } else { "free" },
                    holder
                );
            }
            println!();
            for platform in [Platform::Android, Platform::Ios] {
                let free = available.get(&platform).map_or(0, Vec::len);
                println!("  {} free: {}", platform, free);
            }
            Ok(())
        }
        Backend::Remote => {
            println!("Backend: remote ({})", config.broker.url.as_deref().unwrap_or("-"));
            probe(config).await
        }
    }
}

fn locks(config: &LabConfig) -> anyhow::Result<()> {
    let entries = lock_table(config).snapshot()?;
    println!("{}", serde_json::to_string_pretty(&entries)?);
    Ok(())
}

fn clear_locks(config: &LabConfig, older_than: Option<u64>) -> anyhow::Result<()> {
    let removed = lock_table(config).clear(older_than.map(Duration::from_secs))?;
    for (test_id, entry) in &removed {
        info!(test_id = %test_id, device = %entry.device_id, since = %entry.timestamp, "Cleared device lock");
    }
    println!("Removed {} lock(s)", removed.len());
    Ok(())
}

async fn allocate(
    config: &LabConfig,
    platform: Platform,
    test_id: &str,
    caps: &Capabilities,
) -> anyhow::Result<()> {
    let allocator = build_allocator(config)?;
    let allocation = allocator.allocate(platform, test_id, caps).await?;
    println!("{}", serde_json::to_string_pretty(&allocation)?);

    if config.backend == Backend::Remote {
        warn!(
            test_id = %test_id,
            "Remote allocations are not persisted; release with --device-id before the lease expires"
        );
    }
    Ok(())
}

async fn release(
    config: &LabConfig,
    test_id: &str,
    device_id: Option<String>,
    session_id: Option<String>,
    platform: Platform,
) -> anyhow::Result<()> {
    let released = match (config.backend, device_id) {
        (Backend::Local, _) => build_allocator(config)?.release(test_id).await,
        (Backend::Remote, Some(device_id)) => {
            let broker = RemoteBroker::new(config.broker_config()?)?;
            let mut allocation = Allocation::local(test_id, platform, &device_id);
            allocation.session_id = session_id;
            broker.remember(allocation);
            broker.release_device(test_id).await
        }
        (Backend::Remote, None) => {
            bail!("remote release needs --device-id");
        }
    };

    if !released {
        bail!("release of {} did not complete", test_id);
    }
    println!("Released {}", test_id);
    Ok(())
}

async fn probe(config: &LabConfig) -> anyhow::Result<()> {
    if config.broker.url.is_none() {
        bail!("broker.url is not configured");
    }
    let broker = RemoteBroker::new(config.broker_config()?)?;

    broker.status().await.context("device farm health check failed")?;
    println!("Device farm: healthy");

    for platform in [Platform::Android, Platform::Ios] {
        match broker.list_devices(platform).await {
            Ok(devices) => {
                let busy = devices.iter().filter(|d| d.busy).count();
                println!(
                    "  {}: {} device(s), {} busy",
                    platform,
                    devices.len(),
                    busy
                );
                for device in devices {
                    println!("    {} {}", device.id, if device.busy { "busy" } else { "free" });
                }
            }
            Err(e) => println!("  {}: listing failed ({})", platform, e),
        }
    }
    Ok(())
}
