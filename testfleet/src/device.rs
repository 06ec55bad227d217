//! Device and allocation models shared by both allocation backends

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::LabError;

/// Automation capabilities passed through to the device farm and the session
pub type Capabilities = serde_json::Map<String, serde_json::Value>;

/// Mobile platform a device runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Android,
    Ios,
}

impl Platform {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Android => "android",
            Self::Ios => "ios",
        }
    }

    /// Spelling used for the `platformName` capability and by device farms
    pub fn capability_name(&self) -> &'static str {
        match self {
            Self::Android => "Android",
            Self::Ios => "iOS",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "android" => Ok(Self::Android),
            "ios" => Ok(Self::Ios),
            other => Err(LabError::Config(format!("Unknown platform: {}", other))),
        }
    }
}

/// A device in the local pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    /// Device id or UDID, unique across the pool
    pub id: String,
    pub platform: Platform,
    pub device_name: String,
    pub platform_version: String,
    /// Whether an allocation currently holds this device
    #[serde(default)]
    pub in_use: bool,
}

impl Device {
    pub fn new(
        id: impl Into<String>,
        platform: Platform,
        device_name: impl Into<String>,
        platform_version: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            platform,
            device_name: device_name.into(),
            platform_version: platform_version.into(),
            in_use: false,
        }
    }
}

/// Binding between a test and a reserved device, valid until released
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Allocation {
    pub test_id: String,
    pub platform: Platform,
    pub device_id: String,
    /// Remote session id (broker allocations only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Opaque connection endpoint (broker allocations only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    pub allocated_at: DateTime<Utc>,
}

impl Allocation {
    pub fn local(test_id: &str, platform: Platform, device_id: &str) -> Self {
        Self {
            test_id: test_id.to_string(),
            platform,
            device_id: device_id.to_string(),
            session_id: None,
            endpoint: None,
            allocated_at: Utc::now(),
        }
    }
}
