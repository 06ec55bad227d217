//! Lab configuration
//!
//! Loaded from TOML, then overridden by `TESTFLEET_*` environment variables.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::broker::{Credentials, RemoteBrokerConfig, DEFAULT_PORT, DEFAULT_PROTOCOL};
use crate::device::{Device, Platform};
use crate::error::{LabError, Result};
use crate::pool::DevicesByPlatform;

/// Which allocation backend serves the lab
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// File-backed local device pool
    #[default]
    Local,
    /// HTTP device farm
    Remote,
}

impl std::str::FromStr for Backend {
    type Err = LabError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(LabError::Config(format!("Unknown backend: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabConfig {
    #[serde(default)]
    pub backend: Backend,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub fixtures: FixturesConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Shared lock table file
    #[serde(default = "default_lock_table")]
    pub lock_table: PathBuf,

    /// How long to wait for the cross-process lock
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,

    /// Reclaim lock entries older than this at startup (0 = never)
    #[serde(default)]
    pub stale_lock_ttl_secs: u64,

    /// Automation server for locally attached devices
    #[serde(default = "default_local_endpoint")]
    pub local_endpoint: String,

    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            lock_table: default_lock_table(),
            lock_timeout_ms: default_lock_timeout_ms(),
            stale_lock_ttl_secs: 0,
            local_endpoint: default_local_endpoint(),
            devices: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    pub id: String,
    pub platform: Platform,
    #[serde(default)]
    pub device_name: String,
    #[serde(default)]
    pub platform_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// Device farm base URL
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Lease requested per allocation
    #[serde(default = "default_reserve_timeout")]
    pub reserve_timeout_secs: u64,

    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_protocol")]
    pub default_protocol: String,

    #[serde(default = "default_port")]
    pub default_port: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: None,
            api_key: None,
            username: None,
            password: None,
            reserve_timeout_secs: default_reserve_timeout(),
            request_timeout_secs: default_request_timeout(),
            default_protocol: default_protocol(),
            default_port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturesConfig {
    /// Directory holding `<type>.json` / `<type>.yaml` documents
    #[serde(default = "default_fixture_root")]
    pub root: PathBuf,

    /// Keys rewritten as `local+ctx@domain`
    #[serde(default = "default_email_fields")]
    pub email_fields: Vec<String>,

    /// Keys rewritten as `value_ctx`
    #[serde(default = "default_identifier_fields")]
    pub identifier_fields: Vec<String>,
}

impl Default for FixturesConfig {
    fn default() -> Self {
        Self {
            root: default_fixture_root(),
            email_fields: default_email_fields(),
            identifier_fields: default_identifier_fields(),
        }
    }
}

// Defaults
fn default_lock_table() -> PathBuf { PathBuf::from("device-locks.json") }
fn default_lock_timeout_ms() -> u64 { 10_000 }
fn default_local_endpoint() -> String { format!("{}://127.0.0.1:{}", DEFAULT_PROTOCOL, DEFAULT_PORT) }
fn default_reserve_timeout() -> u64 { 300 }
fn default_request_timeout() -> u64 { 30 }
fn default_protocol() -> String { DEFAULT_PROTOCOL.to_string() }
fn default_port() -> u16 { DEFAULT_PORT }
fn default_fixture_root() -> PathBuf { PathBuf::from("fixtures") }
fn default_email_fields() -> Vec<String> { vec!["email".to_string()] }
fn default_identifier_fields() -> Vec<String> { vec!["username".to_string()] }

impl LabConfig {
    /// Load from `path`; a missing file yields the defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            info!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)
            .map_err(|e| LabError::Config(format!("{}: {}", path.display(), e)))?;
        let config = Self::from_toml(&content)?;
        debug!(path = %path.display(), backend = ?config.backend, "Loaded config");
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `TESTFLEET_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, keyed by environment variable name
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(backend) = lookup("TESTFLEET_BACKEND") {
            self.backend = backend.parse()?;
        }
        if let Some(url) = lookup("TESTFLEET_BROKER_URL") {
            self.broker.url = Some(url);
        }
        if let Some(key) = lookup("TESTFLEET_BROKER_API_KEY") {
            self.broker.api_key = Some(key);
        }
        if let Some(username) = lookup("TESTFLEET_BROKER_USERNAME") {
            self.broker.username = Some(username);
        }
        if let Some(password) = lookup("TESTFLEET_BROKER_PASSWORD") {
            self.broker.password = Some(password);
        }
        if let Some(path) = lookup("TESTFLEET_LOCK_TABLE") {
            self.pool.lock_table = PathBuf::from(path);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.backend == Backend::Remote
            && self.broker.url.as_deref().map_or(true, |u| u.trim().is_empty())
        {
            return Err(LabError::Config(
                "backend = \"remote\" requires broker.url".to_string(),
            ));
        }

        if self.pool.lock_timeout_ms == 0 {
            return Err(LabError::Config(
                "pool.lock_timeout_ms must be greater than 0".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for device in &self.pool.devices {
            if device.id.trim().is_empty() {
                return Err(LabError::Config("pool device with empty id".to_string()));
            }
            if !seen.insert(device.id.as_str()) {
                return Err(LabError::Config(format!(
                    "duplicate pool device id: {}",
                    device.id
                )));
            }
        }

        Ok(())
    }

    /// Pool devices grouped by platform, in declaration order
    pub fn devices_by_platform(&self) -> DevicesByPlatform {
        let mut grouped = DevicesByPlatform::new();
        for entry in &self.pool.devices {
            grouped.entry(entry.platform).or_default().push(Device::new(
                entry.id.clone(),
                entry.platform,
                entry.device_name.clone(),
                entry.platform_version.clone(),
            ));
        }
        grouped
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.pool.lock_timeout_ms)
    }

    pub fn stale_lock_ttl(&self) -> Option<Duration> {
        (self.pool.stale_lock_ttl_secs > 0).then(|| Duration::from_secs(self.pool.stale_lock_ttl_secs))
    }

    pub fn broker_config(&self) -> Result<RemoteBrokerConfig> {
        let base_url = self
            .broker
            .url
            .clone()
            .ok_or_else(|| LabError::Config("broker.url is not set".to_string()))?;

        Ok(RemoteBrokerConfig {
            base_url,
            credentials: Credentials::from_parts(
                self.broker.api_key.clone(),
                self.broker.username.clone(),
                self.broker.password.clone(),
            ),
            reserve_timeout: Duration::from_secs(self.broker.reserve_timeout_secs),
            request_timeout: Duration::from_secs(self.broker.request_timeout_secs),
            default_protocol: self.broker.default_protocol.clone(),
            default_port: self.broker.default_port,
        })
    }
}
