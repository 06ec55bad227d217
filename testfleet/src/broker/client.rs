//! Remote Device Broker: the allocation contract over a device-farm HTTP API
//!
//! ## Protocol
//!
//! - `GET  /status` health probe
//! - `GET  /devices?platformName=P` → `{devices: [{id, busy, ..}]}`
//! - `POST /device {platformName, capabilities, testId, reserveTimeout}` →
//!   `{device, sessionId, endpoint}`
//! - `POST /device/{id}/release {sessionId, testId}`
//!
//! ## Idempotency
//!
//! Allocations are cached per test id, so a retried setup step gets the
//! cached allocation without another `POST /device`. The cache lives in
//! process memory only. A worker that restarts between retries has lost it
//! and may allocate a second remote device, bounded by the lease.

use dashmap::DashMap;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::endpoint::{ConnectionTarget, DEFAULT_PORT, DEFAULT_PROTOCOL};
use crate::device::{Allocation, Capabilities, Platform};
use crate::error::LabError;

/// Header carrying the farm API key
pub const API_KEY_HEADER: &str = "X-API-Key";

/// Error types for device-farm calls
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    /// Service could not be reached
    #[error("Network error: {0}")]
    Network(String),

    /// Service answered with a non-success status
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    /// Service explicitly refused the allocation
    #[error("Allocation refused: {0}")]
    Conflict(String),

    /// Response could not be understood
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Broker configuration is unusable
    #[error("Invalid broker configuration: {0}")]
    Config(String),
}

impl From<BrokerError> for LabError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Conflict(reason) => LabError::AllocationConflict(reason),
            BrokerError::Config(reason) => LabError::Config(reason),
            other => LabError::RemoteUnavailable(other.to_string()),
        }
    }
}

/// How requests authenticate; exactly one applies
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Credentials {
    /// Sent as `X-API-Key`
    ApiKey(String),
    /// HTTP Basic
    Basic { username: String, password: String },
    #[default]
    None,
}

impl Credentials {
    /// Pick the credential method: API key first, then a complete
    /// username/password pair, else unauthenticated.
    pub fn from_parts(
        api_key: Option<String>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        if let Some(key) = api_key.filter(|k| !k.is_empty()) {
            return Self::ApiKey(key);
        }
        match (username, password) {
            (Some(username), Some(password)) if !username.is_empty() => {
                Self::Basic { username, password }
            }
            (Some(_), None) | (None, Some(_)) => {
                warn!("Broker username/password pair incomplete, sending requests unauthenticated");
                Self::None
            }
            _ => Self::None,
        }
    }

    fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Self::ApiKey(key) => request.header(API_KEY_HEADER, key),
            Self::Basic { username, password } => request.basic_auth(username, Some(password)),
            Self::None => request,
        }
    }
}

/// Configuration for the remote broker
#[derive(Debug, Clone)]
pub struct RemoteBrokerConfig {
    /// Farm API base URL, e.g. `https://farm.example.com/api`
    pub base_url: String,
    pub credentials: Credentials,
    /// Lease requested per allocation (default: 5 minutes)
    pub reserve_timeout: Duration,
    /// Timeout for each HTTP request (default: 30 seconds)
    pub request_timeout: Duration,
    /// Protocol assumed for endpoints that omit one
    pub default_protocol: String,
    /// Port assumed for endpoints that omit one
    pub default_port: u16,
}

impl Default for RemoteBrokerConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:4444".to_string(),
            credentials: Credentials::None,
            reserve_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            default_protocol: DEFAULT_PROTOCOL.to_string(),
            default_port: DEFAULT_PORT,
        }
    }
}

/// A device as listed by the farm
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Map<String, Value>")]
pub struct RemoteDevice {
    /// First non-empty of `id`, `udid`, `serial`
    pub id: String,
    pub busy: bool,
    /// Farm-specific fields (udid, name, OS version, ..)
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl TryFrom<serde_json::Map<String, Value>> for RemoteDevice {
    type Error = String;

    fn try_from(mut fields: serde_json::Map<String, Value>) -> Result<Self, Self::Error> {
        let id = id_field(&fields).ok_or("device entry has no id, udid or serial")?;
        fields.remove("id");
        let busy = fields
            .remove("busy")
            .and_then(|busy| busy.as_bool())
            .unwrap_or(false);
        Ok(Self {
            id,
            busy,
            extra: fields,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DeviceList {
    #[serde(default)]
    devices: Vec<RemoteDevice>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DeviceRequest<'a> {
    platform_name: &'a str,
    capabilities: &'a Capabilities,
    test_id: &'a str,
    /// Lease length in seconds
    reserve_timeout: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeviceResponse {
    #[serde(default)]
    device: Option<Value>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    endpoint: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ReleaseRequest<'a> {
    session_id: Option<&'a str>,
    test_id: &'a str,
}

/// Device-farm client with a per-test allocation cache
pub struct RemoteBroker {
    config: RemoteBrokerConfig,
    base_url: Url,
    http_client: Client,
    /// test_id → allocation
    cache: DashMap<String, Allocation>,
}

impl RemoteBroker {
    pub fn new(config: RemoteBrokerConfig) -> Result<Self, BrokerError> {
        let base_url = Url::parse(&config.base_url)
            .map_err(|e| BrokerError::Config(format!("{}: {}", config.base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(BrokerError::Config(format!(
                "{} cannot be used as a base URL",
                config.base_url
            )));
        }

        let http_client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("testfleet/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| BrokerError::Config(e.to_string()))?;

        info!(
            url = %base_url,
            reserve_timeout_secs = config.reserve_timeout.as_secs(),
            auth = match config.credentials {
                Credentials::ApiKey(_) => "api-key",
                Credentials::Basic { .. } => "basic",
                Credentials::None => "none",
            },
            "RemoteBroker created"
        );

        Ok(Self {
            config,
            base_url,
            http_client,
            cache: DashMap::new(),
        })
    }

    /// Build `<base>/<segments..>` with each segment percent-encoded
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().extend(segments);
        }
        url
    }

    fn get(&self, url: Url) -> RequestBuilder {
        self.config.credentials.apply(self.http_client.get(url))
    }

    fn post(&self, url: Url) -> RequestBuilder {
        self.config.credentials.apply(self.http_client.post(url))
    }

    /// Health probe
    pub async fn status(&self) -> Result<(), BrokerError> {
        let response = self
            .get(self.url(&["status"]))
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;
        check_status(response).await.map(|_| ())
    }

    pub async fn is_available(&self) -> bool {
        match self.status().await {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "Device farm health probe failed");
                false
            }
        }
    }

    /// Devices the farm lists for `platform`
    pub async fn list_devices(&self, platform: Platform) -> Result<Vec<RemoteDevice>, BrokerError> {
        let response = self
            .get(self.url(&["devices"]))
            .query(&[("platformName", platform.capability_name())])
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        let list: DeviceList = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;
        Ok(list.devices)
    }

    /// Allocate a remote device for `test_id`, or `None` when the farm is
    /// unreachable or refuses. The cause is logged.
    pub async fn request_device(
        &self,
        platform: Platform,
        capabilities: &Capabilities,
        test_id: &str,
    ) -> Option<Allocation> {
        match self.try_request_device(platform, capabilities, test_id).await {
            Ok(allocation) => Some(allocation),
            Err(e) => {
                error!(test_id = %test_id, platform = %platform, error = %e, "Remote device request failed");
                None
            }
        }
    }

    /// Allocate a remote device for `test_id`, classifying failures
    pub async fn try_request_device(
        &self,
        platform: Platform,
        capabilities: &Capabilities,
        test_id: &str,
    ) -> Result<Allocation, BrokerError> {
        if let Some(cached) = self.cache.get(test_id) {
            debug!(test_id = %test_id, device = %cached.device_id, "Remote allocation served from cache");
            return Ok(cached.clone());
        }

        let body = DeviceRequest {
            platform_name: platform.capability_name(),
            capabilities,
            test_id,
            reserve_timeout: self.config.reserve_timeout.as_secs(),
        };

        let response = self
            .post(self.url(&["device"]))
            .json(&body)
            .send()
            .await
            .map_err(|e| BrokerError::Network(e.to_string()))?;

        if response.status() == StatusCode::CONFLICT {
            let reason = response.text().await.unwrap_or_default();
            return Err(BrokerError::Conflict(reason));
        }

        let parsed: DeviceResponse = check_status(response)
            .await?
            .json()
            .await
            .map_err(|e| BrokerError::InvalidResponse(e.to_string()))?;

        if let Some(reason) = parsed.error.filter(|e| !e.is_null()) {
            let reason = match reason {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(BrokerError::Conflict(reason));
        }

        let device_id = parsed
            .device
            .as_ref()
            .and_then(device_id_of)
            .ok_or_else(|| BrokerError::InvalidResponse("response carries no device id".into()))?;

        let allocation = Allocation {
            test_id: test_id.to_string(),
            platform,
            device_id,
            session_id: parsed.session_id,
            endpoint: parsed.endpoint,
            allocated_at: chrono::Utc::now(),
        };

        info!(
            test_id = %test_id,
            device = %allocation.device_id,
            session_id = ?allocation.session_id,
            endpoint = ?allocation.endpoint,
            "Allocated remote device"
        );
        self.cache.insert(test_id.to_string(), allocation.clone());

        Ok(allocation)
    }

    /// Release the device held by `test_id`.
    ///
    /// Nothing cached means nothing to release: success without a network
    /// call. A failed release keeps the cache entry so it can be retried.
    pub async fn release_device(&self, test_id: &str) -> bool {
        let Some(allocation) = self.cache.get(test_id).map(|a| a.clone()) else {
            debug!(test_id = %test_id, "No remote allocation to release");
            return true;
        };

        let body = ReleaseRequest {
            session_id: allocation.session_id.as_deref(),
            test_id,
        };

        let result = self
            .post(self.url(&["device", &allocation.device_id, "release"]))
            .json(&body)
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                self.cache.remove(test_id);
                info!(test_id = %test_id, device = %allocation.device_id, "Released remote device");
                true
            }
            Ok(response) if response.status() == StatusCode::NOT_FOUND => {
                self.cache.remove(test_id);
                warn!(
                    test_id = %test_id,
                    device = %allocation.device_id,
                    "Remote device already gone (lease expired?), treating as released"
                );
                true
            }
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                error!(
                    test_id = %test_id,
                    device = %allocation.device_id,
                    status = %status,
                    body = %body,
                    "Remote device release rejected"
                );
                false
            }
            Err(e) => {
                error!(
                    test_id = %test_id,
                    device = %allocation.device_id,
                    error = %e,
                    "Remote device release failed"
                );
                false
            }
        }
    }

    /// Cache an allocation made elsewhere (by an earlier process) so it can
    /// be released through this broker
    pub fn remember(&self, allocation: Allocation) {
        self.cache.insert(allocation.test_id.clone(), allocation);
    }

    pub fn cached(&self, test_id: &str) -> Option<Allocation> {
        self.cache.get(test_id).map(|a| a.clone())
    }

    pub fn is_allocated(&self, test_id: &str) -> bool {
        self.cache.contains_key(test_id)
    }

    /// Where to connect for `allocation`, using configured defaults for
    /// anything the endpoint omits
    pub fn connection_target(&self, allocation: &Allocation) -> Option<ConnectionTarget> {
        let endpoint = allocation.endpoint.as_deref()?;
        ConnectionTarget::parse(
            endpoint,
            &self.config.default_protocol,
            self.config.default_port,
        )
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, BrokerError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    Err(BrokerError::Status { status, body })
}

/// The farm may return the device as a bare id or as an object
fn device_id_of(device: &Value) -> Option<String> {
    match device {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(fields) => id_field(fields),
        _ => None,
    }
}

fn id_field(fields: &serde_json::Map<String, Value>) -> Option<String> {
    ["id", "udid", "serial"]
        .iter()
        .find_map(|key| fields.get(*key).and_then(Value::as_str).filter(|id| !id.is_empty()))
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_credentials_prefer_api_key() {
        let creds = Credentials::from_parts(
            Some("k-123".into()),
            Some("user".into()),
            Some("pass".into()),
        );
        assert_eq!(creds, Credentials::ApiKey("k-123".into()));
    }

    #[test]
    fn test_credentials_basic_needs_pair() {
        assert_eq!(
            Credentials::from_parts(None, Some("user".into()), Some("pass".into())),
            Credentials::Basic {
                username: "user".into(),
                password: "pass".into()
            }
        );
        assert_eq!(
            Credentials::from_parts(None, Some("user".into()), None),
            Credentials::None
        );
        assert_eq!(Credentials::from_parts(None, None, None), Credentials::None);
    }

    #[test]
    fn test_empty_api_key_is_ignored() {
        assert_eq!(
            Credentials::from_parts(Some(String::new()), None, None),
            Credentials::None
        );
    }

    #[test]
    fn test_device_id_shapes() {
        assert_eq!(device_id_of(&json!("R58M123")), Some("R58M123".into()));
        assert_eq!(device_id_of(&json!({"udid": "00008030"})), Some("00008030".into()));
        assert_eq!(device_id_of(&json!({"id": "d-1", "udid": "x"})), Some("d-1".into()));
        assert_eq!(device_id_of(&json!({"name": "Pixel"})), None);
        assert_eq!(device_id_of(&json!(42)), None);
    }

    #[test]
    fn test_listing_accepts_id_and_udid_together() {
        let list: DeviceList = serde_json::from_value(json!({
            "devices": [
                {"id": "d1", "udid": "00008030", "busy": false},
                {"udid": "00008031", "busy": true, "name": "iPhone 15"},
                {"id": "", "serial": "R58M"}
            ]
        }))
        .unwrap();

        let ids: Vec<&str> = list.devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["d1", "00008031", "R58M"]);
        assert_eq!(list.devices[0].extra["udid"], json!("00008030"));
        assert!(list.devices[0].extra.get("id").is_none());
        assert!(list.devices[1].busy);
        assert!(!list.devices[2].busy);
    }

    #[test]
    fn test_listing_entry_without_id_rejected() {
        let result = serde_json::from_value::<DeviceList>(json!({"devices": [{"name": "ghost"}]}));
        assert!(result.is_err());
    }

    #[test]
    fn test_url_joins_segments() {
        let broker = RemoteBroker::new(RemoteBrokerConfig {
            base_url: "https://farm.example.com/api/".into(),
            ..Default::default()
        })
        .unwrap();

        assert_eq!(
            broker.url(&["device", "emu 1", "release"]).as_str(),
            "https://farm.example.com/api/device/emu%201/release"
        );
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        let result = RemoteBroker::new(RemoteBrokerConfig {
            base_url: "not a url".into(),
            ..Default::default()
        });
        assert!(matches!(result, Err(BrokerError::Config(_))));
    }

    #[test]
    fn test_broker_error_mapping() {
        assert!(matches!(
            LabError::from(BrokerError::Conflict("taken".into())),
            LabError::AllocationConflict(_)
        ));
        assert!(matches!(
            LabError::from(BrokerError::Network("refused".into())),
            LabError::RemoteUnavailable(_)
        ));
        assert!(matches!(
            LabError::from(BrokerError::Status {
                status: 503,
                body: String::new()
            }),
            LabError::RemoteUnavailable(_)
        ));
    }

    #[test]
    fn test_connection_target_uses_configured_defaults() {
        let broker = RemoteBroker::new(RemoteBrokerConfig {
            default_protocol: "https".into(),
            default_port: 443,
            ..Default::default()
        })
        .unwrap();

        let mut allocation = Allocation::local("t1", Platform::Android, "d-1");
        assert!(broker.connection_target(&allocation).is_none());

        allocation.endpoint = Some("farm-node-3/wd/hub".into());
        let target = broker.connection_target(&allocation).unwrap();
        assert_eq!(target.url(), "https://farm-node-3:443/wd/hub");
    }
}
