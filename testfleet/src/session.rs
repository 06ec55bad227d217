//! Setup and teardown of a single test run
//!
//! `setup` reserves a device through the configured allocator, derives the
//! test's isolated data, and returns what the automation session needs to
//! connect. `teardown` undoes both.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::allocation::{build_allocator, DeviceAllocator};
use crate::broker::ConnectionTarget;
use crate::config::LabConfig;
use crate::device::{Allocation, Capabilities, Platform};
use crate::error::{LabError, Result};
use crate::fixtures::FixtureStore;
use crate::isolation::{IdentityFields, IsolatedRecord, IsolationEngine};

/// Which fixture record seeds a test's data
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixtureRef {
    pub fixture_type: String,
    pub category: String,
    #[serde(default)]
    pub index: Option<usize>,
}

impl FixtureRef {
    pub fn new(fixture_type: impl Into<String>, category: impl Into<String>) -> Self {
        Self {
            fixture_type: fixture_type.into(),
            category: category.into(),
            index: None,
        }
    }

    pub fn at(mut self, index: usize) -> Self {
        self.index = Some(index);
        self
    }
}

#[derive(Debug, Clone)]
pub struct TestSpec {
    pub test_id: String,
    pub platform: Platform,
    pub capabilities: Capabilities,
    pub fixture: Option<FixtureRef>,
}

impl TestSpec {
    pub fn new(test_id: impl Into<String>, platform: Platform) -> Self {
        Self {
            test_id: test_id.into(),
            platform,
            capabilities: Capabilities::new(),
            fixture: None,
        }
    }

    pub fn with_fixture(mut self, fixture: FixtureRef) -> Self {
        self.fixture = Some(fixture);
        self
    }

    pub fn with_capability(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.capabilities.insert(key.into(), value.into());
        self
    }
}

/// What the automation session consumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionHandoff {
    pub target: ConnectionTarget,
    pub capabilities: Capabilities,
}

#[derive(Debug, Clone)]
pub struct TestLease {
    pub allocation: Allocation,
    pub handoff: SessionHandoff,
    pub data: IsolatedRecord,
}

pub struct TestCoordinator {
    allocator: Arc<dyn DeviceAllocator>,
    isolation: Arc<IsolationEngine>,
    fixtures: Arc<FixtureStore>,
    local_endpoint: ConnectionTarget,
}

impl TestCoordinator {
    pub fn new(
        allocator: Arc<dyn DeviceAllocator>,
        isolation: Arc<IsolationEngine>,
        fixtures: Arc<FixtureStore>,
        local_endpoint: ConnectionTarget,
    ) -> Self {
        Self {
            allocator,
            isolation,
            fixtures,
            local_endpoint,
        }
    }

    /// Build the configured backend, isolation engine and fixture store
    pub fn from_config(config: &LabConfig) -> Result<Self> {
        let local_endpoint = ConnectionTarget::parse(
            &config.pool.local_endpoint,
            &config.broker.default_protocol,
            config.broker.default_port,
        )
        .ok_or_else(|| {
            LabError::Config(format!(
                "invalid pool.local_endpoint: {}",
                config.pool.local_endpoint
            ))
        })?;

        Ok(Self::new(
            build_allocator(config)?,
            Arc::new(IsolationEngine::new(IdentityFields::from(&config.fixtures))),
            Arc::new(FixtureStore::new(config.fixtures.root.clone())),
            local_endpoint,
        ))
    }

    pub fn allocator(&self) -> &Arc<dyn DeviceAllocator> {
        &self.allocator
    }

    pub fn isolation(&self) -> &Arc<IsolationEngine> {
        &self.isolation
    }

    pub fn fixtures(&self) -> &Arc<FixtureStore> {
        &self.fixtures
    }

    /// Reserve a device and prepare isolated data for `spec.test_id`.
    ///
    /// An allocation failure aborts setup before any data is created.
    pub async fn setup(&self, spec: TestSpec) -> Result<TestLease> {
        let allocation = self
            .allocator
            .allocate(spec.platform, &spec.test_id, &spec.capabilities)
            .await
            .map_err(|e| {
                error!(
                    test_id = %spec.test_id,
                    backend = self.allocator.backend_name(),
                    error = %e,
                    "Test setup aborted"
                );
                e
            })?;

        let base = match &spec.fixture {
            Some(fixture) => {
                let record =
                    self.fixtures
                        .load_record(&fixture.fixture_type, &fixture.category, fixture.index);
                if record.is_empty() {
                    warn!(
                        test_id = %spec.test_id,
                        fixture_type = %fixture.fixture_type,
                        category = %fixture.category,
                        "Fixture yielded no data"
                    );
                }
                record
            }
            None => Map::new(),
        };
        let data = self.isolation.initialize_test_data(&spec.test_id, &base);

        let handoff = SessionHandoff {
            target: self
                .allocator
                .connection_target(&allocation)
                .unwrap_or_else(|| self.local_endpoint.clone()),
            capabilities: self.session_capabilities(spec.capabilities, &allocation),
        };

        info!(
            test_id = %spec.test_id,
            device = %allocation.device_id,
            target = %handoff.target,
            "Test setup complete"
        );

        Ok(TestLease {
            allocation,
            handoff,
            data,
        })
    }

    /// Release `test_id`'s device and drop its data. Returns whether the
    /// release was durable.
    pub async fn teardown(&self, test_id: &str) -> bool {
        let released = self.allocator.release(test_id).await;
        self.isolation.cleanup_test_data(test_id);

        if released {
            info!(test_id = %test_id, "Test teardown complete");
        } else {
            warn!(test_id = %test_id, "Test teardown finished but the device release did not persist");
        }
        released
    }

    fn session_capabilities(&self, mut caps: Capabilities, allocation: &Allocation) -> Capabilities {
        caps.insert(
            "platformName".into(),
            Value::from(allocation.platform.capability_name()),
        );
        caps.insert("udid".into(), Value::from(allocation.device_id.as_str()));

        if let Some(device) = self.allocator.describe(&allocation.device_id) {
            if !device.device_name.is_empty() {
                caps.insert("deviceName".into(), Value::from(device.device_name));
            }
            if !device.platform_version.is_empty() {
                caps.insert("platformVersion".into(), Value::from(device.platform_version));
            }
        }
        caps
    }
}
