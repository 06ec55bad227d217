//! Unified allocation contract over the local pool and the device farm.
//!
//! The execution driver holds an `Arc<dyn DeviceAllocator>` built from
//! configuration by [`build_allocator`] and never learns which backend
//! serves it.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{error, info};

use crate::broker::{ConnectionTarget, RemoteBroker};
use crate::config::{Backend, LabConfig};
use crate::device::{Allocation, Capabilities, Device, Platform};
use crate::error::{LabError, Result};
use crate::pool::{LockTable, PoolRegistry};

/// Core trait for device allocation backends
#[async_trait]
pub trait DeviceAllocator: Send + Sync {
    /// Backend identifier for logs and diagnostics
    fn backend_name(&self) -> &str;

    /// Reserve a device of `platform` for `test_id`.
    ///
    /// Re-entrant per test id. Fails with `ResourceExhausted`,
    /// `RemoteUnavailable`, `AllocationConflict` or `IoFailure`.
    async fn allocate(
        &self,
        platform: Platform,
        test_id: &str,
        capabilities: &Capabilities,
    ) -> Result<Allocation>;

    /// Release whatever `test_id` holds.
    ///
    /// `true` once the test holds no device, including when it held none.
    /// `false` when the release could not be made durable or was rejected.
    async fn release(&self, test_id: &str) -> bool;

    fn is_allocated(&self, test_id: &str) -> bool;

    /// Catalog entry for `device_id`, when the backend keeps one
    fn describe(&self, _device_id: &str) -> Option<Device> {
        None
    }

    /// Where a session for `allocation` should connect, if the allocation
    /// names an endpoint
    fn connection_target(&self, allocation: &Allocation) -> Option<ConnectionTarget> {
        allocation
            .endpoint
            .as_deref()
            .and_then(ConnectionTarget::parse_with_defaults)
    }
}

#[async_trait]
impl DeviceAllocator for PoolRegistry {
    fn backend_name(&self) -> &str {
        "local"
    }

    async fn allocate(
        &self,
        platform: Platform,
        test_id: &str,
        _capabilities: &Capabilities,
    ) -> Result<Allocation> {
        let registry = self.clone();
        let test_id = test_id.to_string();
        tokio::task::spawn_blocking(move || PoolRegistry::allocate(&registry, platform, &test_id))
            .await
            .map_err(|e| LabError::IoFailure(format!("allocation task failed: {}", e)))?
    }

    async fn release(&self, test_id: &str) -> bool {
        let registry = self.clone();
        let owned = test_id.to_string();
        let result =
            tokio::task::spawn_blocking(move || PoolRegistry::release(&registry, &owned)).await;

        match result {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                error!(test_id = %test_id, error = %e, "Release was not persisted");
                false
            }
            Err(e) => {
                error!(test_id = %test_id, error = %e, "Release task failed");
                false
            }
        }
    }

    fn is_allocated(&self, test_id: &str) -> bool {
        PoolRegistry::is_allocated(self, test_id)
    }

    fn describe(&self, device_id: &str) -> Option<Device> {
        self.device(device_id)
    }
}

#[async_trait]
impl DeviceAllocator for RemoteBroker {
    fn backend_name(&self) -> &str {
        "remote"
    }

    async fn allocate(
        &self,
        platform: Platform,
        test_id: &str,
        capabilities: &Capabilities,
    ) -> Result<Allocation> {
        self.try_request_device(platform, capabilities, test_id)
            .await
            .map_err(|e| {
                error!(test_id = %test_id, platform = %platform, error = %e, "Remote allocation failed");
                LabError::from(e)
            })
    }

    async fn release(&self, test_id: &str) -> bool {
        self.release_device(test_id).await
    }

    fn is_allocated(&self, test_id: &str) -> bool {
        RemoteBroker::is_allocated(self, test_id)
    }

    fn connection_target(&self, allocation: &Allocation) -> Option<ConnectionTarget> {
        RemoteBroker::connection_target(self, allocation)
    }
}

/// Construct the configured backend.
///
/// The local pool is initialized from `config.pool.devices` and reconciled
/// against the lock table before it is returned.
pub fn build_allocator(config: &LabConfig) -> Result<Arc<dyn DeviceAllocator>> {
    config.validate()?;

    match config.backend {
        Backend::Local => {
            let registry = local_pool(config);
            info!(lock_table = %config.pool.lock_table.display(), "Using local device pool");
            Ok(Arc::new(registry))
        }
        Backend::Remote => {
            let broker = RemoteBroker::new(config.broker_config()?)?;
            info!(url = ?config.broker.url, "Using remote device farm");
            Ok(Arc::new(broker))
        }
    }
}

/// Local pool over the configured lock table, initialized with the
/// configured devices
pub fn local_pool(config: &LabConfig) -> PoolRegistry {
    let table = LockTable::new(config.pool.lock_table.clone(), config.lock_timeout());
    let registry = match config.stale_lock_ttl() {
        Some(ttl) => PoolRegistry::with_stale_ttl(table, ttl),
        None => PoolRegistry::new(table),
    };
    registry.initialize_pool(config.devices_by_platform());
    registry
}
