//! Local device pool
//!
//! - [`PoolRegistry`]: in-memory device catalog and allocation logic
//! - [`LockTable`]: the persisted, cross-process lock table it reconciles with

pub mod lock_table;
pub mod registry;

pub use lock_table::{LockEntry, LockMap, LockTable, LockTableError};
pub use registry::{DevicesByPlatform, PoolRegistry, ReconcileReport};
