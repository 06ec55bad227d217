//! Testfleet - device allocation and data isolation for parallel UI tests
//!
//! Gives every concurrently running test:
//! - Exclusive use of one device, from a local file-locked pool or a remote
//!   device farm
//! - A private copy of its fixture data, with emails and usernames tagged so
//!   parallel registrations never collide
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │            TestCoordinator              │
//! │        (setup / teardown per test)      │
//! └─────────┬─────────────┬─────────────┬───┘
//!           │             │             │
//!           ▼             ▼             ▼
//! ┌─────────────────┐ ┌───────────┐ ┌──────────────┐
//! │ DeviceAllocator │ │ Isolation │ │ FixtureStore │
//! │  PoolRegistry   │ │  Engine   │ │ (json/yaml)  │
//! │  RemoteBroker   │ └───────────┘ └──────────────┘
//! └────────┬────────┘
//!          ▼
//!  lock table (flock + atomic rename) / device farm HTTP API
//! ```

pub mod allocation;
pub mod broker;
pub mod config;
pub mod device;
pub mod error;
pub mod fixtures;
pub mod isolation;
pub mod logging;
pub mod pool;
pub mod session;

// Re-export main types for convenience
pub use allocation::{build_allocator, DeviceAllocator};
pub use broker::{ConnectionTarget, Credentials, RemoteBroker, RemoteBrokerConfig};
pub use config::{Backend, LabConfig};
pub use device::{Allocation, Capabilities, Device, Platform};
pub use error::{LabError, Result};
pub use fixtures::{Fixture, FixtureStore, Record};
pub use isolation::{ExecutionContext, IdentityFields, IsolatedRecord, IsolationEngine};
pub use pool::{DevicesByPlatform, LockTable, PoolRegistry};
pub use session::{FixtureRef, SessionHandoff, TestCoordinator, TestLease, TestSpec};
