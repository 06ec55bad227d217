//! Per-test data isolation

pub mod context;
pub mod engine;

pub use context::{mint_context_id, ExecutionContext, IsolatedRecord};
pub use engine::{IdentityFields, IsolationEngine};
