//! Remote device-farm backend

pub mod client;
pub mod endpoint;

pub use client::{BrokerError, Credentials, RemoteBroker, RemoteBrokerConfig, RemoteDevice};
pub use endpoint::{ConnectionTarget, DEFAULT_PORT, DEFAULT_PROTOCOL};
