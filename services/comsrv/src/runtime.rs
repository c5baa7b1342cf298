//! Runtime Orchestration Layer
//!
//! Service lifecycle (startup, shutdown signal) and reconnection backoff.

pub mod lifecycle;
pub mod reconnect;

pub use lifecycle::{
    start_communication_service, start_with_registry, validate_channels, wait_for_shutdown,
    ServiceHandle,
};
pub use reconnect::{ReconnectHelper, ReconnectPolicy, ReconnectStats};
