//! Channels
//!
//! A channel binds one protocol engine to its point table and runs it;
//! the manager owns all channels and routes commands to them.

pub mod channel;
pub mod manager;
pub mod types;

pub use channel::Channel;
pub use manager::ChannelManager;
pub use types::{ChannelCommand, PointSnapshot};
