//! Communication Service (comsrv)
//!
//! Runs configured device channels (Modbus TCP/RTU master or slave, CAN,
//! virtual) and pushes every point value to a [`publisher::DataPublisher`].
//!
//! ```text
//! config.yaml + points CSV ──► ProtocolRegistry ──► Channel (engine + loop)
//!                                                        │
//!                            ChannelManager ◄── commands ┘
//!                                                        │ PointUpdate
//!                                                        ▼
//!                                               PublisherPump ──► DataPublisher
//! ```

pub mod channels;
pub mod config;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod registry;
pub mod runtime;

pub use channels::{Channel, ChannelCommand, ChannelManager, PointSnapshot};
pub use config::{ComsrvConfig, DEFAULT_CONFIG_PATH};
pub use error::{ComSrvError, Result};
pub use publisher::{DataPublisher, MemoryPublisher, PublisherPump};
pub use registry::{create_default_registry, ProtocolFactory, ProtocolRegistry};
pub use runtime::{start_communication_service, wait_for_shutdown, ServiceHandle};
