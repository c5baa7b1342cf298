//! Runtime lifecycle management
//!
//! Startup builds every enabled channel from configuration and starts it;
//! shutdown stops the channels and then drains the publisher queue.

use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::channels::ChannelManager;
use crate::config::{load_channel_points, ComsrvConfig};
use crate::error::Result;
use crate::publisher::{DataPublisher, PublisherPump};
use crate::registry::{create_default_registry, ProtocolRegistry};

/// Time allowed for buffered updates to reach the publisher on shutdown
const PUBLISH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Running service: channels plus the publisher pump
pub struct ServiceHandle {
    manager: Arc<ChannelManager>,
    pump: PublisherPump,
    failed_channels: Vec<u32>,
}

impl ServiceHandle {
    pub fn manager(&self) -> &Arc<ChannelManager> {
        &self.manager
    }

    /// Channels that could not be created at startup
    pub fn failed_channels(&self) -> &[u32] {
        &self.failed_channels
    }

    /// Stop all channels, then flush pending updates
    pub async fn shutdown(self) {
        info!("Shutting down {} channels", self.manager.len());
        self.manager.stop_all().await;
        self.pump.shutdown(PUBLISH_DRAIN_TIMEOUT).await;
        info!("Communication service stopped");
    }
}

/// Create and start every enabled channel
///
/// A channel whose points or parameters are invalid is logged and skipped;
/// the remaining channels still start.
pub async fn start_communication_service(
    config: &ComsrvConfig,
    publisher: Arc<dyn DataPublisher>,
) -> Result<ServiceHandle> {
    start_with_registry(config, publisher, Arc::new(create_default_registry())).await
}

pub async fn start_with_registry(
    config: &ComsrvConfig,
    publisher: Arc<dyn DataPublisher>,
    registry: Arc<ProtocolRegistry>,
) -> Result<ServiceHandle> {
    let pump = PublisherPump::spawn(publisher, config.service.publish_buffer);
    let manager = Arc::new(ChannelManager::new(
        registry,
        pump.sender(),
        config.service.reconnect.policy(),
        config.service.command_buffer,
    ));

    let mut failed_channels = Vec::new();
    for channel_config in config.enabled_channels() {
        info!(
            "Creating channel: {} - {} ({})",
            channel_config.id, channel_config.name, channel_config.protocol
        );
        let created = load_channel_points(channel_config)
            .and_then(|points| manager.create_channel(channel_config.clone(), points));
        if let Err(e) = created {
            error!("Ch{} ({}) not created: {}", channel_config.id, channel_config.name, e);
            failed_channels.push(channel_config.id);
        }
    }

    if manager.is_empty() {
        warn!("No channels configured");
    }
    let started = manager.start_all().await?;
    info!(
        "{} started: {} channels running, {} failed",
        config.service.name,
        started,
        failed_channels.len()
    );

    Ok(ServiceHandle {
        manager,
        pump,
        failed_channels,
    })
}

/// Build every enabled channel without starting it
///
/// Fails on the first channel that cannot be created. Returns the number of
/// channels checked.
pub fn validate_channels(config: &ComsrvConfig) -> Result<usize> {
    let registry = create_default_registry();
    let mut checked = 0;
    for channel_config in config.enabled_channels() {
        let points = load_channel_points(channel_config)?;
        let mut engine = registry.create(channel_config)?;
        engine.prepare(&points)?;
        info!(
            "Ch{} ({}) ok: {} points, target {}",
            channel_config.id,
            channel_config.name,
            points.len(),
            engine.target()
        );
        checked += 1;
    }
    Ok(checked)
}

/// Resolve on Ctrl+C or, on Unix, SIGTERM
pub async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            },
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

#[cfg(test)]
#[allow(clippy::disallowed_methods)]
mod tests {
    use super::*;
    use crate::publisher::MemoryPublisher;
    use serde_json::json;
    use voltage_comlink::ChannelConfig;

    fn config() -> ComsrvConfig {
        let mut config = ComsrvConfig::default();
        config.channels = vec![
            ChannelConfig::new(1, "sim", "virtual").with_polling_interval(10),
            // missing host
            ChannelConfig::new(2, "meter", "modbus_tcp"),
            ChannelConfig::new(3, "grid", "iec104"),
        ];
        config
    }

    #[tokio::test]
    async fn test_failed_channels_do_not_block_startup() {
        let publisher = Arc::new(MemoryPublisher::new());
        let handle = start_communication_service(&config(), publisher)
            .await
            .unwrap();

        assert_eq!(handle.failed_channels(), &[2, 3]);
        let channel = handle.manager().get(1).unwrap();
        assert!(channel.is_running());

        handle.shutdown().await;
        assert!(!channel.is_running());
    }

    #[tokio::test]
    async fn test_disabled_channels_are_skipped() {
        let mut config = config();
        config.channels.truncate(1);
        config.channels.push({
            let mut disabled = ChannelConfig::new(4, "spare", "modbus_tcp")
                .with_param("host", json!("10.0.0.9"));
            disabled.enabled = false;
            disabled
        });

        let handle = start_communication_service(&config, Arc::new(MemoryPublisher::new()))
            .await
            .unwrap();
        assert_eq!(handle.manager().channel_ids(), vec![1]);
        handle.shutdown().await;
    }

    #[test]
    fn test_validate_channels() {
        let mut config = config();
        assert!(validate_channels(&config).is_err());

        config.channels.truncate(1);
        assert_eq!(validate_channels(&config).unwrap(), 1);
    }
}
