//! Channel lifecycle management
//!
//! Handles channel creation, removal, start/stop and command routing.

use dashmap::DashMap;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use voltage_comlink::{ChannelConfig, ChannelStatus, CommandOutcome, PointTable, PointType};

use super::channel::Channel;
use super::types::ChannelCommand;
use crate::error::{ComSrvError, Result};
use crate::publisher::UpdateSender;
use crate::registry::ProtocolRegistry;
use crate::runtime::reconnect::ReconnectPolicy;

/// Upper bound on waiting for a queued command to be handled
const COMMAND_REPLY_TIMEOUT: Duration = Duration::from_secs(10);

struct ChannelEntry {
    channel: Arc<Channel>,
    commands: mpsc::Sender<ChannelCommand>,
}

/// Channel manager - responsible for channel lifecycle management
pub struct ChannelManager {
    channels: DashMap<u32, ChannelEntry>,
    registry: Arc<ProtocolRegistry>,
    updates: UpdateSender,
    reconnect: ReconnectPolicy,
    command_buffer: usize,
}

impl std::fmt::Debug for ChannelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelManager")
            .field("channels", &self.channels.len())
            .finish()
    }
}

impl ChannelManager {
    pub fn new(
        registry: Arc<ProtocolRegistry>,
        updates: UpdateSender,
        reconnect: ReconnectPolicy,
        command_buffer: usize,
    ) -> Self {
        Self {
            channels: DashMap::new(),
            registry,
            updates,
            reconnect,
            command_buffer,
        }
    }

    /// Build a channel through the protocol registry and register it
    pub fn create_channel(&self, config: ChannelConfig, points: PointTable) -> Result<Arc<Channel>> {
        let channel_id = config.id;
        if self.channels.contains_key(&channel_id) {
            return Err(ComSrvError::channel_exists(channel_id));
        }

        let count = |t: PointType| points.by_type(t).count();
        info!(
            "Ch{}: T={} S={} C={} A={} pts",
            channel_id,
            count(PointType::Telemetry),
            count(PointType::Signal),
            count(PointType::Control),
            count(PointType::Adjustment)
        );

        let engine = self.registry.create(&config)?;
        let channel = Channel::new(
            config,
            engine,
            points,
            self.updates.clone(),
            self.reconnect.clone(),
        )?;
        self.add_channel(channel)
    }

    /// Register an already built channel
    pub fn add_channel(&self, channel: Channel) -> Result<Arc<Channel>> {
        let channel_id = channel.id();
        match self.channels.entry(channel_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => Err(ComSrvError::channel_exists(channel_id)),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let commands = channel.command_sender(self.command_buffer);
                let channel = Arc::new(channel);
                slot.insert(ChannelEntry {
                    channel: Arc::clone(&channel),
                    commands,
                });
                info!("Ch{} created ({})", channel_id, channel.protocol());
                Ok(channel)
            },
        }
    }

    pub fn get(&self, channel_id: u32) -> Option<Arc<Channel>> {
        self.channels
            .get(&channel_id)
            .map(|entry| Arc::clone(&entry.channel))
    }

    pub fn channel_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.channels.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    fn all_channels(&self) -> Vec<Arc<Channel>> {
        let mut channels: Vec<_> = self
            .channels
            .iter()
            .map(|entry| Arc::clone(&entry.channel))
            .collect();
        channels.sort_by_key(|c| c.id());
        channels
    }

    pub async fn start_channel(&self, channel_id: u32) -> Result<()> {
        let channel = self
            .get(channel_id)
            .ok_or_else(|| ComSrvError::channel_not_found(channel_id))?;
        channel.start().await
    }

    pub async fn stop_channel(&self, channel_id: u32) -> Result<()> {
        let channel = self
            .get(channel_id)
            .ok_or_else(|| ComSrvError::channel_not_found(channel_id))?;
        channel.stop().await;
        Ok(())
    }

    /// Start every registered channel; returns how many are running
    pub async fn start_all(&self) -> Result<usize> {
        let mut started = 0;
        for channel in self.all_channels() {
            channel.start().await?;
            started += 1;
        }
        info!("Started {} channels", started);
        Ok(started)
    }

    /// Stop all channels concurrently
    pub async fn stop_all(&self) {
        let channels = self.all_channels();
        join_all(channels.iter().map(|channel| channel.stop())).await;
        info!("Stopped {} channels", channels.len());
    }

    /// Stop and unregister a channel
    pub async fn remove_channel(&self, channel_id: u32) -> Result<()> {
        let (_, entry) = self
            .channels
            .remove(&channel_id)
            .ok_or_else(|| ComSrvError::channel_not_found(channel_id))?;
        entry.channel.stop().await;
        info!("Ch{} removed", channel_id);
        Ok(())
    }

    /// Route a command to its channel and wait for the outcome
    pub async fn on_command(&self, channel_id: u32, point_id: u32, value: f64) -> CommandOutcome {
        let Some((channel, sender)) = self
            .channels
            .get(&channel_id)
            .map(|entry| (Arc::clone(&entry.channel), entry.commands.clone()))
        else {
            return CommandOutcome::Rejected(format!("channel {} not found", channel_id));
        };
        if !channel.is_running() {
            return CommandOutcome::Rejected(format!("channel {} is not running", channel_id));
        }

        debug!("Ch{} command point {} = {}", channel_id, point_id, value);
        let (command, reply) = ChannelCommand::with_reply(point_id, value);
        let exchange = async {
            if sender.send(command).await.is_err() {
                return CommandOutcome::Rejected(format!(
                    "channel {} command queue closed",
                    channel_id
                ));
            }
            reply.await.unwrap_or_else(|_| {
                CommandOutcome::Rejected(format!("channel {} dropped the command", channel_id))
            })
        };

        match tokio::time::timeout(COMMAND_REPLY_TIMEOUT, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!("Ch{} command point {} not handled in time", channel_id, point_id);
                CommandOutcome::Rejected(format!(
                    "channel {} did not handle the command within {:?}",
                    channel_id, COMMAND_REPLY_TIMEOUT
                ))
            },
        }
    }

    pub fn channel_statuses(&self) -> Vec<ChannelStatus> {
        self.all_channels()
            .iter()
            .map(|channel| channel.status())
            .collect()
    }
}
