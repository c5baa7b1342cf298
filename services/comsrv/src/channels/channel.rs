//! Channel runtime
//!
//! A [`Channel`] owns one protocol engine and drives it from its own task:
//! connect with backoff, run cycles, serve queued commands between cycles
//! and push every value into the publisher queue.
//!
//! Lock order is engine first, then points/status. Status and point locks
//! are never held across an await.

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use voltage_comlink::{
    ChannelConfig, ChannelLogger, ChannelStatus, ComLinkError, CommandOutcome, ConnectionState,
    CycleOutput, DataPointConfig, DeviceRole, ErrorKind, PointCommand, PointReading, PointTable,
    PointType, PointUpdate, ProtocolEngine, Quality, TransportError,
};

use super::types::{ChannelCommand, PointSnapshot};
use crate::error::{ComSrvError, Result};
use crate::publisher::UpdateSender;
use crate::runtime::reconnect::{ReconnectHelper, ReconnectPolicy};

type CommandReceiver = mpsc::Receiver<ChannelCommand>;

/// State shared between the channel handle and its loop task
struct ChannelShared {
    config: ChannelConfig,
    protocol: String,
    role: DeviceRole,
    logger: ChannelLogger,
    engine: AsyncMutex<Box<dyn ProtocolEngine>>,
    points: RwLock<Arc<PointTable>>,
    /// Last published reading per point
    values: DashMap<u32, PointReading>,
    status: RwLock<ChannelStatus>,
    running: AtomicBool,
    updates: UpdateSender,
    reconnect: ReconnectPolicy,
}

struct RunningTask {
    cancel: CancellationToken,
    handle: JoinHandle<Option<CommandReceiver>>,
}

/// One configured link to a device
pub struct Channel {
    shared: Arc<ChannelShared>,
    task: AsyncMutex<Option<RunningTask>>,
    /// Parked command queue while the loop is not running
    commands: Mutex<Option<CommandReceiver>>,
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.shared.config.id)
            .field("name", &self.shared.config.name)
            .field("protocol", &self.shared.protocol)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

impl Channel {
    /// Bind an engine to its point table
    ///
    /// The engine validates the table here; a table it cannot serve is a
    /// configuration error and no channel is created.
    pub fn new(
        config: ChannelConfig,
        mut engine: Box<dyn ProtocolEngine>,
        points: PointTable,
        updates: UpdateSender,
        reconnect: ReconnectPolicy,
    ) -> Result<Self> {
        engine.prepare(&points)?;

        let protocol = engine.protocol().to_string();
        let logger = ChannelLogger::new(config.id, config.name.clone());
        logger.log_init(
            &protocol,
            &format!("{} points, target {}", points.len(), engine.target()),
        );

        let shared = ChannelShared {
            status: RwLock::new(ChannelStatus::new(config.id, config.name.clone(), &protocol)),
            role: engine.role(),
            protocol,
            logger,
            engine: AsyncMutex::new(engine),
            points: RwLock::new(Arc::new(points)),
            values: DashMap::new(),
            running: AtomicBool::new(false),
            updates,
            reconnect,
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
            task: AsyncMutex::new(None),
            commands: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u32 {
        self.shared.config.id
    }

    pub fn name(&self) -> &str {
        &self.shared.config.name
    }

    pub fn protocol(&self) -> &str {
        &self.shared.protocol
    }

    pub fn role(&self) -> DeviceRole {
        self.shared.role
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.shared.config
    }

    /// Hand a command queue to the channel; it is served while running
    pub fn attach_commands(&self, rx: mpsc::Receiver<ChannelCommand>) {
        *self.commands.lock() = Some(rx);
    }

    /// Create and attach a command queue, returning its sending side
    pub fn command_sender(&self, capacity: usize) -> mpsc::Sender<ChannelCommand> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.attach_commands(rx);
        tx
    }

    /// Spawn the channel loop. Calling it on a running channel does nothing.
    pub async fn start(&self) -> Result<()> {
        let mut task = self.task.lock().await;
        if let Some(current) = task.as_ref() {
            if !current.handle.is_finished() {
                debug!("Ch{} already running", self.id());
                return Ok(());
            }
        }
        if let Some(finished) = task.take() {
            self.reap(finished.handle).await;
        }

        let cancel = CancellationToken::new();
        self.shared.running.store(true, Ordering::SeqCst);
        self.shared.status.write().running = true;

        let commands = self.commands.lock().take();
        let handle = tokio::spawn(run_loop(
            Arc::clone(&self.shared),
            cancel.clone(),
            commands,
        ));
        *task = Some(RunningTask { cancel, handle });

        info!("Ch{} started ({})", self.id(), self.shared.protocol);
        Ok(())
    }

    /// Cancel the loop and wait for it to exit
    ///
    /// In-flight I/O finishes or times out first; the engine is disconnected
    /// before this returns.
    pub async fn stop(&self) {
        let mut task = self.task.lock().await;
        let Some(current) = task.take() else {
            return;
        };
        if !current.handle.is_finished() {
            self.shared
                .set_state(ConnectionState::Stopping, "stop requested");
        }
        current.cancel.cancel();
        self.reap(current.handle).await;
        info!("Ch{} stopped", self.id());
    }

    async fn reap(&self, handle: JoinHandle<Option<CommandReceiver>>) {
        match handle.await {
            Ok(Some(rx)) => *self.commands.lock() = Some(rx),
            Ok(None) => {},
            Err(e) => {
                error!("Ch{} loop task failed: {}", self.id(), e);
                self.shared.mark_stopped();
            },
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.status.read().connected
    }

    pub fn status(&self) -> ChannelStatus {
        self.shared.status.read().clone()
    }

    pub fn point_table(&self) -> Arc<PointTable> {
        self.shared.points()
    }

    /// Every configured point with its last known value
    pub fn get_all_points(&self) -> Vec<PointSnapshot> {
        self.shared
            .points()
            .iter()
            .map(|point| self.snapshot(point))
            .collect()
    }

    pub fn get_points_by_type(&self, point_type: PointType) -> Vec<PointSnapshot> {
        self.shared
            .points()
            .by_type(point_type)
            .map(|point| self.snapshot(point))
            .collect()
    }

    pub fn get_value(&self, point_id: u32) -> Option<PointReading> {
        self.shared
            .values
            .get(&point_id)
            .map(|entry| entry.value().clone())
    }

    fn snapshot(&self, point: &DataPointConfig) -> PointSnapshot {
        PointSnapshot {
            point: point.clone(),
            reading: self.get_value(point.id),
        }
    }

    /// Write a value to a control or adjustment point with default options
    pub async fn write_point(&self, point_id: u32, value: f64) -> Result<()> {
        let point_type = self
            .shared
            .points()
            .get(point_id)
            .map(|p| p.point_type)
            .ok_or_else(|| ComSrvError::point_not_found(point_id))?;
        self.execute_point_command(point_id, PointCommand::for_point(point_type, value))
            .await
    }

    /// Write a prepared command (confirmation, timeout, operator)
    ///
    /// The command timeout bounds the wait for the engine. Once the write
    /// has started it runs to completion under the engine's own response
    /// timeout, so no request is abandoned half way on a shared line.
    pub async fn execute_point_command(&self, point_id: u32, command: PointCommand) -> Result<()> {
        if !self.is_running() {
            return Err(ComSrvError::channel(format!(
                "channel {} is not running",
                self.id()
            )));
        }
        self.shared.execute(point_id, command).await
    }

    /// Read one point from the device outside the cycle schedule
    pub async fn read_point(&self, point_id: u32) -> Result<PointReading> {
        let point = self
            .shared
            .points()
            .get(point_id)
            .cloned()
            .ok_or_else(|| ComSrvError::point_not_found(point_id))?;
        let mut engine = self.shared.engine.lock().await;
        Ok(engine.read_point(&point).await?)
    }

    /// Swap the point table at a cycle boundary
    ///
    /// The engine re-validates first; on failure the old table stays active.
    pub async fn reload_points(&self, points: PointTable) -> Result<()> {
        let mut engine = self.shared.engine.lock().await;
        engine.prepare(&points)?;

        self.shared
            .values
            .retain(|id, _| points.get(*id).is_some());
        let count = points.len();
        *self.shared.points.write() = Arc::new(points);
        drop(engine);

        info!("Ch{} reloaded {} points", self.id(), count);
        Ok(())
    }
}

impl ChannelShared {
    fn points(&self) -> Arc<PointTable> {
        Arc::clone(&self.points.read())
    }

    fn set_state(&self, state: ConnectionState, reason: &str) {
        let old = std::mem::replace(&mut self.status.write().state, state);
        self.logger.log_status(old, state, reason);
    }

    fn active_state(&self) -> ConnectionState {
        match self.role {
            DeviceRole::Master => ConnectionState::Polling,
            DeviceRole::Slave => ConnectionState::Listening,
        }
    }

    fn on_connected(&self) {
        self.status.write().connected = true;
        self.set_state(self.active_state(), "connected");
    }

    fn on_connect_failed(&self, err: &ComLinkError) {
        let mut status = self.status.write();
        status.connected = false;
        status.transport_errors += 1;
        status.reconnect_attempts += 1;
        status.last_error = Some(err.to_string());
    }

    fn mark_stopped(&self) {
        {
            let mut status = self.status.write();
            status.running = false;
            status.connected = false;
        }
        self.set_state(ConnectionState::Stopped, "loop exited");
        self.running.store(false, Ordering::SeqCst);
    }

    async fn apply_cycle(&self, output: CycleOutput) {
        {
            let mut status = self.status.write();
            status.poll_cycles += 1;
            status.protocol_errors += u64::from(output.protocol_errors);
            status.transport_errors += u64::from(output.transport_errors);
            let now = Utc::now();
            if output.transactions > 0 {
                status.last_response_time = Some(now);
            }
            if !output.updates.is_empty() {
                status.last_update = Some(now);
            }
            if let Some(err) = &output.last_error {
                status.last_error = Some(err.clone());
            }
        }
        for update in output.updates {
            self.publish(update).await;
        }
    }

    /// Cache and forward one update
    ///
    /// A degraded reading keeps the last good value and only changes its
    /// quality, so consumers still see the stale value flagged as such.
    async fn publish(&self, mut update: PointUpdate) {
        if !update.reading.is_valid() {
            let previous = self
                .values
                .get(&update.point_id)
                .map(|entry| entry.value().clone());
            if let Some(previous) = previous {
                update.reading = previous.with_quality(update.reading.quality());
            }
        }
        self.values
            .insert(update.point_id, update.reading.clone());

        if self.updates.send(update).await.is_err() {
            debug!("Ch{} publisher queue closed", self.config.id);
        }
    }

    /// Mark every polled point as unreachable after the link dropped
    async fn on_link_lost(&self, err: &ComLinkError, points: &PointTable) {
        warn!("Ch{} link lost: {}", self.config.id, err);
        {
            let mut status = self.status.write();
            status.connected = false;
            status.transport_errors += 1;
            status.last_error = Some(err.to_string());
        }
        if let Err(e) = self.engine.lock().await.disconnect().await {
            debug!("Ch{} disconnect after link loss: {}", self.config.id, e);
        }
        for point in points.pollable() {
            self.publish(PointUpdate {
                channel_id: self.config.id,
                point_id: point.id,
                point_type: point.point_type,
                reading: PointReading::degraded(point, Quality::CommFailure),
            })
            .await;
        }
    }

    async fn handle_command(&self, command: ChannelCommand) {
        let ChannelCommand {
            point_id,
            value,
            reply,
        } = command;

        let outcome = match self.command_for(point_id, value) {
            Ok(cmd) => self.execute(point_id, cmd).await,
            Err(e) => Err(e),
        };
        let outcome = match outcome {
            Ok(()) => CommandOutcome::Accepted,
            Err(e) => CommandOutcome::Rejected(e.to_string()),
        };

        if let Some(reply) = reply {
            if reply.send(outcome).is_err() {
                debug!("Ch{} command {} requester gone", self.config.id, point_id);
            }
        }
    }

    fn command_for(&self, point_id: u32, value: f64) -> Result<PointCommand> {
        let points = self.points();
        let point = points
            .get(point_id)
            .ok_or_else(|| ComSrvError::point_not_found(point_id))?;
        Ok(PointCommand::for_point(point.point_type, value))
    }

    async fn execute(&self, point_id: u32, command: PointCommand) -> Result<()> {
        let point = self
            .points()
            .get(point_id)
            .cloned()
            .ok_or_else(|| ComSrvError::point_not_found(point_id))?;

        let result = if !point.point_type.is_command() {
            Err(ComLinkError::rejected(format!(
                "point {} is {} and cannot be commanded",
                point_id, point.point_type
            )))
        } else if !point.enabled {
            Err(ComLinkError::rejected(format!("point {} is disabled", point_id)))
        } else {
            let timeout = command.timeout();
            match tokio::time::timeout(timeout, self.engine.lock()).await {
                Ok(mut engine) => {
                    let started = Instant::now();
                    let result = engine.write_point(&point, &command).await;
                    if started.elapsed() > timeout {
                        warn!(
                            "Ch{} command on point {} took {:?}, over its {:?} timeout",
                            self.config.id,
                            point_id,
                            started.elapsed(),
                            timeout
                        );
                    }
                    result
                },
                Err(_) => Err(ComLinkError::CommandTimeout(format!(
                    "point {}: engine busy for {:?}",
                    point_id, timeout
                ))),
            }
        };

        match result {
            Ok(()) => {
                self.logger
                    .log_command(point_id, command.value(), "accepted");
                let reading = if point.point_type.is_digital() {
                    PointReading::digital(command.value() != 0.0)
                } else {
                    PointReading::analog(command.value(), point.unit.clone())
                };
                self.publish(PointUpdate {
                    channel_id: self.config.id,
                    point_id,
                    point_type: point.point_type,
                    reading,
                })
                .await;
                Ok(())
            },
            Err(e) => {
                self.logger
                    .log_command(point_id, command.value(), &format!("rejected: {}", e));
                let mut status = self.status.write();
                status.command_errors += 1;
                status.last_error = Some(e.to_string());
                Err(e.into())
            },
        }
    }
}

/// Errors that retrying cannot fix
fn is_permanent(err: &ComLinkError) -> bool {
    err.kind() == ErrorKind::Configuration
        || matches!(err, ComLinkError::Transport(TransportError::Config(_)))
}

async fn next_command(commands: &mut Option<CommandReceiver>) -> Option<ChannelCommand> {
    match commands {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn drain_commands(shared: &ChannelShared, commands: &mut Option<CommandReceiver>) {
    let Some(rx) = commands.as_mut() else {
        return;
    };
    while let Ok(command) = rx.try_recv() {
        shared.handle_command(command).await;
    }
}

/// Sleep until `duration` elapses, serving commands meanwhile
///
/// Returns false when cancelled.
async fn wait(
    shared: &ChannelShared,
    duration: Duration,
    cancel: &CancellationToken,
    commands: &mut Option<CommandReceiver>,
) -> bool {
    let deadline = Instant::now() + duration;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep_until(deadline) => return true,
            command = next_command(commands) => match command {
                Some(command) => shared.handle_command(command).await,
                None => *commands = None,
            },
        }
    }
}

async fn run_loop(
    shared: Arc<ChannelShared>,
    cancel: CancellationToken,
    mut commands: Option<CommandReceiver>,
) -> Option<CommandReceiver> {
    let id = shared.config.id;
    let interval = shared
        .engine
        .lock()
        .await
        .cycle_interval(shared.config.polling_interval());
    let mut reconnect = ReconnectHelper::new(shared.reconnect.clone());

    while !cancel.is_cancelled() {
        let connected = shared.engine.lock().await.is_connected();
        if !connected {
            shared.set_state(ConnectionState::Connecting, "opening transport");
            let result = shared.engine.lock().await.connect().await;
            match result {
                Ok(()) => {
                    reconnect.mark_connected();
                    shared.on_connected();
                },
                Err(e) if is_permanent(&e) => {
                    error!("Ch{} cannot connect: {}", id, e);
                    shared.on_connect_failed(&e);
                    break;
                },
                Err(e) => {
                    shared.on_connect_failed(&e);
                    let Some(delay) = reconnect.record_failure() else {
                        error!(
                            "Ch{} giving up after {} attempts: {}",
                            id,
                            reconnect.failures(),
                            e
                        );
                        break;
                    };
                    shared
                        .logger
                        .log_retry(u64::from(reconnect.failures()), delay, &e.to_string());
                    shared.set_state(ConnectionState::Reconnecting, "connect failed");
                    if !wait(&shared, delay, &cancel, &mut commands).await {
                        break;
                    }
                    continue;
                },
            }
        }

        drain_commands(&shared, &mut commands).await;

        let (points, result) = {
            let mut engine = shared.engine.lock().await;
            let points = shared.points();
            let result = engine.run_cycle(&points, &cancel).await;
            (points, result)
        };

        match result {
            Ok(output) => shared.apply_cycle(output).await,
            Err(e) if e.needs_reconnect() => {
                shared.on_link_lost(&e, &points).await;
                let Some(delay) = reconnect.record_failure() else {
                    error!("Ch{} giving up after link loss: {}", id, e);
                    break;
                };
                shared
                    .logger
                    .log_retry(u64::from(reconnect.failures()), delay, &e.to_string());
                shared.set_state(ConnectionState::Reconnecting, "link lost");
                if !wait(&shared, delay, &cancel, &mut commands).await {
                    break;
                }
                continue;
            },
            Err(e) => {
                warn!("Ch{} cycle failed: {}", id, e);
                let mut status = shared.status.write();
                status.poll_cycles += 1;
                status.protocol_errors += 1;
                status.last_error = Some(e.to_string());
            },
        }

        if interval.is_zero() {
            tokio::task::yield_now().await;
        } else if !wait(&shared, interval, &cancel, &mut commands).await {
            break;
        }
    }

    if let Err(e) = shared.engine.lock().await.disconnect().await {
        warn!("Ch{} disconnect failed: {}", id, e);
    }
    shared.mark_stopped();
    commands
}
