//! Data publisher
//!
//! Channels push [`PointUpdate`]s into a bounded queue; a pump task drains it
//! in batches and hands them to a [`DataPublisher`]. A full queue blocks the
//! producing channel instead of dropping values.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};
use voltage_comlink::{PointReading, PointUpdate};

use crate::error::Result;

/// Largest batch handed to the publisher at once
const MAX_BATCH: usize = 256;

/// Sink for point values
#[async_trait]
pub trait DataPublisher: Send + Sync {
    async fn publish(&self, update: &PointUpdate) -> Result<()>;

    async fn publish_batch(&self, updates: &[PointUpdate]) -> Result<()> {
        for update in updates {
            self.publish(update).await?;
        }
        Ok(())
    }
}

/// Keeps the latest update per (channel, point)
#[derive(Default)]
pub struct MemoryPublisher {
    latest: DashMap<(u32, u32), PointUpdate>,
    published: AtomicU64,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel_id: u32, point_id: u32) -> Option<PointUpdate> {
        self.latest
            .get(&(channel_id, point_id))
            .map(|entry| entry.value().clone())
    }

    /// Latest readings of one channel, keyed by point id
    pub fn channel_values(&self, channel_id: u32) -> Vec<(u32, PointReading)> {
        let mut values: Vec<_> = self
            .latest
            .iter()
            .filter(|entry| entry.key().0 == channel_id)
            .map(|entry| (entry.key().1, entry.value().reading.clone()))
            .collect();
        values.sort_by_key(|(id, _)| *id);
        values
    }

    /// Updates received so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.latest.len()
    }

    pub fn is_empty(&self) -> bool {
        self.latest.is_empty()
    }
}

#[async_trait]
impl DataPublisher for MemoryPublisher {
    async fn publish(&self, update: &PointUpdate) -> Result<()> {
        trace!(
            "publish ch{} {}{} = {} ({:?})",
            update.channel_id,
            update.point_type,
            update.point_id,
            update.reading.as_f64(),
            update.reading.quality()
        );
        self.latest
            .insert((update.channel_id, update.point_id), update.clone());
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Sending side handed to channels
pub type UpdateSender = mpsc::Sender<PointUpdate>;

/// Background task moving updates from the queue to a publisher
pub struct PublisherPump {
    tx: UpdateSender,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl PublisherPump {
    pub fn spawn(publisher: Arc<dyn DataPublisher>, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let stop = CancellationToken::new();
        let task = tokio::spawn(Self::run(publisher, rx, stop.clone()));
        Self { tx, stop, task }
    }

    async fn run(
        publisher: Arc<dyn DataPublisher>,
        mut rx: mpsc::Receiver<PointUpdate>,
        stop: CancellationToken,
    ) {
        let mut batch = Vec::with_capacity(MAX_BATCH);
        loop {
            // once closed, recv yields what is buffered and then None
            let first = tokio::select! {
                biased;
                update = rx.recv() => update,
                _ = stop.cancelled() => {
                    rx.close();
                    rx.recv().await
                },
            };
            let Some(update) = first else {
                break;
            };

            batch.push(update);
            while batch.len() < MAX_BATCH {
                match rx.try_recv() {
                    Ok(update) => batch.push(update),
                    Err(_) => break,
                }
            }
            if let Err(e) = publisher.publish_batch(&batch).await {
                error!("Failed to publish {} updates: {}", batch.len(), e);
            }
            batch.clear();
        }
        debug!("Publisher pump stopped");
    }

    pub fn sender(&self) -> UpdateSender {
        self.tx.clone()
    }

    /// Close the queue and wait until every buffered update is published
    ///
    /// Stop the channels first; later sends fail.
    pub async fn shutdown(self, timeout: Duration) {
        let PublisherPump { tx, stop, task } = self;
        drop(tx);
        stop.cancel();
        if tokio::time::timeout(timeout, task).await.is_err() {
            warn!("Publisher pump did not drain within {:?}", timeout);
        }
    }
}
