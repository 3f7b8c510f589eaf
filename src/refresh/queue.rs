//! At-least-once delivery of refresh batches to consumers.
//!
//! [`QueueTransport`] is the seam to whatever broker carries work items.
//! [`MemoryQueue`] is the in-process implementation used by `serve` and tests:
//! a nacked batch comes back after a delay until it has been delivered
//! `max_deliveries` times, then it is dead-lettered.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

use super::dispatcher::PipelineError;
use super::message::{RefreshBatch, RefreshNotification};

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue is closed")]
    Closed,
    #[error("Queue is full")]
    Full,
}

/// One delivery of a batch. `attempt` starts at 1.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub id: u64,
    pub attempt: u32,
    pub batch: RefreshBatch,
}

#[async_trait]
pub trait QueueTransport: Send + Sync {
    async fn publish(&self, batch: RefreshBatch) -> Result<(), QueueError>;
    /// Next delivery, or `None` once the queue is closed and drained.
    async fn receive(&self) -> Option<Delivery>;
    async fn ack(&self, delivery: &Delivery);
    /// Hand the batch back for redelivery.
    async fn nack(&self, delivery: Delivery, reason: &str);
}

/// Anything that can process a delivered batch.
#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: &RefreshBatch) -> Result<RefreshNotification, PipelineError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub published: u64,
    pub acked: u64,
    pub redelivered: u64,
    pub dead_lettered: u64,
}

pub struct MemoryQueue {
    sender: Mutex<Option<mpsc::Sender<Delivery>>>,
    receiver: tokio::sync::Mutex<mpsc::Receiver<Delivery>>,
    next_id: AtomicU64,
    max_deliveries: u32,
    redelivery_delay: Duration,
    dead_letters: Mutex<Vec<RefreshBatch>>,
    published: AtomicU64,
    acked: AtomicU64,
    redelivered: AtomicU64,
}

impl MemoryQueue {
    pub fn new(capacity: usize, max_deliveries: u32, redelivery_delay: Duration) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        Self {
            sender: Mutex::new(Some(tx)),
            receiver: tokio::sync::Mutex::new(rx),
            next_id: AtomicU64::new(1),
            max_deliveries: max_deliveries.max(1),
            redelivery_delay,
            dead_letters: Mutex::new(Vec::new()),
            published: AtomicU64::new(0),
            acked: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
        }
    }

    /// Stop accepting batches. Consumers drain what is queued, including
    /// redeliveries already scheduled, then `receive` returns `None`.
    pub fn close(&self) {
        self.sender_guard().take();
    }

    pub fn dead_letters(&self) -> Vec<RefreshBatch> {
        self.dead_letters_guard().clone()
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            published: self.published.load(Ordering::Relaxed),
            acked: self.acked.load(Ordering::Relaxed),
            redelivered: self.redelivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_letters().len() as u64,
        }
    }

    fn sender(&self) -> Option<mpsc::Sender<Delivery>> {
        self.sender_guard().clone()
    }

    fn sender_guard(&self) -> std::sync::MutexGuard<'_, Option<mpsc::Sender<Delivery>>> {
        self.sender.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dead_letters_guard(&self) -> std::sync::MutexGuard<'_, Vec<RefreshBatch>> {
        self.dead_letters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl QueueTransport for MemoryQueue {
    async fn publish(&self, batch: RefreshBatch) -> Result<(), QueueError> {
        let sender = self.sender().ok_or(QueueError::Closed)?;
        let delivery = Delivery {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            attempt: 1,
            batch,
        };
        sender.try_send(delivery).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => QueueError::Full,
            mpsc::error::TrySendError::Closed(_) => QueueError::Closed,
        })?;
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn receive(&self) -> Option<Delivery> {
        self.receiver.lock().await.recv().await
    }

    async fn ack(&self, delivery: &Delivery) {
        self.acked.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(
            delivery_id = delivery.id,
            batch_id = %delivery.batch.batch_id,
            attempt = delivery.attempt,
            "Batch acknowledged"
        );
    }

    async fn nack(&self, delivery: Delivery, reason: &str) {
        if delivery.attempt >= self.max_deliveries {
            tracing::error!(
                delivery_id = delivery.id,
                batch_id = %delivery.batch.batch_id,
                attempts = delivery.attempt,
                reason = %reason,
                "Batch dead-lettered after max deliveries"
            );
            self.dead_letters_guard().push(delivery.batch);
            return;
        }

        let Some(sender) = self.sender() else {
            tracing::warn!(batch_id = %delivery.batch.batch_id, "Queue closed, dropping redelivery");
            return;
        };

        tracing::warn!(
            delivery_id = delivery.id,
            batch_id = %delivery.batch.batch_id,
            attempt = delivery.attempt,
            delay_ms = self.redelivery_delay.as_millis() as u64,
            reason = %reason,
            "Batch failed, scheduling redelivery"
        );
        self.redelivered.fetch_add(1, Ordering::Relaxed);

        let delay = self.redelivery_delay;
        let redelivery = Delivery {
            attempt: delivery.attempt + 1,
            ..delivery
        };
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if sender.send(redelivery).await.is_err() {
                tracing::debug!("Queue closed before redelivery");
            }
        });
    }
}

/// Pull deliveries until the queue closes or `shutdown` flips to true.
///
/// `Ok` acks the batch. `Err` (a pipeline-level failure) nacks it so the
/// transport redelivers; per-feed failures never reach this point.
pub async fn run_consumer(
    queue: Arc<dyn QueueTransport>,
    handler: Arc<dyn BatchHandler>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            break;
        }

        let delivery = tokio::select! {
            delivery = queue.receive() => delivery,
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
                continue;
            }
        };
        let Some(delivery) = delivery else {
            break;
        };

        match handler.handle(&delivery.batch).await {
            Ok(notification) => {
                tracing::debug!(
                    batch_id = %notification.batch_id,
                    new_entries = notification.new_entries_count,
                    "Batch handled"
                );
                queue.ack(&delivery).await;
            }
            Err(e) => {
                let reason = e.to_string();
                queue.nack(delivery, &reason).await;
            }
        }
    }
    tracing::debug!("Queue consumer stopped");
}
