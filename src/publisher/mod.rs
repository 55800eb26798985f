//! Downstream queue seam. A publish is "accepted" once the queue has taken
//! ownership of the batch; delivery from there on is at-least-once.

pub mod http;

use crate::aggregation::types::FinalizedBatch;
use async_trait::async_trait;
use tokio::sync::mpsc;

pub use http::HttpPublisher;

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    /// The queue refused the batch; retrying the same payload will not help.
    #[error("batch rejected by queue: {0}")]
    Rejected(String),
    #[error("queue transport failure: {0}")]
    Transport(String),
    #[error("queue closed")]
    Closed,
}

impl PublishError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_))
    }
}

#[async_trait]
pub trait BatchPublisher: Send + Sync {
    fn name(&self) -> &str;

    /// Whether an accepted batch outlives this process. A non-durable queue
    /// leaves the outbox entry in place until the consumer has handled it.
    fn is_durable(&self) -> bool {
        true
    }

    async fn publish(&self, batch: &FinalizedBatch) -> Result<(), PublishError>;
}

/// Bounded in-process queue feeding the built-in consumer. Batches in it
/// die with the process, so the consumer acks the outbox after handling.
#[derive(Debug, Clone)]
pub struct ChannelPublisher {
    tx: mpsc::Sender<FinalizedBatch>,
}

impl ChannelPublisher {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<FinalizedBatch>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl BatchPublisher for ChannelPublisher {
    fn name(&self) -> &str {
        "channel"
    }

    fn is_durable(&self) -> bool {
        false
    }

    async fn publish(&self, batch: &FinalizedBatch) -> Result<(), PublishError> {
        self.tx
            .send(batch.clone())
            .await
            .map_err(|_| PublishError::Closed)
    }
}
