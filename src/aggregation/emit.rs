//! Finalization. Winning the conditional delete moves the batch into the
//! store's pending outbox in the same atomic step; only then is it
//! published. A publish that fails past its retry budget leaves the batch in
//! the outbox for the sweeper's relay, under the same idempotency key.
//!
//! Acceptance by a durable queue acks the outbox entry here. For the
//! in-process queue the consumer acks once its handler has run, so a failed
//! handler or a crash leaves the entry for the relay.

use super::types::{ArrivalEvent, FinalizedBatch, GroupKey, MessageGroup};
use crate::config::RetryConfig;
use crate::observability::Metrics;
use crate::publisher::{BatchPublisher, PublishError};
use crate::retry::Backoff;
use crate::store::{GroupStore, StoreError};
use std::sync::Arc;
use std::time::Duration;

/// Which actor won the conditional delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizePath {
    Inline,
    Sweeper,
    Passthrough,
}

impl FinalizePath {
    pub fn label(self) -> &'static str {
        match self {
            Self::Inline => "inline",
            Self::Sweeper => "sweeper",
            Self::Passthrough => "passthrough",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Accepted by the queue.
    Published(FinalizedBatch),
    /// Group destroyed, batch waiting in the outbox for a republish.
    Deferred(FinalizedBatch),
    /// Another actor finalized this group version first; nothing emitted.
    LostRace,
}

impl FinalizeOutcome {
    pub fn into_batch(self) -> Option<FinalizedBatch> {
        match self {
            Self::Published(batch) | Self::Deferred(batch) => Some(batch),
            Self::LostRace => None,
        }
    }
}

#[derive(Clone)]
pub struct Emitter {
    store: Arc<dyn GroupStore>,
    publisher: Arc<dyn BatchPublisher>,
    store_retry: Backoff,
    publish_retry: Backoff,
    max_items: usize,
    metrics: Metrics,
}

impl Emitter {
    pub fn new(
        store: Arc<dyn GroupStore>,
        publisher: Arc<dyn BatchPublisher>,
        max_items: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            publisher,
            store_retry: Backoff::from(&RetryConfig::default()),
            publish_retry: Backoff::new(3, Duration::from_millis(200), Duration::from_secs(5)),
            max_items: max_items.max(1),
            metrics,
        }
    }

    #[must_use]
    pub fn with_store_retry(mut self, backoff: Backoff) -> Self {
        self.store_retry = backoff;
        self
    }

    #[must_use]
    pub fn with_publish_retry(mut self, backoff: Backoff) -> Self {
        self.publish_retry = backoff;
        self
    }

    pub fn store(&self) -> &Arc<dyn GroupStore> {
        &self.store
    }

    pub fn store_retry(&self) -> Backoff {
        self.store_retry
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Finalize `group` at the version the caller observed.
    pub async fn finalize(
        &self,
        group: &MessageGroup,
        path: FinalizePath,
    ) -> Result<FinalizeOutcome, StoreError> {
        let batch = FinalizedBatch::from_group(group, self.max_items, self.store.now());
        let won = self
            .store_retry
            .retry("finalize", StoreError::is_transient, || {
                self.store
                    .finalize_if_version(&group.group_key, group.version, &batch)
            })
            .await?;
        if !won {
            tracing::debug!(
                "Lost finalize race on group {} at version {} ({})",
                group.group_key,
                group.version,
                path.label()
            );
            return Ok(FinalizeOutcome::LostRace);
        }

        self.metrics.record_batch(path.label());
        tracing::info!(
            "Finalized group {} for {} with {} item(s) via {} (idempotency key: {})",
            group.group_key,
            batch.sender_id,
            batch.item_count,
            path.label(),
            batch.idempotency_key
        );
        Ok(if self.deliver(&batch).await {
            FinalizeOutcome::Published(batch)
        } else {
            FinalizeOutcome::Deferred(batch)
        })
    }

    /// Emit a non-aggregatable arrival as its own one-item batch.
    pub async fn passthrough(
        &self,
        event: &ArrivalEvent,
        key: GroupKey,
    ) -> Result<FinalizedBatch, StoreError> {
        let now = self.store.now();
        let group = MessageGroup::open(key, event.clone(), now);
        let batch = FinalizedBatch::from_group(&group, 1, now);
        self.store_retry
            .retry("stage_batch", StoreError::is_transient, || {
                self.store.stage_batch(&batch)
            })
            .await?;
        self.metrics.record_batch(FinalizePath::Passthrough.label());
        tracing::debug!(
            "Passthrough arrival from {} on {} (idempotency key: {})",
            event.sender_id,
            event.channel,
            batch.idempotency_key
        );
        self.deliver(&batch).await;
        Ok(batch)
    }

    /// Publish an outbox batch again, keeping its idempotency key.
    pub async fn republish(&self, batch: &FinalizedBatch) -> Result<(), PublishError> {
        self.publish_with_retry(batch).await?;
        if self.publisher.is_durable() {
            self.acknowledge(batch).await;
        }
        Ok(())
    }

    async fn deliver(&self, batch: &FinalizedBatch) -> bool {
        match self.publish_with_retry(batch).await {
            Ok(()) => {
                if self.publisher.is_durable() {
                    self.acknowledge(batch).await;
                }
                true
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                tracing::warn!(
                    "Publish of {} via {} failed, left in outbox for relay: {e}",
                    batch.idempotency_key,
                    self.publisher.name()
                );
                false
            }
        }
    }

    async fn publish_with_retry(&self, batch: &FinalizedBatch) -> Result<(), PublishError> {
        self.publish_retry
            .retry("publish", PublishError::is_retryable, || {
                self.publisher.publish(batch)
            })
            .await
    }

    async fn acknowledge(&self, batch: &FinalizedBatch) {
        // An unacked entry is republished later; the consumer gate absorbs it.
        let acked = self
            .store_retry
            .retry("ack_batch", StoreError::is_transient, || {
                self.store.ack_batch(&batch.idempotency_key)
            })
            .await;
        if let Err(e) = acked {
            tracing::warn!("Failed to ack {} in outbox: {e}", batch.idempotency_key);
        }
    }
}
