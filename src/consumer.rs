//! Downstream consumer for the in-process queue. Every batch goes through the
//! idempotency gate first, so republished batches run their handler once.
//!
//! The in-process queue does not survive a crash, so when an outbox is
//! attached the consumer acks each batch only after the gate reports it
//! handled. A failed handler leaves the entry for the sweeper's relay.

use crate::aggregation::types::FinalizedBatch;
use crate::config::RetryConfig;
use crate::idempotency::{GateError, GateOutcome, IdempotencyGate};
use crate::observability::Metrics;
use crate::retry::Backoff;
use crate::store::{GroupStore, StoreError};
use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How often completed ledger records past retention are purged.
const PURGE_INTERVAL_SECS: u64 = 3_600;

#[async_trait]
pub trait BatchHandler: Send + Sync {
    async fn handle(&self, batch: &FinalizedBatch) -> anyhow::Result<()>;
}

/// Logs a one-line summary per batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl BatchHandler for LoggingHandler {
    async fn handle(&self, batch: &FinalizedBatch) -> anyhow::Result<()> {
        let refs: Vec<&str> = batch.items.iter().map(|i| i.payload_ref.as_str()).collect();
        tracing::info!(
            "Batch {} from {}: {} item(s) [{}]{}",
            batch.idempotency_key,
            batch.sender_id,
            batch.item_count,
            refs.join(", "),
            batch
                .combined_text()
                .map(|t| format!(" text: {t}"))
                .unwrap_or_default()
        );
        Ok(())
    }
}

pub struct Consumer {
    gate: IdempotencyGate,
    handler: Arc<dyn BatchHandler>,
    metrics: Metrics,
    retention: ChronoDuration,
    outbox: Option<Arc<dyn GroupStore>>,
    store_retry: Backoff,
}

impl Consumer {
    pub fn new(gate: IdempotencyGate, handler: Arc<dyn BatchHandler>, metrics: Metrics) -> Self {
        Self {
            gate,
            handler,
            metrics,
            retention: ChronoDuration::days(7),
            outbox: None,
            store_retry: Backoff::from(&RetryConfig::default()),
        }
    }

    #[must_use]
    pub fn with_store_retry(mut self, backoff: Backoff) -> Self {
        self.store_retry = backoff;
        self
    }

    /// Ack handled batches in `store`'s outbox.
    #[must_use]
    pub fn with_outbox(mut self, store: Arc<dyn GroupStore>) -> Self {
        self.outbox = Some(store);
        self
    }

    #[must_use]
    pub fn with_retention(mut self, retention: ChronoDuration) -> Self {
        self.retention = retention;
        self
    }

    /// Handle one batch at most once per idempotency key.
    pub async fn consume(
        &self,
        batch: &FinalizedBatch,
    ) -> Result<GateOutcome<()>, GateError<anyhow::Error>> {
        let outcome = self
            .gate
            .process_once(&batch.idempotency_key, || self.handler.handle(batch))
            .await?;
        if outcome.is_duplicate() {
            self.metrics.record_duplicate();
        }
        self.acknowledge(batch).await;
        Ok(outcome)
    }

    async fn acknowledge(&self, batch: &FinalizedBatch) {
        let Some(store) = &self.outbox else { return };
        // Left unacked, the relay republishes it and the gate reports a duplicate.
        let acked = self
            .store_retry
            .retry("ack_batch", StoreError::is_transient, || {
                store.ack_batch(&batch.idempotency_key)
            })
            .await;
        if let Err(e) = acked {
            tracing::warn!("Failed to ack handled batch {}: {e}", batch.idempotency_key);
        }
    }

    /// Drain `rx` until it closes or `cancel` fires.
    pub async fn run(&self, mut rx: mpsc::Receiver<FinalizedBatch>, cancel: CancellationToken) {
        let mut purge = tokio::time::interval(Duration::from_secs(PURGE_INTERVAL_SECS));
        purge.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!("Consumer started (ledger: {})", self.gate.ledger().name());

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = purge.tick() => self.purge().await,
                next = rx.recv() => {
                    let Some(batch) = next else { break };
                    if let Err(e) = self.consume(&batch).await {
                        tracing::error!("Batch {} not handled: {e:#}", batch.idempotency_key);
                    }
                }
            }
        }
        tracing::info!("Consumer stopped");
    }

    async fn purge(&self) {
        match self.gate.ledger().purge_older_than(self.retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!("Purged {removed} idempotency record(s)"),
            Err(e) => tracing::warn!("Idempotency purge failed: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregation::types::{ArrivalEvent, GroupKey, MessageGroup};
    use crate::clock::ManualClock;
    use crate::idempotency::MemoryIdempotencyLedger;
    use crate::store::MemoryGroupStore;
    use chrono::Utc;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recording {
        seen: Mutex<Vec<String>>,
        fail_next: Mutex<bool>,
    }

    #[async_trait]
    impl BatchHandler for Recording {
        async fn handle(&self, batch: &FinalizedBatch) -> anyhow::Result<()> {
            if std::mem::take(&mut *self.fail_next.lock()) {
                anyhow::bail!("analysis backend unavailable");
            }
            self.seen.lock().push(batch.idempotency_key.clone());
            Ok(())
        }
    }

    fn batch() -> FinalizedBatch {
        let now = Utc::now();
        let group = MessageGroup::open(GroupKey::new("k"), ArrivalEvent::new("+1", "a", now), now);
        FinalizedBatch::from_group(&group, 3, now)
    }

    fn consumer(handler: Arc<Recording>) -> Consumer {
        let ledger = MemoryIdempotencyLedger::new(
            Arc::new(ManualClock::at_secs(0)),
            ChronoDuration::seconds(300),
            100,
        );
        Consumer::new(
            IdempotencyGate::new(Arc::new(ledger)),
            handler,
            Metrics::new().unwrap(),
        )
    }

    #[tokio::test]
    async fn republished_batch_is_handled_once() {
        let handler = Arc::new(Recording::default());
        let consumer = consumer(handler.clone());
        let batch = batch();

        assert!(!consumer.consume(&batch).await.unwrap().is_duplicate());
        assert!(consumer.consume(&batch).await.unwrap().is_duplicate());
        assert_eq!(handler.seen.lock().len(), 1);
        assert_eq!(consumer.metrics.duplicates_skipped(), 1);
    }

    #[tokio::test]
    async fn handler_failure_allows_redelivery() {
        let handler = Arc::new(Recording::default());
        *handler.fail_next.lock() = true;
        let consumer = consumer(handler.clone());
        let batch = batch();

        assert!(matches!(consumer.consume(&batch).await, Err(GateError::Work(_))));
        assert!(!consumer.consume(&batch).await.unwrap().is_duplicate());
        assert_eq!(handler.seen.lock().as_slice(), [batch.idempotency_key.clone()]);
    }

    #[tokio::test]
    async fn outbox_entry_is_acked_only_after_handling() {
        let handler = Arc::new(Recording::default());
        *handler.fail_next.lock() = true;
        let store = Arc::new(MemoryGroupStore::new());
        let consumer = consumer(handler.clone()).with_outbox(store.clone());
        let batch = batch();
        store.stage_batch(&batch).await.unwrap();

        assert!(consumer.consume(&batch).await.is_err());
        assert_eq!(store.outbox_len(), 1);

        assert!(!consumer.consume(&batch).await.unwrap().is_duplicate());
        assert_eq!(store.outbox_len(), 0);
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn duplicate_delivery_still_acks_outbox() {
        let handler = Arc::new(Recording::default());
        let store = Arc::new(MemoryGroupStore::new());
        let consumer = consumer(handler.clone()).with_outbox(store.clone());
        let batch = batch();

        consumer.consume(&batch).await.unwrap();
        // A relay republish of an entry whose first ack was lost.
        store.stage_batch(&batch).await.unwrap();
        assert!(consumer.consume(&batch).await.unwrap().is_duplicate());
        assert_eq!(store.outbox_len(), 0);
        assert_eq!(handler.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn run_drains_until_sender_drops() {
        let handler = Arc::new(Recording::default());
        let consumer = consumer(handler.clone());
        let (tx, rx) = mpsc::channel(4);
        let batch = batch();
        tx.send(batch.clone()).await.unwrap();
        tx.send(batch.clone()).await.unwrap();
        drop(tx);

        consumer.run(rx, CancellationToken::new()).await;
        assert_eq!(handler.seen.lock().len(), 1);
    }
}
