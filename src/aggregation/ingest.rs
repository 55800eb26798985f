//! Arrival ingestion: route each event into its group under optimistic
//! concurrency and finalize inline when policy says so.

use super::emit::{Emitter, FinalizePath};
use super::policy::AggregationPolicy;
use super::types::{ArrivalEvent, DropReason, GroupKey, IngestOutcome, MessageGroup};
use crate::observability::Metrics;
use crate::retry::Backoff;
use crate::store::{GroupStore, StoreError};
use std::future::Future;
use std::sync::Arc;

#[derive(Clone)]
pub struct Ingestor {
    store: Arc<dyn GroupStore>,
    policy: AggregationPolicy,
    emitter: Emitter,
    store_retry: Backoff,
    append_max_attempts: u32,
    metrics: Metrics,
}

impl Ingestor {
    pub fn new(policy: AggregationPolicy, emitter: Emitter, append_max_attempts: u32) -> Self {
        Self {
            store: emitter.store().clone(),
            store_retry: emitter.store_retry(),
            metrics: emitter.metrics().clone(),
            policy,
            emitter,
            append_max_attempts: append_max_attempts.max(1),
        }
    }

    pub fn policy(&self) -> &AggregationPolicy {
        &self.policy
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    /// Drive one arrival to a terminal outcome. An `Err` means the store
    /// stayed unavailable beyond the retry budget.
    pub async fn ingest(&self, event: ArrivalEvent) -> Result<IngestOutcome, StoreError> {
        let result = self.route(&event).await;
        match &result {
            Ok(outcome) => self.metrics.record_arrival(outcome.label()),
            Err(e) => {
                self.metrics.record_arrival("failed");
                tracing::error!(
                    "Ingest of {} from {} failed: {e}",
                    event.payload_ref,
                    event.sender_id
                );
            }
        }
        result
    }

    async fn route(&self, event: &ArrivalEvent) -> Result<IngestOutcome, StoreError> {
        let key = self.policy.group_key(event);
        if !self.policy.is_aggregatable(event) {
            let batch = self.emitter.passthrough(event, key).await?;
            return Ok(IngestOutcome::Passthrough(batch));
        }

        let mut attempts = 0u32;
        'create: loop {
            let created = self
                .with_retry("create_if_absent", || self.store.create_if_absent(&key, event))
                .await?;
            if created.created {
                tracing::debug!("Opened group {key} for {}", event.sender_id);
                return self.evaluate(created.group).await;
            }

            let mut group = created.group;
            loop {
                if self.policy.is_full(&group) {
                    return Ok(self.overflow(event, group).await);
                }
                match self
                    .with_retry("append", || self.store.append(&key, event, group.version))
                    .await
                {
                    Ok(updated) => {
                        tracing::debug!(
                            "Appended {} to group {key} ({} item(s), version {})",
                            event.payload_ref,
                            updated.item_count,
                            updated.version
                        );
                        return self.evaluate(updated).await;
                    }
                    Err(StoreError::VersionConflict { .. }) => {
                        attempts += 1;
                        if attempts >= self.append_max_attempts {
                            return Ok(self.contention(event, key));
                        }
                        match self.with_retry("get", || self.store.get(&key)).await? {
                            Some(latest) => group = latest,
                            None => continue 'create,
                        }
                    }
                    Err(StoreError::NotFound(_)) => {
                        // Finalized between our read and write; start a fresh group.
                        attempts += 1;
                        if attempts >= self.append_max_attempts {
                            return Ok(self.contention(event, key));
                        }
                        continue 'create;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }

    async fn evaluate(&self, group: MessageGroup) -> Result<IngestOutcome, StoreError> {
        if !self.policy.should_finalize_inline(&group, self.store.now()) {
            return Ok(IngestOutcome::Buffered {
                group_key: group.group_key,
                item_count: group.item_count,
            });
        }
        match self
            .emitter
            .finalize(&group, FinalizePath::Inline)
            .await?
            .into_batch()
        {
            Some(batch) => Ok(IngestOutcome::Finalized(batch)),
            None => Ok(IngestOutcome::Buffered {
                group_key: group.group_key,
                item_count: group.item_count,
            }),
        }
    }

    async fn overflow(&self, event: &ArrivalEvent, full: MessageGroup) -> IngestOutcome {
        self.metrics.record_overflow();
        tracing::warn!(
            "Group {} for {} already holds {} item(s); dropping {}",
            full.group_key,
            event.sender_id,
            full.item_count,
            event.payload_ref
        );
        if let Err(e) = self.emitter.finalize(&full, FinalizePath::Inline).await {
            tracing::error!("Finalize of full group {} failed: {e}", full.group_key);
        }
        IngestOutcome::Dropped {
            group_key: full.group_key,
            reason: DropReason::CapacityExceeded,
        }
    }

    fn contention(&self, event: &ArrivalEvent, key: GroupKey) -> IngestOutcome {
        tracing::error!(
            "Gave up appending {} to group {key} after {} attempts; arrival dropped",
            event.payload_ref,
            self.append_max_attempts
        );
        IngestOutcome::Dropped {
            group_key: key,
            reason: DropReason::Contention,
        }
    }

    async fn with_retry<T, F, Fut>(&self, label: &str, op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        self.store_retry
            .retry(label, StoreError::is_transient, op)
            .await
    }
}
