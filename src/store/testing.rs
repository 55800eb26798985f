//! Store wrapper that injects the outcomes of concurrent writers at exact
//! points, so race handling can be tested without real parallelism.

use super::{CreateResult, GroupStore, MemoryGroupStore, StoreError};
use crate::aggregation::types::{ArrivalEvent, FinalizedBatch, GroupKey, MessageGroup};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Default)]
pub(crate) struct ScriptedStore {
    inner: Arc<MemoryGroupStore>,
    /// Every append reports a writer that got there first.
    pub conflict_appends: AtomicBool,
    /// Number of appends that find their group finalized under them.
    pub vanish_appends: AtomicU32,
    /// Number of finalizes that lose to a rival finalizer.
    pub lose_finalizes: AtomicU32,
    /// Appended by a rival writer right after the next scan returns.
    pub append_after_scan: Mutex<Option<ArrivalEvent>>,
    pub appends: AtomicU32,
}

impl ScriptedStore {
    pub fn new(inner: Arc<MemoryGroupStore>) -> Self {
        Self {
            inner,
            ..Self::default()
        }
    }

    pub fn inner(&self) -> &MemoryGroupStore {
        &self.inner
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl GroupStore for ScriptedStore {
    fn name(&self) -> &str {
        "scripted"
    }

    fn now(&self) -> DateTime<Utc> {
        self.inner.now()
    }

    async fn create_if_absent(
        &self,
        key: &GroupKey,
        event: &ArrivalEvent,
    ) -> Result<CreateResult, StoreError> {
        self.inner.create_if_absent(key, event).await
    }

    async fn get(&self, key: &GroupKey) -> Result<Option<MessageGroup>, StoreError> {
        self.inner.get(key).await
    }

    async fn append(
        &self,
        key: &GroupKey,
        event: &ArrivalEvent,
        expected_version: u64,
    ) -> Result<MessageGroup, StoreError> {
        self.appends.fetch_add(1, Ordering::SeqCst);
        if self.conflict_appends.load(Ordering::SeqCst) {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual: expected_version + 1,
            });
        }
        if take_one(&self.vanish_appends) {
            self.inner.delete_if_version(key, expected_version).await?;
            return Err(StoreError::NotFound(key.clone()));
        }
        self.inner.append(key, event, expected_version).await
    }

    async fn delete_if_version(&self, key: &GroupKey, version: u64) -> Result<bool, StoreError> {
        self.inner.delete_if_version(key, version).await
    }

    async fn finalize_if_version(
        &self,
        key: &GroupKey,
        version: u64,
        batch: &FinalizedBatch,
    ) -> Result<bool, StoreError> {
        if take_one(&self.lose_finalizes) {
            return Ok(false);
        }
        self.inner.finalize_if_version(key, version, batch).await
    }

    async fn stage_batch(&self, batch: &FinalizedBatch) -> Result<(), StoreError> {
        self.inner.stage_batch(batch).await
    }

    async fn scan_older_than(&self, age: ChronoDuration) -> Result<Vec<MessageGroup>, StoreError> {
        let groups = self.inner.scan_older_than(age).await?;
        let rival = self.append_after_scan.lock().take();
        if let (Some(event), Some(group)) = (rival, groups.first()) {
            self.inner
                .append(&group.group_key, &event, group.version)
                .await?;
        }
        Ok(groups)
    }

    async fn pending_batches(
        &self,
        age: ChronoDuration,
    ) -> Result<Vec<FinalizedBatch>, StoreError> {
        self.inner.pending_batches(age).await
    }

    async fn ack_batch(&self, idempotency_key: &str) -> Result<bool, StoreError> {
        self.inner.ack_batch(idempotency_key).await
    }
}
