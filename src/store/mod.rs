//! Group store contract: keyed storage with version-conditional writes.
//!
//! Every backend must make `append`, `delete_if_version`, and
//! `finalize_if_version` atomic with respect to the stored `version`; the
//! conditional delete is the only finalize barrier shared by the ingestor
//! and the sweeper.

pub mod memory;
pub mod sqlite;
#[cfg(test)]
pub(crate) mod testing;

use crate::aggregation::types::{ArrivalEvent, FinalizedBatch, GroupKey, MessageGroup};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};

pub use memory::MemoryGroupStore;
pub use sqlite::SqliteGroupStore;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Busy/locked/unavailable backend; safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    #[error("version conflict on group {key}: expected {expected}, found {actual}")]
    VersionConflict {
        key: GroupKey,
        expected: u64,
        actual: u64,
    },
    #[error("group {0} not found")]
    NotFound(GroupKey),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateResult {
    pub group: MessageGroup,
    pub created: bool,
}

#[async_trait]
pub trait GroupStore: Send + Sync {
    fn name(&self) -> &str;

    /// Clock this store stamps groups with; staleness and threshold checks
    /// read it too. It is the local process clock, so stores shared between
    /// processes assume those processes agree on the time.
    fn now(&self) -> DateTime<Utc>;

    /// Insert a one-item group unless the key already holds one.
    async fn create_if_absent(
        &self,
        key: &GroupKey,
        event: &ArrivalEvent,
    ) -> Result<CreateResult, StoreError>;

    async fn get(&self, key: &GroupKey) -> Result<Option<MessageGroup>, StoreError>;

    /// Append if the stored version equals `expected_version`.
    async fn append(
        &self,
        key: &GroupKey,
        event: &ArrivalEvent,
        expected_version: u64,
    ) -> Result<MessageGroup, StoreError>;

    /// `true` only if this call removed the group.
    async fn delete_if_version(
        &self,
        key: &GroupKey,
        expected_version: u64,
    ) -> Result<bool, StoreError>;

    /// Conditional delete that records `batch` in the pending outbox in the
    /// same atomic step. `false` means another actor already finalized.
    async fn finalize_if_version(
        &self,
        key: &GroupKey,
        expected_version: u64,
        batch: &FinalizedBatch,
    ) -> Result<bool, StoreError>;

    /// Record a batch that never had a stored group (passthrough arrivals) in
    /// the pending outbox. Re-staging the same key is a no-op.
    async fn stage_batch(&self, batch: &FinalizedBatch) -> Result<(), StoreError>;

    /// Groups whose last update is at least `age` old by the store clock.
    async fn scan_older_than(&self, age: ChronoDuration) -> Result<Vec<MessageGroup>, StoreError>;

    /// Outbox batches recorded at least `age` ago and not yet acknowledged.
    async fn pending_batches(&self, age: ChronoDuration)
        -> Result<Vec<FinalizedBatch>, StoreError>;

    /// Remove an outbox entry once a durable queue accepted it or the
    /// in-process consumer handled it.
    async fn ack_batch(&self, idempotency_key: &str) -> Result<bool, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_errors_are_retryable() {
        assert!(StoreError::Transient("busy".into()).is_transient());
        assert!(!StoreError::NotFound(GroupKey::new("k")).is_transient());
        assert!(!StoreError::VersionConflict {
            key: GroupKey::new("k"),
            expected: 1,
            actual: 2
        }
        .is_transient());
    }

    #[test]
    fn version_conflict_message_names_both_versions() {
        let err = StoreError::VersionConflict {
            key: GroupKey::new("abc"),
            expected: 3,
            actual: 4,
        };
        assert_eq!(
            err.to_string(),
            "version conflict on group abc: expected 3, found 4"
        );
    }
}
