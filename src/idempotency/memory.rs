//! In-process idempotency ledger with bounded cardinality.
//!
//! Only sound when every consumer shares this process; use
//! [`super::SqliteIdempotencyLedger`] when consumers are distributed.

use super::{
    validate_message_id, ClaimOutcome, ClaimToken, IdempotencyLedger, IdempotencyRecord,
    LedgerError, RecordStatus,
};
use crate::clock::SharedClock;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Entry {
    status: RecordStatus,
    created_at: DateTime<Utc>,
    token: ClaimToken,
}

#[derive(Debug)]
pub struct MemoryIdempotencyLedger {
    clock: SharedClock,
    claim_timeout: ChronoDuration,
    max_keys: usize,
    keys: Mutex<HashMap<String, Entry>>,
}

impl MemoryIdempotencyLedger {
    pub fn new(clock: SharedClock, claim_timeout: ChronoDuration, max_keys: usize) -> Self {
        Self {
            clock,
            claim_timeout,
            max_keys: max_keys.max(1),
            keys: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryIdempotencyLedger {
    fn name(&self) -> &str {
        "memory"
    }

    async fn try_claim(&self, message_id: &str) -> Result<ClaimOutcome, LedgerError> {
        let message_id = validate_message_id(message_id)?;
        let now = self.clock.now();
        let mut keys = self.keys.lock();

        if let Some(entry) = keys.get_mut(message_id) {
            let abandoned = entry.status == RecordStatus::Processing
                && now - entry.created_at >= self.claim_timeout;
            if !abandoned {
                return Ok(ClaimOutcome::Existing(entry.status));
            }
            let token = ClaimToken::fresh();
            entry.created_at = now;
            entry.token = token.clone();
            return Ok(ClaimOutcome::Claimed(token));
        }

        if keys.len() >= self.max_keys {
            // Evict the oldest completed record; in-flight claims are never evicted.
            let evict_key = keys
                .iter()
                .filter(|(_, e)| e.status == RecordStatus::Completed)
                .min_by_key(|(_, e)| e.created_at)
                .map(|(k, _)| k.clone());
            if let Some(evict_key) = evict_key {
                keys.remove(&evict_key);
            }
        }

        let token = ClaimToken::fresh();
        keys.insert(
            message_id.to_owned(),
            Entry {
                status: RecordStatus::Processing,
                created_at: now,
                token: token.clone(),
            },
        );
        Ok(ClaimOutcome::Claimed(token))
    }

    async fn complete(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError> {
        let mut keys = self.keys.lock();
        if let Some(entry) = keys.get_mut(message_id) {
            if entry.token == *token {
                entry.status = RecordStatus::Completed;
            }
        }
        Ok(())
    }

    async fn release(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError> {
        let mut keys = self.keys.lock();
        let owned = keys
            .get(message_id)
            .is_some_and(|e| e.token == *token && e.status == RecordStatus::Processing);
        if owned {
            keys.remove(message_id);
        }
        Ok(())
    }

    async fn get(&self, message_id: &str) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let keys = self.keys.lock();
        Ok(keys.get(message_id).map(|e| IdempotencyRecord {
            message_id: message_id.to_string(),
            status: e.status,
            created_at: e.created_at,
        }))
    }

    async fn purge_older_than(&self, age: ChronoDuration) -> Result<usize, LedgerError> {
        let cutoff = self.clock.now() - age;
        let mut keys = self.keys.lock();
        let before = keys.len();
        keys.retain(|_, e| !(e.status == RecordStatus::Completed && e.created_at <= cutoff));
        Ok(before - keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn ledger(max_keys: usize) -> (MemoryIdempotencyLedger, ManualClock) {
        let clock = ManualClock::at_secs(0);
        (
            MemoryIdempotencyLedger::new(
                Arc::new(clock.clone()),
                ChronoDuration::seconds(60),
                max_keys,
            ),
            clock,
        )
    }

    async fn claim(ledger: &MemoryIdempotencyLedger, id: &str) -> Option<ClaimToken> {
        match ledger.try_claim(id).await.unwrap() {
            ClaimOutcome::Claimed(token) => Some(token),
            ClaimOutcome::Existing(_) => None,
        }
    }

    #[tokio::test]
    async fn rejects_duplicate_key() {
        let (ledger, _) = ledger(10);
        assert!(claim(&ledger, "req-1").await.is_some());
        assert!(claim(&ledger, "req-1").await.is_none());
        assert!(claim(&ledger, "req-2").await.is_some());
    }

    #[tokio::test]
    async fn allows_different_keys() {
        let (ledger, _) = ledger(100);
        for key in ["key-a", "key-b", "key-c", "key-d"] {
            assert!(claim(&ledger, key).await.is_some());
        }
        assert_eq!(ledger.len(), 4);
    }

    #[tokio::test]
    async fn max_keys_clamped_to_one() {
        let (ledger, _) = ledger(0);
        assert!(claim(&ledger, "only-key").await.is_some());
        assert!(claim(&ledger, "only-key").await.is_none());
    }

    #[tokio::test]
    async fn eviction_drops_oldest_completed_and_keeps_newest() {
        let (ledger, clock) = ledger(2);
        let t1 = claim(&ledger, "k1").await.unwrap();
        ledger.complete("k1", &t1).await.unwrap();
        clock.advance_secs(1);
        let t2 = claim(&ledger, "k2").await.unwrap();
        ledger.complete("k2", &t2).await.unwrap();
        clock.advance_secs(1);
        assert!(claim(&ledger, "k3").await.is_some());

        assert_eq!(ledger.len(), 2);
        assert!(ledger.get("k1").await.unwrap().is_none());
        assert!(ledger.get("k2").await.unwrap().is_some());
        assert!(ledger.get("k3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn abandoned_claim_can_be_taken_over_once() {
        let (ledger, clock) = ledger(10);
        let stale = claim(&ledger, "slow").await.unwrap();
        clock.advance_secs(30);
        assert!(claim(&ledger, "slow").await.is_none());
        clock.advance_secs(30);
        let fresh = claim(&ledger, "slow").await.unwrap();
        assert_ne!(stale, fresh);

        // The original holder can no longer release or complete.
        ledger.release("slow", &stale).await.unwrap();
        assert!(ledger.get("slow").await.unwrap().is_some());
        ledger.complete("slow", &stale).await.unwrap();
        assert_eq!(
            ledger.get("slow").await.unwrap().unwrap().status,
            RecordStatus::Processing
        );
    }

    #[tokio::test]
    async fn completed_records_never_time_out_into_reclaims() {
        let (ledger, clock) = ledger(10);
        let token = claim(&ledger, "done").await.unwrap();
        ledger.complete("done", &token).await.unwrap();
        clock.advance_secs(3_600);
        assert!(claim(&ledger, "done").await.is_none());
    }

    #[tokio::test]
    async fn purge_removes_only_old_completed_records() {
        let (ledger, clock) = ledger(10);
        let old = claim(&ledger, "old").await.unwrap();
        ledger.complete("old", &old).await.unwrap();
        claim(&ledger, "inflight").await.unwrap();
        clock.advance_secs(100);
        let recent = claim(&ledger, "recent").await.unwrap();
        ledger.complete("recent", &recent).await.unwrap();

        let removed = ledger.purge_older_than(ChronoDuration::seconds(50)).await.unwrap();
        assert_eq!(removed, 1);
        assert!(ledger.get("old").await.unwrap().is_none());
        assert!(ledger.get("inflight").await.unwrap().is_some());
        assert!(ledger.get("recent").await.unwrap().is_some());
    }

    #[test]
    fn concurrent_access_safe() {
        let (ledger, _) = ledger(1_000);
        let ledger = Arc::new(ledger);
        let mut handles = Vec::new();

        for i in 0..10 {
            let ledger = ledger.clone();
            handles.push(std::thread::spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
                rt.block_on(async {
                    for j in 0..100 {
                        let _ = ledger.try_claim(&format!("thread-{i}-key-{j}")).await;
                    }
                });
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert!(ledger.len() <= 1_000, "should respect max_keys");
    }
}
