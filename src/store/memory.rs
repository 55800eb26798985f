//! Single-process group store. Conditional operations are serialized by one
//! mutex, which gives the same CAS semantics the SQLite backend provides
//! across processes.

use super::{CreateResult, GroupStore, StoreError};
use crate::aggregation::types::{ArrivalEvent, FinalizedBatch, GroupKey, MessageGroup};
use crate::clock::{system_clock, SharedClock};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Default)]
struct State {
    groups: HashMap<GroupKey, MessageGroup>,
    outbox: BTreeMap<String, (FinalizedBatch, DateTime<Utc>)>,
}

#[derive(Debug)]
pub struct MemoryGroupStore {
    clock: SharedClock,
    state: Mutex<State>,
}

impl MemoryGroupStore {
    pub fn new() -> Self {
        Self::with_clock(system_clock())
    }

    pub fn with_clock(clock: SharedClock) -> Self {
        Self {
            clock,
            state: Mutex::new(State::default()),
        }
    }

    pub fn group_count(&self) -> usize {
        self.state.lock().groups.len()
    }

    pub fn outbox_len(&self) -> usize {
        self.state.lock().outbox.len()
    }

    /// Insert a group verbatim, bypassing the append path.
    pub fn seed(&self, group: MessageGroup) {
        self.state
            .lock()
            .groups
            .insert(group.group_key.clone(), group);
    }
}

impl Default for MemoryGroupStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl GroupStore for MemoryGroupStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn create_if_absent(
        &self,
        key: &GroupKey,
        event: &ArrivalEvent,
    ) -> Result<CreateResult, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        if let Some(existing) = state.groups.get(key) {
            return Ok(CreateResult {
                group: existing.clone(),
                created: false,
            });
        }
        let group = MessageGroup::open(key.clone(), event.clone(), now);
        state.groups.insert(key.clone(), group.clone());
        Ok(CreateResult {
            group,
            created: true,
        })
    }

    async fn get(&self, key: &GroupKey) -> Result<Option<MessageGroup>, StoreError> {
        Ok(self.state.lock().groups.get(key).cloned())
    }

    async fn append(
        &self,
        key: &GroupKey,
        event: &ArrivalEvent,
        expected_version: u64,
    ) -> Result<MessageGroup, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let group = state
            .groups
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if group.version != expected_version {
            return Err(StoreError::VersionConflict {
                key: key.clone(),
                expected: expected_version,
                actual: group.version,
            });
        }
        group.push(event.clone(), now);
        Ok(group.clone())
    }

    async fn delete_if_version(
        &self,
        key: &GroupKey,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock();
        match state.groups.get(key) {
            Some(group) if group.version == expected_version => {
                state.groups.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finalize_if_version(
        &self,
        key: &GroupKey,
        expected_version: u64,
        batch: &FinalizedBatch,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        match state.groups.get(key) {
            Some(group) if group.version == expected_version => {
                state.groups.remove(key);
                state
                    .outbox
                    .insert(batch.idempotency_key.clone(), (batch.clone(), now));
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stage_batch(&self, batch: &FinalizedBatch) -> Result<(), StoreError> {
        let now = self.clock.now();
        self.state
            .lock()
            .outbox
            .entry(batch.idempotency_key.clone())
            .or_insert_with(|| (batch.clone(), now));
        Ok(())
    }

    async fn scan_older_than(&self, age: ChronoDuration) -> Result<Vec<MessageGroup>, StoreError> {
        let cutoff = self.clock.now() - age;
        let state = self.state.lock();
        let mut groups: Vec<MessageGroup> = state
            .groups
            .values()
            .filter(|g| g.updated_at <= cutoff)
            .cloned()
            .collect();
        groups.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        Ok(groups)
    }

    async fn pending_batches(
        &self,
        age: ChronoDuration,
    ) -> Result<Vec<FinalizedBatch>, StoreError> {
        let cutoff = self.clock.now() - age;
        let state = self.state.lock();
        let mut pending: Vec<&(FinalizedBatch, DateTime<Utc>)> = state
            .outbox
            .values()
            .filter(|(_, recorded_at)| *recorded_at <= cutoff)
            .collect();
        pending.sort_by_key(|(_, recorded_at)| *recorded_at);
        Ok(pending.into_iter().map(|(batch, _)| batch.clone()).collect())
    }

    async fn ack_batch(&self, idempotency_key: &str) -> Result<bool, StoreError> {
        Ok(self.state.lock().outbox.remove(idempotency_key).is_some())
    }
}
