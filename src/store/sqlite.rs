//! SQLite-backed group store.
//!
//! Several processes may open the same database file; every conditional
//! operation runs in an `IMMEDIATE` transaction and re-checks `version`, so
//! the CAS holds across connections. Statements run on tokio's blocking pool.
//!
//! Timestamps are unix milliseconds taken from the opening process's clock,
//! not from SQLite. Processes sharing one file must share a host (or keep
//! their clocks synchronized well inside the stale threshold); wall-clock
//! steps shift staleness by the same amount.

use super::{CreateResult, GroupStore, StoreError};
use crate::aggregation::types::{ArrivalEvent, FinalizedBatch, GroupKey, MessageGroup};
use crate::clock::{system_clock, SharedClock};
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS message_groups (
    group_key   TEXT PRIMARY KEY,
    sender_id   TEXT NOT NULL,
    items       TEXT NOT NULL,
    item_count  INTEGER NOT NULL,
    created_at  INTEGER NOT NULL,
    updated_at  INTEGER NOT NULL,
    version     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_message_groups_updated_at ON message_groups(updated_at);

CREATE TABLE IF NOT EXISTS pending_batches (
    idempotency_key TEXT PRIMARY KEY,
    group_key       TEXT NOT NULL,
    payload         TEXT NOT NULL,
    recorded_at     INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_pending_batches_recorded_at ON pending_batches(recorded_at);
";

const GROUP_COLUMNS: &str =
    "group_key, sender_id, items, item_count, created_at, updated_at, version";

pub struct SqliteGroupStore {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
}

impl std::fmt::Debug for SqliteGroupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteGroupStore").finish_non_exhaustive()
    }
}

impl SqliteGroupStore {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        Self::open_with_clock(path, busy_timeout, system_clock())
    }

    pub fn open_with_clock(
        path: &Path,
        busy_timeout: Duration,
        clock: SharedClock,
    ) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                StoreError::Backend(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(map_sqlite_error)?;
        Self::from_connection(conn, busy_timeout, clock)
    }

    /// Private in-memory database; useful for tests and dry runs.
    pub fn open_in_memory(clock: SharedClock) -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory().map_err(map_sqlite_error)?;
        Self::from_connection(conn, Duration::from_secs(1), clock)
    }

    fn from_connection(
        conn: Connection,
        busy_timeout: Duration,
        clock: SharedClock,
    ) -> Result<Self, StoreError> {
        conn.busy_timeout(busy_timeout).map_err(map_sqlite_error)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_sqlite_error)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
        })
    }

    /// Run `op` on the blocking pool. A busy database can hold the caller for
    /// up to the busy timeout, which must not stall a runtime worker.
    async fn with_conn<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            op(&mut *guard)
        })
        .await
        .map_err(|e| StoreError::Backend(format!("spawn_blocking failed: {e}")))?
    }
}

/// Busy/locked is contention, not failure.
pub(crate) fn map_sqlite_error(err: rusqlite::Error) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            StoreError::Transient(err.to_string())
        }
        _ => StoreError::Backend(err.to_string()),
    }
}

fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(key: &str, ms: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::<Utc>::from_timestamp_millis(ms).ok_or_else(|| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("timestamp {ms} out of range"),
    })
}

fn to_sql_version(version: u64) -> i64 {
    i64::try_from(version).unwrap_or(i64::MAX)
}

struct GroupRow {
    group_key: String,
    sender_id: String,
    items: String,
    item_count: i64,
    created_at: i64,
    updated_at: i64,
    version: i64,
}

impl GroupRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            group_key: row.get(0)?,
            sender_id: row.get(1)?,
            items: row.get(2)?,
            item_count: row.get(3)?,
            created_at: row.get(4)?,
            updated_at: row.get(5)?,
            version: row.get(6)?,
        })
    }

    fn into_group(self) -> Result<MessageGroup, StoreError> {
        let corrupt = |reason: String| StoreError::Corrupt {
            key: self.group_key.clone(),
            reason,
        };
        let items: Vec<ArrivalEvent> =
            serde_json::from_str(&self.items).map_err(|e| corrupt(format!("items: {e}")))?;
        let item_count = usize::try_from(self.item_count)
            .map_err(|_| corrupt(format!("negative item_count {}", self.item_count)))?;
        if item_count != items.len() {
            return Err(corrupt(format!(
                "item_count {item_count} disagrees with {} stored items",
                items.len()
            )));
        }
        let version = u64::try_from(self.version)
            .map_err(|_| corrupt(format!("negative version {}", self.version)))?;
        Ok(MessageGroup {
            created_at: from_millis(&self.group_key, self.created_at)?,
            updated_at: from_millis(&self.group_key, self.updated_at)?,
            group_key: GroupKey::new(self.group_key),
            sender_id: self.sender_id,
            items,
            item_count,
            version,
        })
    }
}

fn encode_items(group: &MessageGroup) -> Result<String, StoreError> {
    serde_json::to_string(&group.items).map_err(|e| StoreError::Backend(e.to_string()))
}

fn select_group(conn: &Connection, key: &GroupKey) -> Result<Option<MessageGroup>, StoreError> {
    conn.query_row(
        &format!("SELECT {GROUP_COLUMNS} FROM message_groups WHERE group_key = ?1"),
        params![key.as_str()],
        GroupRow::read,
    )
    .optional()
    .map_err(map_sqlite_error)?
    .map(GroupRow::into_group)
    .transpose()
}

#[async_trait]
impl GroupStore for SqliteGroupStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn create_if_absent(
        &self,
        key: &GroupKey,
        event: &ArrivalEvent,
    ) -> Result<CreateResult, StoreError> {
        let group = MessageGroup::open(key.clone(), event.clone(), self.clock.now());
        let items = encode_items(&group)?;

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_error)?;
            let inserted = tx
                .execute(
                    "INSERT INTO message_groups
                        (group_key, sender_id, items, item_count, created_at, updated_at, version)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(group_key) DO NOTHING",
                    params![
                        group.group_key.as_str(),
                        group.sender_id,
                        items,
                        1_i64,
                        to_millis(group.created_at),
                        to_millis(group.updated_at),
                        to_sql_version(group.version),
                    ],
                )
                .map_err(map_sqlite_error)?;

            let result = if inserted == 1 {
                CreateResult {
                    group,
                    created: true,
                }
            } else {
                let existing = select_group(&tx, &group.group_key)?
                    .ok_or_else(|| StoreError::NotFound(group.group_key.clone()))?;
                CreateResult {
                    group: existing,
                    created: false,
                }
            };
            tx.commit().map_err(map_sqlite_error)?;
            Ok(result)
        })
        .await
    }

    async fn get(&self, key: &GroupKey) -> Result<Option<MessageGroup>, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| select_group(conn, &key)).await
    }

    async fn append(
        &self,
        key: &GroupKey,
        event: &ArrivalEvent,
        expected_version: u64,
    ) -> Result<MessageGroup, StoreError> {
        let now = self.clock.now();
        let key = key.clone();
        let event = event.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_error)?;

            let mut group =
                select_group(&tx, &key)?.ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if group.version != expected_version {
                return Err(StoreError::VersionConflict {
                    key,
                    expected: expected_version,
                    actual: group.version,
                });
            }
            group.push(event, now);
            let items = encode_items(&group)?;

            let updated = tx
                .execute(
                    "UPDATE message_groups
                     SET items = ?1, item_count = ?2, updated_at = ?3, version = ?4
                     WHERE group_key = ?5 AND version = ?6",
                    params![
                        items,
                        i64::try_from(group.item_count).unwrap_or(i64::MAX),
                        to_millis(group.updated_at),
                        to_sql_version(group.version),
                        key.as_str(),
                        to_sql_version(expected_version),
                    ],
                )
                .map_err(map_sqlite_error)?;
            if updated != 1 {
                return Err(StoreError::VersionConflict {
                    key,
                    expected: expected_version,
                    actual: group.version,
                });
            }
            tx.commit().map_err(map_sqlite_error)?;
            Ok(group)
        })
        .await
    }

    async fn delete_if_version(
        &self,
        key: &GroupKey,
        expected_version: u64,
    ) -> Result<bool, StoreError> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM message_groups WHERE group_key = ?1 AND version = ?2",
                    params![key.as_str(), to_sql_version(expected_version)],
                )
                .map_err(map_sqlite_error)?;
            Ok(deleted == 1)
        })
        .await
    }

    async fn finalize_if_version(
        &self,
        key: &GroupKey,
        expected_version: u64,
        batch: &FinalizedBatch,
    ) -> Result<bool, StoreError> {
        let payload =
            serde_json::to_string(batch).map_err(|e| StoreError::Backend(e.to_string()))?;
        let now = self.clock.now();
        let key = key.clone();
        let idempotency_key = batch.idempotency_key.clone();

        self.with_conn(move |conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(map_sqlite_error)?;
            let deleted = tx
                .execute(
                    "DELETE FROM message_groups WHERE group_key = ?1 AND version = ?2",
                    params![key.as_str(), to_sql_version(expected_version)],
                )
                .map_err(map_sqlite_error)?;
            if deleted != 1 {
                return Ok(false);
            }
            tx.execute(
                "INSERT INTO pending_batches (idempotency_key, group_key, payload, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![idempotency_key, key.as_str(), payload, to_millis(now)],
            )
            .map_err(map_sqlite_error)?;
            tx.commit().map_err(map_sqlite_error)?;
            Ok(true)
        })
        .await
    }

    async fn stage_batch(&self, batch: &FinalizedBatch) -> Result<(), StoreError> {
        let payload =
            serde_json::to_string(batch).map_err(|e| StoreError::Backend(e.to_string()))?;
        let now = self.clock.now();
        let idempotency_key = batch.idempotency_key.clone();
        let group_key = batch.group_key.clone();

        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR IGNORE INTO pending_batches
                    (idempotency_key, group_key, payload, recorded_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![idempotency_key, group_key.as_str(), payload, to_millis(now)],
            )
            .map_err(map_sqlite_error)?;
            Ok(())
        })
        .await
    }

    async fn scan_older_than(&self, age: ChronoDuration) -> Result<Vec<MessageGroup>, StoreError> {
        let cutoff = to_millis(self.clock.now() - age);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(&format!(
                    "SELECT {GROUP_COLUMNS} FROM message_groups
                     WHERE updated_at <= ?1 ORDER BY updated_at ASC"
                ))
                .map_err(map_sqlite_error)?;
            let rows = stmt
                .query_map(params![cutoff], GroupRow::read)
                .map_err(map_sqlite_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_error)?;
            rows.into_iter().map(GroupRow::into_group).collect()
        })
        .await
    }

    async fn pending_batches(
        &self,
        age: ChronoDuration,
    ) -> Result<Vec<FinalizedBatch>, StoreError> {
        let cutoff = to_millis(self.clock.now() - age);
        self.with_conn(move |conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT idempotency_key, payload FROM pending_batches
                     WHERE recorded_at <= ?1 ORDER BY recorded_at ASC",
                )
                .map_err(map_sqlite_error)?;
            let rows = stmt
                .query_map(params![cutoff], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
                })
                .map_err(map_sqlite_error)?
                .collect::<rusqlite::Result<Vec<_>>>()
                .map_err(map_sqlite_error)?;
            rows.into_iter()
                .map(|(key, payload)| {
                    serde_json::from_str(&payload).map_err(|e| StoreError::Corrupt {
                        key,
                        reason: format!("pending batch payload: {e}"),
                    })
                })
                .collect()
        })
        .await
    }

    async fn ack_batch(&self, idempotency_key: &str) -> Result<bool, StoreError> {
        let idempotency_key = idempotency_key.to_owned();
        self.with_conn(move |conn| {
            let deleted = conn
                .execute(
                    "DELETE FROM pending_batches WHERE idempotency_key = ?1",
                    params![idempotency_key],
                )
                .map_err(map_sqlite_error)?;
            Ok(deleted == 1)
        })
        .await
    }
}
