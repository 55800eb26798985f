//! SQLite idempotency ledger. The `message_id` primary key is the
//! cross-process insert-if-absent primitive. Statements run on tokio's
//! blocking pool so a busy file never parks a runtime worker.

use super::{
    validate_message_id, ClaimOutcome, ClaimToken, IdempotencyLedger, IdempotencyRecord,
    LedgerError, RecordStatus,
};
use crate::clock::SharedClock;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS idempotency_records (
    message_id  TEXT PRIMARY KEY,
    status      TEXT NOT NULL,
    claim_token TEXT NOT NULL,
    created_at  INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_idempotency_records_created_at
    ON idempotency_records(created_at);
";

pub struct SqliteIdempotencyLedger {
    conn: Arc<Mutex<Connection>>,
    clock: SharedClock,
    claim_timeout: ChronoDuration,
}

impl std::fmt::Debug for SqliteIdempotencyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteIdempotencyLedger")
            .field("claim_timeout", &self.claim_timeout)
            .finish_non_exhaustive()
    }
}

fn map_error(err: rusqlite::Error) -> LedgerError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if matches!(e.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked) =>
        {
            LedgerError::Transient(err.to_string())
        }
        _ => LedgerError::Backend(err.to_string()),
    }
}

impl SqliteIdempotencyLedger {
    pub fn open(
        path: &Path,
        busy_timeout: Duration,
        clock: SharedClock,
        claim_timeout: ChronoDuration,
    ) -> Result<Self, LedgerError> {
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                LedgerError::Backend(format!("failed to create {}: {e}", dir.display()))
            })?;
        }
        let conn = Connection::open(path).map_err(map_error)?;
        conn.busy_timeout(busy_timeout).map_err(map_error)?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(map_error)?;
        Self::init(conn, clock, claim_timeout)
    }

    pub fn open_in_memory(
        clock: SharedClock,
        claim_timeout: ChronoDuration,
    ) -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(map_error)?;
        Self::init(conn, clock, claim_timeout)
    }

    fn init(
        conn: Connection,
        clock: SharedClock,
        claim_timeout: ChronoDuration,
    ) -> Result<Self, LedgerError> {
        conn.execute_batch(SCHEMA).map_err(map_error)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            clock,
            claim_timeout,
        })
    }

    async fn with_conn<T, F>(&self, op: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&Connection) -> Result<T, LedgerError> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || op(&*conn.lock()))
            .await
            .map_err(|e| LedgerError::Backend(format!("spawn_blocking failed: {e}")))?
    }
}

#[async_trait]
impl IdempotencyLedger for SqliteIdempotencyLedger {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn try_claim(&self, message_id: &str) -> Result<ClaimOutcome, LedgerError> {
        let message_id = validate_message_id(message_id)?.to_owned();
        let now = self.clock.now();
        let abandoned_before = (now - self.claim_timeout).timestamp_millis();
        let token = ClaimToken::fresh();

        self.with_conn(move |conn| {
            // Insert, or take over a processing claim nobody finished in time.
            let changed = conn
                .execute(
                    "INSERT INTO idempotency_records (message_id, status, claim_token, created_at)
                     VALUES (?1, 'processing', ?2, ?3)
                     ON CONFLICT(message_id) DO UPDATE
                        SET claim_token = excluded.claim_token,
                            created_at = excluded.created_at
                        WHERE idempotency_records.status = 'processing'
                          AND idempotency_records.created_at <= ?4",
                    params![message_id, token.as_str(), now.timestamp_millis(), abandoned_before],
                )
                .map_err(map_error)?;
            if changed == 1 {
                return Ok(ClaimOutcome::Claimed(token));
            }

            let status: String = conn
                .query_row(
                    "SELECT status FROM idempotency_records WHERE message_id = ?1",
                    params![message_id],
                    |row| row.get(0),
                )
                .map_err(map_error)?;
            let status = RecordStatus::parse(&status)
                .ok_or_else(|| LedgerError::Backend(format!("unknown status '{status}'")))?;
            Ok(ClaimOutcome::Existing(status))
        })
        .await
    }

    async fn complete(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError> {
        let message_id = message_id.to_owned();
        let token = token.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE idempotency_records SET status = 'completed'
                 WHERE message_id = ?1 AND claim_token = ?2",
                params![message_id, token.as_str()],
            )
            .map_err(map_error)?;
            Ok(())
        })
        .await
    }

    async fn release(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError> {
        let message_id = message_id.to_owned();
        let token = token.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM idempotency_records
                 WHERE message_id = ?1 AND claim_token = ?2 AND status = 'processing'",
                params![message_id, token.as_str()],
            )
            .map_err(map_error)?;
            Ok(())
        })
        .await
    }

    async fn get(&self, message_id: &str) -> Result<Option<IdempotencyRecord>, LedgerError> {
        let message_id = message_id.to_owned();
        let row = self
            .with_conn(move |conn| {
                conn.query_row(
                    "SELECT message_id, status, created_at FROM idempotency_records
                     WHERE message_id = ?1",
                    params![message_id],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, i64>(2)?,
                        ))
                    },
                )
                .optional()
                .map_err(map_error)
            })
            .await?;
        row.map(|(message_id, status, created_at)| {
            let status = RecordStatus::parse(&status)
                .ok_or_else(|| LedgerError::Backend(format!("unknown status '{status}'")))?;
            let created_at = DateTime::<Utc>::from_timestamp_millis(created_at)
                .ok_or_else(|| LedgerError::Backend(format!("bad timestamp {created_at}")))?;
            Ok(IdempotencyRecord {
                message_id,
                status,
                created_at,
            })
        })
        .transpose()
    }

    async fn purge_older_than(&self, age: ChronoDuration) -> Result<usize, LedgerError> {
        let cutoff = (self.clock.now() - age).timestamp_millis();
        self.with_conn(move |conn| {
            conn.execute(
                "DELETE FROM idempotency_records WHERE status = 'completed' AND created_at <= ?1",
                params![cutoff],
            )
            .map_err(map_error)
        })
        .await
    }
}
