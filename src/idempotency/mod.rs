//! Downstream idempotency gate.
//!
//! `process_once` claims a message id through the ledger's atomic
//! insert-if-absent before running the side effect. A successful effect
//! marks the record completed; a failed one releases the claim so a
//! redelivery may try again. Correctness rests on the ledger primitive, not
//! on any in-process lock.

pub mod memory;
pub mod sqlite;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Arc;

pub use memory::MemoryIdempotencyLedger;
pub use sqlite::SqliteIdempotencyLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Processing,
    Completed,
}

impl RecordStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Completed => "completed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdempotencyRecord {
    pub message_id: String,
    pub status: RecordStatus,
    pub created_at: DateTime<Utc>,
}

/// Proof of a won claim; completing or releasing requires it so a claim
/// taken over after a timeout cannot be clobbered by the original holder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClaimToken(pub(crate) String);

impl ClaimToken {
    pub(crate) fn fresh() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(ClaimToken),
    Existing(RecordStatus),
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("transient ledger failure: {0}")]
    Transient(String),
    #[error("ledger backend error: {0}")]
    Backend(String),
    #[error("invalid message id: {0}")]
    InvalidId(String),
}

#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    fn name(&self) -> &str;

    /// Atomic insert-if-absent. An abandoned `processing` record (older than
    /// the ledger's claim timeout) may be taken over.
    async fn try_claim(&self, message_id: &str) -> Result<ClaimOutcome, LedgerError>;

    async fn complete(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError>;

    async fn release(&self, message_id: &str, token: &ClaimToken) -> Result<(), LedgerError>;

    async fn get(&self, message_id: &str) -> Result<Option<IdempotencyRecord>, LedgerError>;

    /// Drop completed records older than `age`; returns how many were removed.
    async fn purge_older_than(&self, age: ChronoDuration) -> Result<usize, LedgerError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome<T> {
    Executed(T),
    Duplicate,
}

impl<T> GateOutcome<T> {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GateError<E> {
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("side effect failed: {0}")]
    Work(E),
}

const MAX_MESSAGE_ID_LEN: usize = 256;

/// Ids are compared byte for byte, so `" k"` and `"k"` must not both be
/// accepted as distinct keys; surrounding whitespace is rejected outright.
fn validate_message_id(message_id: &str) -> Result<&str, LedgerError> {
    if message_id.trim().is_empty() {
        return Err(LedgerError::InvalidId("message id is empty".into()));
    }
    if message_id.trim() != message_id {
        return Err(LedgerError::InvalidId(
            "message id has leading or trailing whitespace".into(),
        ));
    }
    if message_id.len() > MAX_MESSAGE_ID_LEN {
        return Err(LedgerError::InvalidId(format!(
            "message id exceeds {MAX_MESSAGE_ID_LEN} bytes"
        )));
    }
    Ok(message_id)
}

#[derive(Clone)]
pub struct IdempotencyGate {
    ledger: Arc<dyn IdempotencyLedger>,
}

impl IdempotencyGate {
    pub fn new(ledger: Arc<dyn IdempotencyLedger>) -> Self {
        Self { ledger }
    }

    pub fn ledger(&self) -> &Arc<dyn IdempotencyLedger> {
        &self.ledger
    }

    /// Run `work` at most once per `message_id` across all callers sharing
    /// the ledger.
    pub async fn process_once<T, E, F, Fut>(
        &self,
        message_id: &str,
        work: F,
    ) -> Result<GateOutcome<T>, GateError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        let message_id = validate_message_id(message_id)?;
        let token = match self.ledger.try_claim(message_id).await? {
            ClaimOutcome::Claimed(token) => token,
            ClaimOutcome::Existing(status) => {
                tracing::info!(
                    "Duplicate ignored (message id: {message_id}, status: {})",
                    status.as_str()
                );
                return Ok(GateOutcome::Duplicate);
            }
        };

        match work().await {
            Ok(value) => {
                // The effect already happened; an unmarked claim still blocks
                // redelivery until the claim timeout.
                if let Err(e) = self.ledger.complete(message_id, &token).await {
                    tracing::error!("Failed to mark {message_id} completed: {e}");
                }
                Ok(GateOutcome::Executed(value))
            }
            Err(err) => {
                if let Err(e) = self.ledger.release(message_id, &token).await {
                    tracing::error!("Failed to release claim on {message_id}: {e}");
                }
                tracing::warn!("Side effect for {message_id} failed, claim released: {err}");
                Err(GateError::Work(err))
            }
        }
    }
}
