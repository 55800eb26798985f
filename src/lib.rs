#![warn(clippy::all)]
#![allow(
    clippy::module_name_repetitions,
    clippy::missing_errors_doc,
    clippy::must_use_candidate
)]

//! Windowed aggregation of inbound arrivals into per-sender batches, with
//! exactly-once-in-effect delivery through an outbox and an idempotency gate.

pub mod aggregation;
pub mod app;
pub mod clock;
pub mod config;
pub mod consumer;
pub mod gateway;
pub mod idempotency;
pub mod observability;
pub mod publisher;
pub mod retry;
pub mod store;

pub use aggregation::{ArrivalEvent, FinalizedBatch, IngestOutcome};
pub use config::Config;
