//! Windowed arrival aggregation: grouping, inline and swept finalization,
//! and batch emission.

pub mod emit;
pub mod ingest;
pub mod policy;
pub mod sweep;
pub mod types;

pub use emit::{Emitter, FinalizeOutcome, FinalizePath};
pub use ingest::Ingestor;
pub use policy::AggregationPolicy;
pub use sweep::{SweepReport, Sweeper};
pub use types::{
    ArrivalEvent, BatchItem, DropReason, FinalizedBatch, GroupKey, IngestOutcome, MessageGroup,
};
