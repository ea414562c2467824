//! Disk-backed replicated log: segment files plus durable bookkeeping records.

mod entry;
mod meta;
mod segment;
mod store;

pub use entry::{EntryDecodeError, LogEntry};
pub use meta::{Durable, LogMeta, SnapshotMeta};
pub use segment::Segment;
pub use store::LogStore;

use crate::types::Index;

/// Failures surfaced by the log store. `NonContiguous` is the append
/// precondition violation callers treat as a fatal WAL failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("log io failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("non-contiguous append: expected index {expected}, got {got}")]
    NonContiguous { expected: Index, got: Index },
    #[error("log corrupted: {0}")]
    Corrupt(String),
}
