//! Error types for lineage tracing and event-log replay.
//!
//! Errors split into three families with distinct propagation rules:
//!
//! - Trace-side errors (`UnsupportedLineageOp`, `CyclicLineage`,
//!   `TagSpaceExhausted`, `Engine`) propagate synchronously to the caller of
//!   the trace operation.
//! - Log-side errors (`CorruptLog`, `LogIo`, `Serialization`) are confined to
//!   the reader; entries loaded before the failure remain valid.
//! - Checksum disagreements are *not* errors. They are recorded by the
//!   verifier as [`ChecksumMismatch`](crate::checksum::ChecksumMismatch)
//!   values and surfaced via query.

use thiserror::Error;

use crate::dataset::DatasetId;

/// Error type for all fallible operations in this crate.
#[must_use]
#[derive(Error, Debug)]
pub enum LinealError {
    /// A transformation variant declares no lifted form, so lineage cannot
    /// flow through it. Fatal to the trace that encountered it.
    #[error("transformation '{0}' has no lifted form")]
    UnsupportedLineageOp(String),

    /// The dataset graph contains a cycle, violating the DAG invariant.
    #[error("cycle detected in dataset graph at dataset {0}")]
    CyclicLineage(DatasetId),

    /// The event log is structurally invalid (bad magic, truncated record).
    #[error("corrupt event log: {0}")]
    CorruptLog(String),

    /// An I/O failure while reading or writing the event log.
    #[error("event log I/O failure: {0}")]
    LogIo(#[from] std::io::Error),

    /// A record failed to serialize or deserialize.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The unique-tag id encoding overflowed its partition or position field.
    #[error("tag id space exhausted: partition {partition}, position {position}")]
    TagSpaceExhausted { partition: usize, position: usize },

    /// A dataset id is not present in the registry.
    #[error("dataset {0} not found")]
    DatasetNotFound(DatasetId),

    /// A failure reported by the underlying engine, surfaced unchanged.
    #[error("engine failure: {0}")]
    Engine(String),
}

/// Result type alias for lineal operations.
pub type Result<T> = std::result::Result<T, LinealError>;
