//! # Lineal - Lineage-Tracing Debugger Core
//!
//! Lineal answers two dual questions about a computation expressed as a DAG
//! of partitioned datasets: which sink elements were derived from the source
//! elements matching a predicate (forward trace), and which source elements
//! contributed to the sink elements matching a predicate (backward trace).
//!
//! User functions inside transformations are opaque, so lineage is carried
//! by the data itself: datasets are wrapped so that every element carries a
//! tag naming the source identities that reached it, and every
//! transformation variant declares how tags flow around its function.
//!
//! ## Quick Start
//!
//! ```rust
//! use lineal::{Engine, Strategy, Value};
//!
//! fn main() -> lineal::Result<()> {
//!     let mut engine = Engine::new();
//!     let source = engine.parallelize((1..=20).map(Value::Int).collect(), 4)?;
//!     let sink = engine.map(source, |v| match v {
//!         Value::Int(x) => Value::Int(x * 2),
//!         other => other.clone(),
//!     })?;
//!
//!     // Which sink elements came from even source elements?
//!     let derived = lineal::trace_forward(
//!         &engine,
//!         source,
//!         |v| matches!(v, Value::Int(x) if x % 2 == 0),
//!         sink,
//!     )?;
//!     assert_eq!(derived.len(), 10);
//!
//!     // Which source elements produced the sink element 10?
//!     let contributors = lineal::trace_backward(
//!         &engine,
//!         source,
//!         |v| matches!(v, Value::Int(10)),
//!         sink,
//!         Strategy::default(),
//!     )?;
//!     assert_eq!(contributors, vec![Value::Int(5)]);
//!     Ok(())
//! }
//! ```
//!
//! ## Replay
//!
//! Computations run against an [`Engine`] with an attached
//! [`EventReporter`] append registrations, task submissions, and
//! deterministic-execution checksums to an event log. An
//! [`EventLogReader`] replays the log, rebuilding the structural dataset
//! map, bumping id watermarks, and feeding checksums to a verifier that
//! records (never throws) cross-run mismatches.

pub mod checksum;
pub mod dataset;
pub mod error;
pub mod event_log;
pub mod lift;
pub mod reporter;
pub mod stage;
pub mod tag;
pub mod tagged;
pub mod trace;

pub use checksum::{compare_runs, ChecksumKind, ChecksumMismatch, ChecksumVerifier};
pub use dataset::{DatasetId, DatasetRecord, DepKind, Dependency, Engine, ShuffleId, Value};
pub use error::{LinealError, Result};
pub use event_log::{
    DatasetDescriptor, EventLogReader, EventLogWriter, ExceptionRecord, LogEntry, ReplayConfig,
    ReplaySummary, TaskDescriptor, LOG_MAGIC,
};
pub use lift::tag_through;
pub use reporter::EventReporter;
pub use stage::{decompose, StageRecord};
pub use tag::Tag;
pub use tagged::{predicate_tag, unique_tag, Tagged, TaggedDataset};
pub use trace::{
    trace_backward, trace_backward_maintaining_set, trace_backward_single_step,
    trace_backward_using_mappings, trace_forward, Strategy,
};
