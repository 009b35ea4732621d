//! Append-only event log: registrations, task submissions, checksums.
//!
//! The log begins with a fixed magic header followed by length-prefixed
//! serialized records, written in the order they occur. The reader replays
//! records serially until end of stream: dataset registrations populate the
//! id-to-descriptor map and push the dataset and shuffle watermarks up so
//! that subsequent engine allocations do not collide; task submissions push
//! the stage watermark; checksum entries feed the verifier; exception
//! entries are buffered for later query.
//!
//! Unexpected end of stream in the middle of a record is reported as
//! [`LinealError::CorruptLog`]; everything applied before the failure
//! remains valid. A reader reads once to EOF; reopening a new reader over
//! the same path replays from the start.
//!
//! The reader also supports live subscription: registered with a running
//! [`EventReporter`](crate::reporter::EventReporter), it receives entries as
//! they are reported and applies them on the next drain.

use std::collections::{HashMap, VecDeque};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checksum::{parse_block_id, ChecksumKind, ChecksumMismatch, ChecksumVerifier};
use crate::dataset::{DatasetId, Dependency, Engine};
use crate::error::{LinealError, Result};
use crate::reporter::EventReporter;

/// Magic bytes at the start of every event-log file.
pub const LOG_MAGIC: &[u8; 8] = b"LINEAL01";

/// Structural description of a registered dataset.
///
/// Opaque user functions cannot be serialized, so registration records the
/// graph structure only; re-attaching functions is the deterministic driver
/// rerun's job, and checksums establish that the rerun matched.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetDescriptor {
    pub id: DatasetId,
    /// Operation name, e.g. `"map"` or `"reduce_by_key"`.
    pub op: String,
    pub num_partitions: usize,
    /// Dependency edges. Absent lists are an anomaly that is logged and
    /// tolerated: the dataset is treated as a source downstream.
    pub dependencies: Option<Vec<Dependency>>,
}

/// One submitted task: a partition of a dataset computed within a stage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskDescriptor {
    pub stage_id: u64,
    pub dataset_id: DatasetId,
    pub partition: usize,
}

/// A buffered exception event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExceptionRecord {
    pub task_id: u64,
    pub message: String,
    /// True for exceptions reported from a remote executor.
    pub remote: bool,
}

/// One record in the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum LogEntry {
    DatasetRegistration(DatasetDescriptor),
    TaskSubmission(Vec<TaskDescriptor>),
    ResultTaskChecksum {
        dataset_id: DatasetId,
        partition: usize,
        func_checksum: u32,
        result_checksum: u32,
    },
    ShuffleMapTaskChecksum {
        dataset_id: DatasetId,
        partition: usize,
        accum_updates_checksum: u32,
    },
    BlockChecksum {
        block_id: String,
        bytes_checksum: u32,
    },
    LocalException {
        task_id: u64,
        message: String,
    },
    RemoteException {
        task_id: u64,
        message: String,
    },
}

/// Replay configuration.
///
/// # Example
///
/// ```
/// use lineal::ReplayConfig;
///
/// let config = ReplayConfig::new("run.lineal")
///     .checksum_enabled(false)
///     .master("debugger.local", 8090);
/// assert!(!config.checksum_enabled);
/// ```
#[derive(Clone, Debug)]
pub struct ReplayConfig {
    /// Path of the event log, required for replay.
    pub log_path: PathBuf,
    /// Whether checksum entries feed the verifier.
    pub checksum_enabled: bool,
    /// Host of the event-reporter transport. Carried for collaborators; the
    /// transport itself is out of scope here.
    pub master_host: String,
    /// Port of the event-reporter transport.
    pub master_port: u16,
}

impl ReplayConfig {
    /// Creates a configuration for the given log path with defaults.
    pub fn new(log_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            checksum_enabled: true,
            master_host: "127.0.0.1".to_string(),
            master_port: 8090,
        }
    }

    /// Enables or disables checksum verification.
    pub fn checksum_enabled(mut self, enabled: bool) -> Self {
        self.checksum_enabled = enabled;
        self
    }

    /// Sets the reporter transport endpoint.
    pub fn master(mut self, host: impl Into<String>, port: u16) -> Self {
        self.master_host = host.into();
        self.master_port = port;
        self
    }
}

/// Writer statistics.
#[derive(Clone, Debug, Default)]
pub struct WriterStats {
    pub entries_written: u64,
    pub bytes_written: u64,
    pub syncs: u64,
}

/// Thread-safe append-only writer of event-log records.
pub struct EventLogWriter {
    path: PathBuf,
    file: Mutex<BufWriter<File>>,
    stats: Mutex<WriterStats>,
}

impl EventLogWriter {
    /// Creates (or truncates) a log file and writes the magic header.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut file = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&path)?,
        );
        file.write_all(LOG_MAGIC)?;
        info!(path = %path.display(), "event log created");
        Ok(Self {
            path,
            file: Mutex::new(file),
            stats: Mutex::new(WriterStats::default()),
        })
    }

    /// Path of the underlying file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one serialized record: length prefix, payload, newline.
    pub fn append(&self, entry: &LogEntry) -> Result<()> {
        let payload = serde_json::to_vec(entry)?;
        let mut data = Vec::with_capacity(4 + payload.len() + 1);
        data.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        data.extend_from_slice(&payload);
        data.push(b'\n');

        let mut file = self.file.lock();
        file.write_all(&data)?;
        drop(file);

        let mut stats = self.stats.lock();
        stats.entries_written += 1;
        stats.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Flushes buffered records to the operating system.
    pub fn sync(&self) -> Result<()> {
        let mut file = self.file.lock();
        file.flush()?;
        file.get_ref().sync_all()?;
        drop(file);
        self.stats.lock().syncs += 1;
        Ok(())
    }

    /// Current writer statistics.
    pub fn stats(&self) -> WriterStats {
        self.stats.lock().clone()
    }
}

/// Summary of one replay pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub entries: usize,
    pub datasets: usize,
    pub mismatches: usize,
}

/// Serial reader of event-log records.
pub struct EventLogReader {
    config: ReplayConfig,
    datasets: HashMap<DatasetId, DatasetDescriptor>,
    tasks: Vec<TaskDescriptor>,
    exceptions: Vec<ExceptionRecord>,
    verifier: ChecksumVerifier,
    live: Arc<Mutex<VecDeque<LogEntry>>>,
}

impl EventLogReader {
    /// Creates a reader over the configured log path.
    pub fn new(config: ReplayConfig) -> Self {
        let verifier = ChecksumVerifier::new(config.checksum_enabled);
        Self {
            config,
            datasets: HashMap::new(),
            tasks: Vec::new(),
            exceptions: Vec::new(),
            verifier,
            live: Arc::new(Mutex::new(VecDeque::new())),
        }
    }

    /// Reads the log to end of stream, applying each record to this reader
    /// and bumping `engine` watermarks.
    pub fn load(&mut self, engine: &mut Engine) -> Result<ReplaySummary> {
        let file = File::open(&self.config.log_path)?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 8];
        reader
            .read_exact(&mut magic)
            .map_err(|_| LinealError::CorruptLog("missing magic header".to_string()))?;
        if &magic != LOG_MAGIC {
            return Err(LinealError::CorruptLog("bad magic header".to_string()));
        }

        let mut entries = 0;
        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e.into()),
            }
            let len = u32::from_le_bytes(len_buf) as usize;
            let mut payload = vec![0u8; len];
            reader.read_exact(&mut payload).map_err(|_| {
                LinealError::CorruptLog(format!("truncated record after {entries} entries"))
            })?;
            let mut newline = [0u8; 1];
            let _ = reader.read_exact(&mut newline);

            // A structurally valid but unrecognized record is skipped; a
            // payload that is not even valid JSON corrupts the log.
            let json: serde_json::Value = serde_json::from_slice(&payload).map_err(|e| {
                LinealError::CorruptLog(format!("undecodable record after {entries} entries: {e}"))
            })?;
            match serde_json::from_value::<LogEntry>(json) {
                Ok(entry) => self.apply(entry, engine),
                Err(e) => warn!(error = %e, "unknown log entry type, skipping"),
            }
            entries += 1;
        }

        info!(
            path = %self.config.log_path.display(),
            entries,
            datasets = self.datasets.len(),
            "event log loaded"
        );
        Ok(ReplaySummary {
            entries,
            datasets: self.datasets.len(),
            mismatches: self.verifier.mismatches().len(),
        })
    }

    /// Registers this reader with a running reporter; entries reported from
    /// now on are queued and applied by [`EventLogReader::drain_live`].
    pub fn subscribe(&self, reporter: &EventReporter) {
        let queue = self.live.clone();
        reporter.subscribe(move |entry| {
            queue.lock().push_back(entry.clone());
        });
    }

    /// Applies all queued live entries. Returns how many were applied.
    pub fn drain_live(&mut self, engine: &mut Engine) -> usize {
        let mut applied = 0;
        loop {
            let Some(entry) = self.live.lock().pop_front() else {
                break;
            };
            self.apply(entry, engine);
            applied += 1;
        }
        applied
    }

    fn apply(&mut self, entry: LogEntry, engine: &mut Engine) {
        match entry {
            LogEntry::DatasetRegistration(descriptor) => {
                if descriptor.dependencies.is_none() {
                    warn!(
                        dataset = descriptor.id,
                        op = %descriptor.op,
                        "registration without dependency list, treating as source"
                    );
                }
                engine.update_dataset_id(descriptor.id + 1);
                for dep in descriptor.dependencies.iter().flatten() {
                    if let Some(shuffle) = dep.shuffle {
                        engine.update_shuffle_id(shuffle + 1);
                    }
                }
                match self.datasets.entry(descriptor.id) {
                    std::collections::hash_map::Entry::Vacant(slot) => {
                        slot.insert(descriptor);
                    }
                    std::collections::hash_map::Entry::Occupied(_) => {
                        // Ids are stable; keep the first registration.
                        warn!(dataset = descriptor.id, "duplicate registration ignored");
                    }
                }
            }
            LogEntry::TaskSubmission(tasks) => {
                for task in &tasks {
                    engine.update_stage_id(task.stage_id + 1);
                }
                self.tasks.extend(tasks);
            }
            LogEntry::ResultTaskChecksum {
                dataset_id,
                partition,
                func_checksum,
                result_checksum,
            } => {
                self.verifier
                    .observe(dataset_id, partition, ChecksumKind::TaskFunc, func_checksum);
                self.verifier.observe(
                    dataset_id,
                    partition,
                    ChecksumKind::TaskResult,
                    result_checksum,
                );
            }
            LogEntry::ShuffleMapTaskChecksum {
                dataset_id,
                partition,
                accum_updates_checksum,
            } => {
                self.verifier.observe(
                    dataset_id,
                    partition,
                    ChecksumKind::ShuffleMap,
                    accum_updates_checksum,
                );
            }
            LogEntry::BlockChecksum {
                block_id,
                bytes_checksum,
            } => match parse_block_id(&block_id) {
                Some((dataset_id, partition)) => {
                    self.verifier
                        .observe(dataset_id, partition, ChecksumKind::Block, bytes_checksum);
                }
                None => {
                    warn!(block_id = %block_id, "unrecognized block id, skipping checksum");
                }
            },
            LogEntry::LocalException { task_id, message } => {
                debug!(task_id, "buffered local exception");
                self.exceptions.push(ExceptionRecord {
                    task_id,
                    message,
                    remote: false,
                });
            }
            LogEntry::RemoteException { task_id, message } => {
                debug!(task_id, "buffered remote exception");
                self.exceptions.push(ExceptionRecord {
                    task_id,
                    message,
                    remote: true,
                });
            }
        }
    }

    /// Looks up a loaded dataset descriptor.
    pub fn dataset(&self, id: DatasetId) -> Option<&DatasetDescriptor> {
        self.datasets.get(&id)
    }

    /// All loaded dataset descriptors.
    pub fn datasets(&self) -> &HashMap<DatasetId, DatasetDescriptor> {
        &self.datasets
    }

    /// All loaded task descriptors, in submission order.
    pub fn tasks(&self) -> &[TaskDescriptor] {
        &self.tasks
    }

    /// All buffered exception events, in log order.
    pub fn exceptions(&self) -> &[ExceptionRecord] {
        &self.exceptions
    }

    /// Recorded checksum mismatches.
    pub fn mismatches(&self) -> &[ChecksumMismatch] {
        self.verifier.mismatches()
    }

    /// The reader's checksum verifier.
    pub fn verifier(&self) -> &ChecksumVerifier {
        &self.verifier
    }
}
