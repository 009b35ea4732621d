//! Reference dataflow engine: partitioned, lazily evaluated datasets.
//!
//! Datasets form a DAG of transformations over partitioned collections of
//! [`Value`] elements. Each dataset is identified by a stable integer id and
//! registered in a flat id-to-record map; dependency edges point at parent
//! ids, never the reverse, and every traversal carries a visited set.
//!
//! User functions inside transformations are opaque callables: the engine
//! (and the lineage machinery built on it) never inspects them, only
//! composes around them. Narrow transformations evaluate partition by
//! partition; shuffle transformations ([`Engine::group_by_key`],
//! [`Engine::reduce_by_key`]) route elements to output partitions with a
//! stable hash so that re-evaluation is deterministic.
//!
//! Materialized partitions are cached on the driver. When an
//! [`EventReporter`] is attached, the first materialization of a dataset
//! reports its registration, the submitted tasks, and per-partition
//! checksums of the results.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;
use xxhash_rust::xxh64::xxh64;

use crate::checksum::{checksum_bytes, checksum_values};
use crate::error::{LinealError, Result};
use crate::event_log::{DatasetDescriptor, LogEntry, TaskDescriptor};
use crate::reporter::EventReporter;

/// Stable identifier of a dataset.
pub type DatasetId = u64;

/// Stable identifier of a shuffle boundary.
pub type ShuffleId = u64;

/// Seed for the shuffle partitioner hash.
const PARTITIONER_SEED: u64 = 0;

/// An element of a dataset.
///
/// Shuffle transformations require [`Value::Pair`] elements and route on the
/// key component. Equality, ordering, and hashing are structural, which is
/// what makes cross-stage joins on element values possible.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Str(String),
    Pair(Box<Value>, Box<Value>),
    Values(Vec<Value>),
}

impl Value {
    /// Convenience constructor for a key-value pair.
    pub fn pair(key: Value, value: Value) -> Value {
        Value::Pair(Box::new(key), Box::new(value))
    }

    /// Convenience constructor for a string value.
    pub fn str(s: &str) -> Value {
        Value::Str(s.to_string())
    }

    /// Appends a canonical, self-delimiting byte encoding of the value.
    ///
    /// Used by the shuffle partitioner and the checksum machinery; must stay
    /// stable across runs for replay determinism.
    pub fn canonical_bytes(&self, out: &mut Vec<u8>) {
        match self {
            Value::Int(v) => {
                out.push(0);
                out.extend_from_slice(&v.to_le_bytes());
            }
            Value::Str(s) => {
                out.push(1);
                out.extend_from_slice(&(s.len() as u64).to_le_bytes());
                out.extend_from_slice(s.as_bytes());
            }
            Value::Pair(a, b) => {
                out.push(2);
                a.canonical_bytes(out);
                b.canonical_bytes(out);
            }
            Value::Values(vs) => {
                out.push(3);
                out.extend_from_slice(&(vs.len() as u64).to_le_bytes());
                for v in vs {
                    v.canonical_bytes(out);
                }
            }
        }
    }
}

/// Extracts the key component of a pair element.
pub(crate) fn pair_key(v: &Value) -> Result<Value> {
    match v {
        Value::Pair(k, _) => Ok((**k).clone()),
        other => Err(LinealError::Engine(format!(
            "shuffle requires key-value pairs, got {other:?}"
        ))),
    }
}

/// Extracts the value component of a pair element.
pub(crate) fn pair_value(v: &Value) -> Result<Value> {
    match v {
        Value::Pair(_, val) => Ok((**val).clone()),
        other => Err(LinealError::Engine(format!(
            "shuffle requires key-value pairs, got {other:?}"
        ))),
    }
}

/// Opaque one-to-one user function.
pub type MapFn = Arc<dyn Fn(&Value) -> Value + Send + Sync>;
/// Opaque element predicate.
pub type PredicateFn = Arc<dyn Fn(&Value) -> bool + Send + Sync>;
/// Opaque one-to-many user function.
pub type FlatMapFn = Arc<dyn Fn(&Value) -> Vec<Value> + Send + Sync>;
/// Opaque binary reducer over pair values.
pub type ReduceFn = Arc<dyn Fn(&Value, &Value) -> Value + Send + Sync>;
/// Opaque whole-partition user function.
pub type PartitionFn = Arc<dyn Fn(&[Value]) -> Vec<Value> + Send + Sync>;

/// Kind of a dependency edge between a dataset and a parent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DepKind {
    /// Each output partition depends on one parent partition.
    Narrow,
    /// Output partitions depend on all parent partitions across a shuffle.
    Shuffle,
}

/// A dependency edge to a parent dataset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub kind: DepKind,
    pub parent: DatasetId,
    /// Present on shuffle edges.
    pub shuffle: Option<ShuffleId>,
}

impl Dependency {
    fn narrow(parent: DatasetId) -> Self {
        Self {
            kind: DepKind::Narrow,
            parent,
            shuffle: None,
        }
    }

    fn shuffle(parent: DatasetId, shuffle: ShuffleId) -> Self {
        Self {
            kind: DepKind::Shuffle,
            parent,
            shuffle: Some(shuffle),
        }
    }
}

/// A transformation producing a dataset from zero or more parents.
///
/// Each variant carries its opaque user function; the lineage lifter in
/// [`crate::lift`] pattern-matches on the variant to build the tag-preserving
/// counterpart. Adding a variant here requires adding a lift case there;
/// variants without one fail tracing with
/// [`LinealError::UnsupportedLineageOp`].
#[derive(Clone)]
pub enum Transform {
    /// Externally supplied partitions.
    Source { partitions: Vec<Vec<Value>> },
    /// One-to-one element transformation.
    Map { parent: DatasetId, f: MapFn },
    /// Retains elements satisfying the predicate.
    Filter {
        parent: DatasetId,
        predicate: PredicateFn,
    },
    /// One-to-many element transformation.
    FlatMap { parent: DatasetId, f: FlatMapFn },
    /// Concatenation of two datasets.
    Union { left: DatasetId, right: DatasetId },
    /// All pairs of elements from two datasets.
    Cartesian { left: DatasetId, right: DatasetId },
    /// Shuffle grouping values by key into `(key, values)` elements.
    GroupByKey {
        parent: DatasetId,
        shuffle: ShuffleId,
        num_partitions: usize,
    },
    /// Shuffle reducing values by key into `(key, reduced)` elements.
    ReduceByKey {
        parent: DatasetId,
        shuffle: ShuffleId,
        num_partitions: usize,
        f: ReduceFn,
    },
    /// Whole-partition transformation. Has no per-element correspondence and
    /// therefore no lifted form.
    MapPartitions { parent: DatasetId, f: PartitionFn },
}

impl Transform {
    /// Short operation name used in descriptors and logs.
    pub fn op_name(&self) -> &'static str {
        match self {
            Transform::Source { .. } => "source",
            Transform::Map { .. } => "map",
            Transform::Filter { .. } => "filter",
            Transform::FlatMap { .. } => "flat_map",
            Transform::Union { .. } => "union",
            Transform::Cartesian { .. } => "cartesian",
            Transform::GroupByKey { .. } => "group_by_key",
            Transform::ReduceByKey { .. } => "reduce_by_key",
            Transform::MapPartitions { .. } => "map_partitions",
        }
    }

    /// Dependency edges of this transformation, in parent order.
    pub fn dependencies(&self) -> Vec<Dependency> {
        match self {
            Transform::Source { .. } => Vec::new(),
            Transform::Map { parent, .. }
            | Transform::Filter { parent, .. }
            | Transform::FlatMap { parent, .. }
            | Transform::MapPartitions { parent, .. } => vec![Dependency::narrow(*parent)],
            Transform::Union { left, right } | Transform::Cartesian { left, right } => {
                vec![Dependency::narrow(*left), Dependency::narrow(*right)]
            }
            Transform::GroupByKey {
                parent, shuffle, ..
            }
            | Transform::ReduceByKey {
                parent, shuffle, ..
            } => vec![Dependency::shuffle(*parent, *shuffle)],
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut d = f.debug_struct(self.op_name());
        for dep in self.dependencies() {
            d.field("parent", &dep.parent);
        }
        d.finish()
    }
}

/// A registered dataset: its id and producing transformation.
#[derive(Debug, Clone)]
pub struct DatasetRecord {
    pub id: DatasetId,
    pub transform: Transform,
}

impl DatasetRecord {
    /// Dependency edges of this dataset.
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.transform.dependencies()
    }

    /// Structural descriptor for event-log registration.
    pub fn descriptor(&self, num_partitions: usize) -> DatasetDescriptor {
        DatasetDescriptor {
            id: self.id,
            op: self.transform.op_name().to_string(),
            num_partitions,
            dependencies: Some(self.dependencies()),
        }
    }
}

/// Buckets keyed items into `num_partitions` shuffle partitions.
///
/// Within each partition, keys appear in first-seen order scanning input
/// partitions in order; members keep arrival order. Both the untagged and
/// the lifted shuffle evaluation go through this helper so their element
/// orders agree by construction.
pub(crate) fn bucket_by_key<T: Clone>(
    inputs: &[Vec<T>],
    num_partitions: usize,
    key_of: impl Fn(&T) -> Result<Value>,
) -> Result<Vec<Vec<(Value, Vec<T>)>>> {
    let mut buckets: Vec<Vec<(Value, Vec<T>)>> = vec![Vec::new(); num_partitions];
    for part in inputs {
        for item in part {
            let key = key_of(item)?;
            let bucket = &mut buckets[shuffle_partition(&key, num_partitions)];
            match bucket.iter_mut().find(|(k, _)| *k == key) {
                Some((_, members)) => members.push(item.clone()),
                None => bucket.push((key, vec![item.clone()])),
            }
        }
    }
    Ok(buckets)
}

/// Stable shuffle partition of a key.
pub(crate) fn shuffle_partition(key: &Value, num_partitions: usize) -> usize {
    let mut bytes = Vec::new();
    key.canonical_bytes(&mut bytes);
    (xxh64(&bytes, PARTITIONER_SEED) % num_partitions as u64) as usize
}

/// The driver-side dataset registry and evaluator.
///
/// Single-threaded by design: all state is mutated from the driver. Traces
/// issue blocking collects against it; sequential traces are independent.
pub struct Engine {
    datasets: HashMap<DatasetId, DatasetRecord>,
    next_dataset_id: DatasetId,
    next_shuffle_id: ShuffleId,
    next_stage_id: Cell<u64>,
    cache: RefCell<HashMap<DatasetId, Arc<Vec<Vec<Value>>>>>,
    evaluating: RefCell<HashSet<DatasetId>>,
    reporter: Option<Arc<EventReporter>>,
}

impl Engine {
    /// Creates an empty engine with no event reporting.
    pub fn new() -> Self {
        Self {
            datasets: HashMap::new(),
            next_dataset_id: 0,
            next_shuffle_id: 0,
            next_stage_id: Cell::new(0),
            cache: RefCell::new(HashMap::new()),
            evaluating: RefCell::new(HashSet::new()),
            reporter: None,
        }
    }

    /// Creates an engine that reports registrations, task submissions, and
    /// checksums through `reporter` as datasets materialize.
    pub fn with_reporter(reporter: Arc<EventReporter>) -> Self {
        let mut engine = Self::new();
        engine.reporter = Some(reporter);
        engine
    }

    fn register(&mut self, transform: Transform) -> DatasetId {
        let id = self.next_dataset_id;
        self.next_dataset_id += 1;
        self.datasets.insert(id, DatasetRecord { id, transform });
        id
    }

    fn check_dataset(&self, id: DatasetId) -> Result<()> {
        if self.datasets.contains_key(&id) {
            Ok(())
        } else {
            Err(LinealError::DatasetNotFound(id))
        }
    }

    /// Creates a source dataset by splitting `data` into `num_partitions`
    /// contiguous chunks.
    pub fn parallelize(&mut self, data: Vec<Value>, num_partitions: usize) -> Result<DatasetId> {
        if num_partitions == 0 {
            return Err(LinealError::Engine(
                "parallelize requires at least one partition".to_string(),
            ));
        }
        let chunk = data.len().div_ceil(num_partitions).max(1);
        let mut partitions: Vec<Vec<Value>> = data
            .chunks(chunk)
            .map(|c| c.to_vec())
            .collect();
        partitions.resize(num_partitions, Vec::new());
        Ok(self.register(Transform::Source { partitions }))
    }

    /// One-to-one transformation of `parent`.
    pub fn map(
        &mut self,
        parent: DatasetId,
        f: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Result<DatasetId> {
        self.check_dataset(parent)?;
        Ok(self.register(Transform::Map {
            parent,
            f: Arc::new(f),
        }))
    }

    /// Retains elements of `parent` satisfying `predicate`.
    pub fn filter(
        &mut self,
        parent: DatasetId,
        predicate: impl Fn(&Value) -> bool + Send + Sync + 'static,
    ) -> Result<DatasetId> {
        self.check_dataset(parent)?;
        Ok(self.register(Transform::Filter {
            parent,
            predicate: Arc::new(predicate),
        }))
    }

    /// One-to-many transformation of `parent`.
    pub fn flat_map(
        &mut self,
        parent: DatasetId,
        f: impl Fn(&Value) -> Vec<Value> + Send + Sync + 'static,
    ) -> Result<DatasetId> {
        self.check_dataset(parent)?;
        Ok(self.register(Transform::FlatMap {
            parent,
            f: Arc::new(f),
        }))
    }

    /// Concatenation of two datasets.
    pub fn union(&mut self, left: DatasetId, right: DatasetId) -> Result<DatasetId> {
        self.check_dataset(left)?;
        self.check_dataset(right)?;
        Ok(self.register(Transform::Union { left, right }))
    }

    /// All pairs of elements drawn from `left` and `right`.
    pub fn cartesian(&mut self, left: DatasetId, right: DatasetId) -> Result<DatasetId> {
        self.check_dataset(left)?;
        self.check_dataset(right)?;
        Ok(self.register(Transform::Cartesian { left, right }))
    }

    /// Shuffle grouping pair elements of `parent` by key.
    pub fn group_by_key(
        &mut self,
        parent: DatasetId,
        num_partitions: usize,
    ) -> Result<DatasetId> {
        self.check_dataset(parent)?;
        if num_partitions == 0 {
            return Err(LinealError::Engine(
                "shuffle requires at least one partition".to_string(),
            ));
        }
        let shuffle = self.next_shuffle_id;
        self.next_shuffle_id += 1;
        Ok(self.register(Transform::GroupByKey {
            parent,
            shuffle,
            num_partitions,
        }))
    }

    /// Shuffle reducing pair elements of `parent` by key with `f`.
    pub fn reduce_by_key(
        &mut self,
        parent: DatasetId,
        num_partitions: usize,
        f: impl Fn(&Value, &Value) -> Value + Send + Sync + 'static,
    ) -> Result<DatasetId> {
        self.check_dataset(parent)?;
        if num_partitions == 0 {
            return Err(LinealError::Engine(
                "shuffle requires at least one partition".to_string(),
            ));
        }
        let shuffle = self.next_shuffle_id;
        self.next_shuffle_id += 1;
        Ok(self.register(Transform::ReduceByKey {
            parent,
            shuffle,
            num_partitions,
            f: Arc::new(f),
        }))
    }

    /// Whole-partition transformation of `parent`.
    pub fn map_partitions(
        &mut self,
        parent: DatasetId,
        f: impl Fn(&[Value]) -> Vec<Value> + Send + Sync + 'static,
    ) -> Result<DatasetId> {
        self.check_dataset(parent)?;
        Ok(self.register(Transform::MapPartitions {
            parent,
            f: Arc::new(f),
        }))
    }

    /// Looks up a dataset record.
    pub fn record(&self, id: DatasetId) -> Result<&DatasetRecord> {
        self.datasets
            .get(&id)
            .ok_or(LinealError::DatasetNotFound(id))
    }

    /// Dependency edges of a dataset.
    pub fn dependencies(&self, id: DatasetId) -> Result<Vec<Dependency>> {
        Ok(self.record(id)?.dependencies())
    }

    /// Number of registered datasets.
    pub fn len(&self) -> usize {
        self.datasets.len()
    }

    /// True if no datasets are registered.
    pub fn is_empty(&self) -> bool {
        self.datasets.is_empty()
    }

    /// True if `target` is reachable from `source` along dependency edges
    /// (i.e. `source` is an ancestor of `target`, or they are equal).
    pub fn path_exists(&self, source: DatasetId, target: DatasetId) -> bool {
        if source == target {
            return self.datasets.contains_key(&source);
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::new();
        queue.push_back(target);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if let Some(record) = self.datasets.get(&id) {
                for dep in record.dependencies() {
                    if dep.parent == source {
                        return true;
                    }
                    queue.push_back(dep.parent);
                }
            }
        }
        false
    }

    /// Materializes the partitions of `id`, memoized on the driver.
    pub fn evaluate(&self, id: DatasetId) -> Result<Arc<Vec<Vec<Value>>>> {
        if let Some(cached) = self.cache.borrow().get(&id) {
            return Ok(cached.clone());
        }
        if !self.evaluating.borrow_mut().insert(id) {
            return Err(LinealError::CyclicLineage(id));
        }
        let computed = self.compute(id);
        self.evaluating.borrow_mut().remove(&id);
        let partitions = Arc::new(computed?);
        self.report_materialized(id, &partitions)?;
        self.cache.borrow_mut().insert(id, partitions.clone());
        Ok(partitions)
    }

    /// Collects all elements of `id` in partition order. Blocking barrier:
    /// every partition completes before this returns.
    pub fn collect(&self, id: DatasetId) -> Result<Vec<Value>> {
        let partitions = self.evaluate(id)?;
        Ok(partitions.iter().flatten().cloned().collect())
    }

    /// Drops all cached partitions, forcing re-evaluation on next use.
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    /// Raises the dataset-id watermark so future allocations start at `n`.
    pub fn update_dataset_id(&mut self, n: DatasetId) {
        self.next_dataset_id = self.next_dataset_id.max(n);
    }

    /// Raises the shuffle-id watermark so future allocations start at `n`.
    pub fn update_shuffle_id(&mut self, n: ShuffleId) {
        self.next_shuffle_id = self.next_shuffle_id.max(n);
    }

    /// Raises the stage-id watermark so future allocations start at `n`.
    pub fn update_stage_id(&mut self, n: u64) {
        self.next_stage_id.set(self.next_stage_id.get().max(n));
    }

    fn compute(&self, id: DatasetId) -> Result<Vec<Vec<Value>>> {
        let record = self.record(id)?;
        match &record.transform {
            Transform::Source { partitions } => Ok(partitions.clone()),
            Transform::Map { parent, f } => {
                let input = self.evaluate(*parent)?;
                Ok(input
                    .iter()
                    .map(|part| part.iter().map(|e| f(e)).collect())
                    .collect())
            }
            Transform::Filter { parent, predicate } => {
                let input = self.evaluate(*parent)?;
                Ok(input
                    .iter()
                    .map(|part| part.iter().filter(|e| predicate(e)).cloned().collect())
                    .collect())
            }
            Transform::FlatMap { parent, f } => {
                let input = self.evaluate(*parent)?;
                Ok(input
                    .iter()
                    .map(|part| part.iter().flat_map(|e| f(e)).collect())
                    .collect())
            }
            Transform::Union { left, right } => {
                let l = self.evaluate(*left)?;
                let r = self.evaluate(*right)?;
                Ok(l.iter().chain(r.iter()).cloned().collect())
            }
            Transform::Cartesian { left, right } => {
                let l = self.evaluate(*left)?;
                let r = self.evaluate(*right)?;
                let mut partitions = Vec::with_capacity(l.len() * r.len());
                for lp in l.iter() {
                    for rp in r.iter() {
                        let mut part = Vec::with_capacity(lp.len() * rp.len());
                        for a in lp {
                            for b in rp {
                                part.push(Value::pair(a.clone(), b.clone()));
                            }
                        }
                        partitions.push(part);
                    }
                }
                Ok(partitions)
            }
            Transform::GroupByKey {
                parent,
                num_partitions,
                ..
            } => {
                let input = self.evaluate(*parent)?;
                let buckets = bucket_by_key(&input, *num_partitions, pair_key)?;
                buckets
                    .into_iter()
                    .map(|bucket| {
                        bucket
                            .into_iter()
                            .map(|(key, members)| {
                                let values = members
                                    .iter()
                                    .map(pair_value)
                                    .collect::<Result<Vec<_>>>()?;
                                Ok(Value::pair(key, Value::Values(values)))
                            })
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect()
            }
            Transform::ReduceByKey {
                parent,
                num_partitions,
                f,
                ..
            } => {
                let input = self.evaluate(*parent)?;
                let buckets = bucket_by_key(&input, *num_partitions, pair_key)?;
                buckets
                    .into_iter()
                    .map(|bucket| {
                        bucket
                            .into_iter()
                            .map(|(key, members)| {
                                let mut acc = pair_value(&members[0])?;
                                for m in &members[1..] {
                                    acc = f(&acc, &pair_value(m)?);
                                }
                                Ok(Value::pair(key, acc))
                            })
                            .collect::<Result<Vec<_>>>()
                    })
                    .collect()
            }
            Transform::MapPartitions { parent, f } => {
                let input = self.evaluate(*parent)?;
                Ok(input.iter().map(|part| f(part)).collect())
            }
        }
    }

    /// Reports registration, task submission, and checksums for a freshly
    /// materialized dataset.
    fn report_materialized(&self, id: DatasetId, partitions: &[Vec<Value>]) -> Result<()> {
        let Some(reporter) = &self.reporter else {
            return Ok(());
        };
        let record = self.record(id)?;
        debug!(dataset = id, op = record.transform.op_name(), "dataset materialized");
        reporter.report(&LogEntry::DatasetRegistration(
            record.descriptor(partitions.len()),
        ))?;

        let stage_id = self.next_stage_id.get();
        self.next_stage_id.set(stage_id + 1);
        let tasks = (0..partitions.len())
            .map(|partition| TaskDescriptor {
                stage_id,
                dataset_id: id,
                partition,
            })
            .collect();
        reporter.report(&LogEntry::TaskSubmission(tasks))?;

        let func_checksum = checksum_bytes(record.transform.op_name().as_bytes());
        for (partition, part) in partitions.iter().enumerate() {
            reporter.report(&LogEntry::ResultTaskChecksum {
                dataset_id: id,
                partition,
                func_checksum,
                result_checksum: checksum_values(part),
            })?;
        }

        // Map-side contribution checksums, one per parent partition.
        if let Transform::GroupByKey { parent, .. } | Transform::ReduceByKey { parent, .. } =
            &record.transform
        {
            let input = self.evaluate(*parent)?;
            for (partition, part) in input.iter().enumerate() {
                reporter.report(&LogEntry::ShuffleMapTaskChecksum {
                    dataset_id: id,
                    partition,
                    accum_updates_checksum: checksum_values(part),
                })?;
            }
        }

        for (partition, part) in partitions.iter().enumerate() {
            reporter.report(&LogEntry::BlockChecksum {
                block_id: format!("dataset-{id}-partition-{partition}"),
                bytes_checksum: checksum_values(part),
            })?;
        }
        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}
