//! Stage-aware decomposition of a trace between two datasets.
//!
//! A stage is a maximal sub-DAG whose internal edges are narrow; shuffle
//! edges are the boundaries. Within a stage lineage composes per element,
//! so the walker tags each stage from a unique tagging of its first dataset
//! and hands the per-stage results to the backward-trace strategies, which
//! join them across the shuffle boundaries.

use std::collections::{HashMap, HashSet, VecDeque};

use crate::dataset::{DatasetId, DepKind, Engine};
use crate::error::{LinealError, Result};
use crate::lift::apply_lifted;
use crate::tagged::{empty_tag, unique_tag, TaggedDataset};

/// One stage of a decomposed trace: the first dataset of the stage reachable
/// from the source, and the stage's sink tagged from a unique tagging of
/// that first dataset.
#[derive(Clone, Debug)]
pub struct StageRecord {
    pub first: DatasetId,
    pub tagged_sink: TaggedDataset,
}

/// Collects the datasets that are direct shuffle-parents of any dataset in
/// `sink`'s stage: BFS across narrow edges, stopping at shuffle edges.
pub fn parent_stages(engine: &Engine, sink: DatasetId) -> Result<HashSet<DatasetId>> {
    let mut parents = HashSet::new();
    let mut visited = HashSet::new();
    let mut queue = VecDeque::new();
    queue.push_back(sink);
    while let Some(id) = queue.pop_front() {
        if !visited.insert(id) {
            continue;
        }
        for dep in engine.dependencies(id)? {
            match dep.kind {
                DepKind::Narrow => queue.push_back(dep.parent),
                DepKind::Shuffle => {
                    parents.insert(dep.parent);
                }
            }
        }
    }
    Ok(parents)
}

/// Tags `target` within its stage, starting lineage at the source itself or
/// at the stage's shuffle-parent datasets, whichever the recursion reaches.
///
/// Returns the tagged rendition and the first dataset of the stage. When a
/// dataset has several tagged parents, the first is the one with the
/// largest id among the firsts the recursion returned, preferring the
/// most-derived shared ancestor.
pub fn tag_within_stage(
    engine: &Engine,
    target: DatasetId,
    source: DatasetId,
    parent_stage: &HashSet<DatasetId>,
) -> Result<(TaggedDataset, DatasetId)> {
    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();
    tag_in_stage(engine, target, source, parent_stage, &mut memo, &mut visiting)
}

fn tag_in_stage(
    engine: &Engine,
    target: DatasetId,
    source: DatasetId,
    parent_stage: &HashSet<DatasetId>,
    memo: &mut HashMap<DatasetId, (TaggedDataset, DatasetId)>,
    visiting: &mut HashSet<DatasetId>,
) -> Result<(TaggedDataset, DatasetId)> {
    if let Some(done) = memo.get(&target) {
        return Ok(done.clone());
    }
    let result = if !engine.path_exists(source, target) {
        (empty_tag(engine, target)?, source)
    } else if target == source || parent_stage.contains(&target) {
        (unique_tag(engine, target)?, target)
    } else {
        if !visiting.insert(target) {
            return Err(LinealError::CyclicLineage(target));
        }
        let record = engine.record(target)?;
        let mut parents = Vec::new();
        let mut first = source;
        for dep in record.dependencies() {
            let (tagged, parent_first) = tag_in_stage(
                engine,
                dep.parent,
                source,
                parent_stage,
                memo,
                visiting,
            )?;
            first = first.max(parent_first);
            parents.push(tagged);
        }
        visiting.remove(&target);
        (apply_lifted(record, &parents)?, first)
    };
    memo.insert(target, result.clone());
    Ok(result)
}

/// Decomposes the dependency sub-graph from `source` to `sink` into stages,
/// in dependency order from the source toward the sink.
///
/// Empty when `source == sink` or no dependency path connects them.
pub fn decompose(engine: &Engine, source: DatasetId, sink: DatasetId) -> Result<Vec<StageRecord>> {
    if source == sink || !engine.path_exists(source, sink) {
        return Ok(Vec::new());
    }
    let parents = parent_stages(engine, sink)?;
    let (tagged_sink, first) = tag_within_stage(engine, sink, source, &parents)?;
    let mut stages = decompose(engine, source, first)?;
    stages.push(StageRecord { first, tagged_sink });
    Ok(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Value;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    fn sum(a: &Value, b: &Value) -> Value {
        match (a, b) {
            (Value::Int(x), Value::Int(y)) => int(x + y),
            _ => a.clone(),
        }
    }

    /// source -> map -> reduce_by_key -> map : two stages.
    fn two_stage_engine() -> (Engine, DatasetId, DatasetId, DatasetId) {
        let mut engine = Engine::new();
        let s = engine
            .parallelize(
                vec![
                    Value::pair(Value::str("k1"), int(1)),
                    Value::pair(Value::str("k1"), int(2)),
                    Value::pair(Value::str("k2"), int(5)),
                ],
                2,
            )
            .unwrap();
        let m = engine.map(s, |v| v.clone()).unwrap();
        let r = engine.reduce_by_key(m, 2, sum).unwrap();
        let e = engine
            .map(r, |v| pair_value_or_clone(v))
            .unwrap();
        (engine, s, m, e)
    }

    fn pair_value_or_clone(v: &Value) -> Value {
        match v {
            Value::Pair(_, val) => (**val).clone(),
            other => other.clone(),
        }
    }

    #[test]
    fn test_parent_stages_stops_at_shuffles() {
        let (engine, _s, m, e) = two_stage_engine();
        let parents = parent_stages(&engine, e).unwrap();
        assert_eq!(parents, HashSet::from([m]));
    }

    #[test]
    fn test_decompose_is_empty_for_identity_or_no_path() {
        let (mut engine, s, _m, e) = two_stage_engine();
        assert!(decompose(&engine, s, s).unwrap().is_empty());
        let unrelated = engine.parallelize(vec![int(1)], 1).unwrap();
        assert!(decompose(&engine, unrelated, e).unwrap().is_empty());
    }

    #[test]
    fn test_decompose_splits_at_shuffle() {
        let (engine, s, m, e) = two_stage_engine();
        let stages = decompose(&engine, s, e).unwrap();
        assert_eq!(stages.len(), 2);
        // Source-side stage first, ending at the shuffle parent.
        assert_eq!(stages[0].first, s);
        assert_eq!(stages[0].tagged_sink.origin, m);
        // Sink-side stage starts at the shuffle parent.
        assert_eq!(stages[1].first, m);
        assert_eq!(stages[1].tagged_sink.origin, e);
    }

    #[test]
    fn test_single_stage_when_no_shuffle() {
        let mut engine = Engine::new();
        let s = engine.parallelize((1..=4).map(int).collect(), 2).unwrap();
        let e = engine.map(s, |v| v.clone()).unwrap();
        let stages = decompose(&engine, s, e).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].first, s);
        assert_eq!(stages[0].tagged_sink.origin, e);
    }

    #[test]
    fn test_first_prefers_most_derived_ancestor() {
        // s -> a, s -> b, union(a, b): both branches bottom out at s, and
        // the union's first must be the largest id among the firsts, here s
        // itself since both branches return it.
        let mut engine = Engine::new();
        let s = engine.parallelize((1..=2).map(int).collect(), 1).unwrap();
        let a = engine.map(s, |v| v.clone()).unwrap();
        let b = engine.map(s, |v| v.clone()).unwrap();
        let u = engine.union(a, b).unwrap();
        let stages = decompose(&engine, s, u).unwrap();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].first, s);
        // Tags reach the union through both paths.
        assert_eq!(stages[0].tagged_sink.len(), 4);
        assert!(stages[0].tagged_sink.iter().all(|t| t.tag.is_non_empty()));
    }
}
