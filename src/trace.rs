//! Forward and backward lineage traces.
//!
//! A forward trace pushes predicate-selected source identities with the
//! dataflow and reads off the sink elements whose tags are non-empty. A
//! backward trace runs the dataflow with unique source identities, reduces
//! the tags of predicate-selected sink elements into a set of interest, and
//! intersects it back against the source. Three backward strategies trade
//! data movement differently:
//!
//! - [`Strategy::SingleStep`] propagates end to end in one pass. Correct
//!   everywhere, but across many shuffles the reduced tag set can grow with
//!   every merge site.
//! - [`Strategy::MaintainingSet`] walks stage by stage, concretizing the
//!   interesting element set at each shuffle boundary so the next stage's
//!   tag unions stay small. Costs one driver-side materialization per stage.
//! - [`Strategy::UsingMappings`] (the default) joins consecutive stages on
//!   their element values to translate tags across boundaries, keeping tag
//!   sets small without per-stage broadcasts.

use std::collections::{HashMap, HashSet};

use crate::dataset::{DatasetId, Engine, Value};
use crate::error::Result;
use crate::lift::tag_through;
use crate::stage::{decompose, parent_stages, tag_within_stage};
use crate::tag::Tag;
use crate::tagged::{predicate_tag, unique_tag};

/// Backward-trace strategy selection.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Strategy {
    /// One end-to-end tagging pass, ignoring stage boundaries.
    SingleStep,
    /// Per-stage tagging with a concrete interesting-element set.
    MaintainingSet,
    /// Per-stage tagging joined across boundaries by element value.
    #[default]
    UsingMappings,
}

/// Elements of `sink` derived from elements of `source` satisfying `pred`.
///
/// Results are in partition order of the sink. Tracing a dataset onto
/// itself returns exactly its filtered elements.
pub fn trace_forward(
    engine: &Engine,
    source: DatasetId,
    pred: impl Fn(&Value) -> bool,
    sink: DatasetId,
) -> Result<Vec<Value>> {
    let tagged_source = predicate_tag(engine, source, pred)?;
    let tagged_sink = tag_through(engine, sink, source, &tagged_source)?;
    Ok(tagged_sink.elements_where(|t| t.tag.is_non_empty()))
}

/// Elements of `source` that contributed to elements of `sink` satisfying
/// `pred`, using the given strategy.
pub fn trace_backward(
    engine: &Engine,
    source: DatasetId,
    pred: impl Fn(&Value) -> bool,
    sink: DatasetId,
    strategy: Strategy,
) -> Result<Vec<Value>> {
    match strategy {
        Strategy::SingleStep => trace_backward_single_step(engine, source, pred, sink),
        Strategy::MaintainingSet => trace_backward_maintaining_set(engine, source, pred, sink),
        Strategy::UsingMappings => trace_backward_using_mappings(engine, source, pred, sink),
    }
}

/// Backward trace in a single end-to-end pass.
pub fn trace_backward_single_step(
    engine: &Engine,
    source: DatasetId,
    pred: impl Fn(&Value) -> bool,
    sink: DatasetId,
) -> Result<Vec<Value>> {
    let tagged_source = unique_tag(engine, source)?;
    let tagged_sink = tag_through(engine, sink, source, &tagged_source)?;
    let interest = tagged_sink.fold_tags(|t| pred(&t.elem));
    let retagged = unique_tag(engine, source)?;
    Ok(retagged.elements_where(|t| t.tag.intersects(&interest)))
}

/// Predicate over a stage sink: the caller's at the last stage, then a
/// concrete membership set at every earlier boundary.
enum SinkPredicate<'a, F: Fn(&Value) -> bool> {
    Caller(&'a F),
    Members(HashSet<Value>),
}

impl<F: Fn(&Value) -> bool> SinkPredicate<'_, F> {
    fn matches(&self, v: &Value) -> bool {
        match self {
            SinkPredicate::Caller(f) => f(v),
            SinkPredicate::Members(set) => set.contains(v),
        }
    }
}

/// Backward trace concretizing the interesting set at each stage boundary.
pub fn trace_backward_maintaining_set(
    engine: &Engine,
    source: DatasetId,
    pred: impl Fn(&Value) -> bool,
    sink: DatasetId,
) -> Result<Vec<Value>> {
    let mut current_sink = sink;
    let mut sink_pred = SinkPredicate::Caller(&pred);
    loop {
        if current_sink == source {
            let elements = engine.collect(source)?;
            return Ok(elements
                .into_iter()
                .filter(|e| sink_pred.matches(e))
                .collect());
        }
        let parents = parent_stages(engine, current_sink)?;
        let (tagged, first) = tag_within_stage(engine, current_sink, source, &parents)?;
        let interest = tagged.fold_tags(|t| sink_pred.matches(&t.elem));
        let first_tagged = unique_tag(engine, first)?;
        let members: HashSet<Value> = first_tagged
            .iter()
            .filter(|t| t.tag.intersects(&interest))
            .map(|t| t.elem.clone())
            .collect();
        sink_pred = SinkPredicate::Members(members);
        current_sink = first;
    }
}

/// Backward trace translating tags across stage boundaries with joins.
pub fn trace_backward_using_mappings(
    engine: &Engine,
    source: DatasetId,
    pred: impl Fn(&Value) -> bool,
    sink: DatasetId,
) -> Result<Vec<Value>> {
    if source == sink {
        let elements = engine.collect(source)?;
        return Ok(elements.into_iter().filter(|e| pred(e)).collect());
    }
    let stages = decompose(engine, source, sink)?;
    let Some(last) = stages.last() else {
        return Ok(Vec::new());
    };

    // Tags of interest in the final stage's tag space.
    let mut interest = last.tagged_sink.fold_tags(|t| pred(&t.elem));

    // Step the interest set back one boundary at a time. The boundary
    // dataset is both the previous stage's sink and this stage's first, so
    // joining on element values relates the two tag spaces.
    for i in (1..stages.len()).rev() {
        let start = unique_tag(engine, stages[i].first)?;
        let mut prev_tags: HashMap<Value, Tag> = HashMap::new();
        for t in stages[i - 1].tagged_sink.iter() {
            prev_tags
                .entry(t.elem.clone())
                .and_modify(|acc| acc.union_with(&t.tag))
                .or_insert_with(|| t.tag.clone());
        }
        let mut stepped = Tag::empty();
        for t in start.iter() {
            if t.tag.intersects(&interest) {
                if let Some(prev) = prev_tags.get(&t.elem) {
                    stepped.union_with(prev);
                }
            }
        }
        interest = stepped;
    }

    let tagged_source = unique_tag(engine, stages[0].first)?;
    Ok(tagged_source.elements_where(|t| t.tag.intersects(&interest)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    #[test]
    fn test_identity_trace_equals_filter() {
        let mut engine = Engine::new();
        let d = engine.parallelize((1..=9).map(int).collect(), 3).unwrap();
        let traced = trace_forward(&engine, d, |v| matches!(v, Value::Int(x) if x % 3 == 0), d)
            .unwrap();
        let filtered = engine.filter(d, |v| matches!(v, Value::Int(x) if x % 3 == 0)).unwrap();
        assert_eq!(traced, engine.collect(filtered).unwrap());
    }

    #[test]
    fn test_forward_is_idempotent() {
        let mut engine = Engine::new();
        let s = engine.parallelize((1..=8).map(int).collect(), 2).unwrap();
        let e = engine
            .map(s, |v| match v {
                Value::Int(x) => int(x * 10),
                other => other.clone(),
            })
            .unwrap();
        let once = trace_forward(&engine, s, |v| matches!(v, Value::Int(x) if *x > 4), e).unwrap();
        let twice = trace_forward(&engine, s, |v| matches!(v, Value::Int(x) if *x > 4), e).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn test_backward_with_no_path_is_empty() {
        let mut engine = Engine::new();
        let s = engine.parallelize((1..=3).map(int).collect(), 1).unwrap();
        let other = engine.parallelize((1..=3).map(int).collect(), 1).unwrap();
        for strategy in [
            Strategy::SingleStep,
            Strategy::MaintainingSet,
            Strategy::UsingMappings,
        ] {
            let result = trace_backward(&engine, s, |_| true, other, strategy).unwrap();
            assert!(result.is_empty(), "{strategy:?}");
        }
    }

    #[test]
    fn test_backward_identity_equals_filter() {
        let mut engine = Engine::new();
        let d = engine.parallelize((1..=6).map(int).collect(), 2).unwrap();
        for strategy in [
            Strategy::SingleStep,
            Strategy::MaintainingSet,
            Strategy::UsingMappings,
        ] {
            let result =
                trace_backward(&engine, d, |v| matches!(v, Value::Int(x) if x % 2 == 1), d, strategy)
                    .unwrap();
            assert_eq!(result, vec![int(1), int(3), int(5)], "{strategy:?}");
        }
    }

    #[test]
    fn test_default_strategy_is_using_mappings() {
        assert_eq!(Strategy::default(), Strategy::UsingMappings);
    }
}
