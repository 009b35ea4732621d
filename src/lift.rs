//! Lifting opaque transformations onto tagged datasets.
//!
//! User functions cannot be inspected, so each transformation variant
//! declares how tags flow around it: a map output inherits its input's tag,
//! a flat-map fans the tag out to every output, a cartesian pair unions both
//! sides, a shuffle merges the tags of everything it combined. The lifter
//! pattern-matches on the variant and composes wrapper transformations that
//! read and reassemble the tag field; variants with no per-element
//! correspondence (whole-partition functions) have no lifted form and fail
//! with [`LinealError::UnsupportedLineageOp`].

use std::collections::{HashMap, HashSet};

use crate::dataset::{
    bucket_by_key, pair_key, pair_value, DatasetId, DatasetRecord, Engine, Transform, Value,
};
use crate::error::{LinealError, Result};
use crate::tag::Tag;
use crate::tagged::{empty_tag, Tagged, TaggedDataset};

/// Rebuilds `record`'s output with tags, given its parents' tagged
/// renditions in dependency order.
///
/// The output mirrors the untagged evaluation element for element, so a
/// tagged dataset can be joined against (or filtered into) the plain one.
pub(crate) fn apply_lifted(
    record: &DatasetRecord,
    parents: &[TaggedDataset],
) -> Result<TaggedDataset> {
    let partitions = match &record.transform {
        // A source has no parents; nothing upstream contributes lineage.
        Transform::Source { partitions } => partitions
            .iter()
            .map(|part| {
                part.iter()
                    .map(|e| Tagged {
                        elem: e.clone(),
                        tag: Tag::empty(),
                    })
                    .collect()
            })
            .collect(),
        Transform::Map { f, .. } => parents[0]
            .partitions
            .iter()
            .map(|part| {
                part.iter()
                    .map(|t| Tagged {
                        elem: f(&t.elem),
                        tag: t.tag.clone(),
                    })
                    .collect()
            })
            .collect(),
        Transform::Filter { predicate, .. } => parents[0]
            .partitions
            .iter()
            .map(|part| {
                part.iter()
                    .filter(|t| predicate(&t.elem))
                    .cloned()
                    .collect()
            })
            .collect(),
        Transform::FlatMap { f, .. } => parents[0]
            .partitions
            .iter()
            .map(|part| {
                part.iter()
                    .flat_map(|t| {
                        f(&t.elem).into_iter().map(move |elem| Tagged {
                            elem,
                            tag: t.tag.clone(),
                        })
                    })
                    .collect()
            })
            .collect(),
        Transform::Union { .. } => parents[0]
            .partitions
            .iter()
            .chain(parents[1].partitions.iter())
            .cloned()
            .collect(),
        Transform::Cartesian { .. } => {
            let (l, r) = (&parents[0], &parents[1]);
            let mut partitions = Vec::with_capacity(l.partitions.len() * r.partitions.len());
            for lp in &l.partitions {
                for rp in &r.partitions {
                    let mut part = Vec::with_capacity(lp.len() * rp.len());
                    for a in lp {
                        for b in rp {
                            part.push(Tagged {
                                elem: Value::pair(a.elem.clone(), b.elem.clone()),
                                tag: Tag::union(&a.tag, &b.tag),
                            });
                        }
                    }
                    partitions.push(part);
                }
            }
            partitions
        }
        Transform::GroupByKey { num_partitions, .. } => {
            let buckets = bucket_by_key(&parents[0].partitions, *num_partitions, |t: &Tagged| {
                pair_key(&t.elem)
            })?;
            buckets
                .into_iter()
                .map(|bucket| {
                    bucket
                        .into_iter()
                        .map(|(key, members)| {
                            let values = members
                                .iter()
                                .map(|m| pair_value(&m.elem))
                                .collect::<Result<Vec<_>>>()?;
                            let tag = Tag::fold(members.iter().map(|m| &m.tag));
                            Ok(Tagged {
                                elem: Value::pair(key, Value::Values(values)),
                                tag,
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()?
        }
        Transform::ReduceByKey {
            num_partitions, f, ..
        } => {
            let buckets = bucket_by_key(&parents[0].partitions, *num_partitions, |t: &Tagged| {
                pair_key(&t.elem)
            })?;
            buckets
                .into_iter()
                .map(|bucket| {
                    bucket
                        .into_iter()
                        .map(|(key, members)| {
                            let mut acc = pair_value(&members[0].elem)?;
                            let mut tag = members[0].tag.clone();
                            for m in &members[1..] {
                                acc = f(&acc, &pair_value(&m.elem)?);
                                tag.union_with(&m.tag);
                            }
                            Ok(Tagged {
                                elem: Value::pair(key, acc),
                                tag,
                            })
                        })
                        .collect::<Result<Vec<_>>>()
                })
                .collect::<Result<Vec<_>>>()?
        }
        Transform::MapPartitions { .. } => {
            return Err(LinealError::UnsupportedLineageOp(
                record.transform.op_name().to_string(),
            ));
        }
    };
    Ok(TaggedDataset {
        origin: record.id,
        partitions,
    })
}

/// Propagates tags from a tagged rendition of `source` through every
/// transformation up to `sink`, ignoring stage boundaries.
///
/// Datasets with no dependency path from `source` contribute empty tags.
/// Where multiple paths reach the same dataset, its tagged rendition is
/// shared, so tags union across paths.
pub fn tag_through(
    engine: &Engine,
    sink: DatasetId,
    source: DatasetId,
    tagged_source: &TaggedDataset,
) -> Result<TaggedDataset> {
    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();
    propagate(engine, sink, source, tagged_source, &mut memo, &mut visiting)
}

fn propagate(
    engine: &Engine,
    target: DatasetId,
    source: DatasetId,
    tagged_source: &TaggedDataset,
    memo: &mut HashMap<DatasetId, TaggedDataset>,
    visiting: &mut HashSet<DatasetId>,
) -> Result<TaggedDataset> {
    if let Some(done) = memo.get(&target) {
        return Ok(done.clone());
    }
    if target == source {
        return Ok(tagged_source.clone());
    }
    if !engine.path_exists(source, target) {
        let tagged = empty_tag(engine, target)?;
        memo.insert(target, tagged.clone());
        return Ok(tagged);
    }
    if !visiting.insert(target) {
        return Err(LinealError::CyclicLineage(target));
    }
    let record = engine.record(target)?;
    let mut parents = Vec::new();
    for dep in record.dependencies() {
        parents.push(propagate(
            engine,
            dep.parent,
            source,
            tagged_source,
            memo,
            visiting,
        )?);
    }
    visiting.remove(&target);
    let tagged = apply_lifted(record, &parents)?;
    memo.insert(target, tagged.clone());
    Ok(tagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tagged::unique_tag;

    fn int(v: i64) -> Value {
        Value::Int(v)
    }

    #[test]
    fn test_map_preserves_tags() {
        let mut engine = Engine::new();
        let s = engine.parallelize((1..=4).map(int).collect(), 2).unwrap();
        let e = engine
            .map(s, |v| match v {
                Value::Int(x) => int(x + 100),
                other => other.clone(),
            })
            .unwrap();
        let tagged_s = unique_tag(&engine, s).unwrap();
        let tagged_e = tag_through(&engine, e, s, &tagged_s).unwrap();
        for (a, b) in tagged_s.iter().zip(tagged_e.iter()) {
            assert_eq!(a.tag, b.tag);
        }
        assert_eq!(tagged_e.len(), 4);
    }

    #[test]
    fn test_flat_map_fans_tags_out() {
        let mut engine = Engine::new();
        let s = engine.parallelize(vec![int(1), int(2)], 1).unwrap();
        let e = engine.flat_map(s, |v| vec![v.clone(), v.clone()]).unwrap();
        let tagged_s = unique_tag(&engine, s).unwrap();
        let tagged_e = tag_through(&engine, e, s, &tagged_s).unwrap();
        assert_eq!(tagged_e.len(), 4);
        let tags: Vec<_> = tagged_e.iter().map(|t| t.tag.clone()).collect();
        assert_eq!(tags[0], tags[1]);
        assert_eq!(tags[2], tags[3]);
        assert_ne!(tags[0], tags[2]);
    }

    #[test]
    fn test_cartesian_unions_both_sides() {
        let mut engine = Engine::new();
        let a = engine.parallelize(vec![int(1)], 1).unwrap();
        let b = engine.parallelize(vec![int(2)], 1).unwrap();
        let c = engine.cartesian(a, b).unwrap();
        let tagged_a = unique_tag(&engine, a).unwrap();
        let tagged_c = tag_through(&engine, c, a, &tagged_a).unwrap();
        // Only the a-side contributes: b is outside the traced sub-graph.
        let only = tagged_c.iter().next().unwrap();
        assert_eq!(only.tag.len(), 1);
    }

    #[test]
    fn test_shuffle_merges_tags() {
        let mut engine = Engine::new();
        let pairs = vec![
            Value::pair(Value::str("k"), int(1)),
            Value::pair(Value::str("k"), int(2)),
        ];
        let s = engine.parallelize(pairs, 2).unwrap();
        let r = engine
            .reduce_by_key(s, 1, |a, b| match (a, b) {
                (Value::Int(x), Value::Int(y)) => int(x + y),
                _ => a.clone(),
            })
            .unwrap();
        let tagged_s = unique_tag(&engine, s).unwrap();
        let tagged_r = tag_through(&engine, r, s, &tagged_s).unwrap();
        assert_eq!(tagged_r.len(), 1);
        let merged = tagged_r.iter().next().unwrap();
        assert_eq!(merged.tag.len(), 2);
    }

    #[test]
    fn test_lifted_output_mirrors_untagged_evaluation() {
        let mut engine = Engine::new();
        let pairs = vec![
            Value::pair(int(1), int(10)),
            Value::pair(int(2), int(20)),
            Value::pair(int(1), int(30)),
        ];
        let s = engine.parallelize(pairs, 2).unwrap();
        let g = engine.group_by_key(s, 2).unwrap();
        let tagged_s = unique_tag(&engine, s).unwrap();
        let tagged_g = tag_through(&engine, g, s, &tagged_s).unwrap();
        let plain = engine.collect(g).unwrap();
        let lifted: Vec<_> = tagged_g.iter().map(|t| t.elem.clone()).collect();
        assert_eq!(plain, lifted);
    }

    #[test]
    fn test_map_partitions_has_no_lifted_form() {
        let mut engine = Engine::new();
        let s = engine.parallelize(vec![int(1), int(2)], 1).unwrap();
        let mp = engine.map_partitions(s, |part| part.to_vec()).unwrap();
        let tagged_s = unique_tag(&engine, s).unwrap();
        let err = tag_through(&engine, mp, s, &tagged_s).unwrap_err();
        assert!(matches!(err, LinealError::UnsupportedLineageOp(_)));
    }
}
