//! Tagged elements and materialized tagged datasets.
//!
//! A [`Tagged`] value pairs an element with the [`Tag`] naming the source
//! elements that contributed to it. A [`TaggedDataset`] mirrors the
//! partition structure of the dataset it was derived from, so its elements
//! correspond positionally to the untagged evaluation.

use crate::dataset::{DatasetId, Engine, Value};
use crate::error::Result;
use crate::tag::{encode_id, Tag};

/// An element together with its lineage tag.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tagged {
    pub elem: Value,
    pub tag: Tag,
}

/// A dataset whose elements carry lineage tags.
///
/// Materialized eagerly on the driver, one vector per partition of the
/// origin dataset.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TaggedDataset {
    /// The dataset these elements correspond to.
    pub origin: DatasetId,
    pub partitions: Vec<Vec<Tagged>>,
}

impl TaggedDataset {
    /// Iterates all tagged elements in partition order.
    pub fn iter(&self) -> impl Iterator<Item = &Tagged> {
        self.partitions.iter().flat_map(|p| p.iter())
    }

    /// Total number of elements.
    pub fn len(&self) -> usize {
        self.partitions.iter().map(Vec::len).sum()
    }

    /// True if there are no elements.
    pub fn is_empty(&self) -> bool {
        self.partitions.iter().all(Vec::is_empty)
    }

    /// Collects the elements matching `pred`, in partition order.
    pub fn elements_where(&self, pred: impl Fn(&Tagged) -> bool) -> Vec<Value> {
        self.iter()
            .filter(|t| pred(t))
            .map(|t| t.elem.clone())
            .collect()
    }

    /// Reduces the tags of elements matching `pred` into a single tag.
    ///
    /// This is the broadcast value of a backward trace: a blocking barrier
    /// over all partitions, returned as an immutable snapshot.
    pub fn fold_tags(&self, pred: impl Fn(&Tagged) -> bool) -> Tag {
        let mut acc = Tag::empty();
        for t in self.iter() {
            if pred(t) {
                acc.union_with(&t.tag);
            }
        }
        acc
    }
}

/// Tags every element of `dataset` with a distinct singleton tag.
///
/// The i-th element of partition p receives `{encode(p, i)}`. Because the
/// engine evaluates deterministically, re-running this over the same dataset
/// reproduces identical tags.
pub fn unique_tag(engine: &Engine, dataset: DatasetId) -> Result<TaggedDataset> {
    tag_with(engine, dataset, |_, id| Tag::singleton(id))
}

/// Tags elements satisfying `pred` with their singleton identity and all
/// others with the empty tag.
pub fn predicate_tag(
    engine: &Engine,
    dataset: DatasetId,
    pred: impl Fn(&Value) -> bool,
) -> Result<TaggedDataset> {
    tag_with(engine, dataset, |elem, id| {
        if pred(elem) {
            Tag::singleton(id)
        } else {
            Tag::empty()
        }
    })
}

/// Tags every element with the empty tag. Used for datasets outside the
/// traced sub-graph: nothing they carry derives from the source.
pub(crate) fn empty_tag(engine: &Engine, dataset: DatasetId) -> Result<TaggedDataset> {
    tag_with(engine, dataset, |_, _| Tag::empty())
}

fn tag_with(
    engine: &Engine,
    dataset: DatasetId,
    tag_of: impl Fn(&Value, u64) -> Tag,
) -> Result<TaggedDataset> {
    let partitions = engine.evaluate(dataset)?;
    let mut tagged = Vec::with_capacity(partitions.len());
    for (p, part) in partitions.iter().enumerate() {
        let mut out = Vec::with_capacity(part.len());
        for (i, elem) in part.iter().enumerate() {
            let id = encode_id(p, i)?;
            out.push(Tagged {
                elem: elem.clone(),
                tag: tag_of(elem, id),
            });
        }
        tagged.push(out);
    }
    Ok(TaggedDataset {
        origin: dataset,
        partitions: tagged,
    })
}
