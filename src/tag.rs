//! Tag algebra: finite sets of element identities.
//!
//! A [`Tag`] names the source-dataset elements whose identity propagated to a
//! derived element. The algebra is the contract; the representation (a
//! sorted, deduplicated id vector) is an implementation choice. Union is
//! commutative, associative, and idempotent with identity [`Tag::empty`];
//! intersection distributes over union. All operations are total.
//!
//! Tags produced by reducing across a dataset are broadcast as immutable
//! snapshots; `Tag` is `Send + Sync` and never interior-mutable.

use serde::{Deserialize, Serialize};

use crate::error::{LinealError, Result};

/// Bits of a unique id reserved for the partition index.
const PARTITION_BITS: u32 = 24;
/// Bits of a unique id reserved for the position within the partition.
const POSITION_BITS: u32 = 40;

/// A finite set of non-negative element identities.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Tag {
    /// Sorted and deduplicated.
    ids: Vec<u64>,
}

impl Tag {
    /// The empty tag: "no traced source contributed".
    pub fn empty() -> Self {
        Self { ids: Vec::new() }
    }

    /// A tag holding a single identity.
    pub fn singleton(id: u64) -> Self {
        Self { ids: vec![id] }
    }

    /// Builds a tag from arbitrary ids, normalizing order and duplicates.
    pub fn from_ids(mut ids: Vec<u64>) -> Self {
        ids.sort_unstable();
        ids.dedup();
        Self { ids }
    }

    /// Set union of two tags.
    pub fn union(a: &Tag, b: &Tag) -> Tag {
        let mut out = a.clone();
        out.union_with(b);
        out
    }

    /// In-place set union.
    pub fn union_with(&mut self, other: &Tag) {
        if other.ids.is_empty() {
            return;
        }
        if self.ids.is_empty() {
            self.ids = other.ids.clone();
            return;
        }
        let mut merged = Vec::with_capacity(self.ids.len() + other.ids.len());
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            let (a, b) = (self.ids[i], other.ids[j]);
            if a < b {
                merged.push(a);
                i += 1;
            } else if b < a {
                merged.push(b);
                j += 1;
            } else {
                merged.push(a);
                i += 1;
                j += 1;
            }
        }
        merged.extend_from_slice(&self.ids[i..]);
        merged.extend_from_slice(&other.ids[j..]);
        self.ids = merged;
    }

    /// Set intersection of two tags.
    pub fn intersect(a: &Tag, b: &Tag) -> Tag {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < a.ids.len() && j < b.ids.len() {
            let (x, y) = (a.ids[i], b.ids[j]);
            if x < y {
                i += 1;
            } else if y < x {
                j += 1;
            } else {
                out.push(x);
                i += 1;
                j += 1;
            }
        }
        Tag { ids: out }
    }

    /// True if the two tags share at least one identity.
    pub fn intersects(&self, other: &Tag) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ids.len() && j < other.ids.len() {
            let (x, y) = (self.ids[i], other.ids[j]);
            if x < y {
                i += 1;
            } else if y < x {
                j += 1;
            } else {
                return true;
            }
        }
        false
    }

    /// True if the tag holds at least one identity.
    pub fn is_non_empty(&self) -> bool {
        !self.ids.is_empty()
    }

    /// True if the tag holds no identity.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// True if the tag contains `id`.
    pub fn contains(&self, id: u64) -> bool {
        self.ids.binary_search(&id).is_ok()
    }

    /// Number of identities in the tag.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Iterates the identities in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.ids.iter().copied()
    }

    /// Folds a sequence of tags with union, starting from empty.
    pub fn fold<'a>(tags: impl IntoIterator<Item = &'a Tag>) -> Tag {
        let mut acc = Tag::empty();
        for t in tags {
            acc.union_with(t);
        }
        acc
    }
}

/// Packs a (partition, position) pair into a unique 64-bit identity.
///
/// The encoding is deterministic and collision-free: the partition index
/// occupies the high 24 bits and the position the low 40. Re-evaluating the
/// same partition yields the same ids for the same elements.
pub fn encode_id(partition: usize, position: usize) -> Result<u64> {
    if partition >= 1usize << PARTITION_BITS || position >= 1usize << POSITION_BITS {
        return Err(LinealError::TagSpaceExhausted {
            partition,
            position,
        });
    }
    Ok(((partition as u64) << POSITION_BITS) | position as u64)
}

/// Recovers the (partition, position) pair from an encoded identity.
pub fn decode_id(id: u64) -> (usize, usize) {
    (
        (id >> POSITION_BITS) as usize,
        (id & ((1u64 << POSITION_BITS) - 1)) as usize,
    )
}
