//! Deterministic-execution checksums and the mismatch verifier.
//!
//! Checksums are 32-bit values from a stable non-cryptographic hash seeded
//! with a constant, so two deterministic runs of the same computation
//! produce identical values. The verifier keeps the first-seen checksum per
//! `(dataset, partition, kind)` slot; later disagreement is recorded as a
//! [`ChecksumMismatch`] for inspection and is never fatal.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh32::xxh32;

use crate::dataset::{DatasetId, Value};

/// Seed for all checksums, fixed so results reproduce across runs.
pub const CHECKSUM_SEED: u32 = 42;

/// Checksum of a byte slice.
pub fn checksum_bytes(bytes: &[u8]) -> u32 {
    xxh32(bytes, CHECKSUM_SEED)
}

/// Checksum of a sequence of values via their canonical byte encoding.
pub fn checksum_values(values: &[Value]) -> u32 {
    let mut bytes = Vec::new();
    for v in values {
        v.canonical_bytes(&mut bytes);
    }
    checksum_bytes(&bytes)
}

/// Which recorded quantity a checksum covers.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChecksumKind {
    /// The user function of a result task.
    TaskFunc,
    /// The materialized result of a result task.
    TaskResult,
    /// The map-side output of a shuffle task.
    ShuffleMap,
    /// A stored block's bytes.
    Block,
}

/// A recorded disagreement between runs for one checksum slot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecksumMismatch {
    pub dataset_id: DatasetId,
    pub partition: usize,
    pub kind: ChecksumKind,
    pub expected: u32,
    pub got: u32,
}

/// Tracks first-seen checksums and records later disagreements.
#[derive(Debug, Default)]
pub struct ChecksumVerifier {
    enabled: bool,
    seen: HashMap<(DatasetId, usize, ChecksumKind), u32>,
    mismatches: Vec<ChecksumMismatch>,
}

impl ChecksumVerifier {
    /// Creates a verifier; a disabled one ignores every observation.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            seen: HashMap::new(),
            mismatches: Vec::new(),
        }
    }

    /// True if observations are being tracked.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Feeds one checksum observation. The first value for a slot is
    /// authoritative; later values that disagree are recorded.
    pub fn observe(
        &mut self,
        dataset_id: DatasetId,
        partition: usize,
        kind: ChecksumKind,
        checksum: u32,
    ) {
        if !self.enabled {
            return;
        }
        match self.seen.entry((dataset_id, partition, kind)) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(checksum);
            }
            std::collections::hash_map::Entry::Occupied(slot) => {
                let expected = *slot.get();
                if expected != checksum {
                    self.mismatches.push(ChecksumMismatch {
                        dataset_id,
                        partition,
                        kind,
                        expected,
                        got: checksum,
                    });
                }
            }
        }
    }

    /// All recorded disagreements, in observation order.
    pub fn mismatches(&self) -> &[ChecksumMismatch] {
        &self.mismatches
    }

    /// Number of distinct slots observed.
    pub fn slots(&self) -> usize {
        self.seen.len()
    }

    /// First-seen checksum for a slot, if observed.
    pub fn checksum(
        &self,
        dataset_id: DatasetId,
        partition: usize,
        kind: ChecksumKind,
    ) -> Option<u32> {
        self.seen.get(&(dataset_id, partition, kind)).copied()
    }
}

/// Compares two verifiers loaded from separate runs: every slot present in
/// both must agree. Disagreements are returned, slots unique to one run are
/// ignored.
pub fn compare_runs(a: &ChecksumVerifier, b: &ChecksumVerifier) -> Vec<ChecksumMismatch> {
    let mut out = Vec::new();
    for (&(dataset_id, partition, kind), &expected) in &a.seen {
        if let Some(got) = b.checksum(dataset_id, partition, kind) {
            if got != expected {
                out.push(ChecksumMismatch {
                    dataset_id,
                    partition,
                    kind,
                    expected,
                    got,
                });
            }
        }
    }
    out.sort_by_key(|m| (m.dataset_id, m.partition));
    out
}

/// Parses a block id of the form `dataset-{id}-partition-{p}` into its
/// checksum slot. Returns `None` for foreign block id schemes.
pub fn parse_block_id(block_id: &str) -> Option<(DatasetId, usize)> {
    let rest = block_id.strip_prefix("dataset-")?;
    let (id, partition) = rest.split_once("-partition-")?;
    Some((id.parse().ok()?, partition.parse().ok()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksums_are_stable() {
        let values = vec![Value::Int(1), Value::str("x")];
        assert_eq!(checksum_values(&values), checksum_values(&values));
        assert_ne!(checksum_values(&values), checksum_values(&values[..1]));
    }

    #[test]
    fn test_first_seen_wins_and_mismatch_is_recorded() {
        let mut verifier = ChecksumVerifier::new(true);
        verifier.observe(1, 0, ChecksumKind::TaskResult, 100);
        verifier.observe(1, 0, ChecksumKind::TaskResult, 100);
        assert!(verifier.mismatches().is_empty());
        verifier.observe(1, 0, ChecksumKind::TaskResult, 200);
        assert_eq!(
            verifier.mismatches(),
            &[ChecksumMismatch {
                dataset_id: 1,
                partition: 0,
                kind: ChecksumKind::TaskResult,
                expected: 100,
                got: 200,
            }]
        );
        // Still tracks the original value.
        assert_eq!(verifier.checksum(1, 0, ChecksumKind::TaskResult), Some(100));
    }

    #[test]
    fn test_disabled_verifier_ignores_observations() {
        let mut verifier = ChecksumVerifier::new(false);
        verifier.observe(1, 0, ChecksumKind::Block, 5);
        verifier.observe(1, 0, ChecksumKind::Block, 6);
        assert_eq!(verifier.slots(), 0);
        assert!(verifier.mismatches().is_empty());
    }

    #[test]
    fn test_compare_runs_flags_disagreements() {
        let mut a = ChecksumVerifier::new(true);
        let mut b = ChecksumVerifier::new(true);
        a.observe(1, 0, ChecksumKind::TaskResult, 10);
        b.observe(1, 0, ChecksumKind::TaskResult, 10);
        a.observe(2, 1, ChecksumKind::ShuffleMap, 20);
        b.observe(2, 1, ChecksumKind::ShuffleMap, 21);
        a.observe(3, 0, ChecksumKind::Block, 30);
        let diffs = compare_runs(&a, &b);
        assert_eq!(diffs.len(), 1);
        assert_eq!(diffs[0].dataset_id, 2);
    }

    #[test]
    fn test_parse_block_id() {
        assert_eq!(parse_block_id("dataset-7-partition-3"), Some((7, 3)));
        assert_eq!(parse_block_id("rdd_7_3"), None);
    }
}
