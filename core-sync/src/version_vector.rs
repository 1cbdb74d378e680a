//! Version vector comparison and arithmetic
//!
//! Missing entries count as zero, so `{d1: 1}` and `{d1: 1, d2: 0}` are equal.

use core_store::VersionVector;
use std::cmp::Ordering;

/// Causal relation between two version vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Causality {
    Equal,
    /// The left side has seen everything the right side has, and more
    Dominates,
    /// The right side has seen everything the left side has, and more
    DominatedBy,
    Concurrent,
}

impl Causality {
    /// The same relation seen from the other side.
    pub fn reverse(self) -> Self {
        match self {
            Causality::Dominates => Causality::DominatedBy,
            Causality::DominatedBy => Causality::Dominates,
            other => other,
        }
    }
}

/// Compare two vectors entry by entry.
pub fn compare(a: &VersionVector, b: &VersionVector) -> Causality {
    let mut a_ahead = false;
    let mut b_ahead = false;

    for device in a.keys().chain(b.keys()) {
        let left = a.get(device).copied().unwrap_or(0);
        let right = b.get(device).copied().unwrap_or(0);
        match left.cmp(&right) {
            Ordering::Greater => a_ahead = true,
            Ordering::Less => b_ahead = true,
            Ordering::Equal => {}
        }
    }

    match (a_ahead, b_ahead) {
        (false, false) => Causality::Equal,
        (true, false) => Causality::Dominates,
        (false, true) => Causality::DominatedBy,
        (true, true) => Causality::Concurrent,
    }
}

/// Neither vector has seen all the writes of the other.
pub fn are_concurrent(a: &VersionVector, b: &VersionVector) -> bool {
    compare(a, b) == Causality::Concurrent
}

/// Pointwise maximum.
pub fn merge(a: &VersionVector, b: &VersionVector) -> VersionVector {
    let mut merged = a.clone();
    for (device, &counter) in b {
        let entry = merged.entry(device.clone()).or_insert(0);
        *entry = (*entry).max(counter);
    }
    merged
}

/// Copy of `vector` with `device_id`'s counter advanced by one.
pub fn increment_version(vector: &VersionVector, device_id: &str) -> VersionVector {
    let mut next = vector.clone();
    let counter = next.entry(device_id.to_string()).or_insert(0);
    *counter = counter.saturating_add(1);
    next
}
