//! Conflict Resolution for CRDT Records
//!
//! Merges a local and a remote snapshot of the same record.
//!
//! ## Overview
//!
//! Two kinds of tables exist:
//! - **Append-only** (payments): rows are immutable facts, so there is nothing
//!   to merge and the local copy is kept.
//! - **Editable** (clients, loans, installments): the version vectors decide.
//!   A dominating side wins outright; concurrent edits are merged field by
//!   field with last-writer-wins on each [`FieldVersion`].
//!
//! ## Determinism
//!
//! Every decision uses a total order that does not depend on which side is
//! called local, so `resolve_conflict(a, b)` and `resolve_conflict(b, a)`
//! produce the same merged content and the same conflict set:
//!
//! 1. Field versions: greater `timestamp`, then greater `device_id`, then the
//!    greater canonical JSON encoding of the value.
//! 2. Plain attributes without a field version come from the preferred
//!    record: greater `updated_at`, then greater maximum device id, then the
//!    greater canonical encoding of the fields.
//!
//! ## Usage
//!
//! ```
//! use core_store::{ConflictKind, CrdtRecord};
//! use core_sync::conflict_resolver::{resolve_conflict, ResolutionStrategy};
//!
//! let mut local = CrdtRecord::new("cl-1");
//! local.version_vector.insert("d1".to_string(), 2);
//! local.version_vector.insert("d2".to_string(), 1);
//!
//! let mut remote = CrdtRecord::new("cl-1");
//! remote.version_vector.insert("d1".to_string(), 1);
//! remote.version_vector.insert("d2".to_string(), 1);
//!
//! let resolution = resolve_conflict(&local, &remote, ConflictKind::Editable);
//! assert_eq!(resolution.strategy, ResolutionStrategy::LocalWins);
//! ```

use crate::version_vector::{self, Causality};
use bridge_traits::time::Clock;
use core_store::{ConflictKind, CrdtRecord, FieldMap, FieldVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;

pub use crate::version_vector::{are_concurrent, increment_version};

/// How a conflict was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LocalWins,
    RemoteWins,
    Merged,
    AppendOnly,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LocalWins => "local_wins",
            ResolutionStrategy::RemoteWins => "remote_wins",
            ResolutionStrategy::Merged => "merged",
            ResolutionStrategy::AppendOnly => "append_only",
        }
    }

    /// The strategy reported when the arguments are swapped.
    pub fn mirrored(&self) -> Self {
        match self {
            ResolutionStrategy::LocalWins => ResolutionStrategy::RemoteWins,
            ResolutionStrategy::RemoteWins => ResolutionStrategy::LocalWins,
            other => *other,
        }
    }
}

/// Result of merging two snapshots
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictResolution {
    pub resolved: CrdtRecord,
    pub strategy: ResolutionStrategy,
    /// Fields whose value came from the otherwise losing record, sorted
    pub conflicts_detected: Vec<String>,
}

impl ConflictResolution {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts_detected.is_empty()
    }
}

/// Merge `local` and `remote` for a table of the given kind.
pub fn resolve_conflict(
    local: &CrdtRecord,
    remote: &CrdtRecord,
    kind: ConflictKind,
) -> ConflictResolution {
    if kind == ConflictKind::AppendOnly {
        return ConflictResolution {
            resolved: local.clone(),
            strategy: ResolutionStrategy::AppendOnly,
            conflicts_detected: Vec::new(),
        };
    }

    match version_vector::compare(&local.version_vector, &remote.version_vector) {
        Causality::Dominates => ConflictResolution {
            resolved: local.clone(),
            strategy: ResolutionStrategy::LocalWins,
            conflicts_detected: Vec::new(),
        },
        Causality::DominatedBy => ConflictResolution {
            resolved: remote.clone(),
            strategy: ResolutionStrategy::RemoteWins,
            conflicts_detected: Vec::new(),
        },
        Causality::Equal | Causality::Concurrent => merge_records(local, remote),
    }
}

fn merge_records(a: &CrdtRecord, b: &CrdtRecord) -> ConflictResolution {
    // `None` when the two records tie on every preference key
    let preferred = match compare_records(a, b) {
        Ordering::Greater => Some(Side::A),
        Ordering::Less => Some(Side::B),
        Ordering::Equal => None,
    };
    let (primary, secondary) = match preferred {
        Some(Side::B) => (b, a),
        _ => (a, b),
    };

    let mut resolved = CrdtRecord::new(a.id.clone());
    resolved.tenant_id = primary.tenant_id.clone().or_else(|| secondary.tenant_id.clone());
    resolved.version_vector = version_vector::merge(&a.version_vector, &b.version_vector);
    resolved.updated_at = a.updated_at.max(b.updated_at);
    resolved.synced = false;

    let mut conflicts = BTreeSet::new();

    let versioned: BTreeSet<&String> = a
        .field_versions
        .keys()
        .chain(b.field_versions.keys())
        .collect();

    for field in &versioned {
        let winner = match (a.field_versions.get(*field), b.field_versions.get(*field)) {
            (Some(x), Some(y)) => {
                if compare_field_versions(x, y) == Ordering::Less {
                    (Side::B, y)
                } else {
                    (Side::A, x)
                }
            }
            (Some(x), None) => (Side::A, x),
            (None, Some(y)) => (Side::B, y),
            (None, None) => continue,
        };

        let (winning_side, version) = winner;
        if preferred.is_some_and(|side| side != winning_side)
            && field_value(a, field) != field_value(b, field)
        {
            conflicts.insert((*field).clone());
        }

        resolved.fields.insert((*field).clone(), version.value.clone());
        resolved.field_versions.insert((*field).clone(), version.clone());
    }

    // Plain attributes: preferred side first, the other side fills gaps
    for (field, value) in secondary.fields.iter().chain(primary.fields.iter()) {
        if versioned.contains(field) {
            continue;
        }
        resolved.fields.insert(field.clone(), value.clone());
    }

    debug!(
        record_id = %resolved.id,
        conflicts = conflicts.len(),
        "Merged concurrent record versions"
    );

    ConflictResolution {
        resolved,
        strategy: ResolutionStrategy::Merged,
        conflicts_detected: conflicts.into_iter().collect(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    A,
    B,
}

fn field_value<'a>(record: &'a CrdtRecord, field: &str) -> Option<&'a Value> {
    record
        .field_versions
        .get(field)
        .map(|version| &version.value)
        .or_else(|| record.fields.get(field))
}

/// Total order on field versions: timestamp, device id, canonical value.
pub fn compare_field_versions(a: &FieldVersion, b: &FieldVersion) -> Ordering {
    a.timestamp
        .cmp(&b.timestamp)
        .then_with(|| a.device_id.cmp(&b.device_id))
        .then_with(|| canonical(&a.value).cmp(&canonical(&b.value)))
}

/// Preference order between whole records for attributes without versions.
fn compare_records(a: &CrdtRecord, b: &CrdtRecord) -> Ordering {
    a.updated_at
        .cmp(&b.updated_at)
        .then_with(|| a.max_device_id().cmp(&b.max_device_id()))
        .then_with(|| canonical_fields(&a.fields).cmp(&canonical_fields(&b.fields)))
        .then_with(|| a.tenant_id.cmp(&b.tenant_id))
}

/// Stable text form of a value; object keys are emitted in sorted order.
fn canonical(value: &Value) -> String {
    value.to_string()
}

fn canonical_fields(fields: &FieldMap) -> String {
    serde_json::to_string(fields).unwrap_or_default()
}

/// Stamp a field write.
pub fn create_field_version(value: Value, device_id: &str, timestamp: i64) -> FieldVersion {
    FieldVersion {
        value,
        timestamp,
        device_id: device_id.to_string(),
    }
}

/// Apply local field updates to a record.
///
/// Advances `device_id`'s vector entry once, stamps every updated field with
/// a fresh version at `timestamp`, and leaves the record unsynced.
pub fn update_record(
    record: &CrdtRecord,
    field_updates: &FieldMap,
    device_id: &str,
    timestamp: i64,
) -> CrdtRecord {
    let mut next = record.clone();

    for (field, value) in field_updates {
        if field == "id" {
            continue;
        }
        next.fields.insert(field.clone(), value.clone());
        next.field_versions.insert(
            field.clone(),
            create_field_version(value.clone(), device_id, timestamp),
        );
    }

    next.version_vector = increment_version(&record.version_vector, device_id);
    next.updated_at = timestamp.max(record.updated_at);
    next.synced = false;
    next
}

/// Device-bound helper that stamps writes with the injected clock.
#[derive(Clone)]
pub struct ConflictResolver {
    device_id: String,
    clock: Arc<dyn Clock>,
}

impl ConflictResolver {
    pub fn new(device_id: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            device_id: device_id.into(),
            clock,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn resolve(
        &self,
        local: &CrdtRecord,
        remote: &CrdtRecord,
        kind: ConflictKind,
    ) -> ConflictResolution {
        resolve_conflict(local, remote, kind)
    }

    /// Field version for this device at the current time.
    pub fn create_field_version(&self, value: Value) -> FieldVersion {
        create_field_version(value, &self.device_id, self.clock.unix_timestamp_millis())
    }

    pub fn update_record(&self, record: &CrdtRecord, field_updates: &FieldMap) -> CrdtRecord {
        update_record(
            record,
            field_updates,
            &self.device_id,
            self.clock.unix_timestamp_millis(),
        )
    }
}
