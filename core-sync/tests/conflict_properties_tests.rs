//! Merge properties checked over generated record pairs

use core_store::{ConflictKind, CrdtRecord, FieldVersion};
use core_sync::{compare_field_versions, resolve_conflict, ResolutionStrategy};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde_json::json;
use std::cmp::Ordering;

const DEVICES: [&str; 3] = ["d1", "d2", "d3"];
const FIELDS: [&str; 3] = ["nombre", "telefono", "direccion"];

/// Small value ranges so ties on timestamps, devices and values are common
fn random_record(rng: &mut StdRng) -> CrdtRecord {
    let mut record = CrdtRecord::new("cl-1");
    record.updated_at = rng.gen_range(0..3);
    if rng.gen_bool(0.2) {
        record.tenant_id = Some(format!("t{}", rng.gen_range(1..3)));
    }

    for device in DEVICES {
        let counter = rng.gen_range(0..3);
        if counter > 0 {
            record.version_vector.insert(device.to_string(), counter);
        }
    }

    for field in FIELDS {
        if !rng.gen_bool(0.7) {
            continue;
        }
        let value = json!(format!("{}-{}", field, rng.gen_range(0..3)));
        record.fields.insert(field.to_string(), value.clone());
        if rng.gen_bool(0.6) {
            record.field_versions.insert(
                field.to_string(),
                FieldVersion {
                    value,
                    timestamp: rng.gen_range(0..4),
                    device_id: DEVICES[rng.gen_range(0..DEVICES.len())].to_string(),
                },
            );
        }
    }

    record
}

#[test]
fn test_resolution_is_commutative() {
    let mut rng = StdRng::seed_from_u64(0x5eed);

    for _ in 0..500 {
        let a = random_record(&mut rng);
        let b = random_record(&mut rng);

        let ab = resolve_conflict(&a, &b, ConflictKind::Editable);
        let ba = resolve_conflict(&b, &a, ConflictKind::Editable);

        assert_eq!(ab.resolved, ba.resolved, "a = {:?}\nb = {:?}", a, b);
        assert_eq!(ab.strategy, ba.strategy.mirrored());
        assert_eq!(ab.conflicts_detected, ba.conflicts_detected);
    }
}

#[test]
fn test_resolution_keeps_every_field() {
    let mut rng = StdRng::seed_from_u64(7);

    for _ in 0..200 {
        let a = random_record(&mut rng);
        let b = random_record(&mut rng);
        let resolution = resolve_conflict(&a, &b, ConflictKind::Editable);

        if resolution.strategy == ResolutionStrategy::Merged {
            for field in a.fields.keys().chain(b.fields.keys()) {
                assert!(resolution.resolved.fields.contains_key(field));
            }
            for (device, counter) in a.version_vector.iter().chain(b.version_vector.iter()) {
                assert!(resolution.resolved.version_vector[device] >= *counter);
            }
        }
    }
}

#[test]
fn test_append_only_never_conflicts() {
    let mut rng = StdRng::seed_from_u64(42);

    for _ in 0..200 {
        let local = random_record(&mut rng);
        let remote = random_record(&mut rng);
        let resolution = resolve_conflict(&local, &remote, ConflictKind::AppendOnly);

        assert_eq!(resolution.strategy, ResolutionStrategy::AppendOnly);
        assert_eq!(resolution.resolved, local);
        assert!(resolution.conflicts_detected.is_empty());
    }
}

#[test]
fn test_field_version_order_is_total() {
    let version = |timestamp, device: &str, value| FieldVersion {
        value: json!(value),
        timestamp,
        device_id: device.to_string(),
    };

    // Later timestamp wins regardless of device
    assert_eq!(
        compare_field_versions(&version(2, "d1", "a"), &version(1, "d9", "z")),
        Ordering::Greater
    );
    // Equal timestamps fall back to the device id
    assert_eq!(
        compare_field_versions(&version(1, "d1", "z"), &version(1, "d2", "a")),
        Ordering::Less
    );
    // Only identical versions compare equal
    assert_eq!(
        compare_field_versions(&version(1, "d1", "a"), &version(1, "d1", "a")),
        Ordering::Equal
    );
}
