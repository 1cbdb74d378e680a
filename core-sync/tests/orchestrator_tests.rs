//! End-to-end sync passes against the in-memory remote store

mod common;

use bridge_traits::storage::SettingsStore;
use bridge_traits::time::{Clock, ManualClock};
use common::*;
use core_runtime::config::SyncEngineConfig;
use core_runtime::events::{CoreEvent, SyncEvent};
use core_store::{RecordRepository, SqliteRecordRepository, TableKind};
use core_sync::orchestrator::LAST_SYNC_KEY;
use core_sync::remote::RemoteStore;
use core_sync::{
    update_record, CircuitState, InMemoryRemoteStore, RemoteError, SyncOptions, SyncPhase,
    SyncProgress,
};
use serde_json::json;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn drain_sync_events(
    receiver: &mut core_async::sync::broadcast::Receiver<CoreEvent>,
) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        if let CoreEvent::Sync(event) = event {
            events.push(event);
        }
    }
    events
}

#[tokio::test]
async fn test_offline_pass_is_rejected() {
    let h = harness().await;
    h.network.set_online(false);

    let result = h.orchestrator.sync(SyncOptions::default()).await;

    assert!(!result.success);
    assert_eq!(result.errors, vec!["No internet connection".to_string()]);
    assert_eq!(h.orchestrator.get_last_sync_timestamp(), None);
    assert!(!h.orchestrator.get_connection_status().await.online);
}

#[tokio::test]
async fn test_local_writes_are_uploaded() {
    let h = harness().await;
    h.orchestrator
        .record_local_change(&pago("pago-1", "cr-1", 150.0))
        .await
        .unwrap();
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();
    assert_eq!(h.orchestrator.get_queue_size().await.unwrap(), 2);

    let pending = h.orchestrator.get_pending_operations(Some(1)).await.unwrap();
    assert_eq!(pending[0].table_name, "pagos");

    let result = h.orchestrator.sync(SyncOptions::default()).await;

    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.uploaded, 2);
    assert_eq!(result.conflicts, 0);
    assert_eq!(h.orchestrator.get_queue_size().await.unwrap(), 0);
    assert_eq!(h.orchestrator.tracker().get_stats().await.unwrap().pending, 0);

    let uploaded = h.remote.get(TableKind::Pagos, "pago-1").unwrap();
    assert_eq!(uploaded.fields["monto"], json!(150.0));
    assert_eq!(uploaded.version_vector.get("device-a"), Some(&1));

    let records = SqliteRecordRepository::new(h.pool.clone());
    assert!(records.find(TableKind::Pagos, "pago-1").await.unwrap().unwrap().synced);

    assert_eq!(h.orchestrator.get_last_sync_timestamp(), Some(START_MILLIS));
    assert_eq!(
        h.settings.get_i64(LAST_SYNC_KEY).await.unwrap(),
        Some(START_MILLIS)
    );
}

#[tokio::test]
async fn test_identical_write_is_not_queued() {
    let h = harness().await;
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();

    assert_eq!(h.orchestrator.get_queue_size().await.unwrap(), 1);
    assert_eq!(h.orchestrator.tracker().get_stats().await.unwrap().total, 1);
}

#[tokio::test]
async fn test_remote_records_are_downloaded() {
    let h = harness().await;
    let mut remote_cliente = core_store::CrdtRecord::new("cl-9").with_fields(
        [
            ("nombre".to_string(), json!("Luis")),
            ("documento".to_string(), json!("DOC-9")),
        ]
        .into_iter()
        .collect(),
    );
    remote_cliente.version_vector.insert("device-b".to_string(), 1);
    h.remote.put(TableKind::Clientes, remote_cliente);

    let result = h.orchestrator.sync(SyncOptions::default()).await;

    assert!(result.success);
    assert_eq!(result.downloaded, 1);

    let records = SqliteRecordRepository::new(h.pool.clone());
    let local = records.find(TableKind::Clientes, "cl-9").await.unwrap().unwrap();
    assert_eq!(local.fields["nombre"], json!("Luis"));
    assert!(local.synced);
    assert_eq!(h.orchestrator.get_queue_size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_concurrent_edits_merge_fieldwise() {
    let h = harness().await;
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();
    assert!(h.orchestrator.sync(SyncOptions::default()).await.success);

    // This device renames the client
    h.clock.advance(Duration::from_secs(1));
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana Maria"))
        .await
        .unwrap();

    // Another device adds a phone number to the uploaded copy
    let remote_copy = h.remote.get(TableKind::Clientes, "cl-1").unwrap();
    let phone: core_store::FieldMap = [("telefono".to_string(), json!("555-0101"))]
        .into_iter()
        .collect();
    let edited = update_record(
        &remote_copy,
        &phone,
        "device-b",
        h.clock.unix_timestamp_millis() + 500,
    );
    h.remote.put(TableKind::Clientes, edited);

    h.clock.advance(Duration::from_secs(1));
    let result = h.orchestrator.sync(SyncOptions::default()).await;
    assert!(result.success, "errors: {:?}", result.errors);

    let records = SqliteRecordRepository::new(h.pool.clone());
    let local = records.find(TableKind::Clientes, "cl-1").await.unwrap().unwrap();
    assert_eq!(local.fields["nombre"], json!("Ana Maria"));
    assert_eq!(local.fields["telefono"], json!("555-0101"));
    assert_eq!(local.version_vector.get("device-a"), Some(&2));
    assert_eq!(local.version_vector.get("device-b"), Some(&1));

    let stored = h.remote.get(TableKind::Clientes, "cl-1").unwrap();
    assert_eq!(stored.fields, local.fields);
}

#[tokio::test]
async fn test_progress_reports_every_phase() {
    let h = harness().await;
    h.orchestrator
        .record_local_change(&pago("pago-1", "cr-1", 80.0))
        .await
        .unwrap();

    let seen: Arc<Mutex<Vec<SyncProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let options = SyncOptions::default()
        .with_trigger("focus")
        .with_progress(Arc::new(move |progress| sink.lock().unwrap().push(progress)));

    let mut events = h.orchestrator.event_bus().subscribe();
    assert!(h.orchestrator.sync(options).await.success);

    let phases: Vec<String> = {
        let seen = seen.lock().unwrap();
        let mut phases: Vec<String> = seen.iter().map(|p| p.phase.clone()).collect();
        phases.dedup();
        phases
    };
    assert_eq!(phases, vec!["upload", "download", "verify", "complete"]);
    assert_eq!(seen.lock().unwrap().last().unwrap().percent, 100);

    let events = drain_sync_events(&mut events);
    assert!(matches!(
        events.first(),
        Some(SyncEvent::Started { trigger, forced: false, .. }) if trigger == "focus"
    ));
    assert!(matches!(
        events.last(),
        Some(SyncEvent::Completed { uploaded: 1, .. })
    ));
    assert_eq!(h.orchestrator.state().current_phase(), SyncPhase::Complete);
}

#[tokio::test]
async fn test_pass_in_progress_and_cancellation() {
    let gated = GatedRemote::new(InMemoryRemoteStore::new(Arc::new(ManualClock::new(
        START_MILLIS,
    ))));
    let h = harness_with(config(), Some(gated.clone() as Arc<dyn RemoteStore>)).await;
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();

    let orchestrator = h.orchestrator.clone();
    let running = tokio::spawn(async move { orchestrator.sync(SyncOptions::default()).await });

    gated.entered.notified().await;
    assert!(h.orchestrator.is_currently_syncing());

    let second = h.orchestrator.sync(SyncOptions::default()).await;
    assert_eq!(second.errors, vec!["Sync already in progress".to_string()]);

    assert!(h.orchestrator.cancel_sync());
    gated.gate.notify_one();

    let first = running.await.unwrap();
    assert!(!first.success);
    assert_eq!(first.errors, vec!["Sync cancelled".to_string()]);
    assert!(!h.orchestrator.is_currently_syncing());
    assert_eq!(h.orchestrator.state().current_phase(), SyncPhase::Cancelled);

    // The upload result was discarded, so the write is still queued
    assert_eq!(h.orchestrator.get_queue_size().await.unwrap(), 1);
    assert_eq!(h.orchestrator.get_last_sync_timestamp(), None);
    assert!(!h.orchestrator.cancel_sync());
}

#[tokio::test]
async fn test_circuit_opens_and_recovers() {
    let h = harness().await;
    let mut events = h.orchestrator.event_bus().subscribe();
    h.remote.set_offline(true);

    for _ in 0..5 {
        let result = h.orchestrator.sync(SyncOptions::default()).await;
        assert!(!result.success);
    }
    assert_eq!(h.orchestrator.circuit_state(), CircuitState::Open);

    let events_so_far = drain_sync_events(&mut events);
    assert!(events_so_far.contains(&SyncEvent::CircuitOpened {
        consecutive_failures: 5,
        cooldown_secs: 300,
    }));
    assert!(events_so_far
        .iter()
        .any(|e| matches!(e, SyncEvent::Failed { recoverable: true, .. })));

    let paused = h.orchestrator.sync(SyncOptions::default()).await;
    assert_eq!(
        paused.errors,
        vec!["Sync paused after repeated failures".to_string()]
    );

    h.monotonic.advance(Duration::from_secs(300));
    assert_eq!(h.orchestrator.circuit_state(), CircuitState::HalfOpen);
    h.remote.set_offline(false);

    let trial = h.orchestrator.sync(SyncOptions::default()).await;
    assert!(trial.success);
    assert_eq!(h.orchestrator.circuit_state(), CircuitState::Closed);
    assert!(drain_sync_events(&mut events).contains(&SyncEvent::CircuitClosed));
}

#[tokio::test]
async fn test_cancelled_trial_does_not_hold_the_circuit() {
    let inner = InMemoryRemoteStore::new(Arc::new(ManualClock::new(START_MILLIS)));
    let gated = GatedRemote::new(inner.clone());
    let h = harness_with(config(), Some(gated.clone() as Arc<dyn RemoteStore>)).await;

    inner.set_offline(true);
    for _ in 0..5 {
        h.orchestrator.sync(SyncOptions::default()).await;
    }
    inner.set_offline(false);
    h.monotonic.advance(Duration::from_secs(300));
    assert_eq!(h.orchestrator.circuit_state(), CircuitState::HalfOpen);

    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();
    let orchestrator = h.orchestrator.clone();
    let trial = tokio::spawn(async move { orchestrator.sync(SyncOptions::default()).await });

    gated.entered.notified().await;
    assert!(h.orchestrator.cancel_sync());
    gated.gate.notify_one();
    assert_eq!(
        trial.await.unwrap().errors,
        vec!["Sync cancelled".to_string()]
    );
    assert_eq!(h.orchestrator.circuit_state(), CircuitState::HalfOpen);

    gated.gate.notify_one();
    let retry = h.orchestrator.sync(SyncOptions::default()).await;
    assert!(retry.success, "errors: {:?}", retry.errors);
    assert_eq!(h.orchestrator.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_remote_delete_discards_pending_local_edit() {
    let h = harness().await;
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();
    assert!(h.orchestrator.sync(SyncOptions::default()).await.success);

    h.clock.advance(Duration::from_secs(1));
    let mut edited = cliente("cl-1", "Ana");
    if let core_store::Record::Cliente(c) = &mut edited {
        c.telefono = Some("300".to_string());
    }
    h.orchestrator.record_local_change(&edited).await.unwrap();

    // Another device deletes the record while this edit fails to upload
    h.remote.delete("clientes", "cl-1").await.unwrap();
    h.remote.fail_next(RemoteError::Unavailable("flaky link".to_string()));

    h.clock.advance(Duration::from_secs(1));
    let first = h.orchestrator.sync(SyncOptions::default()).await;
    assert_eq!(first.uploaded, 0);
    assert_eq!(h.orchestrator.get_queue_size().await.unwrap(), 0);

    let records = SqliteRecordRepository::new(h.pool.clone());
    assert!(records.find(TableKind::Clientes, "cl-1").await.unwrap().is_none());

    h.clock.advance(Duration::from_secs(120));
    let upserts_before = h.remote.upsert_calls();
    let second = h.orchestrator.sync(SyncOptions::default()).await;
    assert!(second.success, "errors: {:?}", second.errors);
    assert_eq!(second.uploaded, 0);
    assert_eq!(h.remote.upsert_calls(), upserts_before);
    assert!(h.remote.get(TableKind::Clientes, "cl-1").is_none());
}

#[tokio::test]
async fn test_forced_pass_bypasses_open_circuit() {
    let h = harness().await;
    h.remote.set_offline(true);
    for _ in 0..5 {
        h.orchestrator.sync(SyncOptions::default()).await;
    }
    h.remote.set_offline(false);

    let result = h.orchestrator.sync(SyncOptions::forced()).await;
    assert!(result.success);
    assert_eq!(h.orchestrator.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_rejected_upload_backs_off_then_dead_letters() {
    let config = SyncEngineConfig::builder()
        .device_id("device-a")
        .max_retries(2)
        .build()
        .unwrap();
    let h = harness_with(config, None).await;
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();

    h.remote.fail_next(RemoteError::Rejected {
        table: "clientes".to_string(),
        message: "validation failed".to_string(),
    });
    let first = h.orchestrator.sync(SyncOptions::default()).await;
    assert!(first.success);
    assert_eq!(first.uploaded, 0);
    assert_eq!(first.errors.len(), 1);
    assert!(first.errors[0].starts_with("clientes:"));

    let item = &h.orchestrator.get_pending_operations(None).await.unwrap()[0];
    assert_eq!(item.retry_count, 1);
    assert!(item.next_retry > h.clock.unix_timestamp_millis());

    // Still backing off: nothing is attempted
    let waiting = h.orchestrator.sync(SyncOptions::default()).await;
    assert_eq!(waiting.uploaded, 0);
    assert!(waiting.errors.is_empty());
    assert_eq!(h.remote.upsert_calls(), 0);

    h.remote.fail_next(RemoteError::Timeout);
    h.clock.advance(Duration::from_secs(60));
    h.orchestrator.sync(SyncOptions::default()).await;

    assert_eq!(h.orchestrator.get_queue_size().await.unwrap(), 0);
    let dead = h.orchestrator.dead_letters().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].record_id, "cl-1");
    assert_eq!(dead[0].retry_count, 2);

    // Dead-lettered records stay out of later passes
    h.clock.advance(Duration::from_secs(60));
    let skipped = h.orchestrator.sync(SyncOptions::default()).await;
    assert_eq!(skipped.uploaded, 0);
    assert!(h.remote.get(TableKind::Clientes, "cl-1").is_none());

    // Clearing the log lets the record through again
    assert_eq!(h.orchestrator.clear_dead_letters().await.unwrap(), 1);
    let retried = h.orchestrator.sync(SyncOptions::default()).await;
    assert_eq!(retried.uploaded, 1);
    assert!(h.remote.get(TableKind::Clientes, "cl-1").is_some());
}

#[tokio::test]
async fn test_damaged_store_is_rebuilt_from_remote() {
    let h = harness().await;
    let mut remote_cliente = core_store::CrdtRecord::new("cl-5").with_fields(
        [
            ("nombre".to_string(), json!("Marta")),
            ("documento".to_string(), json!("DOC-5")),
        ]
        .into_iter()
        .collect(),
    );
    remote_cliente.version_vector.insert("device-b".to_string(), 3);
    h.remote.put(TableKind::Clientes, remote_cliente.clone());

    h.clock.advance(Duration::from_secs(1));
    assert!(h.orchestrator.sync(SyncOptions::default()).await.success);

    sqlx::query("UPDATE records SET version_vector = '{broken' WHERE id = 'cl-5'")
        .execute(&h.pool)
        .await
        .unwrap();

    h.clock.advance(Duration::from_secs(1));
    let result = h.orchestrator.sync(SyncOptions::default()).await;
    assert!(result.success, "errors: {:?}", result.errors);

    let records = SqliteRecordRepository::new(h.pool.clone());
    let restored = records.find(TableKind::Clientes, "cl-5").await.unwrap().unwrap();
    assert_eq!(restored.version_vector, remote_cliente.version_vector);
    assert!(restored.synced);
}

#[tokio::test]
async fn test_local_delete_reaches_remote() {
    let h = harness().await;
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();
    assert!(h.orchestrator.sync(SyncOptions::default()).await.success);
    assert!(h.remote.get(TableKind::Clientes, "cl-1").is_some());

    h.clock.advance(Duration::from_secs(1));
    assert!(h
        .orchestrator
        .delete_local_record(TableKind::Clientes, "cl-1")
        .await
        .unwrap());
    assert!(!h
        .orchestrator
        .delete_local_record(TableKind::Clientes, "missing")
        .await
        .unwrap());

    let result = h.orchestrator.sync(SyncOptions::default()).await;
    assert!(result.success, "errors: {:?}", result.errors);
    assert_eq!(result.uploaded, 1);
    assert!(h.remote.get(TableKind::Clientes, "cl-1").is_none());
    assert_eq!(h.orchestrator.get_queue_size().await.unwrap(), 0);
}

#[tokio::test]
async fn test_last_sync_survives_restart() {
    let h = harness().await;
    h.settings.set_i64(LAST_SYNC_KEY, 42).await.unwrap();

    let restarted = core_sync::SyncOrchestrator::builder(config(), h.pool.clone())
        .remote(Arc::new(h.remote.clone()))
        .network(h.network.clone())
        .settings(h.settings.clone())
        .build()
        .await
        .unwrap();

    assert_eq!(restarted.get_last_sync_timestamp(), Some(42));
}

#[tokio::test]
async fn test_builder_requires_remote() {
    let h = harness().await;
    let result = core_sync::SyncOrchestrator::builder(config(), h.pool.clone())
        .network(h.network.clone())
        .settings(h.settings.clone())
        .build()
        .await;

    assert!(matches!(
        result,
        Err(core_sync::SyncError::InvalidInput { ref field, .. }) if field == "remote"
    ));
}

#[tokio::test]
async fn test_maintenance_clears_old_synced_changes() {
    let h = harness().await;
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();
    assert!(h.orchestrator.sync(SyncOptions::default()).await.success);

    h.clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
    let report = h.orchestrator.run_maintenance().await.unwrap();

    assert_eq!(report.changes_cleared, 1);
    assert_eq!(h.orchestrator.tracker().get_stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_successful_pass_sweeps_old_changes() {
    let h = harness().await;
    h.orchestrator
        .record_local_change(&cliente("cl-1", "Ana"))
        .await
        .unwrap();
    assert!(h.orchestrator.sync(SyncOptions::default()).await.success);
    assert_eq!(h.orchestrator.tracker().get_stats().await.unwrap().total, 1);

    h.clock.advance(Duration::from_secs(31 * 24 * 60 * 60));
    assert!(h.orchestrator.sync(SyncOptions::default()).await.success);

    assert_eq!(h.orchestrator.tracker().get_stats().await.unwrap().total, 0);
}
