//! Shared fixtures for the sync engine integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use bridge_desktop::SqliteSettingsStore;
use bridge_traits::error::Result as BridgeResult;
use bridge_traits::network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkType};
use bridge_traits::time::{ManualClock, ManualMonotonicClock};
use chrono::NaiveDate;
use core_async::sync::{mpsc, Notify};
use core_runtime::config::SyncEngineConfig;
use core_store::db::create_test_pool;
use core_store::{Cliente, CrdtRecord, Pago, Record};
use core_sync::remote::{RemoteChange, RemoteResult, RemoteStore};
use core_sync::{InMemoryRemoteStore, SyncOrchestrator};
use sqlx::SqlitePool;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

pub const START_MILLIS: i64 = 1_717_200_000_000;

/// Network monitor whose status the test flips by hand
#[derive(Default)]
pub struct TestNetwork {
    offline: AtomicBool,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<NetworkInfo>>>,
}

impl TestNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_online(&self, online: bool) {
        self.offline.store(!online, Ordering::SeqCst);
        let info = self.info();
        self.subscribers
            .lock()
            .unwrap()
            .retain(|sender| sender.send(info.clone()).is_ok());
    }

    fn info(&self) -> NetworkInfo {
        if self.offline.load(Ordering::SeqCst) {
            NetworkInfo::offline()
        } else {
            NetworkInfo::online(NetworkType::WiFi)
        }
    }
}

struct TestNetworkStream(mpsc::UnboundedReceiver<NetworkInfo>);

#[async_trait]
impl NetworkChangeStream for TestNetworkStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        self.0.recv().await
    }
}

#[async_trait]
impl NetworkMonitor for TestNetwork {
    async fn get_network_info(&self) -> BridgeResult<NetworkInfo> {
        Ok(self.info())
    }

    async fn subscribe_changes(&self) -> BridgeResult<Box<dyn NetworkChangeStream>> {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.subscribers.lock().unwrap().push(sender);
        Ok(Box::new(TestNetworkStream(receiver)))
    }
}

/// Remote store that parks every upsert until the test opens the gate
pub struct GatedRemote {
    pub inner: InMemoryRemoteStore,
    pub entered: Notify,
    pub gate: Notify,
}

impl GatedRemote {
    pub fn new(inner: InMemoryRemoteStore) -> Arc<Self> {
        Arc::new(Self {
            inner,
            entered: Notify::new(),
            gate: Notify::new(),
        })
    }
}

#[async_trait]
impl RemoteStore for GatedRemote {
    async fn upsert_batch(&self, table: &str, records: &[CrdtRecord]) -> RemoteResult<()> {
        self.entered.notify_one();
        self.gate.notified().await;
        self.inner.upsert_batch(table, records).await
    }

    async fn delete(&self, table: &str, record_id: &str) -> RemoteResult<()> {
        self.inner.delete(table, record_id).await
    }

    async fn fetch_changes_since(&self, table: &str, since: i64) -> RemoteResult<Vec<RemoteChange>> {
        self.inner.fetch_changes_since(table, since).await
    }

    async fn fetch_all(&self, table: &str) -> RemoteResult<Vec<CrdtRecord>> {
        self.inner.fetch_all(table).await
    }
}

pub struct Harness {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub remote: InMemoryRemoteStore,
    pub network: Arc<TestNetwork>,
    pub clock: Arc<ManualClock>,
    pub monotonic: Arc<ManualMonotonicClock>,
    pub settings: Arc<SqliteSettingsStore>,
    pub pool: SqlitePool,
}

pub fn config() -> SyncEngineConfig {
    SyncEngineConfig::for_device("device-a").unwrap()
}

pub async fn harness() -> Harness {
    harness_with(config(), None).await
}

/// Build an orchestrator over a fresh in-memory database. `remote` replaces
/// the default in-memory remote store for the orchestrator only.
pub async fn harness_with(
    config: SyncEngineConfig,
    remote: Option<Arc<dyn RemoteStore>>,
) -> Harness {
    let pool = create_test_pool().await.unwrap();
    let clock = Arc::new(ManualClock::new(START_MILLIS));
    let monotonic = Arc::new(ManualMonotonicClock::new());
    let network = TestNetwork::new();
    let settings = Arc::new(SqliteSettingsStore::with_pool(pool.clone()).await.unwrap());
    let memory_remote = InMemoryRemoteStore::new(clock.clone());
    let remote = remote.unwrap_or_else(|| Arc::new(memory_remote.clone()));

    let orchestrator = SyncOrchestrator::builder(config, pool.clone())
        .remote(remote)
        .network(network.clone())
        .settings(settings.clone())
        .clock(clock.clone())
        .monotonic_clock(monotonic.clone())
        .build()
        .await
        .unwrap();

    Harness {
        orchestrator: Arc::new(orchestrator),
        remote: memory_remote,
        network,
        clock,
        monotonic,
        settings,
        pool,
    }
}

pub fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 6, day).unwrap()
}

pub fn cliente(id: &str, nombre: &str) -> Record {
    Record::Cliente(Cliente {
        id: id.to_string(),
        nombre: nombre.to_string(),
        documento: format!("DOC-{}", id),
        telefono: None,
        direccion: None,
        email: None,
    })
}

pub fn pago(id: &str, credito_id: &str, monto: f64) -> Record {
    Record::Pago(Pago {
        id: id.to_string(),
        credito_id: credito_id.to_string(),
        cuota_id: None,
        monto,
        fecha_pago: date(3),
        metodo: Some("efectivo".to_string()),
    })
}
