//! Offline-first sync engine façade and bootstrap helpers.
//!
//! Host applications depend on `ledger-sync` instead of wiring each workspace
//! crate by hand. The `desktop-shims` feature (enabled by default) pulls in
//! `bridge-desktop` and exposes [`bootstrap_desktop`], which opens the local
//! database and assembles an engine around a host-provided [`RemoteStore`].

pub use core_runtime::config::{SyncEngineConfig, SyncEngineConfigBuilder};
pub use core_runtime::events::{CoreEvent, EventBus, EventSeverity, EventStream};
pub use core_store::{Cliente, CrdtRecord, Credito, Cuota, Pago, Record, TableKind};
pub use core_sync::{
    BackgroundTrigger, RegisterOptions, RemoteStore, SyncOptions, SyncOrchestrator, SyncResult,
    SyncTrigger,
};

use std::sync::Arc;

/// A running engine: the orchestrator plus the trigger funnel feeding it.
pub struct SyncEngine {
    pub orchestrator: Arc<SyncOrchestrator>,
    pub background: BackgroundTrigger,
}

impl SyncEngine {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        Self {
            background: BackgroundTrigger::new(orchestrator.clone()),
            orchestrator,
        }
    }

    /// Events worth surfacing to the user: failed passes, dead-lettered
    /// operations, the circuit opening and losing connectivity.
    pub fn alerts(&self) -> EventStream {
        EventStream::new(self.orchestrator.event_bus().subscribe())
            .filter(|event| event.severity() >= EventSeverity::Warning)
    }

    /// Run a manual, forced pass.
    pub async fn sync_now(&self) -> SyncResult {
        self.orchestrator
            .sync(SyncOptions::forced().with_trigger(SyncTrigger::Manual.name()))
            .await
    }
}

#[cfg(feature = "desktop-shims")]
pub use desktop::{bootstrap_desktop, DesktopOptions};

#[cfg(feature = "desktop-shims")]
mod desktop {
    use super::SyncEngine;
    use anyhow::Context;
    use bridge_desktop::{
        DesktopLifecycleObserver, DesktopNetworkMonitor, LogNotifier, SqliteSettingsStore,
    };
    use core_runtime::config::SyncEngineConfig;
    use core_runtime::logging::{init_logging, strip_path, LoggingConfig};
    use core_store::db::{create_pool, DatabaseConfig};
    use core_sync::{BackgroundTrigger, RegisterOptions, RemoteStore, SyncOrchestrator};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tracing::{info, warn};

    /// Inputs for [`bootstrap_desktop`]
    pub struct DesktopOptions {
        pub database_path: PathBuf,
        pub config: SyncEngineConfig,
        /// `None` leaves logging to the host
        pub logging: Option<LoggingConfig>,
    }

    /// Open the local database and start an engine with desktop bridges.
    ///
    /// Registers the fallback timer and starts watching connectivity and the
    /// window lifecycle. The returned observer is driven by the host shell.
    pub async fn bootstrap_desktop(
        options: DesktopOptions,
        remote: Arc<dyn RemoteStore>,
    ) -> anyhow::Result<(SyncEngine, Arc<DesktopLifecycleObserver>)> {
        if let Some(logging) = options.logging {
            if let Err(e) = init_logging(logging) {
                warn!(error = %e, "Logging already initialized");
            }
        }

        let pool = create_pool(DatabaseConfig::new(&options.database_path))
            .await
            .with_context(|| format!("opening {}", options.database_path.display()))?;
        let settings = SqliteSettingsStore::with_pool(pool.clone())
            .await
            .context("preparing settings store")?;
        let network = Arc::new(DesktopNetworkMonitor::new());

        let orchestrator = SyncOrchestrator::builder(options.config, pool)
            .remote(remote)
            .network(network.clone())
            .settings(Arc::new(settings))
            .build()
            .await
            .context("building sync orchestrator")?;
        let orchestrator = Arc::new(orchestrator);

        let interval = orchestrator.config().fallback_interval;
        let engine = SyncEngine {
            background: BackgroundTrigger::new(orchestrator.clone())
                .with_notifier(Arc::new(LogNotifier::new())),
            orchestrator,
        };

        let lifecycle = Arc::new(DesktopLifecycleObserver::new());
        engine
            .background
            .register_sync(RegisterOptions::default().with_interval(interval))
            .await;
        engine
            .background
            .watch_connectivity(network)
            .await
            .context("watching connectivity")?;
        engine
            .background
            .watch_lifecycle(lifecycle.clone())
            .await
            .context("watching window lifecycle")?;
        engine.background.start();

        let path = options.database_path.to_string_lossy();
        info!(database = %strip_path(&path), "Desktop sync engine started");
        Ok((engine, lifecycle))
    }
}

#[cfg(all(test, feature = "desktop-shims"))]
mod tests {
    use super::*;
    use bridge_traits::time::SystemClock;
    use core_sync::InMemoryRemoteStore;
    use std::time::{SystemTime, UNIX_EPOCH};

    #[tokio::test]
    async fn test_bootstrap_desktop_tracks_local_writes() {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("ledger-sync-{}-{}", std::process::id(), nanos));
        std::fs::create_dir_all(&dir).unwrap();

        let options = DesktopOptions {
            database_path: dir.join("engine.db"),
            config: SyncEngineConfig::for_device("desk-1").unwrap(),
            logging: None,
        };
        let remote = Arc::new(InMemoryRemoteStore::new(Arc::new(SystemClock)));
        let (engine, _lifecycle) = bootstrap_desktop(options, remote).await.unwrap();

        assert!(engine.background.has_fallback());
        assert_eq!(engine.orchestrator.get_queue_size().await.unwrap(), 0);

        engine
            .orchestrator
            .record_local_change(&Record::Cliente(Cliente {
                id: "c-1".to_string(),
                nombre: "Ana".to_string(),
                documento: "DOC-1".to_string(),
                telefono: None,
                direccion: None,
                email: None,
            }))
            .await
            .unwrap();
        assert_eq!(engine.orchestrator.get_queue_size().await.unwrap(), 1);

        let mut alerts = engine.alerts();
        engine
            .orchestrator
            .event_bus()
            .emit(CoreEvent::Sync(core_runtime::events::SyncEvent::Cancelled {
                pass_id: "p-0".to_string(),
            }))
            .unwrap();
        engine
            .orchestrator
            .event_bus()
            .emit(CoreEvent::Connectivity(
                core_runtime::events::ConnectivityEvent::Offline,
            ))
            .unwrap();
        let alert = alerts.recv().await.unwrap();
        assert!(alert.severity() >= EventSeverity::Warning);

        let manual = SyncEngine::new(engine.orchestrator.clone());
        assert!(!manual.background.has_fallback());
        assert!(!manual.orchestrator.is_currently_syncing());

        engine.background.shutdown();
        let _ = std::fs::remove_dir_all(&dir);
    }
}
