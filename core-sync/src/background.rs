//! # Background Triggers
//!
//! Every automatic reason to sync becomes a [`SyncTrigger`] on one queue. A
//! single dispatcher drains the queue and calls
//! [`SyncOrchestrator::sync`], so triggers share its single-pass guard and
//! circuit breaker.
//!
//! Sources:
//! - platform wakeups registered through a [`BackgroundSyncRegistrar`]
//! - a fallback [`Timer`] when the platform offers no background sync
//! - connectivity coming back ([`NetworkMonitor`])
//! - the app regaining focus or visibility ([`LifecycleObserver`])
//!
//! Event-driven triggers force the pass so a long periodic pass cannot starve
//! them. The periodic timer never forces. Only manual triggers get past an
//! open circuit breaker.

use crate::error::{Result, SyncError};
use crate::orchestrator::{SyncOptions, SyncOrchestrator};
use crate::pass::SyncResult;
use bridge_traits::background::{
    BackgroundSyncRegistrar, LifecycleObserver, LifecycleState, TaskConstraints,
};
use bridge_traits::network::NetworkMonitor;
use bridge_traits::notification::{Notification, NotificationPermission, NotificationSink};
use core_async::sync::{mpsc, CancellationToken};
use core_async::task::{self, JoinHandle};
use core_async::timer::{Timer, TimerHandle, TokioTimer};
use core_runtime::config::DEFAULT_FALLBACK_INTERVAL;
use core_runtime::events::{ConnectivityEvent, CoreEvent};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_SYNC_TAG: &str = "sync-data";

const NOTIFICATION_TAG: &str = "sync-failures";

/// Why a pass was requested
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Fallback interval timer
    Timer,
    /// Connectivity restored
    Online,
    /// App window regained focus
    Focus,
    /// App became visible again
    Visibility,
    /// Platform background wakeup for a registered tag
    Platform(String),
    Manual,
}

impl SyncTrigger {
    pub fn name(&self) -> String {
        match self {
            SyncTrigger::Timer => "timer".to_string(),
            SyncTrigger::Online => "online".to_string(),
            SyncTrigger::Focus => "focus".to_string(),
            SyncTrigger::Visibility => "visibility".to_string(),
            SyncTrigger::Platform(tag) => format!("platform:{}", tag),
            SyncTrigger::Manual => "manual".to_string(),
        }
    }

    pub fn is_forced(&self) -> bool {
        !matches!(self, SyncTrigger::Timer)
    }

    /// Only an explicit user request runs while the circuit breaker is open.
    pub fn bypasses_circuit(&self) -> bool {
        matches!(self, SyncTrigger::Manual)
    }
}

impl fmt::Display for SyncTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// Callback receiving the result of a triggered pass
pub type SyncCallback = Arc<dyn Fn(&SyncResult) + Send + Sync>;

#[derive(Clone)]
pub struct RegisterOptions {
    pub tag: String,
    /// Platform minimum interval, also the fallback timer period
    pub interval: Duration,
    pub on_success: Option<SyncCallback>,
    pub on_failure: Option<SyncCallback>,
}

impl Default for RegisterOptions {
    fn default() -> Self {
        Self {
            tag: DEFAULT_SYNC_TAG.to_string(),
            interval: DEFAULT_FALLBACK_INTERVAL,
            on_success: None,
            on_failure: None,
        }
    }
}

impl RegisterOptions {
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn on_success(mut self, callback: SyncCallback) -> Self {
        self.on_success = Some(callback);
        self
    }

    pub fn on_failure(mut self, callback: SyncCallback) -> Self {
        self.on_failure = Some(callback);
        self
    }
}

impl fmt::Debug for RegisterOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterOptions")
            .field("tag", &self.tag)
            .field("interval", &self.interval)
            .field("on_success", &self.on_success.is_some())
            .field("on_failure", &self.on_failure.is_some())
            .finish()
    }
}

#[derive(Default)]
struct Callbacks {
    on_success: Option<SyncCallback>,
    on_failure: Option<SyncCallback>,
}

/// Runs triggered passes and reacts to their results
struct Dispatcher {
    orchestrator: Arc<SyncOrchestrator>,
    notifier: Option<Arc<dyn NotificationSink>>,
    callbacks: Mutex<Callbacks>,
    consecutive_failures: AtomicU32,
    notify_after_failures: u32,
    permission_requested: AtomicBool,
}

impl Dispatcher {
    async fn dispatch(&self, trigger: &SyncTrigger) -> Option<SyncResult> {
        if !self.orchestrator.is_online().await {
            debug!(trigger = %trigger, "Offline, dropping trigger");
            return None;
        }

        let options = SyncOptions {
            force: trigger.is_forced(),
            bypass_circuit: trigger.bypasses_circuit(),
            trigger: trigger.name(),
            on_progress: None,
        };
        let result = self.orchestrator.sync(options).await;
        self.handle_result(&result).await;
        Some(result)
    }

    async fn handle_result(&self, result: &SyncResult) {
        let (on_success, on_failure) = {
            let callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            (callbacks.on_success.clone(), callbacks.on_failure.clone())
        };

        if result.success {
            self.consecutive_failures.store(0, Ordering::SeqCst);
            if let Some(callback) = on_success {
                callback(result);
            }
            return;
        }

        if let Some(callback) = on_failure {
            callback(result);
        }

        if was_skipped(result) {
            return;
        }

        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.notify_after_failures {
            let body = format!(
                "Sync failed {} times in a row. Changes are kept on this device.",
                failures
            );
            self.notify("Sync paused", &body).await;
        }
    }

    async fn request_permission(&self) -> NotificationPermission {
        let Some(notifier) = &self.notifier else {
            return NotificationPermission::Denied;
        };

        let current = match notifier.permission().await {
            Ok(permission) => permission,
            Err(e) => {
                warn!(error = %e, "Notification permission unavailable");
                return NotificationPermission::Denied;
            }
        };
        if current != NotificationPermission::Default {
            return current;
        }
        if self.permission_requested.swap(true, Ordering::SeqCst) {
            return current;
        }

        notifier.request_permission().await.unwrap_or_else(|e| {
            warn!(error = %e, "Notification permission request failed");
            NotificationPermission::Denied
        })
    }

    async fn notify(&self, title: &str, body: &str) -> bool {
        let Some(notifier) = &self.notifier else {
            return false;
        };
        if self.request_permission().await != NotificationPermission::Granted {
            debug!("Notification permission not granted");
            return false;
        }

        match notifier
            .notify(Notification::new(title, body).with_tag(NOTIFICATION_TAG))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "Failed to show notification");
                false
            }
        }
    }
}

/// A pass that did not run because another one was already running
fn was_skipped(result: &SyncResult) -> bool {
    let in_progress = SyncError::SyncInProgress.to_string();
    result.errors.len() == 1 && result.errors[0] == in_progress
}

/// Funnels background sync triggers into the orchestrator
pub struct BackgroundTrigger {
    dispatcher: Arc<Dispatcher>,
    registrar: Option<Arc<dyn BackgroundSyncRegistrar>>,
    timer: Arc<dyn Timer>,
    sender: mpsc::UnboundedSender<SyncTrigger>,
    receiver: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
    fallback: Mutex<Option<TimerHandle>>,
    shutdown: CancellationToken,
}

impl BackgroundTrigger {
    pub fn new(orchestrator: Arc<SyncOrchestrator>) -> Self {
        let notify_after_failures = orchestrator.config().notify_after_failures;
        let (sender, receiver) = mpsc::unbounded_channel();

        Self {
            dispatcher: Arc::new(Dispatcher {
                orchestrator,
                notifier: None,
                callbacks: Mutex::new(Callbacks::default()),
                consecutive_failures: AtomicU32::new(0),
                notify_after_failures,
                permission_requested: AtomicBool::new(false),
            }),
            registrar: None,
            timer: Arc::new(TokioTimer::new()),
            sender,
            receiver: Mutex::new(Some(receiver)),
            fallback: Mutex::new(None),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn with_registrar(mut self, registrar: Arc<dyn BackgroundSyncRegistrar>) -> Self {
        self.registrar = Some(registrar);
        self
    }

    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    /// Must be called before [`BackgroundTrigger::start`].
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        if let Some(dispatcher) = Arc::get_mut(&mut self.dispatcher) {
            dispatcher.notifier = Some(notifier);
        }
        self
    }

    /// Whether the platform offers background sync
    pub async fn is_supported(&self) -> bool {
        match &self.registrar {
            Some(registrar) => registrar.is_supported().await,
            None => false,
        }
    }

    /// Register a platform wakeup, falling back to a local interval timer.
    ///
    /// Returns `true` when the platform registration succeeded.
    #[tracing::instrument(skip(self, options), fields(tag = %options.tag))]
    pub async fn register_sync(&self, options: RegisterOptions) -> bool {
        {
            let mut callbacks = self
                .dispatcher
                .callbacks
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            callbacks.on_success = options.on_success.clone();
            callbacks.on_failure = options.on_failure.clone();
        }

        if let Some(registrar) = &self.registrar {
            if registrar.is_supported().await {
                match registrar
                    .register(&options.tag, options.interval, TaskConstraints::default())
                    .await
                {
                    Ok(()) => {
                        info!("Registered background sync");
                        return true;
                    }
                    Err(e) => warn!(error = %e, "Background sync registration failed"),
                }
            }
        }

        self.start_fallback(options.interval);
        false
    }

    fn start_fallback(&self, interval: Duration) {
        let sender = self.sender.clone();
        let handle = self.timer.every(
            interval,
            Arc::new(move || {
                let _ = sender.send(SyncTrigger::Timer);
            }),
        );

        let previous = self
            .fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.cancel();
        }
        info!(interval_secs = interval.as_secs(), "Started fallback sync timer");
    }

    /// Cancel the fallback timer, if any.
    pub fn stop_fallback(&self) {
        let handle = self
            .fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.cancel();
            debug!("Stopped fallback sync timer");
        }
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|handle| !handle.is_cancelled())
    }

    /// Tags registered with the platform. Empty when unsupported.
    pub async fn get_pending_tags(&self) -> Vec<String> {
        let Some(registrar) = &self.registrar else {
            return Vec::new();
        };
        if !registrar.is_supported().await {
            return Vec::new();
        }
        registrar.get_tags().await.unwrap_or_else(|e| {
            warn!(error = %e, "Failed to list background sync tags");
            Vec::new()
        })
    }

    /// Queue a trigger for the dispatcher.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.sender.send(trigger).is_ok()
    }

    /// Run a trigger immediately, bypassing the queue. `None` when offline.
    pub async fn dispatch(&self, trigger: SyncTrigger) -> Option<SyncResult> {
        self.dispatcher.dispatch(&trigger).await
    }

    pub async fn request_notification_permission(&self) -> NotificationPermission {
        self.dispatcher.request_permission().await
    }

    /// Best-effort notification. Returns whether it was shown.
    pub async fn show_notification(&self, title: &str, body: &str) -> bool {
        self.dispatcher.notify(title, body).await
    }

    /// Start the dispatcher. Returns `None` when it is already running.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        let mut receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()?;
        let dispatcher = self.dispatcher.clone();
        let shutdown = self.shutdown.clone();

        Some(task::spawn(async move {
            let mut pending: VecDeque<SyncTrigger> = VecDeque::new();

            loop {
                let trigger = match pending.pop_front() {
                    Some(trigger) => trigger,
                    None => core_async::select! {
                        _ = shutdown.cancelled() => break,
                        next = receiver.recv() => match next {
                            Some(trigger) => trigger,
                            None => break,
                        },
                    },
                };

                dispatcher.dispatch(&trigger).await;

                // Collapse repeats that piled up during the pass
                let mut last = trigger;
                while let Ok(next) = receiver.try_recv() {
                    if next != last {
                        pending.push_back(next.clone());
                        last = next;
                    }
                }
            }

            debug!("Sync trigger dispatcher stopped");
        }))
    }

    /// Queue [`SyncTrigger::Online`] whenever connectivity comes back.
    pub async fn watch_connectivity(
        &self,
        network: Arc<dyn NetworkMonitor>,
    ) -> Result<JoinHandle<()>> {
        let mut was_online = network.is_connected().await;
        let mut changes = network.subscribe_changes().await?;
        let sender = self.sender.clone();
        let events = self.dispatcher.orchestrator.event_bus().clone();
        let shutdown = self.shutdown.clone();

        Ok(task::spawn(async move {
            loop {
                let info = core_async::select! {
                    _ = shutdown.cancelled() => break,
                    next = changes.next() => match next {
                        Some(info) => info,
                        None => break,
                    },
                };

                let online = info.is_online();
                if online == was_online {
                    continue;
                }
                was_online = online;

                if online {
                    let connection_type = info
                        .network_type
                        .map(|kind| format!("{:?}", kind).to_lowercase());
                    info!(connection_type = ?connection_type, "Connectivity restored");
                    let _ = events.emit(CoreEvent::Connectivity(ConnectivityEvent::Online {
                        connection_type,
                    }));
                    let _ = sender.send(SyncTrigger::Online);
                } else {
                    info!("Connectivity lost");
                    let _ = events.emit(CoreEvent::Connectivity(ConnectivityEvent::Offline));
                }
            }
        }))
    }

    /// Queue focus and visibility triggers from app lifecycle changes.
    pub async fn watch_lifecycle(
        &self,
        observer: Arc<dyn LifecycleObserver>,
    ) -> Result<JoinHandle<()>> {
        let mut previous = observer.get_state().await?;
        let mut changes = observer.subscribe_changes().await?;
        let sender = self.sender.clone();
        let shutdown = self.shutdown.clone();

        Ok(task::spawn(async move {
            loop {
                let state = core_async::select! {
                    _ = shutdown.cancelled() => break,
                    next = changes.next() => match next {
                        Some(state) => state,
                        None => break,
                    },
                };

                let trigger = match (previous, state) {
                    (from, LifecycleState::Focused) if from != LifecycleState::Focused => {
                        Some(SyncTrigger::Focus)
                    }
                    (LifecycleState::Hidden, LifecycleState::Visible) => {
                        Some(SyncTrigger::Visibility)
                    }
                    _ => None,
                };
                previous = state;

                if let Some(trigger) = trigger {
                    let _ = sender.send(trigger);
                }
            }
        }))
    }

    /// Queue [`SyncTrigger::Platform`] for each platform wakeup.
    pub async fn watch_platform_wakeups(&self) -> Result<Option<JoinHandle<()>>> {
        let Some(registrar) = &self.registrar else {
            return Ok(None);
        };
        let mut wakeups = registrar.subscribe_wakeups().await?;
        let sender = self.sender.clone();
        let shutdown = self.shutdown.clone();

        Ok(Some(task::spawn(async move {
            loop {
                let tag = core_async::select! {
                    _ = shutdown.cancelled() => break,
                    next = wakeups.next() => match next {
                        Some(tag) => tag,
                        None => break,
                    },
                };
                let _ = sender.send(SyncTrigger::Platform(tag));
            }
        })))
    }

    /// Stop the fallback timer, watchers and the dispatcher.
    pub fn shutdown(&self) {
        self.stop_fallback();
        self.shutdown.cancel();
    }
}

impl Drop for BackgroundTrigger {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_timer_is_unforced() {
        assert!(!SyncTrigger::Timer.is_forced());
        for trigger in [
            SyncTrigger::Online,
            SyncTrigger::Focus,
            SyncTrigger::Visibility,
            SyncTrigger::Platform("sync-data".to_string()),
            SyncTrigger::Manual,
        ] {
            assert!(trigger.is_forced(), "{} should force", trigger);
        }
    }

    #[test]
    fn test_only_manual_bypasses_circuit() {
        assert!(SyncTrigger::Manual.bypasses_circuit());
        assert!(!SyncTrigger::Focus.bypasses_circuit());
        assert!(!SyncTrigger::Online.bypasses_circuit());
        assert!(!SyncTrigger::Timer.bypasses_circuit());
    }

    #[test]
    fn test_trigger_names() {
        assert_eq!(SyncTrigger::Timer.name(), "timer");
        assert_eq!(
            SyncTrigger::Platform("sync-data".to_string()).name(),
            "platform:sync-data"
        );
    }

    #[test]
    fn test_skipped_result_detection() {
        let skipped = SyncResult::rejected(SyncError::SyncInProgress.to_string(), 0);
        let failed = SyncResult::rejected(SyncError::Offline.to_string(), 0);
        assert!(was_skipped(&skipped));
        assert!(!was_skipped(&failed));
    }
}
