//! # Engine Events
//!
//! A broadcast bus for what the engine does: pass lifecycle, connectivity and
//! dead-lettered queue items. Hosts subscribe to drive status indicators and
//! passive notifications instead of polling the orchestrator.
//!
//! ```text
//! SyncOrchestrator ──┐                 ┌──> status indicator
//! BackgroundTrigger ─┼──> EventBus ────┤
//! SyncQueue ─────────┘   (broadcast)   └──> EventStream::filter(..)
//! ```
//!
//! ```rust
//! use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
//!
//! let bus = EventBus::new(16);
//! let mut subscriber = bus.subscribe();
//!
//! bus.emit(CoreEvent::Sync(SyncEvent::Cancelled {
//!     pass_id: "pass-1".to_string(),
//! }))
//! .ok();
//!
//! assert!(subscriber.try_recv().is_ok());
//! ```
//!
//! Emitting without subscribers returns an error; publishers ignore it. A
//! subscriber that falls more than the buffer size behind gets
//! `RecvError::Lagged(n)` and keeps receiving newer events.

use core_async::sync::broadcast;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use core_async::sync::broadcast::error::{RecvError, SendError};
pub use core_async::sync::broadcast::Receiver;

/// Default buffer size for the event bus channel.
pub const DEFAULT_EVENT_BUFFER_SIZE: usize = 100;

// ============================================================================
// Core Event Types
// ============================================================================

/// Top-level event enum encompassing all event categories.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", content = "payload")]
pub enum CoreEvent {
    /// Sync pass lifecycle events
    Sync(SyncEvent),
    /// Connectivity changes observed by the engine
    Connectivity(ConnectivityEvent),
    /// Outbox events
    Queue(QueueEvent),
}

impl CoreEvent {
    /// Returns a human-readable description of the event.
    pub fn description(&self) -> &str {
        match self {
            CoreEvent::Sync(e) => e.description(),
            CoreEvent::Connectivity(e) => e.description(),
            CoreEvent::Queue(e) => e.description(),
        }
    }

    /// Returns the severity level of the event.
    pub fn severity(&self) -> EventSeverity {
        match self {
            CoreEvent::Sync(SyncEvent::Failed { .. }) => EventSeverity::Error,
            CoreEvent::Queue(QueueEvent::DeadLettered { .. }) => EventSeverity::Error,
            CoreEvent::Sync(SyncEvent::CircuitOpened { .. }) => EventSeverity::Warning,
            CoreEvent::Connectivity(ConnectivityEvent::Offline) => EventSeverity::Warning,
            CoreEvent::Sync(SyncEvent::Completed { .. }) => EventSeverity::Info,
            CoreEvent::Sync(SyncEvent::CircuitClosed) => EventSeverity::Info,
            _ => EventSeverity::Debug,
        }
    }
}

/// Event severity levels for filtering and logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

// ============================================================================
// Sync Events
// ============================================================================

/// Events emitted over the lifetime of one sync pass.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum SyncEvent {
    /// Sync pass initiated.
    Started {
        /// Unique identifier for this pass.
        pass_id: String,
        /// What asked for the pass (e.g., "timer", "online", "manual").
        trigger: String,
        /// Whether mutual exclusion and the circuit breaker were bypassed.
        forced: bool,
    },
    /// Progress update within a phase.
    Progress {
        pass_id: String,
        /// One of "upload", "download", "verify", "complete".
        phase: String,
        /// Items handled so far in this phase.
        processed: u64,
        /// Items expected in this phase, when known.
        total: Option<u64>,
        /// Progress percentage (0-100) within the phase.
        percent: u8,
    },
    /// Sync pass finished.
    Completed {
        pass_id: String,
        uploaded: u64,
        downloaded: u64,
        conflicts: u64,
        duration_ms: u64,
    },
    /// Sync pass stopped on an error.
    Failed {
        pass_id: String,
        message: String,
        /// Whether a later pass may succeed without intervention.
        recoverable: bool,
    },
    /// Sync pass was cancelled.
    Cancelled { pass_id: String },
    /// Repeated failures paused automatic syncing.
    CircuitOpened {
        consecutive_failures: u32,
        cooldown_secs: u64,
    },
    /// Automatic syncing resumed after a successful trial pass.
    CircuitClosed,
}

impl SyncEvent {
    fn description(&self) -> &str {
        match self {
            SyncEvent::Started { .. } => "Sync started",
            SyncEvent::Progress { .. } => "Sync in progress",
            SyncEvent::Completed { .. } => "Sync completed",
            SyncEvent::Failed { .. } => "Sync failed",
            SyncEvent::Cancelled { .. } => "Sync cancelled",
            SyncEvent::CircuitOpened { .. } => "Sync paused after repeated failures",
            SyncEvent::CircuitClosed => "Sync resumed",
        }
    }
}

// ============================================================================
// Connectivity Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum ConnectivityEvent {
    Online { connection_type: Option<String> },
    Offline,
}

impl ConnectivityEvent {
    fn description(&self) -> &str {
        match self {
            ConnectivityEvent::Online { .. } => "Connection restored",
            ConnectivityEvent::Offline => "Connection lost",
        }
    }
}

// ============================================================================
// Queue Events
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "event")]
pub enum QueueEvent {
    /// An operation exhausted its retries and moved to the error log.
    DeadLettered {
        item_id: String,
        table_name: String,
        record_id: String,
        retry_count: u32,
    },
}

impl QueueEvent {
    fn description(&self) -> &str {
        match self {
            QueueEvent::DeadLettered { .. } => "Operation moved to error log",
        }
    }
}

// ============================================================================
// Event Bus
// ============================================================================

/// Clones share one channel.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<CoreEvent>,
}

impl EventBus {
    /// `capacity` is how far a subscriber may fall behind before it lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Returns how many subscribers got the event.
    pub fn emit(&self, event: CoreEvent) -> Result<usize, SendError<CoreEvent>> {
        self.sender.send(event)
    }

    /// Past events are not replayed.
    pub fn subscribe(&self) -> Receiver<CoreEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_BUFFER_SIZE)
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("subscriber_count", &self.subscriber_count())
            .finish()
    }
}

// ============================================================================
// Event Stream Wrapper
// ============================================================================

type EventFilter = Box<dyn Fn(&CoreEvent) -> bool + Send + Sync>;

/// A wrapper around `broadcast::Receiver` with optional filtering.
///
/// ```rust
/// use core_runtime::events::{CoreEvent, EventBus, EventStream};
///
/// let event_bus = EventBus::new(100);
/// let sync_only = EventStream::new(event_bus.subscribe())
///     .filter(|event| matches!(event, CoreEvent::Sync(_)));
/// ```
pub struct EventStream {
    receiver: Receiver<CoreEvent>,
    filter: Option<EventFilter>,
}

impl EventStream {
    pub fn new(receiver: Receiver<CoreEvent>) -> Self {
        Self {
            receiver,
            filter: None,
        }
    }

    /// Only events matching `predicate` will be returned by `recv()`.
    pub fn filter<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&CoreEvent) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Box::new(predicate));
        self
    }

    fn matches(&self, event: &CoreEvent) -> bool {
        self.filter.as_ref().map_or(true, |filter| filter(event))
    }

    /// Next event that passes the filter. Lag and closure are reported as by
    /// `broadcast::Receiver::recv`.
    pub async fn recv(&mut self) -> Result<CoreEvent, RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.matches(&event) {
                return Ok(event);
            }
        }
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("has_filter", &self.filter.is_some())
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn completed(pass_id: &str) -> CoreEvent {
        CoreEvent::Sync(SyncEvent::Completed {
            pass_id: pass_id.to_string(),
            uploaded: 3,
            downloaded: 2,
            conflicts: 1,
            duration_ms: 40,
        })
    }

    #[tokio::test]
    async fn test_emission_with_no_subscribers_is_an_error() {
        let bus = EventBus::new(10);
        assert!(bus.emit(completed("p1")).is_err());
    }

    #[tokio::test]
    async fn test_multiple_subscribers_receive_same_event() {
        let bus = EventBus::new(10);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();

        assert_eq!(bus.emit(completed("p1")).unwrap(), 2);

        assert_eq!(first.recv().await.unwrap(), completed("p1"));
        assert_eq!(second.recv().await.unwrap(), completed("p1"));
    }

    #[tokio::test]
    async fn test_event_stream_with_filter() {
        let bus = EventBus::new(10);
        let mut stream = EventStream::new(bus.subscribe())
            .filter(|event| matches!(event, CoreEvent::Queue(_)));

        bus.emit(completed("p1")).unwrap();
        bus.emit(CoreEvent::Queue(QueueEvent::DeadLettered {
            item_id: "q-1".to_string(),
            table_name: "pagos".to_string(),
            record_id: "pago-9".to_string(),
            retry_count: 5,
        }))
        .unwrap();

        let event = stream.recv().await.unwrap();
        assert!(matches!(event, CoreEvent::Queue(QueueEvent::DeadLettered { retry_count: 5, .. })));
        assert_eq!(event.severity(), EventSeverity::Error);
    }

    #[tokio::test]
    async fn test_lagged_subscriber() {
        let bus = EventBus::new(2);
        let mut subscriber = bus.subscribe();

        for i in 0..5 {
            bus.emit(completed(&format!("p{}", i))).unwrap();
        }

        assert!(matches!(subscriber.recv().await, Err(RecvError::Lagged(_))));
        assert!(subscriber.recv().await.is_ok());
    }

    #[test]
    fn test_event_severity() {
        assert_eq!(
            CoreEvent::Sync(SyncEvent::Failed {
                pass_id: "p".to_string(),
                message: "boom".to_string(),
                recoverable: true,
            })
            .severity(),
            EventSeverity::Error
        );
        assert_eq!(
            CoreEvent::Sync(SyncEvent::CircuitOpened {
                consecutive_failures: 5,
                cooldown_secs: 300,
            })
            .severity(),
            EventSeverity::Warning
        );
        assert_eq!(completed("p").severity(), EventSeverity::Info);
        assert_eq!(
            CoreEvent::Connectivity(ConnectivityEvent::Online {
                connection_type: None
            })
            .severity(),
            EventSeverity::Debug
        );
    }

    #[test]
    fn test_event_serialization() {
        let json = serde_json::to_value(completed("p7")).unwrap();
        assert_eq!(json["type"], "Sync");
        assert_eq!(json["payload"]["event"], "Completed");
        assert_eq!(json["payload"]["pass_id"], "p7");

        let back: CoreEvent = serde_json::from_value(json).unwrap();
        assert_eq!(back.description(), "Sync completed");
    }
}
