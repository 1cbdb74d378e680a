//! Cancellable periodic timers.
//!
//! The sync engine never calls `tokio::time::interval` directly for its
//! polling fallback. It asks a [`Timer`] for a periodic callback and keeps the
//! returned [`TimerHandle`] to stop it later. Production code uses
//! [`TokioTimer`]; tests use [`ManualTimer`] and fire ticks by hand.
//!
//! ```rust
//! use core_async::timer::{ManualTimer, Timer};
//! use core_async::time::Duration;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//! use std::sync::Arc;
//!
//! let timer = ManualTimer::new();
//! let ticks = Arc::new(AtomicUsize::new(0));
//! let counter = ticks.clone();
//! let handle = timer.every(Duration::from_secs(300), Arc::new(move || {
//!     counter.fetch_add(1, Ordering::SeqCst);
//! }));
//!
//! timer.fire();
//! handle.cancel();
//! timer.fire();
//! assert_eq!(ticks.load(Ordering::SeqCst), 1);
//! ```

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::sync::CancellationToken;
use crate::time::{interval_at, Duration, MissedTickBehavior};

/// Callback invoked on every timer tick.
pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle to a running periodic timer.
///
/// Cancelling is idempotent. Dropping the handle does not stop the timer.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    token: CancellationToken,
}

impl TimerHandle {
    fn new(token: CancellationToken) -> Self {
        Self { token }
    }

    /// Stop the timer. Safe to call more than once.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Source of periodic callbacks.
pub trait Timer: Send + Sync {
    /// Invoke `callback` every `period`, first after one full period has
    /// elapsed, until the returned handle is cancelled.
    fn every(&self, period: Duration, callback: TimerCallback) -> TimerHandle;
}

/// Timer backed by the Tokio timer wheel.
///
/// `every` spawns a task and therefore must be called from within a Tokio
/// runtime.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioTimer;

impl TokioTimer {
    pub fn new() -> Self {
        Self
    }
}

impl Timer for TokioTimer {
    fn every(&self, period: Duration, callback: TimerCallback) -> TimerHandle {
        let period = period.max(Duration::from_millis(1));
        let token = CancellationToken::new();
        let stop = token.clone();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut ticker = interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = ticker.tick() => callback(),
                }
            }

            debug!(period_ms = period.as_millis() as u64, "Periodic timer stopped");
        });

        TimerHandle::new(token)
    }
}

struct ManualEntry {
    period: Duration,
    callback: TimerCallback,
    token: CancellationToken,
}

/// Timer driven explicitly through [`ManualTimer::fire`].
///
/// Clones share the same set of registered timers.
#[derive(Clone, Default)]
pub struct ManualTimer {
    entries: Arc<Mutex<Vec<ManualEntry>>>,
}

impl ManualTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Invoke every active callback once. Returns how many callbacks ran.
    pub fn fire(&self) -> usize {
        let callbacks: Vec<TimerCallback> = {
            let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
            entries.retain(|entry| !entry.token.is_cancelled());
            entries.iter().map(|entry| entry.callback.clone()).collect()
        };

        for callback in &callbacks {
            callback();
        }
        callbacks.len()
    }

    /// Number of registered timers that have not been cancelled.
    pub fn active_count(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|entry| !entry.token.is_cancelled())
            .count()
    }

    /// Periods of the active timers, in registration order.
    pub fn active_periods(&self) -> Vec<Duration> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries
            .iter()
            .filter(|entry| !entry.token.is_cancelled())
            .map(|entry| entry.period)
            .collect()
    }
}

impl Timer for ManualTimer {
    fn every(&self, period: Duration, callback: TimerCallback) -> TimerHandle {
        let token = CancellationToken::new();
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(ManualEntry {
            period,
            callback,
            token: token.clone(),
        });
        TimerHandle::new(token)
    }
}

impl fmt::Debug for ManualTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualTimer")
            .field("active", &self.active_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_callback() -> (Arc<AtomicUsize>, TimerCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let inner = count.clone();
        (
            count,
            Arc::new(move || {
                inner.fetch_add(1, Ordering::SeqCst);
            }),
        )
    }

    #[test]
    fn test_manual_timer_fires_active_callbacks() {
        let timer = ManualTimer::new();
        let (first, first_cb) = counting_callback();
        let (second, second_cb) = counting_callback();

        let first_handle = timer.every(Duration::from_secs(60), first_cb);
        timer.every(Duration::from_secs(300), second_cb);

        assert_eq!(timer.fire(), 2);
        first_handle.cancel();
        assert_eq!(timer.fire(), 1);

        assert_eq!(first.load(Ordering::SeqCst), 1);
        assert_eq!(second.load(Ordering::SeqCst), 2);
        assert_eq!(timer.active_periods(), vec![Duration::from_secs(300)]);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let timer = ManualTimer::new();
        let (_, cb) = counting_callback();
        let handle = timer.every(Duration::from_secs(1), cb);

        handle.cancel();
        handle.cancel();

        assert!(handle.is_cancelled());
        assert_eq!(timer.active_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_timer_ticks_until_cancelled() {
        let (count, cb) = counting_callback();
        let handle = TokioTimer::new().every(Duration::from_secs(10), cb);

        tokio::time::sleep(Duration::from_secs(35)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);

        handle.cancel();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }
}
