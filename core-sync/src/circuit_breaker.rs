//! Circuit breaker for sync passes
//!
//! ```text
//!            threshold failures            cooldown elapsed
//!   Closed ─────────────────────▶ Open ─────────────────────▶ HalfOpen
//!     ▲                            ▲                             │
//!     │          trial success     │        trial failure        │
//!     └────────────────────────────┼─────────────────────────────┤
//!                                  └─────────────────────────────┘
//! ```
//!
//! The cooldown is measured on an injected [`MonotonicClock`], so wall-clock
//! jumps never reopen or close the breaker.

use bridge_traits::time::MonotonicClock;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// State change caused by recording an outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened { consecutive_failures: u32 },
    Closed,
}

struct Inner {
    consecutive_failures: u32,
    opened_at: Option<Duration>,
    trial_in_flight: bool,
}

pub struct CircuitBreaker {
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn MonotonicClock>,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            threshold: threshold.max(1),
            cooldown,
            clock,
            inner: Mutex::new(Inner {
                consecutive_failures: 0,
                opened_at: None,
                trial_in_flight: false,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state_of(&self, inner: &Inner) -> CircuitState {
        match inner.opened_at {
            None => CircuitState::Closed,
            Some(opened_at) if self.clock.elapsed().saturating_sub(opened_at) >= self.cooldown => {
                CircuitState::HalfOpen
            }
            Some(_) => CircuitState::Open,
        }
    }

    pub fn state(&self) -> CircuitState {
        let inner = self.lock();
        self.state_of(&inner)
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Whether a pass may start. `bypass` always passes; a half-open breaker
    /// admits a single trial until its outcome is recorded or released.
    pub fn try_acquire(&self, bypass: bool) -> bool {
        let mut inner = self.lock();
        match self.state_of(&inner) {
            CircuitState::Closed => true,
            _ if bypass => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    /// Give back a half-open trial that ended without an outcome, such as a
    /// cancelled pass, so the next pass can try again.
    pub fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    pub fn record_success(&self) -> Option<CircuitTransition> {
        let mut inner = self.lock();
        let was_open = inner.opened_at.is_some();

        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.trial_in_flight = false;

        if was_open {
            info!("Circuit breaker closed");
            Some(CircuitTransition::Closed)
        } else {
            None
        }
    }

    pub fn record_failure(&self) -> Option<CircuitTransition> {
        let mut inner = self.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        let state = self.state_of(&inner);
        let should_open = match state {
            CircuitState::Closed => inner.consecutive_failures >= self.threshold,
            // A failed trial (or forced pass) after the cooldown restarts it
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };
        inner.trial_in_flight = false;

        if should_open {
            inner.opened_at = Some(self.clock.elapsed());
            warn!(
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker opened"
            );
            Some(CircuitTransition::Opened {
                consecutive_failures: inner.consecutive_failures,
            })
        } else {
            None
        }
    }
}
