//! Async facade for the sync engine crates.
//!
//! All `core-*` and `bridge-*` crates depend on this crate instead of reaching
//! for tokio directly, so the executor choice lives in one place.
//!
//! # Modules
//!
//! - `task`: Task spawning
//! - `time`: Sleep, timeouts, instants and wall-clock helpers
//! - `sync`: Synchronization primitives, channels and cancellation tokens
//! - `timer`: Cancellable periodic timers with a manual implementation for tests
//! - `runtime`: Blocking entry point for hosts without a runtime
//!
//! # Examples
//!
//! ```rust
//! use core_async::task;
//! use core_async::time::{sleep, Duration};
//!
//! async fn example() {
//!     let handle = task::spawn(async {
//!         sleep(Duration::from_millis(10)).await;
//!         42
//!     });
//!     assert_eq!(handle.await.unwrap(), 42);
//! }
//! ```

pub mod runtime;
pub mod sync;
pub mod task;
pub mod time;
pub mod timer;

pub use task::spawn;
pub use tokio::select;
pub use time::{sleep, Duration, Instant};
pub use timer::{ManualTimer, Timer, TimerHandle, TokioTimer};
