//! Window lifecycle observer

use async_trait::async_trait;
use bridge_traits::{
    background::{LifecycleChangeStream, LifecycleObserver, LifecycleState},
    error::Result,
};
use core_async::sync::watch;
use tracing::debug;

/// Lifecycle observer driven by the host window layer.
///
/// The desktop shell calls [`DesktopLifecycleObserver::set_state`] from its
/// focus/minimize handlers; subscribers see every change exactly once. A new
/// window starts out focused.
#[derive(Clone)]
pub struct DesktopLifecycleObserver {
    sender: watch::Sender<LifecycleState>,
}

impl DesktopLifecycleObserver {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(LifecycleState::Focused);
        Self { sender }
    }

    /// Report a window state change. Repeating the current state is a no-op.
    pub fn set_state(&self, state: LifecycleState) {
        let changed = self.sender.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });

        if changed {
            debug!(state = ?state, "Window lifecycle changed");
        }
    }
}

impl Default for DesktopLifecycleObserver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LifecycleObserver for DesktopLifecycleObserver {
    async fn get_state(&self) -> Result<LifecycleState> {
        Ok(*self.sender.borrow())
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn LifecycleChangeStream>> {
        Ok(Box::new(DesktopLifecycleChangeStream {
            receiver: self.sender.subscribe(),
        }))
    }
}

struct DesktopLifecycleChangeStream {
    receiver: watch::Receiver<LifecycleState>,
}

#[async_trait]
impl LifecycleChangeStream for DesktopLifecycleChangeStream {
    async fn next(&mut self) -> Option<LifecycleState> {
        self.receiver.changed().await.ok()?;
        let state = *self.receiver.borrow_and_update();
        Some(state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_initial_state_is_focused() {
        let observer = DesktopLifecycleObserver::new();
        assert_eq!(observer.get_state().await.unwrap(), LifecycleState::Focused);
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let observer = DesktopLifecycleObserver::new();
        let mut stream = observer.subscribe_changes().await.unwrap();

        observer.set_state(LifecycleState::Hidden);
        assert_eq!(stream.next().await, Some(LifecycleState::Hidden));

        observer.set_state(LifecycleState::Hidden);
        observer.set_state(LifecycleState::Visible);
        assert_eq!(stream.next().await, Some(LifecycleState::Visible));
    }

    #[tokio::test]
    async fn test_stream_ends_when_observer_dropped() {
        let observer = DesktopLifecycleObserver::new();
        let mut stream = observer.subscribe_changes().await.unwrap();

        drop(observer);
        assert_eq!(stream.next().await, None);
    }
}
