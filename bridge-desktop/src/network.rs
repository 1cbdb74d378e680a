//! TCP-probe connectivity monitor

use async_trait::async_trait;
use bridge_traits::{
    error::Result,
    network::{NetworkChangeStream, NetworkInfo, NetworkMonitor, NetworkStatus, NetworkType},
};
use core_async::sync::Mutex;
use core_async::time::{sleep, timeout, Duration, Instant};
use std::sync::Arc;
use tracing::debug;

const DEFAULT_PROBE_ADDR: &str = "8.8.8.8:53";

/// Connectivity from a TCP connect to a known address.
///
/// A probe result is reused for `cache_ttl`. The link kind is always
/// [`NetworkType::Other`].
#[derive(Clone)]
pub struct DesktopNetworkMonitor {
    probe_addr: String,
    probe_timeout: Duration,
    cache_ttl: Duration,
    poll_interval: Duration,
    cached_info: Arc<Mutex<Option<(Instant, NetworkInfo)>>>,
}

impl DesktopNetworkMonitor {
    pub fn new() -> Self {
        Self::with_probe_addr(DEFAULT_PROBE_ADDR)
    }

    /// Probe `host:port` instead of public DNS
    pub fn with_probe_addr(addr: impl Into<String>) -> Self {
        Self {
            probe_addr: addr.into(),
            probe_timeout: Duration::from_secs(5),
            cache_ttl: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
            cached_info: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_probe_timeout(mut self, probe_timeout: Duration) -> Self {
        self.probe_timeout = probe_timeout;
        self
    }

    pub fn with_cache_ttl(mut self, cache_ttl: Duration) -> Self {
        self.cache_ttl = cache_ttl;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn probe(&self) -> NetworkInfo {
        let connect = tokio::net::TcpStream::connect(self.probe_addr.as_str());
        match timeout(self.probe_timeout, connect).await {
            Ok(Ok(_)) => NetworkInfo::online(NetworkType::Other),
            _ => NetworkInfo::offline(),
        }
    }
}

impl Default for DesktopNetworkMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NetworkMonitor for DesktopNetworkMonitor {
    async fn get_network_info(&self) -> Result<NetworkInfo> {
        let mut cached = self.cached_info.lock().await;

        if let Some((probed_at, info)) = cached.as_ref() {
            if probed_at.elapsed() < self.cache_ttl {
                return Ok(info.clone());
            }
        }

        let info = self.probe().await;
        *cached = Some((Instant::now(), info.clone()));
        debug!(status = ?info.status, probe = %self.probe_addr, "Network info updated");

        Ok(info)
    }

    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
        Ok(Box::new(DesktopNetworkChangeStream {
            monitor: self.clone().with_cache_ttl(Duration::ZERO),
            last_status: None,
        }))
    }
}

/// Network change stream that polls for changes
struct DesktopNetworkChangeStream {
    monitor: DesktopNetworkMonitor,
    last_status: Option<NetworkStatus>,
}

#[async_trait]
impl NetworkChangeStream for DesktopNetworkChangeStream {
    async fn next(&mut self) -> Option<NetworkInfo> {
        loop {
            if self.last_status.is_some() {
                sleep(self.monitor.poll_interval).await;
            }

            let info = self.monitor.probe().await;
            if self.last_status != Some(info.status) {
                self.last_status = Some(info.status);
                return Some(info);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_reachable_probe_reports_connected() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let monitor = DesktopNetworkMonitor::with_probe_addr(addr.to_string());
        let info = monitor.get_network_info().await.unwrap();

        assert_eq!(info.status, NetworkStatus::Connected);
        assert_eq!(info.network_type, Some(NetworkType::Other));
        assert!(monitor.is_connected().await);
    }

    #[tokio::test]
    async fn test_refused_probe_reports_disconnected() {
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };

        let monitor = DesktopNetworkMonitor::with_probe_addr(addr.to_string())
            .with_probe_timeout(Duration::from_millis(500));
        let info = monitor.get_network_info().await.unwrap();

        assert_eq!(info.status, NetworkStatus::Disconnected);
        assert!(!monitor.is_metered().await);
    }

    #[tokio::test]
    async fn test_cached_result_survives_listener_shutdown() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let monitor = DesktopNetworkMonitor::with_probe_addr(addr.to_string())
            .with_cache_ttl(Duration::from_secs(60));
        assert!(monitor.is_connected().await);

        drop(listener);
        assert!(monitor.is_connected().await);
    }

    #[tokio::test]
    async fn test_change_stream_emits_initial_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let monitor = DesktopNetworkMonitor::with_probe_addr(addr.to_string());
        let mut stream = monitor.subscribe_changes().await.unwrap();

        let first = stream.next().await.unwrap();
        assert!(first.is_online());
    }
}
