//! Connectivity seam

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Link kind reported by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Cellular,
    WiFi,
    Ethernet,
    /// Unknown or unreported
    Other,
}

/// Estimated link quality, as reported by hosts that expose it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EffectiveType {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
}

impl EffectiveType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EffectiveType::Slow2g => "slow-2g",
            EffectiveType::TwoG => "2g",
            EffectiveType::ThreeG => "3g",
            EffectiveType::FourG => "4g",
        }
    }
}

/// Network connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
    Connected,
    Disconnected,
    /// The host cannot tell; treated as offline
    Indeterminate,
}

/// Snapshot of the current connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub status: NetworkStatus,
    pub network_type: Option<NetworkType>,
    pub effective_type: Option<EffectiveType>,
    /// Whether the connection is metered (has data limits/costs)
    pub is_metered: bool,
}

impl NetworkInfo {
    pub fn online(network_type: NetworkType) -> Self {
        Self {
            status: NetworkStatus::Connected,
            network_type: Some(network_type),
            effective_type: None,
            is_metered: network_type == NetworkType::Cellular,
        }
    }

    pub fn offline() -> Self {
        Self {
            status: NetworkStatus::Disconnected,
            network_type: None,
            effective_type: None,
            is_metered: false,
        }
    }

    pub fn with_effective_type(mut self, effective_type: EffectiveType) -> Self {
        self.effective_type = Some(effective_type);
        self
    }

    pub fn is_online(&self) -> bool {
        self.status == NetworkStatus::Connected
    }
}

/// Host connectivity source.
///
/// The orchestrator refuses to start a pass while this reports offline, and
/// the background trigger starts one when the change stream reports the
/// connection coming back. A failed probe counts as offline.
#[async_trait]
pub trait NetworkMonitor: Send + Sync {
    async fn get_network_info(&self) -> Result<NetworkInfo>;

    async fn is_connected(&self) -> bool {
        self.get_network_info()
            .await
            .map(|info| info.is_online())
            .unwrap_or(false)
    }

    async fn is_metered(&self) -> bool {
        self.get_network_info()
            .await
            .map(|info| info.is_metered)
            .unwrap_or(false)
    }

    /// Emits whenever the connection status changes.
    async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>>;
}

#[async_trait]
pub trait NetworkChangeStream: Send {
    /// `None` once the stream is closed.
    async fn next(&mut self) -> Option<NetworkInfo>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_info_constructors() {
        let wifi = NetworkInfo::online(NetworkType::WiFi).with_effective_type(EffectiveType::FourG);
        assert!(wifi.is_online());
        assert!(!wifi.is_metered);
        assert_eq!(wifi.effective_type.map(|e| e.as_str()), Some("4g"));

        let cellular = NetworkInfo::online(NetworkType::Cellular);
        assert!(cellular.is_metered);

        let offline = NetworkInfo::offline();
        assert!(!offline.is_online());
        assert_eq!(offline.network_type, None);
    }

    struct FixedMonitor(NetworkInfo);

    #[async_trait]
    impl NetworkMonitor for FixedMonitor {
        async fn get_network_info(&self) -> Result<NetworkInfo> {
            Ok(self.0.clone())
        }

        async fn subscribe_changes(&self) -> Result<Box<dyn NetworkChangeStream>> {
            Err(crate::error::BridgeError::NotAvailable(
                "change stream".to_string(),
            ))
        }
    }

    #[tokio::test]
    async fn test_default_methods_follow_network_info() {
        let online = FixedMonitor(NetworkInfo::online(NetworkType::Cellular));
        assert!(online.is_connected().await);
        assert!(online.is_metered().await);

        let offline = FixedMonitor(NetworkInfo::offline());
        assert!(!offline.is_connected().await);
    }
}
