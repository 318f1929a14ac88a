//! Network abstraction layer.
//!
//! This module provides a platform-independent radio interface that works on:
//! - **ESP32** (`esp32` feature): ESP-IDF WiFi station + soft AP
//! - **Host**: native OS networking, always connected
//!
//! Only the orchestrator holds the [`NetworkLayer`]; subsystems see a
//! read-only [`LinkSnapshot`] taken once per tick.
//!
//! # Example
//!
//! ```ignore
//! use hydro_esp32::network::NetworkLayer;
//!
//! #[cfg(feature = "esp32")]
//! let mut network = network::EspWifiNetwork::new(modem, sysloop)?;
//!
//! #[cfg(not(feature = "esp32"))]
//! let mut network = network::HostNetwork::new();
//!
//! // Same code for both platforms
//! network.begin_connect(&credentials)?;
//! println!("Link: {}", network.link_state());
//! ```

use crate::config::Credentials;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;

#[cfg(not(feature = "esp32"))]
mod host;
#[cfg(feature = "esp32")]
mod wifi;

#[cfg(not(feature = "esp32"))]
pub use host::HostNetwork;
#[cfg(feature = "esp32")]
pub use wifi::EspWifiNetwork;

/// Station link state, named after the status codes the firmware has always
/// printed on the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkState {
    /// Radio idle or a connect is in progress.
    Idle,
    /// Configured SSID not found.
    NoSsid,
    /// Scan finished without joining.
    ScanCompleted,
    /// Joined and holding an address.
    Connected,
    /// Join attempt rejected (e.g. wrong password).
    ConnectFailed,
    /// Link was up and dropped.
    ConnectionLost,
    /// Deliberately disconnected or never configured.
    Disconnected,
}

impl LinkState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::NoSsid => "NO_SSID",
            Self::ScanCompleted => "SCAN_DONE",
            Self::Connected => "CONNECTED",
            Self::ConnectFailed => "FAILED",
            Self::ConnectionLost => "LOST",
            Self::Disconnected => "DISCONNECTED",
        }
    }
}

impl fmt::Display for LinkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Read-only view of the radio handed to subsystems.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkSnapshot {
    pub state: LinkState,
    pub ssid: Option<String>,
    pub ip: Option<IpAddr>,
    pub rssi: Option<i8>,
    pub channel: Option<u8>,
    /// Soft AP address while the access point is raised.
    pub ap_ip: Option<IpAddr>,
}

impl LinkSnapshot {
    /// Snapshot of a radio that is not associated with anything.
    pub fn disconnected() -> Self {
        Self {
            state: LinkState::Disconnected,
            ssid: None,
            ip: None,
            rssi: None,
            channel: None,
            ap_ip: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == LinkState::Connected
    }

    /// Multi-line summary for console status commands.
    pub fn describe(&self) -> String {
        let mut out = format!("WiFi status: {}", self.state);
        if let Some(ssid) = &self.ssid {
            out.push_str(&format!("\n  SSID: {}", ssid));
        }
        if let Some(ip) = self.ip {
            out.push_str(&format!("\n  IP: {}", ip));
        }
        if let Some(rssi) = self.rssi {
            out.push_str(&format!("\n  RSSI: {} dBm", rssi));
        }
        if let Some(channel) = self.channel {
            out.push_str(&format!("\n  Channel: {}", channel));
        }
        if let Some(ap_ip) = self.ap_ip {
            out.push_str(&format!("\n  AP IP: {}", ap_ip));
        }
        out
    }
}

/// Radio abstraction commanded exclusively by the orchestrator.
///
/// All calls are non-blocking; `begin_connect` only starts an association
/// and later `link_state()` calls report the outcome.
pub trait NetworkLayer {
    /// Start joining the network described by `credentials`.
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError>;

    fn link_state(&self) -> LinkState;

    fn is_connected(&self) -> bool {
        self.link_state() == LinkState::Connected
    }

    fn snapshot(&self) -> LinkSnapshot;

    /// Raise an open access point named `name`. Returns its address.
    fn start_access_point(&mut self, name: &str) -> Result<IpAddr, NetworkError>;

    /// Lower the access point. No-op if it is not raised.
    fn stop_access_point(&mut self) -> Result<(), NetworkError>;

    /// Station MAC address, used for the device identity.
    fn mac_address(&self) -> [u8; 6];
}

/// Network errors.
#[derive(Debug)]
pub enum NetworkError {
    /// Credentials rejected by the driver (e.g. SSID not representable).
    InvalidCredentials(String),
    /// Access point could not be raised.
    AccessPoint(String),
    /// Generic I/O error.
    Io(std::io::Error),
    /// ESP-IDF driver error.
    #[cfg(feature = "esp32")]
    Esp(esp_idf_sys::EspError),
}

impl fmt::Display for NetworkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidCredentials(msg) => write!(f, "invalid credentials: {}", msg),
            Self::AccessPoint(msg) => write!(f, "access point error: {}", msg),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            #[cfg(feature = "esp32")]
            Self::Esp(e) => write!(f, "ESP error: {:?}", e),
        }
    }
}

impl std::error::Error for NetworkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for NetworkError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for NetworkError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Esp(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_state_names() {
        assert_eq!(LinkState::Idle.as_str(), "IDLE");
        assert_eq!(LinkState::NoSsid.as_str(), "NO_SSID");
        assert_eq!(LinkState::ScanCompleted.as_str(), "SCAN_DONE");
        assert_eq!(LinkState::Connected.to_string(), "CONNECTED");
        assert_eq!(LinkState::ConnectFailed.as_str(), "FAILED");
        assert_eq!(LinkState::ConnectionLost.as_str(), "LOST");
        assert_eq!(LinkState::Disconnected.as_str(), "DISCONNECTED");
    }

    #[test]
    fn test_snapshot_describe() {
        let snapshot = LinkSnapshot {
            state: LinkState::Connected,
            ssid: Some("HomeNet".into()),
            ip: Some("192.168.1.40".parse().unwrap()),
            rssi: Some(-61),
            channel: Some(6),
            ap_ip: None,
        };
        assert!(snapshot.is_connected());
        let text = snapshot.describe();
        assert!(text.starts_with("WiFi status: CONNECTED"));
        assert!(text.contains("SSID: HomeNet"));
        assert!(text.contains("RSSI: -61 dBm"));
        assert!(!text.contains("AP IP"));
    }

    #[test]
    fn test_disconnected_snapshot() {
        let snapshot = LinkSnapshot::disconnected();
        assert!(!snapshot.is_connected());
        assert_eq!(snapshot.describe(), "WiFi status: DISCONNECTED");
    }
}
