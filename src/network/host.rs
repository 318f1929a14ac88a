//! Host network layer.
//!
//! On host systems, the OS handles networking. This layer is a thin wrapper
//! that reports the system's network status and simulates the access point.

use super::{LinkSnapshot, LinkState, NetworkError, NetworkLayer};
use crate::config::Credentials;
use log::info;
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr};

/// Host network layer.
///
/// Networking is always available via the OS. The station MAC is derived
/// from the hostname so the device id is stable across runs.
pub struct HostNetwork {
    ip_addr: Option<IpAddr>,
    ssid: Option<String>,
    ap_name: Option<String>,
    mac: [u8; 6],
}

impl HostNetwork {
    /// Create a new host network layer.
    pub fn new() -> Self {
        let ip_addr = Self::detect_local_ip();
        match ip_addr {
            Some(ip) => info!("Host network ready, local IP: {}", ip),
            None => info!("Host network ready, binding to 0.0.0.0"),
        }
        Self {
            ip_addr,
            ssid: None,
            ap_name: None,
            mac: Self::derive_mac(&hostname()),
        }
    }

    /// Get the primary local IP address.
    ///
    /// This uses a trick: create a UDP socket and "connect" to a public IP
    /// (doesn't actually send anything), then check which local address was chosen.
    fn detect_local_ip() -> Option<IpAddr> {
        use std::net::UdpSocket;

        let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
        socket.connect("8.8.8.8:80").ok()?;
        let local_addr = socket.local_addr().ok()?;
        Some(local_addr.ip())
    }

    /// Locally administered unicast MAC from a SHA-256 of `seed`.
    fn derive_mac(seed: &str) -> [u8; 6] {
        let digest = Sha256::digest(seed.as_bytes());
        let mut mac = [0u8; 6];
        mac.copy_from_slice(&digest[..6]);
        mac[0] = (mac[0] | 0x02) & !0x01;
        mac
    }
}

impl Default for HostNetwork {
    fn default() -> Self {
        Self::new()
    }
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .ok()
        .filter(|h| !h.is_empty())
        .or_else(|| {
            std::fs::read_to_string("/etc/hostname")
                .ok()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty())
        })
        .unwrap_or_else(|| "localhost".to_string())
}

impl NetworkLayer for HostNetwork {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
        // The OS owns the real link; remember the SSID for status output
        info!(
            "Host network: using OS link (configured SSID '{}')",
            credentials.ssid()
        );
        self.ssid = Some(credentials.ssid().to_string());
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        LinkState::Connected
    }

    fn snapshot(&self) -> LinkSnapshot {
        LinkSnapshot {
            state: self.link_state(),
            ssid: self.ssid.clone(),
            ip: self.ip_addr,
            rssi: None,
            channel: None,
            ap_ip: self
                .ap_name
                .as_ref()
                .map(|_| IpAddr::V4(Ipv4Addr::LOCALHOST)),
        }
    }

    fn start_access_point(&mut self, name: &str) -> Result<IpAddr, NetworkError> {
        info!("Host network: simulating access point '{}'", name);
        self.ap_name = Some(name.to_string());
        Ok(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }

    fn stop_access_point(&mut self) -> Result<(), NetworkError> {
        if let Some(name) = self.ap_name.take() {
            info!("Host network: access point '{}' lowered", name);
        }
        Ok(())
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }
}
