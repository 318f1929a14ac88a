//! ESP32 WiFi network layer.
//!
//! Drives the ESP-IDF `EspWifi` driver without blocking: `begin_connect`
//! issues the association and returns, `link_state` is polled by the
//! orchestrator. While the access point is raised the driver runs in mixed
//! AP+STA mode so a reconnect can proceed alongside the portal.

use super::{LinkSnapshot, LinkState, NetworkError, NetworkLayer};
use crate::config::Credentials;
use esp_idf_hal::modem::Modem;
use esp_idf_svc::eventloop::EspSystemEventLoop;
use esp_idf_svc::wifi::{
    AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration, EspWifi,
    WifiDeviceId,
};
use log::{info, warn};
use std::cell::Cell;
use std::net::IpAddr;

/// Channel used by the soft AP when the station has no pinned channel.
const AP_CHANNEL: u8 = 1;

/// Concurrent stations accepted by the soft AP.
const AP_MAX_CONNECTIONS: u16 = 4;

/// WiFi-based network layer for ESP32.
pub struct EspWifiNetwork<'a> {
    wifi: EspWifi<'a>,
    client: Option<ClientConfiguration>,
    ssid: Option<String>,
    access_point: Option<AccessPointConfiguration>,
    connect_issued: bool,
    was_connected: Cell<bool>,
    mac: [u8; 6],
}

impl<'a> EspWifiNetwork<'a> {
    /// Create a new WiFi network layer.
    ///
    /// # Arguments
    ///
    /// * `modem` - The WiFi/BT modem peripheral
    /// * `sysloop` - The ESP-IDF system event loop
    pub fn new(modem: Modem, sysloop: EspSystemEventLoop) -> Result<Self, NetworkError> {
        let nvs = crate::nvs_default_partition()?;
        let wifi = EspWifi::new(modem, sysloop, Some(nvs))?;
        let mac = wifi.driver().get_mac(WifiDeviceId::Sta)?;

        Ok(Self {
            wifi,
            client: None,
            ssid: None,
            access_point: None,
            connect_issued: false,
            was_connected: Cell::new(false),
            mac,
        })
    }

    fn client_config(credentials: &Credentials) -> Result<ClientConfiguration, NetworkError> {
        let auth_method = if credentials.is_open() {
            AuthMethod::None
        } else {
            AuthMethod::WPA2Personal
        };

        Ok(ClientConfiguration {
            ssid: credentials
                .ssid()
                .try_into()
                .map_err(|_| NetworkError::InvalidCredentials("SSID".into()))?,
            password: credentials
                .password()
                .try_into()
                .map_err(|_| NetworkError::InvalidCredentials("password".into()))?,
            auth_method,
            channel: match credentials.channel() {
                0 => None,
                ch => Some(ch),
            },
            ..Default::default()
        })
    }

    /// Push the current client/AP combination to the driver and start it.
    fn apply(&mut self) -> Result<(), NetworkError> {
        let config = match (&self.client, &self.access_point) {
            (Some(client), Some(ap)) => Configuration::Mixed(client.clone(), ap.clone()),
            (None, Some(ap)) => Configuration::AccessPoint(ap.clone()),
            (Some(client), None) => Configuration::Client(client.clone()),
            (None, None) => Configuration::Client(ClientConfiguration::default()),
        };
        self.wifi.set_configuration(&config)?;
        if !self.wifi.is_started()? {
            self.wifi.start()?;
        }
        Ok(())
    }

    fn connect_station(&mut self) -> Result<(), NetworkError> {
        // A stale association attempt would make connect() fail
        let _ = self.wifi.disconnect();
        self.wifi.connect()?;
        self.connect_issued = true;
        Ok(())
    }

    fn ap_info() -> Option<(i8, u8)> {
        let mut record = esp_idf_sys::wifi_ap_record_t::default();
        // SAFETY: record is a valid out-pointer for the duration of the call
        let err = unsafe { esp_idf_sys::esp_wifi_sta_get_ap_info(&mut record) };
        (err == esp_idf_sys::ESP_OK).then_some((record.rssi, record.primary))
    }
}

impl<'a> NetworkLayer for EspWifiNetwork<'a> {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
        info!("Connecting to WiFi: {}", credentials.ssid());
        self.client = Some(Self::client_config(credentials)?);
        self.ssid = Some(credentials.ssid().to_string());
        self.was_connected.set(false);
        self.apply()?;
        self.connect_station()
    }

    fn link_state(&self) -> LinkState {
        if self.wifi.is_up().unwrap_or(false) {
            self.was_connected.set(true);
            LinkState::Connected
        } else if self.was_connected.get() {
            LinkState::ConnectionLost
        } else if self.connect_issued {
            LinkState::Idle
        } else {
            LinkState::Disconnected
        }
    }

    fn snapshot(&self) -> LinkSnapshot {
        let state = self.link_state();
        let connected = state == LinkState::Connected;
        let ip = if connected {
            self.wifi
                .sta_netif()
                .get_ip_info()
                .ok()
                .map(|info| IpAddr::V4(info.ip))
        } else {
            None
        };
        let ap_info = if connected { Self::ap_info() } else { None };
        let ap_ip = self.access_point.as_ref().and_then(|_| {
            self.wifi
                .ap_netif()
                .get_ip_info()
                .ok()
                .map(|info| IpAddr::V4(info.ip))
        });

        LinkSnapshot {
            state,
            ssid: self.ssid.clone(),
            ip,
            rssi: ap_info.map(|(rssi, _)| rssi),
            channel: ap_info.map(|(_, channel)| channel),
            ap_ip,
        }
    }

    fn start_access_point(&mut self, name: &str) -> Result<IpAddr, NetworkError> {
        let channel = self
            .client
            .as_ref()
            .and_then(|client| client.channel)
            .unwrap_or(AP_CHANNEL);

        self.access_point = Some(AccessPointConfiguration {
            ssid: name
                .try_into()
                .map_err(|_| NetworkError::AccessPoint(format!("name too long: {}", name)))?,
            auth_method: AuthMethod::None,
            channel,
            max_connections: AP_MAX_CONNECTIONS,
            ..Default::default()
        });

        if let Err(e) = self.apply() {
            self.access_point = None;
            return Err(e);
        }
        if self.client.is_some() {
            // Keep trying the stored network while the portal is up
            if let Err(e) = self.connect_station() {
                warn!("Station reconnect alongside AP failed: {}", e);
            }
        }

        let ip = self.wifi.ap_netif().get_ip_info()?.ip;
        info!("Access point '{}' up at {}", name, ip);
        Ok(IpAddr::V4(ip))
    }

    fn stop_access_point(&mut self) -> Result<(), NetworkError> {
        if self.access_point.take().is_none() {
            return Ok(());
        }
        self.apply()?;
        if self.client.is_some() && !self.wifi.is_connected().unwrap_or(false) {
            self.connect_station()?;
        }
        info!("Access point lowered");
        Ok(())
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }
}
