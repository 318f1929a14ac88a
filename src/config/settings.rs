//! Orchestrator timing, port and endpoint settings.
//!
//! Compiled-in defaults can be overridden per device through the
//! ConfigStore (see [`crate::store::keys`]). Overrides are read once at
//! boot, after schema migration.

use crate::store::{keys, ConfigStore};
use log::{info, warn};
use std::time::Duration;

/// Provisioning portal lifetime before re-evaluating credentials.
pub const PROVISIONING_TIMEOUT: Duration = Duration::from_secs(600);

/// Admin session length before auto-reverting to Active.
pub const ADMIN_SESSION: Duration = Duration::from_secs(300);

/// Upper bound on the blocking connect at boot.
pub const BOOT_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Poll interval during the boot connect.
pub const BOOT_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Report link status every N polls during the boot connect.
pub const BOOT_REPORT_EVERY: u32 = 5;

/// Minimum spacing between reconnect requests in Active mode.
pub const RECONNECT_INTERVAL: Duration = Duration::from_secs(15);

/// Reconnect requests before falling back to Provisioning.
pub const RECONNECT_MAX_ATTEMPTS: u32 = 8;

/// Transition records kept for the `state` command.
pub const HISTORY_CAPACITY: usize = 16;

/// Distinct portal clients allowed at once.
pub const PORTAL_MAX_CLIENTS: usize = 3;

/// Distinct admin clients allowed at once.
pub const ADMIN_MAX_CLIENTS: usize = 2;

// Privileged ports are unavailable to unprivileged host processes
#[cfg(feature = "esp32")]
pub const DEFAULT_PORTAL_PORT: u16 = 80;
#[cfg(not(feature = "esp32"))]
pub const DEFAULT_PORTAL_PORT: u16 = 8080;

#[cfg(feature = "esp32")]
pub const DEFAULT_STATS_PORT: u16 = 80;
#[cfg(not(feature = "esp32"))]
pub const DEFAULT_STATS_PORT: u16 = 8080;

#[cfg(feature = "esp32")]
pub const DEFAULT_ADMIN_PORT: u16 = 81;
#[cfg(not(feature = "esp32"))]
pub const DEFAULT_ADMIN_PORT: u16 = 8081;

/// Device registration backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationEndpoint {
    /// Base URL, e.g. `https://project.example.co`.
    pub base_url: String,
    /// Anonymous API key sent as `apikey` and bearer token.
    pub api_key: String,
}

/// Runtime settings for the orchestrator and the reference subsystems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorSettings {
    pub provisioning_timeout: Duration,
    pub admin_session: Duration,
    pub boot_connect_timeout: Duration,
    pub boot_poll_interval: Duration,
    pub boot_report_every: u32,
    pub reconnect_interval: Duration,
    pub reconnect_max_attempts: u32,
    pub history_capacity: usize,
    pub portal_port: u16,
    pub stats_port: u16,
    pub admin_port: u16,
    pub portal_max_clients: usize,
    pub admin_max_clients: usize,
    pub registration: Option<RegistrationEndpoint>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            provisioning_timeout: PROVISIONING_TIMEOUT,
            admin_session: ADMIN_SESSION,
            boot_connect_timeout: BOOT_CONNECT_TIMEOUT,
            boot_poll_interval: BOOT_POLL_INTERVAL,
            boot_report_every: BOOT_REPORT_EVERY,
            reconnect_interval: RECONNECT_INTERVAL,
            reconnect_max_attempts: RECONNECT_MAX_ATTEMPTS,
            history_capacity: HISTORY_CAPACITY,
            portal_port: DEFAULT_PORTAL_PORT,
            stats_port: DEFAULT_STATS_PORT,
            admin_port: DEFAULT_ADMIN_PORT,
            portal_max_clients: PORTAL_MAX_CLIENTS,
            admin_max_clients: ADMIN_MAX_CLIENTS,
            registration: None,
        }
    }
}

impl OrchestratorSettings {
    /// Apply per-device overrides from the store on top of `self`.
    ///
    /// Unreadable or non-positive values are logged and ignored.
    pub fn with_overrides(mut self, store: &dyn ConfigStore) -> Self {
        if let Some(secs) = positive(store, keys::PROVISIONING_TIMEOUT_S) {
            self.provisioning_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = positive(store, keys::ADMIN_TIMEOUT_S) {
            self.admin_session = Duration::from_secs(secs);
        }
        if let Some(ms) = positive(store, keys::BOOT_WAIT_MS) {
            self.boot_connect_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = positive(store, keys::RECONNECT_S) {
            self.reconnect_interval = Duration::from_secs(secs);
        }
        if let Some(max) = positive(store, keys::RECONNECT_MAX) {
            self.reconnect_max_attempts = max as u32;
        }
        if let Some(port) = port(store, keys::PORTAL_PORT) {
            self.portal_port = port;
        }
        if let Some(port) = port(store, keys::STATS_PORT) {
            self.stats_port = port;
        }
        if let Some(port) = port(store, keys::ADMIN_PORT) {
            self.admin_port = port;
        }

        let url = store.get_str(keys::REGISTRATION_URL).ok().flatten();
        let key = store.get_str(keys::REGISTRATION_KEY).ok().flatten();
        if let (Some(base_url), Some(api_key)) = (url, key) {
            if !base_url.is_empty() && !api_key.is_empty() {
                info!("Registration endpoint: {}", base_url);
                self.registration = Some(RegistrationEndpoint {
                    base_url: base_url.trim_end_matches('/').to_string(),
                    api_key,
                });
            }
        }

        self
    }
}

fn positive(store: &dyn ConfigStore, key: &str) -> Option<u64> {
    match store.get_i32(key) {
        Ok(Some(value)) if value > 0 => {
            info!("Override {} = {}", key, value);
            Some(value as u64)
        }
        Ok(Some(value)) => {
            warn!("Ignoring non-positive override {} = {}", key, value);
            None
        }
        Ok(None) => None,
        Err(e) => {
            warn!("Ignoring unreadable override {}: {}", key, e);
            None
        }
    }
}

fn port(store: &dyn ConfigStore, key: &str) -> Option<u16> {
    let value = positive(store, key)?;
    match u16::try_from(value) {
        Ok(port) => Some(port),
        Err(_) => {
            warn!("Ignoring out-of-range port {} = {}", key, value);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.open().unwrap();
        store
    }

    #[test]
    fn test_defaults() {
        let settings = OrchestratorSettings::default();
        assert_eq!(settings.provisioning_timeout, Duration::from_secs(600));
        assert_eq!(settings.admin_session, Duration::from_secs(300));
        assert_eq!(settings.boot_connect_timeout, Duration::from_secs(15));
        assert_eq!(settings.boot_poll_interval, Duration::from_millis(500));
        assert_eq!(settings.boot_report_every, 5);
        assert!(settings.registration.is_none());
    }

    #[test]
    fn test_empty_store_keeps_defaults() {
        let settings = OrchestratorSettings::default().with_overrides(&store());
        assert_eq!(settings, OrchestratorSettings::default());
    }

    #[test]
    fn test_overrides_applied() {
        let mut store = store();
        store.set_i32(keys::PROVISIONING_TIMEOUT_S, 120).unwrap();
        store.set_i32(keys::ADMIN_TIMEOUT_S, 60).unwrap();
        store.set_i32(keys::BOOT_WAIT_MS, 3000).unwrap();
        store.set_i32(keys::RECONNECT_MAX, 3).unwrap();
        store.set_i32(keys::ADMIN_PORT, 9090).unwrap();

        let settings = OrchestratorSettings::default().with_overrides(&store);
        assert_eq!(settings.provisioning_timeout, Duration::from_secs(120));
        assert_eq!(settings.admin_session, Duration::from_secs(60));
        assert_eq!(settings.boot_connect_timeout, Duration::from_millis(3000));
        assert_eq!(settings.reconnect_max_attempts, 3);
        assert_eq!(settings.admin_port, 9090);
    }

    #[test]
    fn test_invalid_overrides_ignored() {
        let mut store = store();
        store.set_i32(keys::RECONNECT_S, 0).unwrap();
        store.set_i32(keys::PORTAL_PORT, 70000).unwrap();
        store.set_str(keys::ADMIN_TIMEOUT_S, "soon").unwrap();

        let settings = OrchestratorSettings::default().with_overrides(&store);
        assert_eq!(settings.reconnect_interval, RECONNECT_INTERVAL);
        assert_eq!(settings.portal_port, DEFAULT_PORTAL_PORT);
        assert_eq!(settings.admin_session, ADMIN_SESSION);
    }

    #[test]
    fn test_registration_endpoint_needs_both_keys() {
        let mut store = store();
        store
            .set_str(keys::REGISTRATION_URL, "https://example.invalid/")
            .unwrap();
        let settings = OrchestratorSettings::default().with_overrides(&store);
        assert!(settings.registration.is_none());

        store.set_str(keys::REGISTRATION_KEY, "anon-key").unwrap();
        let settings = OrchestratorSettings::default().with_overrides(&store);
        let endpoint = settings.registration.unwrap();
        assert_eq!(endpoint.base_url, "https://example.invalid");
        assert_eq!(endpoint.api_key, "anon-key");
    }
}
