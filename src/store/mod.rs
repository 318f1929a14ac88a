//! Versioned key/value configuration store.
//!
//! The [`ConfigStore`] trait is the only way the controller touches
//! persistent settings. Implementations:
//!
//! - [`MemoryStore`] - in-memory map for tests and emulators
//! - [`FileStore`] - JSON file under `~/.hydro-esp32/` (host)
//! - [`NvsStore`] - ESP-IDF NVS namespace (ESP32 only)
//!
//! Keys follow NVS rules on every platform (1-15 chars of `[A-Za-z0-9_-]`)
//! so a layout that works on the host also works on the device.
//!
//! # Schema versions
//!
//! The layout version lives under [`keys::CONFIG_VERSION`]. [`prepare`] runs
//! once per boot and invokes the migration hook when the stored version is
//! older than [`CURRENT_SCHEMA_VERSION`].

mod memory;
#[cfg(not(feature = "esp32"))]
mod file;
#[cfg(feature = "esp32")]
mod nvs;

pub use memory::MemoryStore;
#[cfg(not(feature = "esp32"))]
pub use file::FileStore;
#[cfg(feature = "esp32")]
pub use nvs::NvsStore;

use crate::config::{ConfigError, Credentials};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Layout version written by this firmware.
pub const CURRENT_SCHEMA_VERSION: i32 = 2;

/// Maximum key length imposed by NVS.
pub const MAX_KEY_LEN: usize = 15;

/// Maximum string value length.
pub const MAX_VALUE_LEN: usize = 4000;

/// Persisted key names.
pub mod keys {
    pub const WIFI_SSID: &str = "wifi_ssid";
    pub const WIFI_PASSWORD: &str = "wifi_pass";
    pub const WIFI_CHANNEL: &str = "wifi_chan";
    pub const DEVICE_ID: &str = "device_id";
    pub const DEVICE_NAME: &str = "device_name";
    pub const USER_EMAIL: &str = "user_email";
    pub const LOCATION: &str = "location";
    pub const CONFIG_VERSION: &str = "config_version";
    pub const REGISTRATION_PENDING: &str = "reg_pending";

    pub const PROVISIONING_TIMEOUT_S: &str = "prov_timeout_s";
    pub const ADMIN_TIMEOUT_S: &str = "admin_timeout_s";
    pub const BOOT_WAIT_MS: &str = "boot_wait_ms";
    pub const RECONNECT_S: &str = "reconnect_s";
    pub const RECONNECT_MAX: &str = "reconnect_max";
    pub const PORTAL_PORT: &str = "portal_port";
    pub const STATS_PORT: &str = "stats_port";
    pub const ADMIN_PORT: &str = "admin_port";
    pub const REGISTRATION_URL: &str = "reg_url";
    pub const REGISTRATION_KEY: &str = "reg_key";

    /// Schema 1 credential keys.
    pub const LEGACY_SSID: &str = "ssid";
    pub const LEGACY_PASSWORD: &str = "password";
}

/// Typed value as held by the map-backed stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum StoredValue {
    Str(String),
    I32(i32),
    F32(f32),
}

impl StoredValue {
    fn type_name(&self) -> &'static str {
        match self {
            Self::Str(_) => "string",
            Self::I32(_) => "i32",
            Self::F32(_) => "f32",
        }
    }
}

/// Persistent key/value store.
///
/// Object safe; the orchestrator and the migration hook use it as
/// `&mut dyn ConfigStore`.
pub trait ConfigStore {
    /// Open the backing storage. Must succeed before any other call.
    fn open(&mut self) -> Result<(), StoreError>;

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError>;

    fn get_i32(&self, key: &str) -> Result<Option<i32>, StoreError>;
    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError>;

    fn get_f32(&self, key: &str) -> Result<Option<f32>, StoreError>;
    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), StoreError>;

    /// Check whether a key exists, whatever its type.
    fn contains(&self, key: &str) -> Result<bool, StoreError>;

    /// Remove a key. Returns `true` if it existed.
    fn remove(&mut self, key: &str) -> Result<bool, StoreError>;
}

/// Credential and schema helpers available on every store.
pub trait ConfigStoreExt: ConfigStore {
    /// Check for stored credentials that pass validation. Read errors and
    /// invalid values count as "absent".
    fn has_credentials(&self) -> bool {
        matches!(self.load_credentials(), Ok(Some(_)))
    }

    /// Load stored credentials.
    ///
    /// Returns `Ok(None)` when no SSID is stored and an error when the stored
    /// values fail validation.
    fn load_credentials(&self) -> Result<Option<Credentials>, StoreError> {
        let ssid = match self.get_str(keys::WIFI_SSID)? {
            Some(ssid) if !ssid.is_empty() => ssid,
            _ => return Ok(None),
        };
        let password = self.get_str(keys::WIFI_PASSWORD)?.unwrap_or_default();
        let channel = self.get_i32(keys::WIFI_CHANNEL)?.unwrap_or(0);
        let channel = u8::try_from(channel).map_err(|_| StoreError::InvalidValue {
            key: keys::WIFI_CHANNEL.to_string(),
            reason: format!("channel {} out of range", channel),
        })?;

        Credentials::with_channel(ssid, password, channel)
            .map(Some)
            .map_err(StoreError::from)
    }

    fn save_credentials(&mut self, credentials: &Credentials) -> Result<(), StoreError> {
        credentials.validate()?;
        self.set_str(keys::WIFI_SSID, credentials.ssid())?;
        self.set_str(keys::WIFI_PASSWORD, credentials.password())?;
        self.set_i32(keys::WIFI_CHANNEL, i32::from(credentials.channel()))?;
        info!("Credentials saved for SSID '{}'", credentials.ssid());
        Ok(())
    }

    fn clear_credentials(&mut self) -> Result<(), StoreError> {
        self.remove(keys::WIFI_SSID)?;
        self.remove(keys::WIFI_PASSWORD)?;
        self.remove(keys::WIFI_CHANNEL)?;
        warn!("Credentials cleared");
        Ok(())
    }

    /// Read a string, falling back to `default` when absent or unreadable.
    fn get_str_or(&self, key: &str, default: &str) -> String {
        match self.get_str(key) {
            Ok(Some(value)) => value,
            Ok(None) => default.to_string(),
            Err(e) => {
                warn!("Failed to read '{}': {}", key, e);
                default.to_string()
            }
        }
    }

    /// Stored schema version, if any.
    fn schema_version(&self) -> Result<Option<i32>, StoreError> {
        self.get_i32(keys::CONFIG_VERSION)
    }
}

impl<T: ConfigStore + ?Sized> ConfigStoreExt for T {}

/// Migration hook: `(store, from_version, to_version)`.
pub type MigrationHook = Box<dyn FnMut(&mut dyn ConfigStore, i32, i32) -> Result<(), StoreError>>;

/// Result of [`prepare`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaStatus {
    /// Empty store, version stamped.
    Fresh,
    /// Stored version matches.
    UpToDate,
    /// Hook ran, version bumped.
    Migrated { from: i32 },
    /// Stored version is newer than this firmware; left untouched.
    Newer { stored: i32 },
}

/// Bring the store layout up to [`CURRENT_SCHEMA_VERSION`].
///
/// A store without a version counter but with legacy credential keys is
/// treated as version 1.
pub fn prepare(
    store: &mut dyn ConfigStore,
    hook: &mut MigrationHook,
) -> Result<SchemaStatus, StoreError> {
    let stored = match store.schema_version()? {
        Some(version) => version,
        None if store.contains(keys::LEGACY_SSID)? => 1,
        None => {
            store.set_i32(keys::CONFIG_VERSION, CURRENT_SCHEMA_VERSION)?;
            info!("Fresh config store, schema v{}", CURRENT_SCHEMA_VERSION);
            return Ok(SchemaStatus::Fresh);
        }
    };

    if stored == CURRENT_SCHEMA_VERSION {
        return Ok(SchemaStatus::UpToDate);
    }
    if stored > CURRENT_SCHEMA_VERSION {
        warn!(
            "Config schema v{} is newer than firmware v{}, leaving it untouched",
            stored, CURRENT_SCHEMA_VERSION
        );
        return Ok(SchemaStatus::Newer { stored });
    }

    info!(
        "Migrating config schema v{} -> v{}",
        stored, CURRENT_SCHEMA_VERSION
    );
    hook(&mut *store, stored, CURRENT_SCHEMA_VERSION)?;
    store.set_i32(keys::CONFIG_VERSION, CURRENT_SCHEMA_VERSION)?;
    Ok(SchemaStatus::Migrated { from: stored })
}

/// Default migration chain.
pub fn default_migration() -> MigrationHook {
    Box::new(|store: &mut dyn ConfigStore, from: i32, to: i32| {
        for version in from..to {
            match version {
                1 => migrate_v1_to_v2(store)?,
                _ => warn!("No migration step from schema v{}", version),
            }
        }
        Ok(())
    })
}

/// Schema 1 kept credentials under `ssid`/`password`.
fn migrate_v1_to_v2(store: &mut dyn ConfigStore) -> Result<(), StoreError> {
    for (old, new) in [
        (keys::LEGACY_SSID, keys::WIFI_SSID),
        (keys::LEGACY_PASSWORD, keys::WIFI_PASSWORD),
    ] {
        if let Some(value) = store.get_str(old)? {
            if !store.contains(new)? {
                store.set_str(new, &value)?;
            }
            store.remove(old)?;
            info!("Migrated '{}' -> '{}'", old, new);
        }
    }
    Ok(())
}

/// Validate a key against NVS naming rules.
pub fn validate_key(key: &str) -> Result<(), StoreError> {
    let valid = !key.is_empty()
        && key.len() <= MAX_KEY_LEN
        && key
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidKey(key.to_string()))
    }
}

/// Validate a string value length.
pub fn validate_value(key: &str, value: &str) -> Result<(), StoreError> {
    if value.len() > MAX_VALUE_LEN {
        return Err(StoreError::InvalidValue {
            key: key.to_string(),
            reason: format!("{} bytes (max {})", value.len(), MAX_VALUE_LEN),
        });
    }
    Ok(())
}

/// Look up a typed value in a map-backed store.
fn typed<T>(
    key: &str,
    value: Option<&StoredValue>,
    expected: &'static str,
    pick: impl FnOnce(&StoredValue) -> Option<T>,
) -> Result<Option<T>, StoreError> {
    match value {
        None => Ok(None),
        Some(v) => pick(v).map(Some).ok_or_else(|| StoreError::TypeMismatch {
            key: key.to_string(),
            expected,
            found: v.type_name(),
        }),
    }
}

/// Errors from the configuration store.
#[derive(Debug)]
pub enum StoreError {
    /// Storage could not be opened or is not open yet.
    Unavailable(String),
    /// Key violates naming rules.
    InvalidKey(String),
    /// Value violates limits or fails validation.
    InvalidValue { key: String, reason: String },
    /// Key exists with a different type.
    TypeMismatch {
        key: String,
        expected: &'static str,
        found: &'static str,
    },
    /// Stored document could not be parsed.
    Corrupt(String),
    /// Stored credentials fail validation.
    Credentials(ConfigError),
    /// File I/O error (host).
    Io(std::io::Error),
    /// ESP-IDF NVS error.
    #[cfg(feature = "esp32")]
    Nvs(esp_idf_sys::EspError),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unavailable(msg) => write!(f, "store unavailable: {}", msg),
            Self::InvalidKey(key) => write!(f, "invalid key: '{}'", key),
            Self::InvalidValue { key, reason } => {
                write!(f, "invalid value for '{}': {}", key, reason)
            }
            Self::TypeMismatch {
                key,
                expected,
                found,
            } => write!(f, "'{}' holds {} (expected {})", key, found, expected),
            Self::Corrupt(msg) => write!(f, "corrupt store: {}", msg),
            Self::Credentials(e) => write!(f, "stored credentials invalid: {}", e),
            Self::Io(e) => write!(f, "I/O error: {}", e),
            #[cfg(feature = "esp32")]
            Self::Nvs(e) => write!(f, "NVS error: {:?}", e),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Credentials(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<ConfigError> for StoreError {
    fn from(e: ConfigError) -> Self {
        Self::Credentials(e)
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

#[cfg(feature = "esp32")]
impl From<esp_idf_sys::EspError> for StoreError {
    fn from(e: esp_idf_sys::EspError) -> Self {
        Self::Nvs(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> MemoryStore {
        let mut store = MemoryStore::new();
        store.open().unwrap();
        store
    }

    // ==================== Key Validation Tests ====================

    #[test]
    fn test_valid_keys() {
        assert!(validate_key("wifi_ssid").is_ok());
        assert!(validate_key("a").is_ok());
        assert!(validate_key("admin_timeout_s").is_ok());
        assert!(validate_key("with-dash").is_ok());
    }

    #[test]
    fn test_invalid_keys() {
        assert!(matches!(validate_key(""), Err(StoreError::InvalidKey(_))));
        assert!(validate_key("sixteen_chars_xx").is_err());
        assert!(validate_key("has space").is_err());
        assert!(validate_key("dot.key").is_err());
    }

    #[test]
    fn test_all_layout_keys_are_valid() {
        for key in [
            keys::WIFI_SSID,
            keys::WIFI_PASSWORD,
            keys::WIFI_CHANNEL,
            keys::DEVICE_ID,
            keys::DEVICE_NAME,
            keys::USER_EMAIL,
            keys::LOCATION,
            keys::CONFIG_VERSION,
            keys::REGISTRATION_PENDING,
            keys::PROVISIONING_TIMEOUT_S,
            keys::ADMIN_TIMEOUT_S,
            keys::BOOT_WAIT_MS,
            keys::RECONNECT_S,
            keys::RECONNECT_MAX,
            keys::PORTAL_PORT,
            keys::STATS_PORT,
            keys::ADMIN_PORT,
            keys::REGISTRATION_URL,
            keys::REGISTRATION_KEY,
        ] {
            assert!(validate_key(key).is_ok(), "{} should be valid", key);
        }
    }

    #[test]
    fn test_value_length_limit() {
        assert!(validate_value("k", &"a".repeat(MAX_VALUE_LEN)).is_ok());
        assert!(matches!(
            validate_value("k", &"a".repeat(MAX_VALUE_LEN + 1)),
            Err(StoreError::InvalidValue { .. })
        ));
    }

    // ==================== Credential Helper Tests ====================

    #[test]
    fn test_credentials_roundtrip() {
        let mut store = open_store();
        assert!(!store.has_credentials());
        assert!(store.load_credentials().unwrap().is_none());

        let creds = Credentials::with_channel("HomeNet", "secret123", 6).unwrap();
        store.save_credentials(&creds).unwrap();

        assert!(store.has_credentials());
        assert_eq!(store.load_credentials().unwrap(), Some(creds));
    }

    #[test]
    fn test_clear_credentials() {
        let mut store = open_store();
        store
            .save_credentials(&Credentials::new("HomeNet", "secret123").unwrap())
            .unwrap();
        store.clear_credentials().unwrap();
        assert!(!store.has_credentials());
        assert!(!store.contains(keys::WIFI_PASSWORD).unwrap());
    }

    #[test]
    fn test_empty_ssid_counts_as_absent() {
        let mut store = open_store();
        store.set_str(keys::WIFI_SSID, "").unwrap();
        assert!(!store.has_credentials());
        assert!(store.load_credentials().unwrap().is_none());
    }

    #[test]
    fn test_corrupt_credentials_error() {
        let mut store = open_store();
        store.set_str(keys::WIFI_SSID, "HomeNet").unwrap();
        store.set_str(keys::WIFI_PASSWORD, "short").unwrap();
        assert!(matches!(
            store.load_credentials(),
            Err(StoreError::Credentials(ConfigError::PasswordTooShort { .. }))
        ));
        assert!(!store.has_credentials());

        store.set_str(keys::WIFI_PASSWORD, "secret123").unwrap();
        store.set_i32(keys::WIFI_CHANNEL, 300).unwrap();
        assert!(matches!(
            store.load_credentials(),
            Err(StoreError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_get_str_or_default() {
        let mut store = open_store();
        assert_eq!(store.get_str_or(keys::LOCATION, "greenhouse"), "greenhouse");
        store.set_str(keys::LOCATION, "roof").unwrap();
        assert_eq!(store.get_str_or(keys::LOCATION, "greenhouse"), "roof");
    }

    // ==================== Schema Migration Tests ====================

    #[test]
    fn test_fresh_store_is_stamped() {
        let mut store = open_store();
        let mut hook = default_migration();
        assert_eq!(prepare(&mut store, &mut hook).unwrap(), SchemaStatus::Fresh);
        assert_eq!(
            store.schema_version().unwrap(),
            Some(CURRENT_SCHEMA_VERSION)
        );
        assert_eq!(
            prepare(&mut store, &mut hook).unwrap(),
            SchemaStatus::UpToDate
        );
    }

    #[test]
    fn test_legacy_layout_migrates_credentials() {
        let mut store = open_store();
        store.set_str(keys::LEGACY_SSID, "OldNet").unwrap();
        store.set_str(keys::LEGACY_PASSWORD, "oldsecret").unwrap();

        let mut hook = default_migration();
        assert_eq!(
            prepare(&mut store, &mut hook).unwrap(),
            SchemaStatus::Migrated { from: 1 }
        );

        let creds = store.load_credentials().unwrap().unwrap();
        assert_eq!(creds.ssid(), "OldNet");
        assert_eq!(creds.password(), "oldsecret");
        assert!(!store.contains(keys::LEGACY_SSID).unwrap());
        assert!(!store.contains(keys::LEGACY_PASSWORD).unwrap());
        assert_eq!(store.schema_version().unwrap(), Some(2));
    }

    #[test]
    fn test_hook_runs_once() {
        use std::cell::Cell;
        use std::rc::Rc;

        let mut store = open_store();
        store.set_i32(keys::CONFIG_VERSION, 1).unwrap();

        let calls = Rc::new(Cell::new(0));
        let seen = calls.clone();
        let mut hook: MigrationHook = Box::new(move |_: &mut dyn ConfigStore, from: i32, to: i32| {
            assert_eq!((from, to), (1, CURRENT_SCHEMA_VERSION));
            seen.set(seen.get() + 1);
            Ok(())
        });

        prepare(&mut store, &mut hook).unwrap();
        prepare(&mut store, &mut hook).unwrap();
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn test_newer_schema_left_alone() {
        let mut store = open_store();
        store.set_i32(keys::CONFIG_VERSION, 7).unwrap();
        let mut hook = default_migration();
        assert_eq!(
            prepare(&mut store, &mut hook).unwrap(),
            SchemaStatus::Newer { stored: 7 }
        );
        assert_eq!(store.schema_version().unwrap(), Some(7));
    }

    #[test]
    fn test_migration_keeps_existing_new_keys() {
        let mut store = open_store();
        store.set_str(keys::LEGACY_SSID, "OldNet").unwrap();
        store.set_str(keys::WIFI_SSID, "NewNet").unwrap();
        let mut hook = default_migration();
        prepare(&mut store, &mut hook).unwrap();
        assert_eq!(
            store.get_str(keys::WIFI_SSID).unwrap().as_deref(),
            Some("NewNet")
        );
    }
}
