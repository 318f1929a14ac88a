//! File-backed configuration store for host (development) builds.
//!
//! Keeps the whole map in a JSON document so settings persist across runs.
//! Uses `~/.hydro-esp32/config.json` by default.
//!
//! # Usage
//!
//! ```ignore
//! use hydro_esp32::store::{ConfigStore, FileStore};
//!
//! let mut store = FileStore::at_default_path()?;
//! store.open()?;
//! ```

use super::{typed, validate_key, validate_value, ConfigStore, StoreError, StoredValue};
use log::{debug, info};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Get the default config file path.
///
/// Returns `~/.hydro-esp32/config.json`
pub fn default_store_path() -> io::Result<PathBuf> {
    let home = std::env::var("HOME")
        .map_err(|_| io::Error::new(io::ErrorKind::NotFound, "HOME not set"))?;
    Ok(PathBuf::from(home).join(".hydro-esp32").join("config.json"))
}

/// JSON file store.
///
/// Every write replaces the file through a temporary sibling and is read
/// back to verify the content landed.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    values: BTreeMap<String, StoredValue>,
    opened: bool,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            values: BTreeMap::new(),
            opened: false,
        }
    }

    pub fn at_default_path() -> io::Result<Self> {
        Ok(Self::new(default_store_path()?))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.opened {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "{} not opened",
                self.path.display()
            )))
        }
    }

    fn lookup(&self, key: &str) -> Result<Option<&StoredValue>, StoreError> {
        self.ensure_open()?;
        validate_key(key)?;
        Ok(self.values.get(key))
    }

    fn insert(&mut self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        self.ensure_open()?;
        validate_key(key)?;
        let previous = self.values.insert(key.to_string(), value);
        if let Err(e) = self.persist() {
            // Keep memory and disk in agreement
            match previous {
                Some(old) => self.values.insert(key.to_string(), old),
                None => self.values.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn persist(&self) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(&self.values)
            .map_err(|e| StoreError::Corrupt(format!("serialize failed: {}", e)))?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;

        // Verify write by reading back
        let read_back = fs::read_to_string(&self.path)?;
        if read_back != json {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "config verification failed: wrote {} bytes, read {} bytes",
                    json.len(),
                    read_back.len()
                ),
            )));
        }

        debug!("Config saved to {:?}", self.path);
        Ok(())
    }
}

impl ConfigStore for FileStore {
    fn open(&mut self) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| StoreError::Unavailable(format!("{}: {}", parent.display(), e)))?;
        }

        self.values = match fs::read_to_string(&self.path) {
            Ok(text) => serde_json::from_str(&text)
                .map_err(|e| StoreError::Corrupt(format!("{}: {}", self.path.display(), e)))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("No config file at {:?}, starting empty", self.path);
                BTreeMap::new()
            }
            Err(e) => {
                return Err(StoreError::Unavailable(format!(
                    "{}: {}",
                    self.path.display(),
                    e
                )))
            }
        };

        self.opened = true;
        info!(
            "Config store opened at {:?} ({} keys)",
            self.path,
            self.values.len()
        );
        Ok(())
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        typed(key, self.lookup(key)?, "string", |v| match v {
            StoredValue::Str(s) => Some(s.clone()),
            _ => None,
        })
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_value(key, value)?;
        self.insert(key, StoredValue::Str(value.to_string()))
    }

    fn get_i32(&self, key: &str) -> Result<Option<i32>, StoreError> {
        typed(key, self.lookup(key)?, "i32", |v| match v {
            StoredValue::I32(n) => Some(*n),
            _ => None,
        })
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.insert(key, StoredValue::I32(value))
    }

    fn get_f32(&self, key: &str) -> Result<Option<f32>, StoreError> {
        typed(key, self.lookup(key)?, "f32", |v| match v {
            StoredValue::F32(n) => Some(*n),
            _ => None,
        })
    }

    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), StoreError> {
        self.insert(key, StoredValue::F32(value))
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.lookup(key)?.is_some())
    }

    fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
        self.ensure_open()?;
        validate_key(key)?;
        match self.values.remove(key) {
            Some(old) => {
                if let Err(e) = self.persist() {
                    self.values.insert(key.to_string(), old);
                    return Err(e);
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Credentials;
    use crate::store::ConfigStoreExt;
    use std::env;
    use std::sync::atomic::{AtomicU32, Ordering};

    // Counter to ensure unique test files even in parallel execution
    static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

    fn unique_store_path() -> PathBuf {
        let id = TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
        let pid = std::process::id();
        env::temp_dir()
            .join(format!("hydro-store-test-{}-{}", pid, id))
            .join("config.json")
    }

    fn cleanup(path: &Path) {
        if let Some(dir) = path.parent() {
            let _ = fs::remove_dir_all(dir);
        }
    }

    #[test]
    fn test_values_survive_reopen() {
        let path = unique_store_path();

        let mut store = FileStore::new(&path);
        store.open().expect("open");
        store.set_str("device_name", "Tank A").unwrap();
        store.set_i32("reconnect_s", 20).unwrap();
        store.set_f32("ph_target", 5.8).unwrap();
        drop(store);

        let mut reopened = FileStore::new(&path);
        reopened.open().expect("reopen");
        assert_eq!(
            reopened.get_str("device_name").unwrap().as_deref(),
            Some("Tank A")
        );
        assert_eq!(reopened.get_i32("reconnect_s").unwrap(), Some(20));
        assert_eq!(reopened.get_f32("ph_target").unwrap(), Some(5.8));

        cleanup(&path);
    }

    #[test]
    fn test_credentials_persist() {
        let path = unique_store_path();

        let mut store = FileStore::new(&path);
        store.open().unwrap();
        let creds = Credentials::new("HomeNet", "secret123").unwrap();
        store.save_credentials(&creds).unwrap();

        let mut reopened = FileStore::new(&path);
        reopened.open().unwrap();
        assert_eq!(reopened.load_credentials().unwrap(), Some(creds));

        cleanup(&path);
    }

    #[test]
    fn test_remove_persists() {
        let path = unique_store_path();

        let mut store = FileStore::new(&path);
        store.open().unwrap();
        store.set_str("location", "roof").unwrap();
        assert!(store.remove("location").unwrap());

        let mut reopened = FileStore::new(&path);
        reopened.open().unwrap();
        assert!(!reopened.contains("location").unwrap());

        cleanup(&path);
    }

    #[test]
    fn test_corrupt_file_fails_open() {
        let path = unique_store_path();
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json").unwrap();

        let mut store = FileStore::new(&path);
        assert!(matches!(store.open(), Err(StoreError::Corrupt(_))));

        cleanup(&path);
    }

    #[test]
    fn test_access_before_open_fails() {
        let store = FileStore::new(unique_store_path());
        assert!(matches!(
            store.contains("wifi_ssid"),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_default_path() {
        // HOME may be unset in some CI sandboxes
        if let Ok(path) = default_store_path() {
            assert!(path.ends_with(".hydro-esp32/config.json"));
        }
    }
}
