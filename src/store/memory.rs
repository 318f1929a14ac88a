//! In-memory configuration store.

use super::{typed, validate_key, validate_value, ConfigStore, StoreError, StoredValue};
use std::collections::BTreeMap;

/// Map-backed store that lives as long as the process.
///
/// Behaves like the persistent stores: keys are validated and every access
/// before [`ConfigStore::open`] fails.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: BTreeMap<String, StoredValue>,
    opened: bool,
    fail_open: bool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store whose `open()` always fails, simulating a broken flash.
    pub fn unavailable() -> Self {
        Self {
            fail_open: true,
            ..Self::default()
        }
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.opened {
            Ok(())
        } else {
            Err(StoreError::Unavailable("store not opened".into()))
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
        self.values.insert(key.to_string(), value);
        Ok(())
    }
}

impl ConfigStore for MemoryStore {
    fn open(&mut self) -> Result<(), StoreError> {
        if self.fail_open {
            return Err(StoreError::Unavailable("simulated open failure".into()));
        }
        self.opened = true;
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
        Ok(self.values.remove(key).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requires_open() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_str("wifi_ssid"),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_unavailable_store_fails_open() {
        let mut store = MemoryStore::unavailable();
        assert!(matches!(store.open(), Err(StoreError::Unavailable(_))));
    }

    #[test]
    fn test_typed_accessors() {
        let mut store = MemoryStore::new();
        store.open().unwrap();

        store.set_str("name", "tank-1").unwrap();
        store.set_i32("count", -4).unwrap();
        store.set_f32("ph_target", 6.2).unwrap();

        assert_eq!(store.get_str("name").unwrap().as_deref(), Some("tank-1"));
        assert_eq!(store.get_i32("count").unwrap(), Some(-4));
        assert_eq!(store.get_f32("ph_target").unwrap(), Some(6.2));
        assert_eq!(store.get_i32("missing").unwrap(), None);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn test_type_mismatch() {
        let mut store = MemoryStore::new();
        store.open().unwrap();
        store.set_str("count", "three").unwrap();
        assert!(matches!(
            store.get_i32("count"),
            Err(StoreError::TypeMismatch {
                expected: "i32",
                found: "string",
                ..
            })
        ));
    }

    #[test]
    fn test_contains_and_remove() {
        let mut store = MemoryStore::new();
        store.open().unwrap();
        store.set_i32("wifi_chan", 6).unwrap();
        assert!(store.contains("wifi_chan").unwrap());
        assert!(store.remove("wifi_chan").unwrap());
        assert!(!store.remove("wifi_chan").unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn test_rejects_invalid_key() {
        let mut store = MemoryStore::new();
        store.open().unwrap();
        assert!(matches!(
            store.set_str("this_key_is_too_long", "x"),
            Err(StoreError::InvalidKey(_))
        ));
    }
}
