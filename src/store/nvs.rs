//! ESP32 NVS-backed configuration store.
//!
//! All keys live in the `hydro_system` namespace of the default NVS
//! partition. Strings and integers use the native NVS types; floats are
//! stored as 4-byte little-endian blobs.

use super::{validate_key, validate_value, ConfigStore, StoreError, MAX_VALUE_LEN};
use esp_idf_svc::nvs::{EspNvs, NvsDefault};
use esp_idf_sys::EspError;
use log::info;

/// NVS namespace for controller configuration.
const NVS_NAMESPACE: &str = "hydro_system";

/// NVS store handle. Opened lazily by [`ConfigStore::open`].
#[derive(Default)]
pub struct NvsStore {
    nvs: Option<EspNvs<NvsDefault>>,
}

impl NvsStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn handle(&self, key: &str) -> Result<&EspNvs<NvsDefault>, StoreError> {
        validate_key(key)?;
        self.nvs
            .as_ref()
            .ok_or_else(|| StoreError::Unavailable("NVS not opened".into()))
    }

    fn handle_mut(&mut self, key: &str) -> Result<&mut EspNvs<NvsDefault>, StoreError> {
        validate_key(key)?;
        self.nvs
            .as_mut()
            .ok_or_else(|| StoreError::Unavailable("NVS not opened".into()))
    }
}

impl ConfigStore for NvsStore {
    fn open(&mut self) -> Result<(), StoreError> {
        let partition = crate::nvs_default_partition()
            .map_err(|e| StoreError::Unavailable(format!("partition: {:?}", e)))?;
        let nvs = EspNvs::new(partition, NVS_NAMESPACE, true)
            .map_err(|e| StoreError::Unavailable(format!("namespace: {:?}", e)))?;
        self.nvs = Some(nvs);
        info!("NVS namespace '{}' opened", NVS_NAMESPACE);
        Ok(())
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StoreError> {
        let nvs = self.handle(key)?;
        // NVS string length includes the terminating NUL
        let mut buf = vec![0u8; MAX_VALUE_LEN + 1];
        Ok(nvs.get_str(key, &mut buf)?.map(str::to_string))
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_value(key, value)?;
        self.handle_mut(key)?.set_str(key, value)?;
        Ok(())
    }

    fn get_i32(&self, key: &str) -> Result<Option<i32>, StoreError> {
        Ok(self.handle(key)?.get_i32(key)?)
    }

    fn set_i32(&mut self, key: &str, value: i32) -> Result<(), StoreError> {
        self.handle_mut(key)?.set_i32(key, value)?;
        Ok(())
    }

    fn get_f32(&self, key: &str) -> Result<Option<f32>, StoreError> {
        let mut buf = [0u8; 4];
        match self.handle(key)?.get_raw(key, &mut buf)? {
            Some(bytes) => {
                let raw: [u8; 4] = bytes.try_into().map_err(|_| StoreError::TypeMismatch {
                    key: key.to_string(),
                    expected: "f32",
                    found: "blob",
                })?;
                Ok(Some(f32::from_le_bytes(raw)))
            }
            None => Ok(None),
        }
    }

    fn set_f32(&mut self, key: &str, value: f32) -> Result<(), StoreError> {
        self.handle_mut(key)?.set_raw(key, &value.to_le_bytes())?;
        Ok(())
    }

    fn contains(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.handle(key)?.contains(key)?)
    }

    fn remove(&mut self, key: &str) -> Result<bool, StoreError> {
        let removed: Result<bool, EspError> = self.handle_mut(key)?.remove(key);
        Ok(removed?)
    }
}
