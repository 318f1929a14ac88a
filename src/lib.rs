//! Hydroponic controller firmware library.
//!
//! The [`orchestrator`] owns the operating mode and the single live
//! subsystem. Everything below it is platform-independent and can be tested
//! on the host machine without ESP32 hardware; radio and storage have host
//! and ESP-IDF implementations selected by the `esp32` feature.

pub mod clock;
pub mod config;
pub mod identity;
pub mod mode;
pub mod network;
pub mod orchestrator;
pub mod platform;
pub mod registration;
pub mod store;
pub mod subsystem;
#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used items
pub use clock::{Clock, SystemClock};
pub use config::{ConfigError, Credentials, OrchestratorSettings};
pub use identity::DeviceIdentity;
pub use mode::{Mode, Target, TransitionEvent};
pub use network::{LinkSnapshot, LinkState, NetworkLayer};
pub use orchestrator::{Orchestrator, OrchestratorError, TickOutcome};
pub use store::{ConfigStore, ConfigStoreExt, StoreError};
pub use subsystem::{DefaultFactory, Subsystem, SubsystemFactory};

#[cfg(feature = "esp32")]
use esp_idf_svc::nvs::{EspDefaultNvsPartition, EspNvsPartition, NvsDefault};
#[cfg(feature = "esp32")]
use std::sync::Mutex;

#[cfg(feature = "esp32")]
static NVS_PARTITION: Mutex<Option<EspNvsPartition<NvsDefault>>> = Mutex::new(None);

/// Shared handle to the default NVS partition.
///
/// `EspDefaultNvsPartition::take()` succeeds only once per boot; the store and
/// the WiFi driver both go through this accessor. Safe to call multiple times.
#[cfg(feature = "esp32")]
pub fn nvs_default_partition() -> Result<EspNvsPartition<NvsDefault>, esp_idf_sys::EspError> {
    let mut slot = NVS_PARTITION
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    if let Some(partition) = slot.as_ref() {
        return Ok(partition.clone());
    }
    let partition = EspDefaultNvsPartition::take()?;
    *slot = Some(partition.clone());
    Ok(partition)
}
