//! Controller configuration types.
//!
//! # Components
//!
//! - [`credentials`] - WiFi station credentials and their validation
//! - [`settings`] - timing/port settings with per-device store overrides

pub mod credentials;
pub mod settings;

pub use credentials::{
    ConfigError, Credentials, MAX_CHANNEL, MAX_PASSWORD_LEN, MAX_SSID_LEN, MIN_PASSWORD_LEN,
};
pub use settings::{OrchestratorSettings, RegistrationEndpoint};
