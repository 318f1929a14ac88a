//! WiFi station credentials.
//!
//! Platform-independent and host-testable. Both the ConfigStore and the
//! provisioning portal validate through [`Credentials::validate`] so the
//! bounds below are enforced in one place.
//!
//! # Example
//!
//! ```
//! use hydro_esp32::config::Credentials;
//!
//! let creds = Credentials::new("HomeNet", "secret123").unwrap();
//! assert_eq!(creds.channel(), 0);
//! assert!(!creds.is_open());
//! ```

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Maximum SSID length per IEEE 802.11 standard.
pub const MAX_SSID_LEN: usize = 32;

/// Maximum password length for WPA2.
pub const MAX_PASSWORD_LEN: usize = 64;

/// Minimum password length for WPA2.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Highest 2.4 GHz channel. Channel 0 means "scan all".
pub const MAX_CHANNEL: u8 = 14;

/// Credentials for joining the configured network.
///
/// The secret is wiped from memory when the value is dropped, so the
/// orchestrator's reconnect copy does not outlive its use.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct Credentials {
    ssid: String,
    password: String,
    channel: u8,
}

impl Credentials {
    /// Create credentials with automatic channel selection.
    pub fn new(ssid: impl Into<String>, password: impl Into<String>) -> Result<Self, ConfigError> {
        Self::with_channel(ssid, password, 0)
    }

    /// Create credentials pinned to a channel (0 = auto).
    pub fn with_channel(
        ssid: impl Into<String>,
        password: impl Into<String>,
        channel: u8,
    ) -> Result<Self, ConfigError> {
        let creds = Self {
            ssid: ssid.into(),
            password: password.into(),
            channel,
        };
        creds.validate()?;
        Ok(creds)
    }

    /// Validate the credentials.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ssid.is_empty() {
            return Err(ConfigError::SsidEmpty);
        }
        if self.ssid.len() > MAX_SSID_LEN {
            return Err(ConfigError::SsidTooLong {
                len: self.ssid.len(),
                max: MAX_SSID_LEN,
            });
        }

        // Empty is OK for open networks
        if !self.password.is_empty() && self.password.len() < MIN_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooShort {
                len: self.password.len(),
                min: MIN_PASSWORD_LEN,
            });
        }
        if self.password.len() > MAX_PASSWORD_LEN {
            return Err(ConfigError::PasswordTooLong {
                len: self.password.len(),
                max: MAX_PASSWORD_LEN,
            });
        }

        if self.channel > MAX_CHANNEL {
            return Err(ConfigError::ChannelOutOfRange(self.channel));
        }

        Ok(())
    }

    pub fn ssid(&self) -> &str {
        &self.ssid
    }

    pub fn password(&self) -> &str {
        &self.password
    }

    pub fn channel(&self) -> u8 {
        self.channel
    }

    /// Check if this is an open network (no password).
    pub fn is_open(&self) -> bool {
        self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("ssid", &self.ssid)
            .field("password", &"<redacted>")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Errors from credential validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// SSID is empty.
    SsidEmpty,
    /// SSID exceeds maximum length.
    SsidTooLong { len: usize, max: usize },
    /// Password is too short for WPA2.
    PasswordTooShort { len: usize, min: usize },
    /// Password exceeds maximum length.
    PasswordTooLong { len: usize, max: usize },
    /// Channel outside 0..=14.
    ChannelOutOfRange(u8),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SsidEmpty => write!(f, "SSID cannot be empty"),
            Self::SsidTooLong { len, max } => {
                write!(f, "SSID too long: {} bytes (max {})", len, max)
            }
            Self::PasswordTooShort { len, min } => {
                write!(f, "password too short: {} bytes (min {})", len, min)
            }
            Self::PasswordTooLong { len, max } => {
                write!(f, "password too long: {} bytes (max {})", len, max)
            }
            Self::ChannelOutOfRange(ch) => {
                write!(f, "channel {} out of range (0-{})", ch, MAX_CHANNEL)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;

    // ==================== Credentials Tests ====================

    #[test]
    fn test_valid_credentials() {
        let creds = Credentials::new("HomeNet", "secret123").unwrap();
        assert_eq!(creds.ssid(), "HomeNet");
        assert_eq!(creds.password(), "secret123");
        assert_eq!(creds.channel(), 0);
    }

    #[test]
    fn test_open_network() {
        let creds = Credentials::new("CafeWiFi", "").unwrap();
        assert!(creds.is_open());
    }

    #[test]
    fn test_empty_ssid() {
        assert_eq!(
            Credentials::new("", "secret123"),
            Err(ConfigError::SsidEmpty)
        );
    }

    #[test]
    fn test_ssid_bounds() {
        assert!(Credentials::new("a".repeat(32), "secret123").is_ok());
        assert!(matches!(
            Credentials::new("a".repeat(33), "secret123"),
            Err(ConfigError::SsidTooLong { len: 33, max: 32 })
        ));
    }

    #[test]
    fn test_password_bounds() {
        assert!(matches!(
            Credentials::new("HomeNet", "short"),
            Err(ConfigError::PasswordTooShort { .. })
        ));
        assert!(Credentials::new("HomeNet", "12345678").is_ok());
        assert!(Credentials::new("HomeNet", "a".repeat(64)).is_ok());
        assert!(matches!(
            Credentials::new("HomeNet", "a".repeat(65)),
            Err(ConfigError::PasswordTooLong { .. })
        ));
    }

    #[test]
    fn test_channel_bounds() {
        assert!(Credentials::with_channel("HomeNet", "secret123", 14).is_ok());
        assert_eq!(
            Credentials::with_channel("HomeNet", "secret123", 15),
            Err(ConfigError::ChannelOutOfRange(15))
        );
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials::new("HomeNet", "secret123").unwrap();
        let debug = format!("{:?}", creds);
        assert!(debug.contains("HomeNet"));
        assert!(!debug.contains("secret123"));
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(ConfigError::SsidEmpty.to_string(), "SSID cannot be empty");
        assert_eq!(
            ConfigError::ChannelOutOfRange(20).to_string(),
            "channel 20 out of range (0-14)"
        );
    }
}
