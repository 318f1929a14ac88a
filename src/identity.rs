//! Stable device identity derived from the station MAC address.

use log::warn;
use std::fmt;

/// Prefix of every device id.
pub const DEVICE_ID_PREFIX: &str = "ESP32_HIDRO_";

/// Device identity: the MAC it was derived from plus the id string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    mac: [u8; 6],
    device_id: String,
}

impl DeviceIdentity {
    /// Derive `ESP32_HIDRO_XXXXXX` from the last three MAC bytes.
    pub fn from_mac(mac: [u8; 6]) -> Self {
        if mac == [0; 6] {
            warn!("MAC address is all zeros, device id will not be unique");
        }
        let device_id = format!(
            "{}{:02X}{:02X}{:02X}",
            DEVICE_ID_PREFIX, mac[3], mac[4], mac[5]
        );
        Self { mac, device_id }
    }

    /// Keep the MAC but adopt a previously persisted id.
    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn mac(&self) -> [u8; 6] {
        self.mac
    }

    /// Colon-separated upper-case MAC, e.g. `24:6F:28:AB:CD:EF`.
    pub fn mac_string(&self) -> String {
        self.mac
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect::<Vec<_>>()
            .join(":")
    }

    /// Name used when the user did not pick one: `ESP32 - AB:CD:EF`.
    pub fn default_device_name(&self) -> String {
        let mac = self.mac_string();
        format!("ESP32 - {}", &mac[mac.len() - 8..])
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.device_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: [u8; 6] = [0x24, 0x6f, 0x28, 0xab, 0xcd, 0xef];

    #[test]
    fn test_device_id_from_mac() {
        let identity = DeviceIdentity::from_mac(MAC);
        assert_eq!(identity.device_id(), "ESP32_HIDRO_ABCDEF");
        assert_eq!(identity.to_string(), "ESP32_HIDRO_ABCDEF");
    }

    #[test]
    fn test_device_id_is_stable() {
        assert_eq!(DeviceIdentity::from_mac(MAC), DeviceIdentity::from_mac(MAC));
    }

    #[test]
    fn test_mac_string() {
        let identity = DeviceIdentity::from_mac(MAC);
        assert_eq!(identity.mac_string(), "24:6F:28:AB:CD:EF");
    }

    #[test]
    fn test_default_device_name() {
        let identity = DeviceIdentity::from_mac(MAC);
        assert_eq!(identity.default_device_name(), "ESP32 - AB:CD:EF");
    }

    #[test]
    fn test_stored_id_wins() {
        let identity = DeviceIdentity::from_mac(MAC).with_device_id("ESP32_HIDRO_000001");
        assert_eq!(identity.device_id(), "ESP32_HIDRO_000001");
        assert_eq!(identity.mac(), MAC);
    }

    #[test]
    fn test_zero_mac_still_formats() {
        let identity = DeviceIdentity::from_mac([0; 6]);
        assert_eq!(identity.device_id(), "ESP32_HIDRO_000000");
    }
}
