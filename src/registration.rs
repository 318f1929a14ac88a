//! Device registration with the cloud backend.
//!
//! The provisioning portal collects the owner's e-mail; once the device is
//! online the runtime posts it to the backend's
//! `register_device_with_email` RPC. Registration failures are logged and
//! retried on the next Active entry, never fatal.

use crate::config::RegistrationEndpoint;
use serde::Serialize;
use std::fmt;

/// RPC path appended to the endpoint base URL.
pub const REGISTER_PATH: &str = "/rest/v1/rpc/register_device_with_email";

/// Location sent when the user left the field empty.
pub const DEFAULT_LOCATION: &str = "Location not specified";

/// Minimum plausible e-mail length (`a@b.c`).
const MIN_EMAIL_LEN: usize = 5;

/// Owner details captured by the provisioning portal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationInfo {
    pub email: String,
    pub device_name: Option<String>,
    pub location: Option<String>,
}

impl RegistrationInfo {
    pub fn new(email: impl Into<String>) -> Result<Self, RegistrationError> {
        let email = email.into();
        if !validate_email(&email) {
            return Err(RegistrationError::InvalidEmail(email));
        }
        Ok(Self {
            email,
            device_name: None,
            location: None,
        })
    }

    pub fn with_device_name(mut self, name: Option<String>) -> Self {
        self.device_name = name.filter(|n| !n.trim().is_empty());
        self
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location.filter(|l| !l.trim().is_empty());
        self
    }
}

/// Basic e-mail sanity check: `@` present and before the last `.`.
pub fn validate_email(email: &str) -> bool {
    if email.len() < MIN_EMAIL_LEN {
        return false;
    }
    match (email.find('@'), email.rfind('.')) {
        (Some(at), Some(dot)) => at > 0 && at < dot && dot + 1 < email.len(),
        _ => false,
    }
}

/// A registration ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRequest {
    pub device_id: String,
    pub mac_address: String,
    pub ip_address: Option<String>,
    /// Used when the owner did not name the device.
    pub default_device_name: String,
    pub info: RegistrationInfo,
}

/// JSON body of the RPC call.
#[derive(Debug, Serialize, PartialEq, Eq)]
pub struct RegistrationPayload<'a> {
    p_device_id: &'a str,
    p_mac_address: &'a str,
    p_user_email: &'a str,
    p_ip_address: &'a str,
    p_device_name: &'a str,
    p_location: &'a str,
}

impl RegistrationRequest {
    pub fn payload(&self) -> RegistrationPayload<'_> {
        RegistrationPayload {
            p_device_id: &self.device_id,
            p_mac_address: &self.mac_address,
            p_user_email: &self.info.email,
            p_ip_address: self.ip_address.as_deref().unwrap_or("0.0.0.0"),
            p_device_name: self
                .info
                .device_name
                .as_deref()
                .unwrap_or(&self.default_device_name),
            p_location: self.info.location.as_deref().unwrap_or(DEFAULT_LOCATION),
        }
    }
}

/// Posts registrations to the configured endpoint.
#[derive(Clone)]
pub struct Registrar {
    endpoint: RegistrationEndpoint,
    #[cfg(not(feature = "esp32"))]
    client: reqwest::Client,
}

impl Registrar {
    pub fn new(endpoint: RegistrationEndpoint) -> Self {
        Self {
            endpoint,
            #[cfg(not(feature = "esp32"))]
            client: reqwest::Client::new(),
        }
    }

    pub fn url(&self) -> String {
        format!("{}{}", self.endpoint.base_url, REGISTER_PATH)
    }

    #[cfg(not(feature = "esp32"))]
    pub async fn register(&self, request: &RegistrationRequest) -> Result<(), RegistrationError> {
        let response = self
            .client
            .post(self.url())
            .header("apikey", &self.endpoint.api_key)
            .bearer_auth(&self.endpoint.api_key)
            .json(&request.payload())
            .send()
            .await
            .map_err(|e| RegistrationError::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            log::info!("Device {} registered", request.device_id);
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(RegistrationError::Rejected {
                status: status.as_u16(),
                body,
            })
        }
    }

    #[cfg(feature = "esp32")]
    pub async fn register(&self, request: &RegistrationRequest) -> Result<(), RegistrationError> {
        let url = self.url();
        let api_key = self.endpoint.api_key.clone();
        let body = serde_json::to_vec(&request.payload())
            .map_err(|e| RegistrationError::Transport(e.to_string()))?;
        let device_id = request.device_id.clone();

        // The ESP-IDF HTTP client blocks; keep it off the controller loop
        tokio::task::spawn_blocking(move || esp_post(&url, &api_key, &body))
            .await
            .map_err(|e| RegistrationError::Transport(format!("worker failed: {}", e)))??;

        log::info!("Device {} registered", device_id);
        Ok(())
    }
}

#[cfg(feature = "esp32")]
fn esp_post(url: &str, api_key: &str, body: &[u8]) -> Result<(), RegistrationError> {
    use esp_idf_svc::http::client::{Configuration, EspHttpConnection};
    use esp_idf_svc::http::Method;
    use esp_idf_svc::io::Write;

    let transport = |e: esp_idf_sys::EspError| RegistrationError::Transport(format!("{:?}", e));

    let mut conn = EspHttpConnection::new(&Configuration {
        crt_bundle_attach: Some(esp_idf_sys::esp_crt_bundle_attach),
        ..Default::default()
    })
    .map_err(transport)?;

    let bearer = format!("Bearer {}", api_key);
    let length = body.len().to_string();
    let headers = [
        ("apikey", api_key),
        ("Authorization", bearer.as_str()),
        ("Content-Type", "application/json"),
        ("Content-Length", length.as_str()),
    ];

    conn.initiate_request(Method::Post, url, &headers)
        .map_err(transport)?;
    conn.write_all(body).map_err(transport)?;
    conn.initiate_response().map_err(transport)?;

    let status = conn.status();
    if (200..300).contains(&status) {
        Ok(())
    } else {
        Err(RegistrationError::Rejected {
            status,
            body: String::new(),
        })
    }
}

/// Registration errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationError {
    /// E-mail failed [`validate_email`].
    InvalidEmail(String),
    /// Request could not be sent.
    Transport(String),
    /// Backend answered with a non-success status.
    Rejected { status: u16, body: String },
}

impl fmt::Display for RegistrationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidEmail(email) => write!(f, "invalid e-mail: '{}'", email),
            Self::Transport(msg) => write!(f, "registration request failed: {}", msg),
            Self::Rejected { status, body } => {
                write!(f, "registration rejected with HTTP {}: {}", status, body)
            }
        }
    }
}

impl std::error::Error for RegistrationError {}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(info: RegistrationInfo) -> RegistrationRequest {
        RegistrationRequest {
            device_id: "ESP32_HIDRO_ABCDEF".into(),
            mac_address: "24:6F:28:AB:CD:EF".into(),
            ip_address: Some("192.168.1.40".into()),
            default_device_name: "ESP32 - AB:CD:EF".into(),
            info,
        }
    }

    // ==================== E-mail Tests ====================

    #[test]
    fn test_valid_emails() {
        assert!(validate_email("grower@example.com"));
        assert!(validate_email("a@b.co"));
        assert!(validate_email("first.last@farm.example.org"));
    }

    #[test]
    fn test_invalid_emails() {
        assert!(!validate_email(""));
        assert!(!validate_email("a@b."));
        assert!(!validate_email("no-at-sign.com"));
        assert!(!validate_email("user@localhost"));
        assert!(!validate_email("dot.before@at"));
        assert!(!validate_email("@example.com"));
    }

    #[test]
    fn test_info_rejects_bad_email() {
        assert_eq!(
            RegistrationInfo::new("nope"),
            Err(RegistrationError::InvalidEmail("nope".into()))
        );
    }

    #[test]
    fn test_blank_optional_fields_dropped() {
        let info = RegistrationInfo::new("grower@example.com")
            .unwrap()
            .with_device_name(Some("  ".into()))
            .with_location(Some(String::new()));
        assert_eq!(info.device_name, None);
        assert_eq!(info.location, None);
    }

    // ==================== Payload Tests ====================

    #[test]
    fn test_payload_defaults() {
        let info = RegistrationInfo::new("grower@example.com").unwrap();
        let json = serde_json::to_value(request(info).payload()).unwrap();

        assert_eq!(json["p_device_id"], "ESP32_HIDRO_ABCDEF");
        assert_eq!(json["p_mac_address"], "24:6F:28:AB:CD:EF");
        assert_eq!(json["p_user_email"], "grower@example.com");
        assert_eq!(json["p_ip_address"], "192.168.1.40");
        assert_eq!(json["p_device_name"], "ESP32 - AB:CD:EF");
        assert_eq!(json["p_location"], DEFAULT_LOCATION);
    }

    #[test]
    fn test_payload_uses_owner_values() {
        let info = RegistrationInfo::new("grower@example.com")
            .unwrap()
            .with_device_name(Some("Lettuce rack".into()))
            .with_location(Some("Greenhouse 2".into()));
        let mut req = request(info);
        req.ip_address = None;
        let json = serde_json::to_value(req.payload()).unwrap();

        assert_eq!(json["p_device_name"], "Lettuce rack");
        assert_eq!(json["p_location"], "Greenhouse 2");
        assert_eq!(json["p_ip_address"], "0.0.0.0");
    }

    #[test]
    fn test_registrar_url() {
        let registrar = Registrar::new(RegistrationEndpoint {
            base_url: "https://example.invalid".into(),
            api_key: "anon".into(),
        });
        assert_eq!(
            registrar.url(),
            "https://example.invalid/rest/v1/rpc/register_device_with_email"
        );
    }
}
