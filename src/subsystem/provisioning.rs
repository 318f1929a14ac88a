//! Provisioning portal.
//!
//! Serves a minimal configuration form and a small JSON API while the
//! orchestrator holds the access point up. Valid submissions become
//! [`SubsystemEvent`]s; storing credentials and restarting is the
//! orchestrator's job.
//!
//! # Routes
//!
//! - `GET /` - setup form
//! - `GET /api/device-info` - identity and AP status
//! - `POST /api/connect-wifi` - `ssid`, `password`, `channel`, `deviceName`
//! - `POST /save-config-with-email` - as above plus `email`, `location`
//! - `POST /api/reset` - request a restart

use super::http::{HttpListener, HttpRequest, Reply};
use super::{
    DeviceProfile, StatusQuery, Subsystem, SubsystemContext, SubsystemError, SubsystemEvent,
    TickContext,
};
use crate::config::Credentials;
use crate::identity::DeviceIdentity;
use crate::mode::Mode;
use crate::network::LinkSnapshot;
use crate::registration::RegistrationInfo;
use log::{info, warn};
use serde_json::json;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tiny_http::Method;

const SETUP_PAGE: &str = r#"<!DOCTYPE html>
<html><head><meta name="viewport" content="width=device-width,initial-scale=1">
<title>Hydro controller setup</title></head>
<body><h2>Hydro controller setup</h2>
<p>Device: <b>{device_id}</b></p>
<form method="post" action="/save-config-with-email">
<p><input name="ssid" placeholder="WiFi network" required maxlength="32"></p>
<p><input name="password" type="password" placeholder="WiFi password" maxlength="64"></p>
<p><input name="deviceName" placeholder="Device name"></p>
<p><input name="email" type="email" placeholder="Owner e-mail" required></p>
<p><input name="location" placeholder="Location"></p>
<p><button type="submit">Save and restart</button></p>
</form></body></html>
"#;

/// Request handling state, kept apart from the listener so routing can
/// borrow it while the listener is being polled.
struct PortalState {
    identity: DeviceIdentity,
    started_at: Instant,
    link: LinkSnapshot,
    events: Vec<SubsystemEvent>,
}

impl PortalState {
    fn route(&mut self, req: &HttpRequest, now: Instant, clients: usize) -> Reply {
        match (req.method.clone(), req.path.as_str()) {
            (Method::Get, "/") => Reply::html(SETUP_PAGE.replace("{device_id}", self.identity.device_id())),
            (Method::Get, "/api/device-info") => self.device_info(now, clients),
            (Method::Post, "/api/connect-wifi") => self.configure(&req.fields(), false),
            (Method::Post, "/save-config-with-email") => self.configure(&req.fields(), true),
            (Method::Post, "/api/reset") => {
                info!("Portal: restart requested by client");
                self.events.push(SubsystemEvent::RestartRequested);
                Reply::json(200, &json!({ "success": true, "message": "Restarting device" }))
            }
            (_, "/" | "/api/device-info" | "/api/connect-wifi" | "/save-config-with-email" | "/api/reset") => {
                Reply::method_not_allowed()
            }
            _ => Reply::not_found(),
        }
    }

    fn device_info(&self, now: Instant, clients: usize) -> Reply {
        let ap_ip = self.link.ap_ip.map(|ip| ip.to_string());
        Reply::json(
            200,
            &json!({
                "device_id": self.identity.device_id(),
                "mac_address": self.identity.mac_string(),
                "ip_address": ap_ip,
                "ap_ip": ap_ip,
                "active_connections": clients,
                "uptime": now.saturating_duration_since(self.started_at).as_secs(),
                "connected": self.link.is_connected(),
            }),
        )
    }

    fn configure(&mut self, fields: &HashMap<String, String>, with_email: bool) -> Reply {
        let field = |name: &str| {
            fields
                .get(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let channel = match field("channel").map(|c| c.parse::<u8>()) {
            None => 0,
            Some(Ok(ch)) => ch,
            Some(Err(_)) => return Reply::error(400, "channel must be a number"),
        };
        let credentials = match Credentials::with_channel(
            field("ssid").unwrap_or_default(),
            fields.get("password").cloned().unwrap_or_default(),
            channel,
        ) {
            Ok(creds) => creds,
            Err(e) => {
                warn!("Portal: rejected credentials: {}", e);
                return Reply::error(400, e.to_string());
            }
        };

        let profile = DeviceProfile {
            device_name: field("deviceName"),
            location: field("location"),
        };

        let mut email = None;
        if with_email {
            let info = match RegistrationInfo::new(field("email").unwrap_or_default()) {
                Ok(info) => info
                    .with_device_name(profile.device_name.clone())
                    .with_location(profile.location.clone()),
                Err(e) => return Reply::error(400, e.to_string()),
            };
            email = Some(info.email.clone());
            self.events.push(SubsystemEvent::RegistrationReceived(info));
        }

        info!("Portal: credentials submitted for '{}'", credentials.ssid());
        self.events.push(SubsystemEvent::CredentialsConfigured {
            credentials,
            profile,
        });

        Reply::json(
            200,
            &json!({
                "success": true,
                "message": "Configuration saved, restarting",
                "device_id": self.identity.device_id(),
                "user_email": email,
            }),
        )
    }
}

/// Access point configuration portal.
pub struct ProvisioningPortal {
    listener: HttpListener,
    state: PortalState,
    timeout: Duration,
    ready: bool,
}

impl ProvisioningPortal {
    pub fn new(ctx: &SubsystemContext) -> Self {
        Self {
            listener: HttpListener::new(
                "Provisioning portal",
                ctx.settings.portal_port,
                ctx.settings.portal_max_clients,
            ),
            state: PortalState {
                identity: ctx.identity.clone(),
                started_at: Instant::now(),
                link: ctx.link.clone(),
                events: Vec::new(),
            },
            timeout: ctx.settings.provisioning_timeout,
            ready: false,
        }
    }

    /// Port bound by `begin()`, if any.
    pub fn local_port(&self) -> Option<u16> {
        self.listener.local_port()
    }

    /// Route a request without a socket.
    pub fn handle(&mut self, req: &HttpRequest, now: Instant) -> Reply {
        let clients = self.listener.active_clients();
        self.state.route(req, now, clients)
    }
}

impl Subsystem for ProvisioningPortal {
    fn mode(&self) -> Mode {
        Mode::Provisioning
    }

    fn begin(&mut self, now: Instant) -> Result<(), SubsystemError> {
        self.listener.bind()?;
        self.state.started_at = now;
        self.ready = true;
        info!(
            "Provisioning portal ready for {}",
            self.state.identity.device_id()
        );
        Ok(())
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) {
        self.state.link = ctx.link.clone();

        let now = ctx.now;
        let clients = self.listener.active_clients();
        let state = &mut self.state;
        self.listener.poll(now, |req| state.route(req, now, clients));

        for event in self.state.events.drain(..) {
            ctx.emit(event);
        }
    }

    fn end(&mut self) {
        if !self.ready && !self.listener.is_bound() {
            return;
        }
        self.listener.close();
        self.state.events.clear();
        self.ready = false;
        info!("Provisioning portal stopped");
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn report(&self, query: StatusQuery, now: Instant) -> Option<String> {
        match query {
            StatusQuery::Wifi => {
                let elapsed = now.saturating_duration_since(self.state.started_at);
                let remaining = self.timeout.saturating_sub(elapsed);
                Some(format!(
                    "Provisioning portal: {}\n  Access point: {}\n  Clients: {}\n  Time left: {}s\n{}",
                    if self.ready { "running" } else { "stopped" },
                    self.state
                        .link
                        .ap_ip
                        .map(|ip| ip.to_string())
                        .unwrap_or_else(|| "down".to_string()),
                    self.listener.active_clients(),
                    remaining.as_secs(),
                    self.state.link.describe()
                ))
            }
            _ => None,
        }
    }
}

impl Drop for ProvisioningPortal {
    fn drop(&mut self) {
        self.end();
    }
}
