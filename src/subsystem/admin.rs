//! Remote administration subsystem.
//!
//! A time-boxed session with a status endpoint. The session ends when its
//! time runs out or a client posts to `/api/end-session`; either way the
//! subsystem only raises [`Subsystem::shutdown_requested`] and the
//! orchestrator moves back to Active.

use super::http::{HttpListener, HttpRequest, Reply};
use super::{StatusQuery, Subsystem, SubsystemContext, SubsystemError, TickContext};
use crate::identity::DeviceIdentity;
use crate::mode::Mode;
use crate::network::LinkSnapshot;
use log::info;
use serde_json::json;
use std::time::{Duration, Instant};
use tiny_http::Method;

struct SessionState {
    identity: DeviceIdentity,
    started_at: Instant,
    length: Duration,
    end_requested: bool,
    link: LinkSnapshot,
}

impl SessionState {
    fn remaining(&self, now: Instant) -> Duration {
        self.length
            .saturating_sub(now.saturating_duration_since(self.started_at))
    }

    fn route(&mut self, req: &HttpRequest, now: Instant, clients: usize) -> Reply {
        match (req.method.clone(), req.path.as_str()) {
            (Method::Get, "/status") => Reply::json(
                200,
                &json!({
                    "device_id": self.identity.device_id(),
                    "mode": Mode::Admin.as_str(),
                    "session_remaining_s": self.remaining(now).as_secs(),
                    "clients": clients,
                    "link": &self.link,
                }),
            ),
            (Method::Post, "/api/end-session") => {
                info!("Admin session end requested by client");
                self.end_requested = true;
                Reply::json(200, &json!({ "success": true, "message": "Session closing" }))
            }
            (_, "/status" | "/api/end-session") => Reply::method_not_allowed(),
            _ => Reply::not_found(),
        }
    }
}

/// Admin-mode subsystem.
pub struct AdminPanel {
    listener: HttpListener,
    state: SessionState,
    ready: bool,
}

impl AdminPanel {
    pub fn new(ctx: &SubsystemContext) -> Self {
        Self {
            listener: HttpListener::new(
                "Admin panel",
                ctx.settings.admin_port,
                ctx.settings.admin_max_clients,
            ),
            state: SessionState {
                identity: ctx.identity.clone(),
                started_at: Instant::now(),
                length: ctx.settings.admin_session,
                end_requested: false,
                link: ctx.link.clone(),
            },
            ready: false,
        }
    }

    /// Route a request without a socket.
    pub fn handle(&mut self, req: &HttpRequest, now: Instant) -> Reply {
        let clients = self.listener.active_clients();
        self.state.route(req, now, clients)
    }
}

impl Subsystem for AdminPanel {
    fn mode(&self) -> Mode {
        Mode::Admin
    }

    fn begin(&mut self, now: Instant) -> Result<(), SubsystemError> {
        self.listener.bind()?;
        self.state.started_at = now;
        self.state.end_requested = false;
        self.ready = true;
        info!(
            "Admin session open for {}s",
            self.state.length.as_secs()
        );
        Ok(())
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) {
        self.state.link = ctx.link.clone();
        let now = ctx.now;
        let clients = self.listener.active_clients();
        let state = &mut self.state;
        self.listener.poll(now, |req| state.route(req, now, clients));
    }

    fn end(&mut self) {
        if !self.ready && !self.listener.is_bound() {
            return;
        }
        self.listener.close();
        self.ready = false;
        info!("Admin session closed");
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn shutdown_requested(&self, now: Instant) -> bool {
        self.ready && (self.state.end_requested || self.state.remaining(now).is_zero())
    }

    fn report(&self, query: StatusQuery, now: Instant) -> Option<String> {
        match query {
            StatusQuery::Admin => Some(format!(
                "Admin session: {}\n  Time left: {}s\n  Clients: {}\n{}",
                if self.ready { "open" } else { "closed" },
                self.state.remaining(now).as_secs(),
                self.listener.active_clients(),
                self.state.link.describe()
            )),
            _ => None,
        }
    }
}

impl Drop for AdminPanel {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorSettings;

    fn panel(session: Duration) -> AdminPanel {
        let mut settings = OrchestratorSettings::default();
        settings.admin_port = 0;
        settings.admin_session = session;
        AdminPanel::new(&SubsystemContext {
            identity: DeviceIdentity::from_mac([0x24, 0x6f, 0x28, 0xab, 0xcd, 0xef]),
            settings,
            link: LinkSnapshot::disconnected(),
        })
    }

    #[test]
    fn test_session_times_out() {
        let mut panel = panel(Duration::from_secs(300));
        let now = Instant::now();
        panel.begin(now).unwrap();
        assert!(!panel.shutdown_requested(now));
        assert!(!panel.shutdown_requested(now + Duration::from_secs(299)));
        assert!(panel.shutdown_requested(now + Duration::from_secs(300)));
    }

    #[test]
    fn test_end_session_route() {
        let mut panel = panel(Duration::from_secs(300));
        let now = Instant::now();
        panel.begin(now).unwrap();
        let reply = panel.handle(&HttpRequest::new(Method::Post, "/api/end-session", ""), now);
        assert_eq!(reply.status, 200);
        assert!(panel.shutdown_requested(now));
    }

    #[test]
    fn test_status_json() {
        let mut panel = panel(Duration::from_secs(120));
        let now = Instant::now();
        panel.begin(now).unwrap();
        let reply = panel.handle(
            &HttpRequest::new(Method::Get, "/status", ""),
            now + Duration::from_secs(20),
        );
        let json: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(json["mode"], "ADMIN");
        assert_eq!(json["session_remaining_s"], 100);
    }

    #[test]
    fn test_end_is_idempotent() {
        let mut panel = panel(Duration::from_secs(300));
        panel.begin(Instant::now()).unwrap();
        panel.end();
        panel.end();
        assert!(!panel.is_ready());
        assert!(!panel.shutdown_requested(Instant::now()));
    }

    #[test]
    fn test_report() {
        let mut panel = panel(Duration::from_secs(300));
        let now = Instant::now();
        panel.begin(now).unwrap();
        let report = panel.report(StatusQuery::Admin, now).unwrap();
        assert!(report.contains("Admin session: open"));
        assert!(report.contains("Time left: 300s"));
        assert!(panel.report(StatusQuery::Relays, now).is_none());
    }
}
