//! Normal-operation subsystem.
//!
//! Owns the relay bank and a `/stats` endpoint on the station network.
//! Relays switch off when their pulse expires, when the hard cap is
//! reached, and unconditionally in `end()`.
//!
//! # Example Response
//!
//! ```json
//! {
//!   "device_id": "ESP32_HIDRO_ABCDEF",
//!   "uptime_secs": 3600,
//!   "mode": "ACTIVE",
//!   "link": { "state": "Connected", "ssid": "HomeNet", "ip": "192.168.1.40", ... },
//!   "relays": [false, true, false, ...]
//! }
//! ```

use super::http::{HttpListener, HttpRequest, Reply};
use super::{StatusQuery, Subsystem, SubsystemContext, SubsystemError, TickContext};
use crate::identity::DeviceIdentity;
use crate::mode::Mode;
use crate::network::LinkSnapshot;
use log::{info, warn};
use serde_json::json;
use std::fmt;
use std::time::{Duration, Instant};
use tiny_http::Method;

/// Relays on the output board.
pub const RELAY_COUNT: usize = 16;

/// Longest a relay may stay on, with or without an explicit duration.
pub const MAX_PULSE: Duration = Duration::from_secs(3600);

/// Distinct stats clients allowed at once.
const STATS_MAX_CLIENTS: usize = 4;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Relay {
    on: bool,
    off_at: Option<Instant>,
}

/// Logical state of the relay outputs.
#[derive(Debug, Default)]
pub struct RelayBank {
    relays: [Relay; RELAY_COUNT],
}

impl RelayBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Switch a relay on for `duration` (capped at [`MAX_PULSE`]).
    pub fn switch_on(
        &mut self,
        index: usize,
        duration: Option<Duration>,
        now: Instant,
    ) -> Result<(), RelayError> {
        let duration = duration.unwrap_or(MAX_PULSE);
        if duration > MAX_PULSE {
            return Err(RelayError::PulseTooLong(duration));
        }
        let relay = self
            .relays
            .get_mut(index)
            .ok_or(RelayError::OutOfRange(index))?;
        relay.on = true;
        relay.off_at = Some(now + duration);
        info!("Relay {} ON for {}s", index, duration.as_secs());
        Ok(())
    }

    pub fn switch_off(&mut self, index: usize) -> Result<(), RelayError> {
        let relay = self
            .relays
            .get_mut(index)
            .ok_or(RelayError::OutOfRange(index))?;
        if relay.on {
            info!("Relay {} OFF", index);
        }
        *relay = Relay::default();
        Ok(())
    }

    /// Switch off every relay whose pulse has ended. Returns their indices.
    pub fn expire(&mut self, now: Instant) -> Vec<usize> {
        let mut expired = Vec::new();
        for (index, relay) in self.relays.iter_mut().enumerate() {
            if relay.on && relay.off_at.is_some_and(|off_at| now >= off_at) {
                *relay = Relay::default();
                expired.push(index);
            }
        }
        expired
    }

    pub fn all_off(&mut self) {
        self.relays = [Relay::default(); RELAY_COUNT];
    }

    pub fn is_on(&self, index: usize) -> bool {
        self.relays.get(index).is_some_and(|r| r.on)
    }

    pub fn states(&self) -> Vec<bool> {
        self.relays.iter().map(|r| r.on).collect()
    }

    pub fn active_count(&self) -> usize {
        self.relays.iter().filter(|r| r.on).count()
    }

    /// Time left before relay `index` switches off.
    pub fn remaining(&self, index: usize, now: Instant) -> Option<Duration> {
        let relay = self.relays.get(index)?;
        if !relay.on {
            return None;
        }
        relay
            .off_at
            .map(|off_at| off_at.saturating_duration_since(now))
    }
}

/// Relay command errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    OutOfRange(usize),
    PulseTooLong(Duration),
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfRange(index) => {
                write!(f, "relay {} out of range (0-{})", index, RELAY_COUNT - 1)
            }
            Self::PulseTooLong(d) => write!(
                f,
                "pulse of {}s exceeds the {}s limit",
                d.as_secs(),
                MAX_PULSE.as_secs()
            ),
        }
    }
}

impl std::error::Error for RelayError {}

struct CoreState {
    identity: DeviceIdentity,
    started_at: Instant,
    link: LinkSnapshot,
    relays: RelayBank,
}

impl CoreState {
    fn route(&mut self, req: &HttpRequest, now: Instant) -> Reply {
        let path = req.path.trim_end_matches('/');
        if path == "/stats" || path.is_empty() {
            return if req.method == Method::Get {
                self.stats(now)
            } else {
                Reply::method_not_allowed()
            };
        }

        let Some(rest) = path.strip_prefix("/relays/") else {
            return Reply::not_found();
        };
        if req.method != Method::Post {
            return Reply::method_not_allowed();
        }
        let Some((index, action)) = rest.split_once('/') else {
            return Reply::not_found();
        };
        let Ok(index) = index.parse::<usize>() else {
            return Reply::error(400, format!("invalid relay index '{}'", index));
        };

        let result = match action {
            "on" => {
                let duration = match req.query_params().get("duration").map(|d| d.parse::<u64>()) {
                    None => None,
                    Some(Ok(secs)) => Some(Duration::from_secs(secs)),
                    Some(Err(_)) => return Reply::error(400, "duration must be whole seconds"),
                };
                self.relays.switch_on(index, duration, now)
            }
            "off" => self.relays.switch_off(index),
            _ => return Reply::not_found(),
        };

        match result {
            Ok(()) => Reply::json(
                200,
                &json!({ "success": true, "relay": index, "on": self.relays.is_on(index) }),
            ),
            Err(e) => Reply::error(400, e.to_string()),
        }
    }

    fn stats(&self, now: Instant) -> Reply {
        Reply::json(
            200,
            &json!({
                "device_id": self.identity.device_id(),
                "uptime_secs": now.saturating_duration_since(self.started_at).as_secs(),
                "mode": Mode::Active.as_str(),
                "link": &self.link,
                "relays": self.relays.states(),
            }),
        )
    }
}

/// Active-mode subsystem.
pub struct HydroCore {
    listener: HttpListener,
    state: CoreState,
    ready: bool,
}

impl HydroCore {
    pub fn new(ctx: &SubsystemContext) -> Self {
        Self {
            listener: HttpListener::new("Stats server", ctx.settings.stats_port, STATS_MAX_CLIENTS),
            state: CoreState {
                identity: ctx.identity.clone(),
                started_at: Instant::now(),
                link: ctx.link.clone(),
                relays: RelayBank::new(),
            },
            ready: false,
        }
    }

    pub fn relays(&self) -> &RelayBank {
        &self.state.relays
    }

    /// Route a request without a socket.
    pub fn handle(&mut self, req: &HttpRequest, now: Instant) -> Reply {
        self.state.route(req, now)
    }
}

impl Subsystem for HydroCore {
    fn mode(&self) -> Mode {
        Mode::Active
    }

    fn begin(&mut self, now: Instant) -> Result<(), SubsystemError> {
        self.listener.bind()?;
        self.state.started_at = now;
        self.state.relays.all_off();
        self.ready = true;
        info!("Hydro core active");
        Ok(())
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) {
        if self.state.link.is_connected() && !ctx.link.is_connected() {
            warn!("Hydro core: link down, keeping local control");
        }
        self.state.link = ctx.link.clone();

        for index in self.state.relays.expire(ctx.now) {
            info!("Relay {} OFF (pulse ended)", index);
        }

        let now = ctx.now;
        let state = &mut self.state;
        self.listener.poll(now, |req| state.route(req, now));
    }

    fn end(&mut self) {
        if !self.ready && !self.listener.is_bound() {
            return;
        }
        self.state.relays.all_off();
        self.listener.close();
        self.ready = false;
        info!("Hydro core stopped, all relays off");
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn report(&self, query: StatusQuery, now: Instant) -> Option<String> {
        match query {
            StatusQuery::Hydro => Some(format!(
                "Hydro core: {}\n  Device: {}\n  Uptime: {}s\n  Relays on: {}/{}\n{}",
                if self.ready { "running" } else { "stopped" },
                self.state.identity.device_id(),
                now.saturating_duration_since(self.state.started_at).as_secs(),
                self.state.relays.active_count(),
                RELAY_COUNT,
                self.state.link.describe()
            )),
            StatusQuery::Relays => {
                let mut out = String::from("Relays:");
                for index in 0..RELAY_COUNT {
                    match self.state.relays.remaining(index, now) {
                        Some(left) => {
                            out.push_str(&format!("\n  [{:2}] ON ({}s left)", index, left.as_secs()))
                        }
                        None => out.push_str(&format!("\n  [{:2}] off", index)),
                    }
                }
                Some(out)
            }
            _ => None,
        }
    }
}

impl Drop for HydroCore {
    fn drop(&mut self) {
        self.end();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OrchestratorSettings;

    fn core() -> HydroCore {
        let mut settings = OrchestratorSettings::default();
        settings.stats_port = 0;
        HydroCore::new(&SubsystemContext {
            identity: DeviceIdentity::from_mac([0x24, 0x6f, 0x28, 0xab, 0xcd, 0xef]),
            settings,
            link: LinkSnapshot::disconnected(),
        })
    }

    // ==================== RelayBank Tests ====================

    #[test]
    fn test_pulse_expires() {
        let now = Instant::now();
        let mut bank = RelayBank::new();
        bank.switch_on(3, Some(Duration::from_secs(30)), now).unwrap();
        assert!(bank.is_on(3));
        assert_eq!(bank.remaining(3, now), Some(Duration::from_secs(30)));

        assert!(bank.expire(now + Duration::from_secs(29)).is_empty());
        assert_eq!(bank.expire(now + Duration::from_secs(30)), vec![3]);
        assert!(!bank.is_on(3));
    }

    #[test]
    fn test_default_pulse_is_capped() {
        let now = Instant::now();
        let mut bank = RelayBank::new();
        bank.switch_on(0, None, now).unwrap();
        assert_eq!(bank.remaining(0, now), Some(MAX_PULSE));
        assert_eq!(bank.expire(now + MAX_PULSE), vec![0]);
    }

    #[test]
    fn test_relay_errors() {
        let now = Instant::now();
        let mut bank = RelayBank::new();
        assert_eq!(
            bank.switch_on(RELAY_COUNT, None, now),
            Err(RelayError::OutOfRange(RELAY_COUNT))
        );
        assert!(matches!(
            bank.switch_on(1, Some(MAX_PULSE + Duration::from_secs(1)), now),
            Err(RelayError::PulseTooLong(_))
        ));
        assert_eq!(bank.active_count(), 0);
    }

    #[test]
    fn test_all_off() {
        let now = Instant::now();
        let mut bank = RelayBank::new();
        bank.switch_on(1, None, now).unwrap();
        bank.switch_on(2, None, now).unwrap();
        assert_eq!(bank.active_count(), 2);
        bank.all_off();
        assert_eq!(bank.active_count(), 0);
    }

    // ==================== HydroCore Tests ====================

    #[test]
    fn test_end_switches_relays_off() {
        let mut core = core();
        let now = Instant::now();
        core.begin(now).unwrap();
        core.handle(
            &HttpRequest::new(Method::Post, "/relays/5/on?duration=60", ""),
            now,
        );
        assert!(core.relays().is_on(5));

        core.end();
        assert!(!core.relays().is_on(5));
        assert!(!core.is_ready());
        core.end();
    }

    #[test]
    fn test_tick_expires_relays() {
        let mut core = core();
        let now = Instant::now();
        core.begin(now).unwrap();
        core.handle(
            &HttpRequest::new(Method::Post, "/relays/2/on?duration=1", ""),
            now,
        );

        let link = LinkSnapshot::disconnected();
        let mut events = Vec::new();
        let mut ctx = TickContext::new(now + Duration::from_secs(2), &link, &mut events);
        core.tick(&mut ctx);
        assert!(!core.relays().is_on(2));
        assert!(events.is_empty());
    }

    #[test]
    fn test_stats_json() {
        let mut core = core();
        let now = Instant::now();
        let reply = core.handle(&HttpRequest::new(Method::Get, "/stats", ""), now);
        assert_eq!(reply.status, 200);
        let json: serde_json::Value = serde_json::from_str(&reply.body).unwrap();
        assert_eq!(json["device_id"], "ESP32_HIDRO_ABCDEF");
        assert_eq!(json["mode"], "ACTIVE");
        assert_eq!(json["relays"].as_array().unwrap().len(), RELAY_COUNT);
    }

    #[test]
    fn test_relay_route_errors() {
        let mut core = core();
        let now = Instant::now();
        let bad_index = core.handle(&HttpRequest::new(Method::Post, "/relays/x/on", ""), now);
        assert_eq!(bad_index.status, 400);
        let out_of_range =
            core.handle(&HttpRequest::new(Method::Post, "/relays/99/off", ""), now);
        assert_eq!(out_of_range.status, 400);
        let get = core.handle(&HttpRequest::new(Method::Get, "/relays/1/on", ""), now);
        assert_eq!(get.status, 405);
        let unknown = core.handle(&HttpRequest::new(Method::Post, "/relays/1/blink", ""), now);
        assert_eq!(unknown.status, 404);
    }

    #[test]
    fn test_reports() {
        let mut core = core();
        let now = Instant::now();
        core.begin(now).unwrap();
        core.handle(
            &HttpRequest::new(Method::Post, "/relays/0/on?duration=10", ""),
            now,
        );

        let hydro = core.report(StatusQuery::Hydro, now).unwrap();
        assert!(hydro.contains("Relays on: 1/16"));
        let relays = core.report(StatusQuery::Relays, now).unwrap();
        assert!(relays.contains("[ 0] ON (10s left)"));
        assert!(relays.contains("[ 1] off"));
        assert!(core.report(StatusQuery::Wifi, now).is_none());
    }
}
