//! Mode subsystems.
//!
//! A subsystem is the unit of work that runs while its mode is current. The
//! orchestrator creates one through a [`SubsystemFactory`] on every mode
//! entry, calls [`Subsystem::begin`], ticks it while it reports ready, and
//! calls [`Subsystem::end`] before dropping it. Subsystems never switch
//! modes; they report through [`SubsystemEvent`]s and
//! [`Subsystem::shutdown_requested`].
//!
//! # Components
//!
//! - [`provisioning`] - access point portal that collects credentials
//! - [`active`] - normal operation: relay bank and stats endpoint
//! - [`admin`] - time-boxed administration panel
//! - [`http`] - non-blocking `tiny_http` listener shared by all three

pub mod active;
pub mod admin;
pub mod http;
pub mod provisioning;

pub use active::HydroCore;
pub use admin::AdminPanel;
pub use provisioning::ProvisioningPortal;

use crate::config::{Credentials, OrchestratorSettings};
use crate::identity::DeviceIdentity;
use crate::mode::Mode;
use crate::network::LinkSnapshot;
use crate::registration::RegistrationInfo;
use std::fmt;
use std::time::Instant;

/// Owner-supplied details that accompany new credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    pub device_name: Option<String>,
    pub location: Option<String>,
}

/// Outcomes reported by a subsystem, applied by the orchestrator at the
/// next tick boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubsystemEvent {
    /// New credentials were submitted and validated.
    CredentialsConfigured {
        credentials: Credentials,
        profile: DeviceProfile,
    },
    /// Owner details for cloud registration.
    RegistrationReceived(RegistrationInfo),
    /// A client asked for a device restart.
    RestartRequested,
}

/// Per-tick inputs and outputs of a subsystem.
pub struct TickContext<'a> {
    pub now: Instant,
    pub link: &'a LinkSnapshot,
    events: &'a mut Vec<SubsystemEvent>,
}

impl<'a> TickContext<'a> {
    pub fn new(now: Instant, link: &'a LinkSnapshot, events: &'a mut Vec<SubsystemEvent>) -> Self {
        Self { now, link, events }
    }

    /// Report an outcome to the orchestrator.
    pub fn emit(&mut self, event: SubsystemEvent) {
        self.events.push(event);
    }
}

/// Mode-specific status queries routed from the command surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusQuery {
    Wifi,
    Hydro,
    Relays,
    Admin,
}

/// Lifecycle contract of a mode subsystem.
pub trait Subsystem {
    /// Mode this subsystem serves.
    fn mode(&self) -> Mode;

    /// Acquire resources. On error the orchestrator calls `end()` and
    /// applies the mode's fallback.
    fn begin(&mut self, now: Instant) -> Result<(), SubsystemError>;

    /// One non-blocking iteration. Only called while `is_ready()`.
    fn tick(&mut self, ctx: &mut TickContext<'_>);

    /// Release every resource. Calling it again is a no-op.
    fn end(&mut self);

    fn is_ready(&self) -> bool;

    /// Whether the subsystem wants its mode to end.
    fn shutdown_requested(&self, _now: Instant) -> bool {
        false
    }

    /// Answer a status query; `None` if the query does not apply.
    fn report(&self, query: StatusQuery, now: Instant) -> Option<String>;
}

/// Everything a subsystem needs at construction.
#[derive(Debug, Clone)]
pub struct SubsystemContext {
    pub identity: DeviceIdentity,
    pub settings: OrchestratorSettings,
    pub link: LinkSnapshot,
}

/// Creates a fresh subsystem for a mode.
pub trait SubsystemFactory {
    fn create(&mut self, mode: Mode, ctx: &SubsystemContext) -> Box<dyn Subsystem>;
}

/// Factory for the built-in subsystems.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFactory;

impl SubsystemFactory for DefaultFactory {
    fn create(&mut self, mode: Mode, ctx: &SubsystemContext) -> Box<dyn Subsystem> {
        match mode {
            Mode::Provisioning => Box::new(ProvisioningPortal::new(ctx)),
            Mode::Active => Box::new(HydroCore::new(ctx)),
            Mode::Admin => Box::new(AdminPanel::new(ctx)),
        }
    }
}

/// Subsystem initialization errors.
#[derive(Debug)]
pub enum SubsystemError {
    /// HTTP listener could not bind.
    Bind { port: u16, reason: String },
    /// Any other resource failure.
    Resource(String),
}

impl fmt::Display for SubsystemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bind { port, reason } => write!(f, "cannot bind port {}: {}", port, reason),
            Self::Resource(msg) => write!(f, "resource unavailable: {}", msg),
        }
    }
}

impl std::error::Error for SubsystemError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_context_collects_events() {
        let link = LinkSnapshot::disconnected();
        let mut events = Vec::new();
        let mut ctx = TickContext::new(Instant::now(), &link, &mut events);
        ctx.emit(SubsystemEvent::RestartRequested);
        assert_eq!(events, vec![SubsystemEvent::RestartRequested]);
    }

    #[test]
    fn test_default_factory_matches_mode() {
        let ctx = SubsystemContext {
            identity: DeviceIdentity::from_mac([0x24, 0x6f, 0x28, 0xab, 0xcd, 0xef]),
            settings: OrchestratorSettings::default(),
            link: LinkSnapshot::disconnected(),
        };
        let mut factory = DefaultFactory;
        for mode in [Mode::Provisioning, Mode::Active, Mode::Admin] {
            let subsystem = factory.create(mode, &ctx);
            assert_eq!(subsystem.mode(), mode);
            assert!(!subsystem.is_ready(), "not ready before begin()");
        }
    }

    #[test]
    fn test_error_display() {
        let err = SubsystemError::Bind {
            port: 80,
            reason: "in use".into(),
        };
        assert_eq!(err.to_string(), "cannot bind port 80: in use");
    }
}
