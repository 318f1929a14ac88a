//! Operating modes and the events that move the controller between them.
//!
//! Every event resolves to exactly one [`Target`] through
//! [`TransitionEvent::target`], so the transition table lives in one place
//! and can be tested without any subsystem or radio.

use std::fmt;

/// Mutually exclusive operating modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mode {
    /// Access point + configuration portal, entered without usable credentials.
    Provisioning,
    /// Normal operation on the configured network.
    Active,
    /// Time-boxed remote administration session.
    Admin,
}

impl Mode {
    /// Upper-case name used in logs and command replies.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Provisioning => "PROVISIONING",
            Self::Active => "ACTIVE",
            Self::Admin => "ADMIN",
        }
    }

    /// Whether entering this mode requires a connected station link.
    pub fn needs_connectivity(&self) -> bool {
        !matches!(self, Self::Provisioning)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Outcome of resolving a [`TransitionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Tear down and enter the given mode.
    Enter(Mode),
    /// Tear down and restart the whole process.
    Restart,
    /// Tear down and stop; only a restart request is honored afterwards.
    Halt,
}

/// Reasons for leaving the current mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionEvent {
    /// First mode decision after the boot connect attempt.
    Boot { connected: bool },
    /// Time in `mode` exceeded its limit.
    Timeout(Mode),
    /// Link dropped in Active mode and no credentials remain.
    ConnectivityLost,
    /// Link dropped in Active mode and the reconnect budget ran out.
    ReconnectExhausted,
    /// The Admin subsystem asked to close its session.
    SubsystemShutdownRequested,
    /// Provisioning stored new credentials.
    CredentialsConfigured,
    /// `begin()` of the subsystem for `mode` failed.
    SubsystemInitFailed(Mode),
    /// `mode` was about to be entered without a station link.
    ConnectivityAbsent(Mode),
    /// Operator asked for `mode` through the command surface.
    Requested(Mode),
    /// Operator or portal asked for a restart.
    RestartRequested,
}

impl TransitionEvent {
    /// Resolve the event to its target.
    ///
    /// `credentials_present` only matters for a Provisioning timeout.
    pub fn target(&self, credentials_present: bool) -> Target {
        match *self {
            Self::Boot { connected: true } => Target::Enter(Mode::Active),
            Self::Boot { connected: false } => Target::Enter(Mode::Provisioning),
            Self::Timeout(Mode::Provisioning) => {
                if credentials_present {
                    Target::Enter(Mode::Active)
                } else {
                    Target::Enter(Mode::Provisioning)
                }
            }
            Self::Timeout(Mode::Admin) => Target::Enter(Mode::Active),
            Self::Timeout(Mode::Active) => Target::Enter(Mode::Active),
            Self::ConnectivityLost | Self::ReconnectExhausted => {
                Target::Enter(Mode::Provisioning)
            }
            Self::SubsystemShutdownRequested => Target::Enter(Mode::Active),
            Self::CredentialsConfigured | Self::RestartRequested => Target::Restart,
            Self::SubsystemInitFailed(Mode::Active) => Target::Enter(Mode::Provisioning),
            Self::SubsystemInitFailed(Mode::Admin) => Target::Enter(Mode::Active),
            Self::SubsystemInitFailed(Mode::Provisioning) => Target::Halt,
            Self::ConnectivityAbsent(Mode::Admin) => Target::Enter(Mode::Active),
            Self::ConnectivityAbsent(_) => Target::Enter(Mode::Provisioning),
            Self::Requested(mode) => Target::Enter(mode),
        }
    }
}

impl fmt::Display for TransitionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boot { connected: true } => write!(f, "boot, link up"),
            Self::Boot { connected: false } => write!(f, "boot, no link"),
            Self::Timeout(mode) => write!(f, "{} timeout", mode),
            Self::ConnectivityLost => write!(f, "connectivity lost without credentials"),
            Self::ReconnectExhausted => write!(f, "reconnect attempts exhausted"),
            Self::SubsystemShutdownRequested => write!(f, "subsystem requested shutdown"),
            Self::CredentialsConfigured => write!(f, "credentials configured"),
            Self::SubsystemInitFailed(mode) => write!(f, "{} init failed", mode),
            Self::ConnectivityAbsent(mode) => write!(f, "{} needs connectivity", mode),
            Self::Requested(mode) => write!(f, "{} requested", mode),
            Self::RestartRequested => write!(f, "restart requested"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_timeout_depends_on_credentials() {
        let event = TransitionEvent::Timeout(Mode::Provisioning);
        assert_eq!(event.target(true), Target::Enter(Mode::Active));
        assert_eq!(event.target(false), Target::Enter(Mode::Provisioning));
    }

    #[test]
    fn test_admin_exits_to_active() {
        assert_eq!(
            TransitionEvent::Timeout(Mode::Admin).target(false),
            Target::Enter(Mode::Active)
        );
        assert_eq!(
            TransitionEvent::SubsystemShutdownRequested.target(true),
            Target::Enter(Mode::Active)
        );
    }

    #[test]
    fn test_init_failure_fallbacks() {
        assert_eq!(
            TransitionEvent::SubsystemInitFailed(Mode::Active).target(true),
            Target::Enter(Mode::Provisioning)
        );
        assert_eq!(
            TransitionEvent::SubsystemInitFailed(Mode::Admin).target(true),
            Target::Enter(Mode::Active)
        );
        assert_eq!(
            TransitionEvent::SubsystemInitFailed(Mode::Provisioning).target(true),
            Target::Halt
        );
    }

    #[test]
    fn test_connectivity_redirects() {
        assert_eq!(
            TransitionEvent::ConnectivityAbsent(Mode::Admin).target(true),
            Target::Enter(Mode::Active)
        );
        assert_eq!(
            TransitionEvent::ConnectivityAbsent(Mode::Active).target(true),
            Target::Enter(Mode::Provisioning)
        );
        assert_eq!(
            TransitionEvent::ConnectivityLost.target(false),
            Target::Enter(Mode::Provisioning)
        );
    }

    #[test]
    fn test_restart_events() {
        assert_eq!(
            TransitionEvent::CredentialsConfigured.target(true),
            Target::Restart
        );
        assert_eq!(TransitionEvent::RestartRequested.target(false), Target::Restart);
    }

    #[test]
    fn test_only_provisioning_skips_connectivity() {
        assert!(!Mode::Provisioning.needs_connectivity());
        assert!(Mode::Active.needs_connectivity());
        assert!(Mode::Admin.needs_connectivity());
    }

    #[test]
    fn test_event_display() {
        assert_eq!(
            TransitionEvent::Timeout(Mode::Admin).to_string(),
            "ADMIN timeout"
        );
        assert_eq!(Mode::Active.to_string(), "ACTIVE");
    }
}
