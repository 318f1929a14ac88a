//! Console command surface.
//!
//! Two families of case-sensitive commands:
//!
//! - **Diagnostics** answer a status query. Each is bound to one mode except
//!   `radio_status`, which works everywhere.
//! - **Controls** (`help`, `state`, `wifi`, `hydro`, `admin`, `reset`) work in
//!   every mode; mode switches and restarts are queued as intents and
//!   applied at the next tick.
//!
//! # Example Session
//!
//! ```text
//! > hydro_status
//! Command 'hydro_status' not available in current mode (PROVISIONING)
//!
//! > wifi_status
//! Provisioning portal: running
//! ...
//! ```

use crate::mode::Mode;
use crate::subsystem::StatusQuery;
use std::fmt;

/// Mode-scoped status commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    WifiStatus,
    HydroStatus,
    Relays,
    AdminStatus,
    RadioStatus,
}

impl Diagnostic {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WifiStatus => "wifi_status",
            Self::HydroStatus => "hydro_status",
            Self::Relays => "relays",
            Self::AdminStatus => "admin_status",
            Self::RadioStatus => "radio_status",
        }
    }

    /// Mode the command is bound to; `None` for global commands.
    pub fn mode(&self) -> Option<Mode> {
        match self {
            Self::WifiStatus => Some(Mode::Provisioning),
            Self::HydroStatus | Self::Relays => Some(Mode::Active),
            Self::AdminStatus => Some(Mode::Admin),
            Self::RadioStatus => None,
        }
    }

    /// Subsystem query answering this command; `None` if the orchestrator
    /// answers it itself.
    pub fn query(&self) -> Option<StatusQuery> {
        match self {
            Self::WifiStatus => Some(StatusQuery::Wifi),
            Self::HydroStatus => Some(StatusQuery::Hydro),
            Self::Relays => Some(StatusQuery::Relays),
            Self::AdminStatus => Some(StatusQuery::Admin),
            Self::RadioStatus => None,
        }
    }

    pub fn available_in(&self, mode: Mode) -> bool {
        self.mode().map_or(true, |m| m == mode)
    }
}

/// Mode-independent control commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    Help,
    State,
    /// Switch to Provisioning.
    Wifi,
    /// Switch to Active.
    Hydro,
    /// Switch to Admin.
    Admin,
    /// Restart the device.
    Reset,
}

impl Control {
    /// Mode requested by a switch command.
    pub fn target_mode(&self) -> Option<Mode> {
        match self {
            Self::Wifi => Some(Mode::Provisioning),
            Self::Hydro => Some(Mode::Active),
            Self::Admin => Some(Mode::Admin),
            _ => None,
        }
    }
}

/// A parsed console command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Diagnostic(Diagnostic),
    Control(Control),
}

impl Command {
    /// Parse one console line. Matching is case-sensitive.
    pub fn parse(input: &str) -> Result<Self, CommandError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(CommandError::Empty);
        }

        let cmd = match input {
            "wifi_status" => Self::Diagnostic(Diagnostic::WifiStatus),
            "hydro_status" => Self::Diagnostic(Diagnostic::HydroStatus),
            "relays" => Self::Diagnostic(Diagnostic::Relays),
            "admin_status" => Self::Diagnostic(Diagnostic::AdminStatus),
            "radio_status" => Self::Diagnostic(Diagnostic::RadioStatus),
            "help" => Self::Control(Control::Help),
            "state" | "status" => Self::Control(Control::State),
            "wifi" => Self::Control(Control::Wifi),
            "hydro" => Self::Control(Control::Hydro),
            "admin" => Self::Control(Control::Admin),
            "reset" => Self::Control(Control::Reset),
            other => return Err(CommandError::Unknown(other.to_string())),
        };
        Ok(cmd)
    }
}

/// Help text for available commands.
pub const HELP_TEXT: &str = r#"
Available commands:
  state          Show mode, time in mode and recent transitions
  wifi           Switch to provisioning mode (access point portal)
  hydro          Switch to active mode
  admin          Open an admin session (needs WiFi)
  reset          Restart the device
  radio_status   Show WiFi link status (any mode)
  wifi_status    Portal status (provisioning mode)
  hydro_status   Controller status (active mode)
  relays         Relay states (active mode)
  admin_status   Session status (admin mode)
  help           Show this help
"#;

/// Command rejections. None of them change state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    Unknown(String),
    NotAvailable { command: &'static str, mode: Mode },
    /// Orchestrator halted after a provisioning failure.
    Halted { command: String },
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "Empty command. Type 'help' for commands."),
            Self::Unknown(cmd) => {
                write!(f, "Unknown command: {}. Type 'help' for commands.", cmd)
            }
            Self::NotAvailable { command, mode } => write!(
                f,
                "Command '{}' not available in current mode ({})",
                command, mode
            ),
            Self::Halted { command } => write!(
                f,
                "Controller halted; '{}' unavailable. Use 'reset' to restart.",
                command
            ),
        }
    }
}

impl std::error::Error for CommandError {}
