//! Mode orchestrator.
//!
//! Owns the current [`Mode`], the single live [`Subsystem`] and the radio.
//! One cooperative [`Orchestrator::tick`] applies the previous tick's
//! subsystem events, then queued [`Intent`]s, then the transition table, and
//! only if nothing fired hands one tick to the subsystem.
//!
//! Every mode entry follows the same protocol:
//!
//! 1. tear down the outgoing subsystem (`end()`, drop, lower the AP)
//! 2. update `mode` and the entry timestamp, record the transition
//! 3. check the connectivity precondition
//! 4. create the new subsystem and call `begin()`
//! 5. on failure call `end()` and follow the mode's fallback
//!
//! The outgoing subsystem is always dropped before the factory is asked for
//! the next one, so two subsystems never hold the radio or a listener port
//! at the same time.

mod commands;

pub use commands::{Command, CommandError, Control, Diagnostic, HELP_TEXT};

use crate::clock::{Clock, SystemClock};
use crate::config::{Credentials, OrchestratorSettings};
use crate::identity::DeviceIdentity;
use crate::mode::{Mode, Target, TransitionEvent};
use crate::network::NetworkLayer;
use crate::platform;
use crate::registration::{RegistrationInfo, RegistrationRequest};
use crate::store::{self, keys, ConfigStore, ConfigStoreExt, MigrationHook, StoreError};
use crate::subsystem::{
    DeviceProfile, Subsystem, SubsystemContext, SubsystemEvent, SubsystemFactory, TickContext,
};
use log::{debug, error, info, warn};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Upper bound on chained mode entries for one transition
/// (Admin -> Active -> Provisioning -> halt is the longest chain).
const MAX_MODE_ENTRIES: usize = 4;

/// Transitions listed by the `state` command.
const STATE_HISTORY_LINES: usize = 5;

/// Externally requested action, applied at the next tick boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
    EnterMode(Mode),
    Restart,
    /// Store new credentials and restart to apply them.
    Configure {
        credentials: Credentials,
        profile: DeviceProfile,
    },
}

/// Why a restart was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartReason {
    CredentialsConfigured,
    Requested,
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CredentialsConfigured => write!(f, "new credentials stored"),
            Self::Requested => write!(f, "restart requested"),
        }
    }
}

/// Result of one [`Orchestrator::tick`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// No transition; the subsystem (if ready) was ticked.
    Continue,
    /// A transition settled in the given mode.
    Transitioned(Mode),
    /// Provisioning could not start. Only a restart request is honored.
    Halted,
    /// Resources are released; the caller must restart the process.
    Restart(RestartReason),
}

/// One entry of the transition history.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionRecord {
    /// `None` for the first entry after boot.
    pub from: Option<Mode>,
    pub to: Target,
    pub event: TransitionEvent,
    pub at: Instant,
}

#[derive(Debug, Default, Clone, Copy)]
struct ReconnectState {
    attempts: u32,
    last_attempt: Option<Instant>,
}

/// The mode state machine.
pub struct Orchestrator<S, N, F, C = SystemClock>
where
    S: ConfigStore,
    N: NetworkLayer,
    F: SubsystemFactory,
    C: Clock,
{
    store: S,
    network: N,
    factory: F,
    clock: C,
    settings: OrchestratorSettings,
    migration: MigrationHook,
    identity: DeviceIdentity,
    started: bool,
    started_at: Instant,
    mode: Mode,
    mode_entered_at: Instant,
    active: Option<Box<dyn Subsystem>>,
    access_point_up: bool,
    halted: bool,
    pending_restart: Option<RestartReason>,
    /// Last loaded credentials, kept only for reconnect attempts.
    credentials: Option<Credentials>,
    reconnect: ReconnectState,
    intents: VecDeque<Intent>,
    events: Vec<SubsystemEvent>,
    registrations: Vec<RegistrationRequest>,
    /// A registration was handed out and its outcome is not known yet.
    registration_in_flight: bool,
    history: VecDeque<TransitionRecord>,
}

impl<S, N, F, C> Orchestrator<S, N, F, C>
where
    S: ConfigStore,
    N: NetworkLayer,
    F: SubsystemFactory,
    C: Clock,
{
    /// Build an orchestrator. The device identity is derived from the radio
    /// MAC here; nothing else happens until [`begin`](Self::begin).
    pub fn new(store: S, network: N, factory: F, clock: C, settings: OrchestratorSettings) -> Self {
        let identity = DeviceIdentity::from_mac(network.mac_address());
        let now = clock.now();
        Self {
            store,
            network,
            factory,
            clock,
            settings,
            migration: store::default_migration(),
            identity,
            started: false,
            started_at: now,
            mode: Mode::Provisioning,
            mode_entered_at: now,
            active: None,
            access_point_up: false,
            halted: false,
            pending_restart: None,
            credentials: None,
            reconnect: ReconnectState::default(),
            intents: VecDeque::new(),
            events: Vec::new(),
            registrations: Vec::new(),
            registration_in_flight: false,
            history: VecDeque::new(),
        }
    }

    /// Replace the schema migration hook run by [`begin`](Self::begin).
    pub fn with_migration(mut self, hook: MigrationHook) -> Self {
        self.migration = hook;
        self
    }

    /// Open storage, connect if credentials exist and enter the first mode.
    ///
    /// This is the only call that blocks: the connect attempt is polled for
    /// at most `boot_connect_timeout`. Only a store that cannot be opened is
    /// fatal; a failed migration is logged and boot continues unmigrated.
    pub fn begin(&mut self) -> Result<Mode, OrchestratorError> {
        if self.started {
            return Err(OrchestratorError::AlreadyStarted);
        }

        info!("Starting controller {}", self.identity);
        self.store
            .open()
            .map_err(OrchestratorError::StorageUnavailable)?;
        match store::prepare(&mut self.store, &mut self.migration) {
            Ok(schema) => debug!("Config schema: {:?}", schema),
            Err(e) => error!("Config migration failed, schema left unstamped: {}", e),
        }

        self.adopt_identity();
        self.settings = self.settings.clone().with_overrides(&self.store);

        self.credentials = match self.store.load_credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("Stored credentials unusable: {}", e);
                None
            }
        };

        let connected = match self.credentials.clone() {
            Some(credentials) => self.boot_connect(&credentials),
            None => {
                info!("No stored credentials");
                false
            }
        };

        self.started = true;
        self.started_at = self.clock.now();
        self.transition(TransitionEvent::Boot { connected });
        Ok(self.mode)
    }

    /// Run one cooperative iteration.
    pub fn tick(&mut self) -> TickOutcome {
        if let Some(reason) = self.pending_restart {
            return TickOutcome::Restart(reason);
        }
        if !self.started {
            debug!("tick() before begin(), ignoring");
            return TickOutcome::Continue;
        }
        if self.halted {
            return self.tick_halted();
        }

        let now = self.clock.now();
        let mut transitioned = false;

        for event in std::mem::take(&mut self.events) {
            if let Some(outcome) = self.apply_event(event) {
                return outcome;
            }
        }

        while let Some(intent) = self.intents.pop_front() {
            match intent {
                Intent::EnterMode(mode) if mode == self.mode => {
                    info!("Already in {}", mode);
                }
                Intent::EnterMode(mode) => {
                    self.transition(TransitionEvent::Requested(mode));
                    transitioned = true;
                }
                Intent::Restart => {
                    return self.restart(TransitionEvent::RestartRequested);
                }
                Intent::Configure {
                    credentials,
                    profile,
                } => {
                    if let Some(outcome) = self.apply_credentials(credentials, profile) {
                        return outcome;
                    }
                }
            }
            if self.halted {
                return TickOutcome::Halted;
            }
        }

        if !transitioned {
            if let Some(event) = self.evaluate(now) {
                self.transition(event);
                transitioned = true;
            }
        }

        if self.halted {
            TickOutcome::Halted
        } else if transitioned {
            TickOutcome::Transitioned(self.mode)
        } else {
            self.delegate(now);
            TickOutcome::Continue
        }
    }

    /// Queue an intent for the next tick.
    pub fn request(&mut self, intent: Intent) {
        debug!("Intent queued: {:?}", intent);
        self.intents.push_back(intent);
    }

    /// Execute one console command line.
    pub fn handle_command(&mut self, line: &str) -> Result<String, CommandError> {
        let command = Command::parse(line)?;

        if self.halted {
            let allowed = matches!(
                command,
                Command::Control(Control::Help | Control::State | Control::Reset)
                    | Command::Diagnostic(Diagnostic::RadioStatus)
            );
            if !allowed {
                return Err(CommandError::Halted {
                    command: line.trim().to_string(),
                });
            }
        }

        match command {
            Command::Diagnostic(diagnostic) => self.diagnostic(diagnostic),
            Command::Control(control) => Ok(self.control(control)),
        }
    }

    /// Registrations waiting to be sent by the runtime.
    pub fn take_registrations(&mut self) -> Vec<RegistrationRequest> {
        std::mem::take(&mut self.registrations)
    }

    /// The runtime delivered the pending registration.
    pub fn registration_delivered(&mut self) {
        self.registration_in_flight = false;
        match self.store.remove(keys::REGISTRATION_PENDING) {
            Ok(_) => info!("Device registration delivered"),
            Err(e) => warn!("Failed to clear pending registration: {}", e),
        }
    }

    /// The runtime gave up on a registration; the next ACTIVE entry retries.
    pub fn registration_failed(&mut self) {
        self.registration_in_flight = false;
    }

    /// Whether a queued registration still awaits its outcome.
    pub fn registration_in_flight(&self) -> bool {
        self.registration_in_flight
    }

    /// Tear down the live subsystem and lower the AP.
    pub fn shutdown(&mut self) {
        info!("Shutting down from {}", self.mode);
        self.teardown();
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Mode of the live subsystem, if any.
    pub fn active_mode(&self) -> Option<Mode> {
        self.active.as_ref().map(|s| s.mode())
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    pub fn pending_restart(&self) -> Option<RestartReason> {
        self.pending_restart
    }

    pub fn time_in_mode(&self) -> Duration {
        self.clock.now().saturating_duration_since(self.mode_entered_at)
    }

    pub fn mode_entered_at(&self) -> Instant {
        self.mode_entered_at
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn settings(&self) -> &OrchestratorSettings {
        &self.settings
    }

    /// Recent transitions, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TransitionRecord> {
        self.history.iter()
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }

    pub fn network(&self) -> &N {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut N {
        &mut self.network
    }

    // ==================== Boot ====================

    fn adopt_identity(&mut self) {
        match self.store.get_str(keys::DEVICE_ID) {
            Ok(Some(stored)) if !stored.is_empty() => {
                if stored != self.identity.device_id() {
                    info!(
                        "Using stored device id {} (derived {})",
                        stored, self.identity
                    );
                }
                self.identity = self.identity.clone().with_device_id(stored);
            }
            Ok(_) => match self.store.set_str(keys::DEVICE_ID, self.identity.device_id()) {
                Ok(()) => info!("Device id {} stored", self.identity),
                Err(e) => warn!("Failed to store device id: {}", e),
            },
            Err(e) => warn!("Failed to read device id: {}", e),
        }
    }

    fn boot_connect(&mut self, credentials: &Credentials) -> bool {
        info!(
            "Connecting to '{}' (up to {}s)",
            credentials.ssid(),
            self.settings.boot_connect_timeout.as_secs()
        );
        if let Err(e) = self.network.begin_connect(credentials) {
            warn!("Connect request rejected: {}", e);
            return false;
        }

        let start = self.clock.now();
        let deadline = start + self.settings.boot_connect_timeout;
        let mut polls = 0u32;
        loop {
            if self.network.is_connected() {
                info!("Connected to '{}'", credentials.ssid());
                return true;
            }
            let now = self.clock.now();
            if now >= deadline {
                warn!(
                    "Connection to '{}' not established, last status {}",
                    credentials.ssid(),
                    self.network.link_state()
                );
                return false;
            }
            self.clock.sleep(self.settings.boot_poll_interval);
            polls += 1;
            if self.settings.boot_report_every > 0 && polls % self.settings.boot_report_every == 0 {
                info!(
                    "Still connecting: {} ({}s)",
                    self.network.link_state(),
                    self.clock.now().saturating_duration_since(start).as_secs()
                );
            }
        }
    }

    // ==================== Tick Steps ====================

    fn tick_halted(&mut self) -> TickOutcome {
        self.events.clear();
        while let Some(intent) = self.intents.pop_front() {
            if intent == Intent::Restart {
                return self.restart(TransitionEvent::RestartRequested);
            }
            debug!("Ignoring {:?} while halted", intent);
        }
        TickOutcome::Halted
    }

    fn apply_event(&mut self, event: SubsystemEvent) -> Option<TickOutcome> {
        match event {
            SubsystemEvent::RegistrationReceived(info) => {
                self.store_registration(&info);
                if self.network.is_connected() {
                    self.queue_registration(info);
                }
                None
            }
            SubsystemEvent::CredentialsConfigured {
                credentials,
                profile,
            } => self.apply_credentials(credentials, profile),
            SubsystemEvent::RestartRequested => {
                Some(self.restart(TransitionEvent::RestartRequested))
            }
        }
    }

    fn apply_credentials(
        &mut self,
        credentials: Credentials,
        profile: DeviceProfile,
    ) -> Option<TickOutcome> {
        if let Err(e) = self.store.save_credentials(&credentials) {
            error!("Failed to save credentials, staying in {}: {}", self.mode, e);
            return None;
        }
        for (key, value) in [
            (keys::DEVICE_NAME, profile.device_name.as_deref()),
            (keys::LOCATION, profile.location.as_deref()),
        ] {
            if let Some(value) = value.filter(|v| !v.is_empty()) {
                if let Err(e) = self.store.set_str(key, value) {
                    warn!("Failed to store {}: {}", key, e);
                }
            }
        }
        self.credentials = Some(credentials);
        Some(self.restart(TransitionEvent::CredentialsConfigured))
    }

    /// Check the transition table for the current mode.
    fn evaluate(&mut self, now: Instant) -> Option<TransitionEvent> {
        let in_mode = now.saturating_duration_since(self.mode_entered_at);
        match self.mode {
            Mode::Provisioning => (in_mode > self.settings.provisioning_timeout)
                .then_some(TransitionEvent::Timeout(Mode::Provisioning)),
            Mode::Admin => {
                let shutdown = self
                    .active
                    .as_ref()
                    .is_some_and(|s| s.shutdown_requested(now));
                if shutdown {
                    Some(TransitionEvent::SubsystemShutdownRequested)
                } else if in_mode > self.settings.admin_session {
                    Some(TransitionEvent::Timeout(Mode::Admin))
                } else {
                    None
                }
            }
            Mode::Active => self.check_link(now),
        }
    }

    /// Active-mode connectivity check. Issues at most one non-blocking
    /// reconnect per `reconnect_interval`.
    fn check_link(&mut self, now: Instant) -> Option<TransitionEvent> {
        if self.network.is_connected() {
            if self.reconnect.attempts > 0 {
                info!(
                    "Link restored after {} reconnect attempt(s)",
                    self.reconnect.attempts
                );
                self.reconnect = ReconnectState::default();
            }
            return None;
        }

        let credentials = match self.store.load_credentials() {
            Ok(credentials) => credentials,
            Err(e) => {
                warn!("Cannot reload credentials ({}), using last known", e);
                self.credentials.clone()
            }
        };
        let Some(credentials) = credentials else {
            warn!("Link lost and no credentials stored");
            self.credentials = None;
            return Some(TransitionEvent::ConnectivityLost);
        };

        let due = self.reconnect.last_attempt.map_or(true, |last| {
            now.saturating_duration_since(last) >= self.settings.reconnect_interval
        });
        if due {
            if self.reconnect.attempts >= self.settings.reconnect_max_attempts {
                warn!(
                    "Link still {} after {} reconnect attempts",
                    self.network.link_state(),
                    self.reconnect.attempts
                );
                return Some(TransitionEvent::ReconnectExhausted);
            }
            self.reconnect.attempts += 1;
            self.reconnect.last_attempt = Some(now);
            warn!(
                "Link {}, reconnect attempt {}/{} to '{}'",
                self.network.link_state(),
                self.reconnect.attempts,
                self.settings.reconnect_max_attempts,
                credentials.ssid()
            );
            if let Err(e) = self.network.begin_connect(&credentials) {
                warn!("Reconnect request rejected: {}", e);
            }
        }
        self.credentials = Some(credentials);
        None
    }

    fn delegate(&mut self, now: Instant) {
        let Some(subsystem) = self.active.as_mut() else {
            return;
        };
        if !subsystem.is_ready() {
            debug!("{} subsystem not ready, skipping tick", subsystem.mode());
            return;
        }
        let link = self.network.snapshot();
        let mut ctx = TickContext::new(now, &link, &mut self.events);
        subsystem.tick(&mut ctx);
    }

    // ==================== Transitions ====================

    /// Resolve `event` and follow redirects until a mode settles.
    fn transition(&mut self, mut event: TransitionEvent) {
        for _ in 0..MAX_MODE_ENTRIES {
            let now = self.clock.now();
            match event.target(self.store.has_credentials()) {
                Target::Enter(mode) => match self.enter(mode, event, now) {
                    Ok(()) => return,
                    Err(next) => event = next,
                },
                Target::Halt => {
                    self.halt(event, now);
                    return;
                }
                Target::Restart => {
                    self.restart(event);
                    return;
                }
            }
        }
        error!("Mode entry did not settle after {} attempts", MAX_MODE_ENTRIES);
        let now = self.clock.now();
        self.halt(event, now);
    }

    /// Mode-entry protocol. Returns the follow-up event when the mode could
    /// not be entered.
    fn enter(
        &mut self,
        mode: Mode,
        event: TransitionEvent,
        now: Instant,
    ) -> Result<(), TransitionEvent> {
        let from = match event {
            TransitionEvent::Boot { .. } => None,
            _ => Some(self.mode),
        };

        self.teardown();
        self.set_mode(mode, now);
        self.record(from, Target::Enter(mode), event, now);
        match from {
            Some(from) => info!("Mode {} -> {} ({})", from, mode, event),
            None => info!("Mode {} ({})", mode, event),
        }

        if mode.needs_connectivity() && !self.network.is_connected() {
            warn!(
                "{} needs a WiFi link, status is {}",
                mode,
                self.network.link_state()
            );
            self.request_connect();
            return Err(TransitionEvent::ConnectivityAbsent(mode));
        }

        if mode == Mode::Provisioning {
            match self.network.start_access_point(self.identity.device_id()) {
                Ok(ip) => {
                    self.access_point_up = true;
                    info!("Access point '{}' up at {}", self.identity, ip);
                }
                Err(e) => {
                    error!("Access point failed: {}", e);
                    return Err(TransitionEvent::SubsystemInitFailed(mode));
                }
            }
        }

        let ctx = SubsystemContext {
            identity: self.identity.clone(),
            settings: self.settings.clone(),
            link: self.network.snapshot(),
        };
        let mut subsystem = self.factory.create(mode, &ctx);
        if let Err(e) = subsystem.begin(now) {
            error!("{} subsystem failed to start: {}", mode, e);
            subsystem.end();
            drop(subsystem);
            self.teardown();
            return Err(TransitionEvent::SubsystemInitFailed(mode));
        }
        self.active = Some(subsystem);

        if mode == Mode::Active {
            self.reconnect = ReconnectState::default();
            if self.registration_in_flight {
                debug!("Registration still in flight, not queuing again");
            } else if let Some(info) = self.pending_registration() {
                self.queue_registration(info);
            }
        }
        Ok(())
    }

    fn halt(&mut self, event: TransitionEvent, now: Instant) {
        self.teardown();
        self.halted = true;
        self.intents.clear();
        self.record(Some(self.mode), Target::Halt, event, now);
        error!(
            "Controller halted in {} ({}); only 'reset' is accepted",
            self.mode, event
        );
    }

    fn restart(&mut self, event: TransitionEvent) -> TickOutcome {
        let reason = match event {
            TransitionEvent::CredentialsConfigured => RestartReason::CredentialsConfigured,
            _ => RestartReason::Requested,
        };
        let now = self.clock.now();
        self.teardown();
        self.record(Some(self.mode), Target::Restart, event, now);
        info!("Restart scheduled from {} ({})", self.mode, reason);
        self.pending_restart = Some(reason);
        TickOutcome::Restart(reason)
    }

    /// Release the live subsystem and the access point.
    fn teardown(&mut self) {
        let released = match self.active.take() {
            Some(mut subsystem) => {
                let mode = subsystem.mode();
                subsystem.end();
                drop(subsystem);
                debug!("{} subsystem released", mode);
                true
            }
            None => false,
        };
        if self.access_point_up {
            if let Err(e) = self.network.stop_access_point() {
                warn!("Failed to stop access point: {}", e);
            }
            self.access_point_up = false;
        }
        if released {
            platform::log_free_heap("teardown");
        }
    }

    fn set_mode(&mut self, mode: Mode, now: Instant) {
        self.mode = mode;
        self.mode_entered_at = now.max(self.mode_entered_at);
    }

    fn record(&mut self, from: Option<Mode>, to: Target, event: TransitionEvent, at: Instant) {
        if self.settings.history_capacity == 0 {
            return;
        }
        while self.history.len() >= self.settings.history_capacity {
            self.history.pop_front();
        }
        self.history.push_back(TransitionRecord {
            from,
            to,
            event,
            at,
        });
    }

    /// Start a background association so a later entry can find the link up.
    fn request_connect(&mut self) {
        if let Some(credentials) = &self.credentials {
            if let Err(e) = self.network.begin_connect(credentials) {
                warn!("Connect request rejected: {}", e);
            }
        }
    }

    // ==================== Registration ====================

    fn store_registration(&mut self, info: &RegistrationInfo) {
        for (key, value) in [
            (keys::USER_EMAIL, Some(info.email.as_str())),
            (keys::DEVICE_NAME, info.device_name.as_deref()),
            (keys::LOCATION, info.location.as_deref()),
        ] {
            if let Some(value) = value {
                if let Err(e) = self.store.set_str(key, value) {
                    warn!("Failed to store {}: {}", key, e);
                }
            }
        }
        if let Err(e) = self.store.set_i32(keys::REGISTRATION_PENDING, 1) {
            warn!("Failed to mark registration pending: {}", e);
        }
        info!("Registration details stored for {}", info.email);
    }

    fn pending_registration(&self) -> Option<RegistrationInfo> {
        match self.store.get_i32(keys::REGISTRATION_PENDING) {
            Ok(Some(flag)) if flag != 0 => {}
            _ => return None,
        }
        let email = self.store.get_str(keys::USER_EMAIL).ok().flatten()?;
        match RegistrationInfo::new(email) {
            Ok(info) => Some(
                info.with_device_name(self.store.get_str(keys::DEVICE_NAME).ok().flatten())
                    .with_location(self.store.get_str(keys::LOCATION).ok().flatten()),
            ),
            Err(e) => {
                warn!("Pending registration dropped: {}", e);
                None
            }
        }
    }

    fn queue_registration(&mut self, info: RegistrationInfo) {
        let request = RegistrationRequest {
            device_id: self.identity.device_id().to_string(),
            mac_address: self.identity.mac_string(),
            ip_address: self.network.snapshot().ip.map(|ip| ip.to_string()),
            default_device_name: self.identity.default_device_name(),
            info,
        };
        info!("Registration queued for {}", request.info.email);
        self.registrations.push(request);
        self.registration_in_flight = true;
    }

    // ==================== Commands ====================

    fn diagnostic(&self, diagnostic: Diagnostic) -> Result<String, CommandError> {
        if !diagnostic.available_in(self.mode) {
            return Err(CommandError::NotAvailable {
                command: diagnostic.name(),
                mode: self.mode,
            });
        }
        let now = self.clock.now();
        Ok(match diagnostic.query() {
            None => self.network.snapshot().describe(),
            Some(query) => self
                .active
                .as_ref()
                .and_then(|s| s.report(query, now))
                .unwrap_or_else(|| format!("{} subsystem not running", self.mode)),
        })
    }

    fn control(&mut self, control: Control) -> String {
        match control {
            Control::Help => HELP_TEXT.trim().to_string(),
            Control::State => self.describe_state(),
            Control::Reset => {
                self.request(Intent::Restart);
                "Restart scheduled".to_string()
            }
            Control::Wifi | Control::Hydro | Control::Admin => {
                let Some(mode) = control.target_mode() else {
                    return String::new();
                };
                if mode == self.mode {
                    format!("Already in {}", mode)
                } else {
                    self.request(Intent::EnterMode(mode));
                    format!("Switching to {}", mode)
                }
            }
        }
    }

    fn describe_state(&self) -> String {
        let now = self.clock.now();
        let mut out = format!(
            "Mode: {} ({}s)\nDevice: {}\nUptime: {}s",
            self.mode,
            self.time_in_mode().as_secs(),
            self.identity,
            now.saturating_duration_since(self.started_at).as_secs()
        );
        if self.halted {
            out.push_str("\nHALTED: use 'reset' to restart");
        }
        if let Some(reason) = self.pending_restart {
            out.push_str(&format!("\nRestart pending: {}", reason));
        }
        let skip = self.history.len().saturating_sub(STATE_HISTORY_LINES);
        if skip < self.history.len() {
            out.push_str("\nRecent transitions:");
        }
        for record in self.history.iter().skip(skip) {
            let to = match record.to {
                Target::Enter(mode) => mode.as_str(),
                Target::Restart => "RESTART",
                Target::Halt => "HALT",
            };
            out.push_str(&format!(
                "\n  [{}s] {} -> {} ({})",
                record
                    .at
                    .saturating_duration_since(self.started_at)
                    .as_secs(),
                record.from.map_or("BOOT", |m| m.as_str()),
                to,
                record.event
            ));
        }
        out
    }
}

impl<S, N, F, C> Drop for Orchestrator<S, N, F, C>
where
    S: ConfigStore,
    N: NetworkLayer,
    F: SubsystemFactory,
    C: Clock,
{
    fn drop(&mut self) {
        self.teardown();
    }
}

/// Errors that stop the orchestrator from starting.
#[derive(Debug)]
pub enum OrchestratorError {
    /// Persistent storage could not be opened. Restart is the only remedy.
    StorageUnavailable(StoreError),
    /// `begin()` was called twice.
    AlreadyStarted,
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StorageUnavailable(e) => write!(f, "config storage unavailable: {}", e),
            Self::AlreadyStarted => write!(f, "orchestrator already started"),
        }
    }
}

impl std::error::Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::StorageUnavailable(e) => Some(e),
            Self::AlreadyStarted => None,
        }
    }
}
