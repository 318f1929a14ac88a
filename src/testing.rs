//! Deterministic doubles for driving the orchestrator in tests.
//!
//! **Note:** This module is only available under `cfg(test)` or with the
//! `test-util` feature, so none of it ends up in firmware builds.
//!
//! - [`ManualClock`] - time only moves when a test (or the boot wait) says so
//! - [`ScriptedNetwork`] - radio whose connect outcome is chosen up front
//! - [`ScriptedFactory`] - subsystems that record every lifecycle call in a
//!   shared [`Ledger`]
//! - [`free_tcp_port`] - a port for tests that bind real listeners
//!
//! # Usage
//!
//! ```ignore
//! use hydro_esp32::testing::{ManualClock, ScriptedFactory, ScriptedNetwork};
//!
//! let clock = ManualClock::new();
//! let factory = ScriptedFactory::new();
//! let script = factory.script();
//! let mut orch = Orchestrator::new(store, ScriptedNetwork::new(), factory, clock.clone(), settings);
//! orch.begin()?;
//! assert_eq!(script.borrow().live, 1);
//! ```

use crate::clock::Clock;
use crate::config::Credentials;
use crate::mode::Mode;
use crate::network::{LinkSnapshot, LinkState, NetworkError, NetworkLayer};
use crate::subsystem::{
    StatusQuery, Subsystem, SubsystemContext, SubsystemError, SubsystemEvent, SubsystemFactory,
    TickContext,
};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{IpAddr, Ipv4Addr, TcpListener};
use std::rc::Rc;
use std::time::{Duration, Instant};

// ==================== Clock ====================

/// Clock that only advances on request. Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Rc<Cell<Instant>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(Instant::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.now.get()
    }

    /// Advances instead of blocking.
    fn sleep(&self, duration: Duration) {
        self.advance(duration);
    }
}

// ==================== Network ====================

/// How [`ScriptedNetwork`] answers `begin_connect`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    /// Link comes up immediately.
    Accept,
    /// Association is rejected (`ConnectFailed`).
    Reject,
    /// Nothing happens; the link stays where it was.
    Ignore,
}

/// Station address reported while connected.
pub const SCRIPTED_STA_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 1, 50));

/// Access point address reported while the AP is raised.
pub const SCRIPTED_AP_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(192, 168, 4, 1));

/// Radio double commanded only through [`NetworkLayer`] and the test hooks.
#[derive(Debug)]
pub struct ScriptedNetwork {
    state: LinkState,
    behavior: ConnectBehavior,
    ssid: Option<String>,
    connect_attempts: Vec<String>,
    ap_name: Option<String>,
    ap_starts: u32,
    ap_fails: bool,
    mac: [u8; 6],
}

impl ScriptedNetwork {
    /// Disconnected radio that accepts the first connect request.
    pub fn new() -> Self {
        Self {
            state: LinkState::Disconnected,
            behavior: ConnectBehavior::Accept,
            ssid: None,
            connect_attempts: Vec::new(),
            ap_name: None,
            ap_starts: 0,
            ap_fails: false,
            mac: [0x24, 0x6f, 0x28, 0xab, 0xcd, 0xef],
        }
    }

    pub fn with_behavior(mut self, behavior: ConnectBehavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn set_behavior(&mut self, behavior: ConnectBehavior) {
        self.behavior = behavior;
    }

    /// Make `start_access_point` fail from now on.
    pub fn fail_access_point(&mut self, fail: bool) {
        self.ap_fails = fail;
    }

    /// Simulate the access point dropping the station.
    pub fn drop_link(&mut self) {
        self.state = LinkState::ConnectionLost;
    }

    /// Simulate the station re-associating on its own.
    pub fn restore_link(&mut self) {
        self.state = LinkState::Connected;
    }

    /// SSIDs passed to `begin_connect`, in order.
    pub fn connect_attempts(&self) -> &[String] {
        &self.connect_attempts
    }

    pub fn access_point(&self) -> Option<&str> {
        self.ap_name.as_deref()
    }

    /// Number of successful `start_access_point` calls.
    pub fn access_point_starts(&self) -> u32 {
        self.ap_starts
    }
}

impl Default for ScriptedNetwork {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkLayer for ScriptedNetwork {
    fn begin_connect(&mut self, credentials: &Credentials) -> Result<(), NetworkError> {
        self.connect_attempts.push(credentials.ssid().to_string());
        self.ssid = Some(credentials.ssid().to_string());
        match self.behavior {
            ConnectBehavior::Accept => self.state = LinkState::Connected,
            ConnectBehavior::Reject => self.state = LinkState::ConnectFailed,
            ConnectBehavior::Ignore => {}
        }
        Ok(())
    }

    fn link_state(&self) -> LinkState {
        self.state
    }

    fn snapshot(&self) -> LinkSnapshot {
        let connected = self.state == LinkState::Connected;
        LinkSnapshot {
            state: self.state,
            ssid: self.ssid.clone(),
            ip: connected.then_some(SCRIPTED_STA_IP),
            rssi: connected.then_some(-55),
            channel: connected.then_some(6),
            ap_ip: self.ap_name.as_ref().map(|_| SCRIPTED_AP_IP),
        }
    }

    fn start_access_point(&mut self, name: &str) -> Result<IpAddr, NetworkError> {
        if self.ap_fails {
            return Err(NetworkError::AccessPoint("scripted failure".into()));
        }
        self.ap_name = Some(name.to_string());
        self.ap_starts += 1;
        Ok(SCRIPTED_AP_IP)
    }

    fn stop_access_point(&mut self) -> Result<(), NetworkError> {
        self.ap_name = None;
        Ok(())
    }

    fn mac_address(&self) -> [u8; 6] {
        self.mac
    }
}

// ==================== Subsystems ====================

/// One lifecycle call observed by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleCall {
    Create(Mode),
    Begin(Mode),
    End(Mode),
    Drop(Mode),
}

/// Shared script and record of every scripted subsystem.
#[derive(Debug, Default)]
pub struct Ledger {
    /// Lifecycle calls in order. Ticks are counted separately.
    pub calls: Vec<LifecycleCall>,
    pub ticks: HashMap<Mode, u32>,
    /// Subsystems created and not yet dropped.
    pub live: usize,
    /// Highest `live` ever observed.
    pub max_live: usize,
    /// Modes whose `begin()` fails.
    pub fail_begin: HashSet<Mode>,
    /// Events emitted on the next tick of the matching mode.
    pub pending_events: HashMap<Mode, Vec<SubsystemEvent>>,
    /// Answer for `shutdown_requested()`.
    pub shutdown: bool,
    /// Whether `begin()` leaves the subsystem ready.
    pub ready_after_begin: bool,
}

impl Ledger {
    pub fn ticks_in(&self, mode: Mode) -> u32 {
        self.ticks.get(&mode).copied().unwrap_or(0)
    }

    /// Modes passed to `begin()`, in order.
    pub fn begun(&self) -> Vec<Mode> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                LifecycleCall::Begin(mode) => Some(*mode),
                _ => None,
            })
            .collect()
    }
}

/// Factory producing [`ScriptedSubsystem`]s bound to one shared [`Ledger`].
#[derive(Debug, Clone)]
pub struct ScriptedFactory {
    script: Rc<RefCell<Ledger>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self {
            script: Rc::new(RefCell::new(Ledger {
                ready_after_begin: true,
                ..Ledger::default()
            })),
        }
    }

    /// Handle for inspecting and steering the subsystems.
    pub fn script(&self) -> Rc<RefCell<Ledger>> {
        Rc::clone(&self.script)
    }
}

impl Default for ScriptedFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl SubsystemFactory for ScriptedFactory {
    fn create(&mut self, mode: Mode, _ctx: &SubsystemContext) -> Box<dyn Subsystem> {
        let mut ledger = self.script.borrow_mut();
        ledger.calls.push(LifecycleCall::Create(mode));
        ledger.live += 1;
        ledger.max_live = ledger.max_live.max(ledger.live);
        Box::new(ScriptedSubsystem {
            mode,
            script: Rc::clone(&self.script),
            ready: false,
        })
    }
}

/// Subsystem whose behavior comes from the shared [`Ledger`].
pub struct ScriptedSubsystem {
    mode: Mode,
    script: Rc<RefCell<Ledger>>,
    ready: bool,
}

impl Subsystem for ScriptedSubsystem {
    fn mode(&self) -> Mode {
        self.mode
    }

    fn begin(&mut self, _now: Instant) -> Result<(), SubsystemError> {
        let mut ledger = self.script.borrow_mut();
        ledger.calls.push(LifecycleCall::Begin(self.mode));
        if ledger.fail_begin.contains(&self.mode) {
            return Err(SubsystemError::Resource(format!("{} scripted failure", self.mode)));
        }
        self.ready = ledger.ready_after_begin;
        Ok(())
    }

    fn tick(&mut self, ctx: &mut TickContext<'_>) {
        let mut ledger = self.script.borrow_mut();
        *ledger.ticks.entry(self.mode).or_insert(0) += 1;
        if let Some(events) = ledger.pending_events.remove(&self.mode) {
            for event in events {
                ctx.emit(event);
            }
        }
    }

    fn end(&mut self) {
        self.script
            .borrow_mut()
            .calls
            .push(LifecycleCall::End(self.mode));
        self.ready = false;
    }

    fn is_ready(&self) -> bool {
        self.ready
    }

    fn shutdown_requested(&self, _now: Instant) -> bool {
        self.ready && self.script.borrow().shutdown
    }

    fn report(&self, query: StatusQuery, _now: Instant) -> Option<String> {
        let serves = matches!(
            (self.mode, query),
            (Mode::Provisioning, StatusQuery::Wifi)
                | (Mode::Active, StatusQuery::Hydro | StatusQuery::Relays)
                | (Mode::Admin, StatusQuery::Admin)
        );
        serves.then(|| format!("{} scripted report ({:?})", self.mode, query))
    }
}

impl Drop for ScriptedSubsystem {
    fn drop(&mut self) {
        let mut ledger = self.script.borrow_mut();
        ledger.calls.push(LifecycleCall::Drop(self.mode));
        ledger.live -= 1;
    }
}

// ==================== Sockets ====================

/// A TCP port that was free a moment ago, for tests binding real listeners.
pub fn free_tcp_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("0.0.0.0", 0))?;
    Ok(listener.local_addr()?.port())
}
