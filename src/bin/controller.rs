//! Hydroponic controller firmware.
//!
//! Runs on both ESP32 and host platforms:
//! - **Host**: `cargo run --bin controller`
//! - **ESP32**: `cargo espflash flash --bin controller --features esp32 --release`
//!
//! ## Console
//!
//! Connect via serial monitor (or use the terminal on host) and type `help`.
//! Commands are answered by the orchestrator; mode switches take effect on
//! the next tick.
//!
//! ## Endpoints
//!
//! - Provisioning portal: http://192.168.4.1/ (host: http://localhost:8080/)
//! - Stats: http://<device>/stats (host: http://localhost:8080/stats)
//! - Admin session: http://<device>:81/status (host: port 8081)

use hydro_esp32::orchestrator::{Orchestrator, OrchestratorError, TickOutcome};
use hydro_esp32::registration::{Registrar, RegistrationError, RegistrationRequest};
use hydro_esp32::{
    Clock, ConfigStore, DefaultFactory, NetworkLayer, OrchestratorSettings, SubsystemFactory,
    SystemClock,
};
use log::{debug, error, info, warn};
use std::io::{BufRead, Write};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

#[cfg(not(feature = "esp32"))]
use hydro_esp32::network::HostNetwork;
#[cfg(not(feature = "esp32"))]
use hydro_esp32::store::FileStore;

#[cfg(feature = "esp32")]
use hydro_esp32::network::EspWifiNetwork;
#[cfg(feature = "esp32")]
use hydro_esp32::store::NvsStore;

/// Controller loop period.
const TICK_INTERVAL: Duration = Duration::from_millis(100);

/// How long a restart waits for in-flight registrations.
const REGISTRATION_DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Pause before rebooting the host controller, so a failing boot does not spin.
#[cfg(not(feature = "esp32"))]
const HOST_RESTART_DELAY: Duration = Duration::from_secs(2);

#[cfg(not(feature = "esp32"))]
type Controller = Orchestrator<FileStore, HostNetwork, DefaultFactory, SystemClock>;

#[cfg(feature = "esp32")]
type Controller = Orchestrator<NvsStore, EspWifiNetwork<'static>, DefaultFactory, SystemClock>;

type BootError = Box<dyn std::error::Error>;

/// Why the controller loop returned.
enum Exit {
    Restart,
    Shutdown,
}

// ESP32: Initialize ESP-IDF before anything else
#[cfg(feature = "esp32")]
fn platform_init() {
    esp_idf_sys::link_patches();
    esp_idf_svc::log::EspLogger::initialize_default();
    info!("ESP-IDF initialized");
}

// Host: Just initialize env_logger
#[cfg(not(feature = "esp32"))]
fn platform_init() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

/// Print a command reply to the console.
fn print_reply(msg: &str) {
    println!("{}", msg);
    let _ = std::io::stdout().flush();
}

fn print_prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

#[cfg(not(feature = "esp32"))]
fn build_controller() -> Result<Controller, BootError> {
    let store = FileStore::at_default_path()?;
    info!("Config file: {}", store.path().display());
    Ok(Orchestrator::new(
        store,
        HostNetwork::new(),
        DefaultFactory,
        SystemClock,
        OrchestratorSettings::default(),
    ))
}

#[cfg(feature = "esp32")]
fn build_controller() -> Result<Controller, BootError> {
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::eventloop::EspSystemEventLoop;

    let peripherals = Peripherals::take()?;
    let sysloop = EspSystemEventLoop::take()?;
    let network = EspWifiNetwork::new(peripherals.modem, sysloop)?;
    Ok(Orchestrator::new(
        NvsStore::new(),
        network,
        DefaultFactory,
        SystemClock,
        OrchestratorSettings::default(),
    ))
}

/// Build the orchestrator and enter the first mode.
///
/// `begin()` polls the boot connect attempt and is the only call allowed to
/// block the loop.
fn boot() -> Result<Controller, BootError> {
    let mut controller = build_controller()?;
    match controller.begin() {
        Ok(mode) => {
            info!("Controller {} started in {}", controller.identity(), mode);
            Ok(controller)
        }
        Err(e @ OrchestratorError::StorageUnavailable(_)) => {
            error!("Cannot operate without config storage");
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(feature = "esp32")]
async fn restart() {
    hydro_esp32::platform::restart();
}

#[cfg(not(feature = "esp32"))]
async fn restart() {
    info!("Restarting controller in {}s", HOST_RESTART_DELAY.as_secs());
    tokio::time::sleep(HOST_RESTART_DELAY).await;
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    platform_init();

    info!("=== Hydroponic controller starting ===");

    #[cfg(feature = "esp32")]
    info!("Platform: ESP32");
    #[cfg(not(feature = "esp32"))]
    info!("Platform: Host");

    let cancel = CancellationToken::new();

    // Console lines outlive controller restarts on the host
    let (line_tx, mut lines) = mpsc::unbounded_channel::<String>();
    let stdin_cancel = cancel.clone();
    let _stdin_task = tokio::task::spawn_blocking(move || {
        let stdin = std::io::stdin();
        let mut input = stdin.lock().lines();
        while !stdin_cancel.is_cancelled() {
            match input.next() {
                Some(Ok(line)) => {
                    if line_tx.send(line).is_err() {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("Console read error: {}", e);
                    break;
                }
                None => break,
            }
        }
    });

    #[cfg(not(feature = "esp32"))]
    {
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                print_reply("\nShutting down...");
                signal_cancel.cancel();
            }
        });
    }

    loop {
        let exit = match boot() {
            Ok(mut controller) => {
                print_reply("Type 'help' for commands.");
                print_prompt();
                run(&mut controller, &mut lines, &cancel).await
            }
            Err(e) => {
                error!("Boot failed: {}", e);
                Exit::Restart
            }
        };

        match exit {
            Exit::Shutdown => break,
            Exit::Restart if cancel.is_cancelled() => break,
            Exit::Restart => restart().await,
        }
    }

    info!("Shutdown complete");
}

/// Drive the orchestrator until it asks for a restart or the process is
/// cancelled.
async fn run<S, N, F, C>(
    controller: &mut Orchestrator<S, N, F, C>,
    lines: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> Exit
where
    S: ConfigStore,
    N: NetworkLayer,
    F: SubsystemFactory,
    C: Clock,
{
    let registrar = controller.settings().registration.clone().map(Registrar::new);
    if let Some(registrar) = &registrar {
        info!("Registrations go to {}", registrar.url());
    }
    let (done_tx, mut done_rx) = mpsc::unbounded_channel::<Result<(), RegistrationError>>();
    let mut in_flight = 0usize;

    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                controller.shutdown();
                return Exit::Shutdown;
            }
            Some(line) = lines.recv() => {
                if !line.trim().is_empty() {
                    match controller.handle_command(&line) {
                        Ok(reply) => print_reply(&reply),
                        Err(e) => print_reply(&e.to_string()),
                    }
                }
                print_prompt();
            }
            Some(result) = done_rx.recv() => {
                in_flight = in_flight.saturating_sub(1);
                registration_finished(controller, result);
            }
            _ = ticker.tick() => {
                let outcome = controller.tick();
                match forward_registrations(
                    controller.take_registrations(),
                    registrar.as_ref(),
                    &done_tx,
                ) {
                    Some(started) => in_flight += started,
                    None => controller.registration_failed(),
                }
                match outcome {
                    TickOutcome::Restart(reason) => {
                        info!("Restarting: {}", reason);
                        drain_registrations(controller, &mut done_rx, in_flight).await;
                        return Exit::Restart;
                    }
                    TickOutcome::Transitioned(mode) => debug!("Settled in {}", mode),
                    TickOutcome::Continue | TickOutcome::Halted => {}
                }
            }
        }
    }
}

/// Send queued registrations on background tasks. Returns how many were
/// started, or `None` when there is nowhere to send them.
fn forward_registrations(
    pending: Vec<RegistrationRequest>,
    registrar: Option<&Registrar>,
    done: &mpsc::UnboundedSender<Result<(), RegistrationError>>,
) -> Option<usize> {
    if pending.is_empty() {
        return Some(0);
    }
    let Some(registrar) = registrar else {
        warn!(
            "No registration endpoint configured, {} registration(s) stay pending",
            pending.len()
        );
        return None;
    };

    let started = pending.len();
    for request in pending {
        let registrar = registrar.clone();
        let done = done.clone();
        tokio::spawn(async move {
            let result = registrar.register(&request).await;
            let _ = done.send(result);
        });
    }
    Some(started)
}

fn registration_finished<S, N, F, C>(
    controller: &mut Orchestrator<S, N, F, C>,
    result: Result<(), RegistrationError>,
) where
    S: ConfigStore,
    N: NetworkLayer,
    F: SubsystemFactory,
    C: Clock,
{
    match result {
        Ok(()) => controller.registration_delivered(),
        Err(e) => {
            warn!("Registration failed, retrying on next ACTIVE entry: {}", e);
            controller.registration_failed();
        }
    }
}

/// Give in-flight registrations a bounded chance to finish before restart.
async fn drain_registrations<S, N, F, C>(
    controller: &mut Orchestrator<S, N, F, C>,
    done_rx: &mut mpsc::UnboundedReceiver<Result<(), RegistrationError>>,
    mut in_flight: usize,
) where
    S: ConfigStore,
    N: NetworkLayer,
    F: SubsystemFactory,
    C: Clock,
{
    if in_flight == 0 {
        return;
    }
    info!(
        "Waiting up to {}s for {} registration(s)",
        REGISTRATION_DRAIN_TIMEOUT.as_secs(),
        in_flight
    );
    let deadline = tokio::time::sleep(REGISTRATION_DRAIN_TIMEOUT);
    tokio::pin!(deadline);

    while in_flight > 0 {
        tokio::select! {
            Some(result) = done_rx.recv() => {
                in_flight -= 1;
                registration_finished(controller, result);
            }
            _ = &mut deadline => {
                warn!("{} registration(s) still in flight, restarting anyway", in_flight);
                break;
            }
        }
    }
}
