//! pibridge Daemon (pibridged)
//!
//! Owns the GPIO lines of a Raspberry Pi and mirrors them into the `gpio.`
//! state tree. Home-automation clients read states and send writes over a
//! Unix domain socket.
//!
//! # Lifecycle
//! - Configuration is loaded (and migrated) once at startup and on SIGHUP
//! - The GPIO chip is probed; a missing driver leaves the tree in place
//!   without hardware, a kernel/driver mismatch exits with code 13
//! - SIGINT/SIGTERM release every line and flush the state tree

mod server;

use anyhow::Context;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use pb_core::config::{config_path, load_config};
use pb_core::constants::{daemon, gpio, paths};
use pb_core::{Adapter, AdapterSignal, IioDhtSensor, LineDriver, MemoryStore, PibridgeError, SimDriver};

const VERSION: &str = env!("CARGO_PKG_VERSION");

struct Options {
    config: Option<PathBuf>,
    socket: String,
    store: Option<PathBuf>,
    simulate: bool,
}

// ============================================================================
// PID File Management
// ============================================================================

/// Write PID file with secure permissions
fn write_pid_file() -> std::io::Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let path = daemon::PID_FILE;

    if Path::new(path).exists() {
        if let Ok(content) = std::fs::read_to_string(path) {
            if let Ok(old_pid) = content.trim().parse::<i32>() {
                // SAFETY: kill with signal 0 only checks whether the process exists.
                if unsafe { libc::kill(old_pid, 0) } == 0 {
                    return Err(std::io::Error::new(
                        std::io::ErrorKind::AddrInUse,
                        format!("Another instance is running (PID {})", old_pid),
                    ));
                }
            }
        }
        // Stale PID file
        let _ = std::fs::remove_file(path);
    }

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o644)
        .open(path)?;

    writeln!(file, "{}", std::process::id())?;
    file.sync_all()?;

    debug!("PID file written: {}", path);
    Ok(())
}

// ============================================================================
// Cleanup
// ============================================================================

fn cleanup(socket_path: &str, store: &MemoryStore) {
    debug!("Starting cleanup...");

    if let Err(e) = store.flush() {
        warn!("Failed to flush state tree: {}", e);
    }

    if Path::new(socket_path).exists() {
        if let Err(e) = std::fs::remove_file(socket_path) {
            warn!("Failed to remove socket: {}", e);
        }
    }

    let pid_file = daemon::PID_FILE;
    if Path::new(pid_file).exists() {
        if let Err(e) = std::fs::remove_file(pid_file) {
            warn!("Failed to remove PID file: {}", e);
        }
    }

    info!("Cleanup complete");
}

// ============================================================================
// CLI
// ============================================================================

fn print_help() {
    eprintln!("pibridged {} - Raspberry Pi GPIO bridge daemon", VERSION);
    eprintln!();
    eprintln!("USAGE:");
    eprintln!("    pibridged [OPTIONS]");
    eprintln!();
    eprintln!("OPTIONS:");
    eprintln!("    -c, --config PATH   Configuration file (default: {}/{})", paths::CONFIG_DIR, paths::CONFIG_FILE);
    eprintln!("    -s, --socket PATH   Socket path (default: {})", daemon::SOCKET_PATH);
    eprintln!("        --store PATH    Persisted state tree (default: next to the configuration)");
    eprintln!("        --simulate      Use simulated GPIO lines instead of /dev/gpiochip*");
    eprintln!("    -f, --foreground    Run in foreground (always on)");
    eprintln!("    -v, --version       Print version");
    eprintln!("    -h, --help          Print this help");
    eprintln!();
    eprintln!("ENVIRONMENT:");
    eprintln!("    {}        Log filter (trace, debug, info, warn, error)", daemon::LOG_ENV);
    eprintln!("    {}     Configuration file path", paths::CONFIG_ENV);
    eprintln!();
    eprintln!("SIGNALS:");
    eprintln!("    SIGHUP              Reload the configuration and reapply it");
    eprintln!("    SIGINT, SIGTERM     Release all GPIO lines and exit");
}

fn print_version() {
    println!("pibridged {}", VERSION);
}

fn parse_args() -> Options {
    let args: Vec<String> = std::env::args().collect();
    let mut options = Options {
        config: None,
        socket: daemon::SOCKET_PATH.to_string(),
        store: None,
        simulate: false,
    };

    let value = |i: usize, flag: &str| -> String {
        match args.get(i) {
            Some(v) => v.clone(),
            None => {
                eprintln!("Error: {} requires a path argument", flag);
                std::process::exit(1);
            }
        }
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => {
                print_help();
                std::process::exit(0);
            }
            "-v" | "--version" => {
                print_version();
                std::process::exit(0);
            }
            "-f" | "--foreground" => {}
            "--simulate" => options.simulate = true,
            "-c" | "--config" => {
                i += 1;
                options.config = Some(PathBuf::from(value(i, "--config")));
            }
            "-s" | "--socket" => {
                i += 1;
                options.socket = value(i, "--socket");
            }
            "--store" => {
                i += 1;
                options.store = Some(PathBuf::from(value(i, "--store")));
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                print_help();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    options
}

fn init_logging() -> (String, bool) {
    let log_level = std::env::var(daemon::LOG_ENV).unwrap_or_else(|_| "info".to_string());

    let mut use_journald = Path::new("/run/systemd/journal/socket").exists();

    if use_journald {
        match tracing_journald::layer() {
            Ok(journald_layer) => {
                use tracing_subscriber::prelude::*;
                tracing_subscriber::registry()
                    .with(journald_layer)
                    .with(tracing_subscriber::EnvFilter::new(&log_level))
                    .init();
            }
            Err(e) => {
                eprintln!("Failed to create journald layer: {}, falling back to stdout", e);
                use_journald = false;
                tracing_subscriber::fmt()
                    .with_target(false)
                    .with_level(true)
                    .with_env_filter(&log_level)
                    .init();
            }
        }
    } else {
        tracing_subscriber::fmt()
            .with_target(false)
            .with_level(true)
            .with_env_filter(&log_level)
            .init();
    }

    (log_level, use_journald)
}

// ============================================================================
// Hardware
// ============================================================================

/// Pick the line driver for this run.
///
/// `Ok(None)` means no usable GPIO driver; the adapter still builds the
/// state tree. Errors are fatal.
async fn select_driver(simulate: bool, chip: u32) -> pb_core::Result<Option<Arc<dyn LineDriver>>> {
    if simulate {
        warn!("STARTUP: Using simulated GPIO lines");
        return Ok(Some(Arc::new(SimDriver::new())));
    }

    #[cfg(target_os = "linux")]
    {
        let driver = pb_core::GpiodDriver::new();
        match driver.probe(chip).await {
            Ok(()) => Ok(Some(Arc::new(driver))),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                error!("Cannot initialize GPIO: {}", e);
                error!("{}", gpio::DRIVER_REMEDIATION);
                Ok(None)
            }
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        error!(chip, "GPIO character devices are only available on Linux");
        error!("{}", gpio::DRIVER_REMEDIATION);
        Ok(None)
    }
}

fn exit_on_fatal(e: &PibridgeError, socket_path: &str, store: &MemoryStore) -> ! {
    error!("Fatal: {}", e);
    cleanup(socket_path, store);
    std::process::exit(e.exit_code().unwrap_or(1));
}

// ============================================================================
// Signals
// ============================================================================

/// Turn process signals into adapter requests until shutdown.
async fn forward_signals(config_path: PathBuf, tx: mpsc::Sender<AdapterSignal>) -> std::io::Result<()> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGNAL: Received SIGINT - initiating shutdown");
                break;
            }
            _ = terminate.recv() => {
                info!("SIGNAL: Received SIGTERM - initiating shutdown");
                break;
            }
            _ = hangup.recv() => {
                info!("SIGNAL: Received SIGHUP - reloading {}", config_path.display());
                match load_config(&config_path) {
                    Ok(normalized) => {
                        if tx.send(AdapterSignal::Reconfigure(normalized.config)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Err(e) => error!("Reload failed, keeping current configuration: {}", e),
                }
            }
        }
    }

    let _ = tx.send(AdapterSignal::Shutdown).await;
    Ok(())
}

// ============================================================================
// Main Entry Point
// ============================================================================

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let options = parse_args();
    let (log_level, use_journald) = init_logging();

    info!("STARTUP: pibridged {} starting", VERSION);
    info!("STARTUP: Logging to {}", if use_journald { "systemd journal" } else { "stdout" });

    let config_file = match options.config {
        Some(path) => path,
        None => config_path().context("Could not determine configuration path")?,
    };
    let store_file = match options.store {
        Some(path) => path,
        None => config_file
            .parent()
            .map(|dir| dir.join(paths::STORE_FILE))
            .unwrap_or_else(|| PathBuf::from(paths::STORE_FILE)),
    };

    if let Err(e) = write_pid_file() {
        if e.kind() == std::io::ErrorKind::AddrInUse {
            error!("Could not write PID file: {}", e);
            std::process::exit(1);
        }
        warn!("Could not write PID file {}: {}", daemon::PID_FILE, e);
    }

    info!("STARTUP: Config: {}", config_file.display());
    info!("STARTUP: State tree: {}", store_file.display());
    info!("STARTUP: Socket path: {}", options.socket);
    info!("STARTUP: PID: {}", std::process::id());
    info!("STARTUP: Log level: {}", log_level);

    let normalized = load_config(&config_file)
        .with_context(|| format!("Failed to load configuration from {}", config_file.display()))?;
    let store = Arc::new(
        MemoryStore::open(&store_file)
            .with_context(|| format!("Failed to open state tree {}", store_file.display()))?,
    );

    let chip = pb_core::hw::resolve_chip_index();
    let driver = match select_driver(options.simulate, chip).await {
        Ok(driver) => driver,
        Err(e) => exit_on_fatal(&e, &options.socket, &store),
    };

    let mut adapter = Adapter::new(
        store.clone(),
        normalized.config,
        driver,
        Arc::new(IioDhtSensor::new()),
    )
    .with_chip(chip);

    if let Err(e) = adapter.start().await {
        if e.is_fatal() {
            exit_on_fatal(&e, &options.socket, &store);
        }
        error!("Adapter started with errors: {}", e);
    }
    if let Err(e) = store.flush() {
        warn!("Failed to flush state tree: {}", e);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server_store = store.clone();
    let socket_path = options.socket.clone();
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server::run_server(&socket_path, server_store, shutdown_rx).await {
            error!("Server error: {}", e);
        }
    });

    let flush_store = store.clone();
    let mut flush_shutdown = shutdown_tx.subscribe();
    let flush_handle = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(daemon::STORE_FLUSH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = flush_store.flush() {
                        warn!("Failed to flush state tree: {}", e);
                    }
                }
                _ = flush_shutdown.changed() => break,
            }
        }
    });

    let (signal_tx, mut signal_rx) = mpsc::channel(4);
    let signal_handle = tokio::spawn(async move {
        if let Err(e) = forward_signals(config_file, signal_tx).await {
            error!("Failed to install signal handlers: {}", e);
        }
    });

    info!("STARTUP: Ready");
    let result = adapter.run(&mut signal_rx).await;

    adapter.stop().await;
    let _ = shutdown_tx.send(true);
    let _ = server_handle.await;
    let _ = flush_handle.await;
    signal_handle.abort();

    if let Err(e) = result {
        if e.is_fatal() {
            exit_on_fatal(&e, &options.socket, &store);
        }
        error!("Adapter loop failed: {}", e);
    }

    cleanup(&options.socket, &store);
    info!("SHUTDOWN: Daemon terminated gracefully");
    Ok(())
}
