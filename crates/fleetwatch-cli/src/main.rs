//! `fleetwatch-cli` – operator console for a live vehicle fleet.
//!
//! This binary wires the whole pipeline together and hands control to the
//! operator. It:
//!
//! 1. Checks for `~/.fleetwatch/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Starts the merger task, the telemetry ingest, the REST poller and the
//!    map synchroniser, then opens the telemetry channel.
//! 3. Drops the user into an **interactive REPL** with slash-commands
//!    (`/status`, `/fleet`, `/trail`, `/lock`, `/export`, `/help`, …).
//! 4. Intercepts **Ctrl-C** / `SIGTERM` to close the channel and stop the
//!    background tasks before exiting.

mod config;
mod repl;

use colored::Colorize;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{info, warn};

use fleetwatch_middleware::{ConnectionManager, TopicRouter, WebSocketTransport};
use fleetwatch_runtime::{
    FleetApi, GeoJsonSurface, HttpFleetApi, MapSync, Poller, TelemetryIngest,
    TelemetryStateMerger, spawn_merger,
};
use fleetwatch_types::FleetError;

fn main() -> ExitCode {
    // ── Structured logging ────────────────────────────────────────────────
    // RUST_LOG filters (default "info"); FLEETWATCH_LOG_FORMAT=json switches
    // to newline-delimited JSON. User-facing output still uses println!.
    let _tracing = fleetwatch_runtime::init_tracing("fleetwatch");

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Interrupt received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(
            error = %e,
            "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available"
        );
    }

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            return ExitCode::FAILURE;
        }
    };

    let session = {
        let _ctx = runtime.enter();
        match start_session(&cfg, runtime.handle().clone()) {
            Ok(session) => session,
            Err(e) => {
                eprintln!("{}: {}", "Startup failed".red(), e);
                return ExitCode::FAILURE;
            }
        }
    };

    // ── Telemetry channel ─────────────────────────────────────────────────
    print!("\n  Opening telemetry channel at {} … ", cfg.channel_url.dimmed());
    match runtime.block_on(session.manager.connect()) {
        Ok(()) => println!("{}", "connected".green()),
        Err(e) => {
            println!("{}", "unavailable".yellow());
            println!(
                "  {}  Retrying every {}s; use {} to try again now.",
                e.to_string().dimmed(),
                cfg.reconnect_delay_secs,
                "/connect".bold()
            );
        }
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    let outcome = repl::run(&session, shutdown);

    // ── Graceful shutdown ─────────────────────────────────────────────────
    session.manager.disconnect();
    session.poller.stop();
    session.ingest.uninstall();
    info!(
        pushes = session.ingest.message_count(),
        "fleetwatch session closed"
    );
    drop(session);
    runtime.shutdown_timeout(Duration::from_secs(1));

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            ExitCode::FAILURE
        }
    }
}

/// Build every long-lived component. Must run inside the runtime context.
fn start_session(
    cfg: &config::Config,
    runtime: tokio::runtime::Handle,
) -> Result<repl::Session, FleetError> {
    let router = TopicRouter::new();
    let (merger, _merger_task) = spawn_merger(TelemetryStateMerger::new(cfg.merger_config()));
    let ingest = TelemetryIngest::install(&router, merger.clone())?;

    let transport = Arc::new(WebSocketTransport::new(cfg.channel_url.clone()));
    let manager = ConnectionManager::with_policy(transport, router, cfg.reconnect_policy());

    let api: Arc<dyn FleetApi> = Arc::new(HttpFleetApi::new(
        cfg.api_base_url.clone(),
        cfg.request_timeout(),
        cfg.api_token(),
    )?);
    let poller = Poller::spawn(api.clone(), merger.clone(), cfg.poll_interval());

    let surface = Arc::new(Mutex::new(GeoJsonSurface::new()));
    tokio::spawn(MapSync::new().drive(merger.subscribe(), surface.clone()));

    info!(
        channel = %cfg.channel_url,
        api = %cfg.api_base_url,
        poll_secs = cfg.poll_interval_secs,
        "fleetwatch session started"
    );

    Ok(repl::Session {
        runtime,
        manager,
        merger,
        ingest,
        poller,
        api,
        surface,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║     fleetwatch First-Run Wizard      ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up fleetwatch.\n");

    let mut cfg = config::Config::default();

    cfg.channel_url = prompt_line(
        &format!("  Telemetry channel URL [{}]: ", cfg.channel_url),
        &cfg.channel_url,
    );
    cfg.api_base_url = prompt_line(
        &format!("  REST API base URL [{}]: ", cfg.api_base_url),
        &cfg.api_base_url,
    );

    let interval = prompt_line(
        &format!("  Poll interval in seconds [{}]: ", cfg.poll_interval_secs),
        &cfg.poll_interval_secs.to_string(),
    );
    if let Ok(secs) = interval.trim().parse::<u64>()
        && secs > 0
    {
        cfg.poll_interval_secs = secs;
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }

    config::apply_env_overrides(&mut cfg);
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___ __         __                  __       __  "#.bold().cyan());
    println!("{}", r#"  / _// /__ ___  / /_ _    __ ___ _  / /_ ____/ /  "#.bold().cyan());
    println!("{}", r#" / _// // -_) -_)/ __/| |/|/ // _ `// __// __/ _ \ "#.bold().cyan());
    println!("{}", r#"/_/ /_/ \__/\__/ \__/ |__,__/ \_,_/ \__/ \__/_//_/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "fleetwatch".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Live fleet telemetry console");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
