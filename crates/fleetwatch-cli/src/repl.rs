//! REPL – the operator shell for a running fleetwatch session.
//!
//! Supported slash-commands:
//!   /help                    – show this list
//!   /status                  – channel state, poller and merger counters
//!   /fleet                   – the current fleet snapshot
//!   /stats                   – dashboard counters from the REST collaborator
//!   /trail <id>              – trajectory summary for one vehicle
//!   /lock <id> [reason]      – send a force-lock command
//!   /unlock <id> [reason]    – send a force-unlock command
//!   /connect | /disconnect   – open or close the telemetry channel
//!   /export <path>           – write the map layer as GeoJSON
//!   /quit | /exit            – gracefully exit the CLI

use chrono::Utc;
use colored::Colorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::runtime::Handle;

use fleetwatch_middleware::ConnectionManager;
use fleetwatch_runtime::{FleetApi, GeoJsonSurface, MergerHandle, Poller, TelemetryIngest};
use fleetwatch_types::{
    CommandRequest, ConnectionState, FleetError, VehicleCommand, VehicleId, VehicleRecord,
    VehicleStatus,
};

/// A parsed shell line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Status,
    Fleet,
    Stats,
    Trail(VehicleId),
    Send {
        vehicle_id: VehicleId,
        command: VehicleCommand,
        reason: Option<String>,
    },
    Connect,
    Disconnect,
    Export(PathBuf),
    Quit,
}

/// Parse one non-empty shell line.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let line = line.trim();
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (line, ""),
    };

    let no_args = |cmd: Command| {
        if rest.is_empty() {
            Ok(cmd)
        } else {
            Err(format!("{head} takes no arguments"))
        }
    };

    match head {
        "/help" => no_args(Command::Help),
        "/status" => no_args(Command::Status),
        "/fleet" => no_args(Command::Fleet),
        "/stats" => no_args(Command::Stats),
        "/connect" => no_args(Command::Connect),
        "/disconnect" => no_args(Command::Disconnect),
        "/quit" | "/exit" => no_args(Command::Quit),
        "/trail" => parse_id(head, rest).map(Command::Trail),
        "/lock" | "/unlock" => {
            let (id, reason) = match rest.split_once(char::is_whitespace) {
                Some((id, reason)) => (id, Some(reason.trim().to_string())),
                None => (rest, None),
            };
            let command = if head == "/lock" {
                VehicleCommand::ForceLock
            } else {
                VehicleCommand::ForceUnlock
            };
            Ok(Command::Send {
                vehicle_id: parse_id(head, id)?,
                command,
                reason: reason.filter(|r| !r.is_empty()),
            })
        }
        "/export" if !rest.is_empty() => Ok(Command::Export(PathBuf::from(rest))),
        "/export" => Err("usage: /export <path>".to_string()),
        other => Err(format!("Unknown command: '{other}'")),
    }
}

fn parse_id(head: &str, raw: &str) -> Result<VehicleId, String> {
    raw.parse::<VehicleId>()
        .map_err(|_| format!("usage: {head} <vehicle id>"))
}

/// Everything the shell talks to.
pub struct Session {
    pub runtime: Handle,
    pub manager: ConnectionManager,
    pub merger: MergerHandle,
    pub ingest: TelemetryIngest,
    pub poller: Poller,
    pub api: Arc<dyn FleetApi>,
    pub surface: Arc<Mutex<GeoJsonSurface>>,
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(session: &Session, shutdown: Arc<AtomicBool>) -> Result<(), ReadlineError> {
    let mut editor = DefaultEditor::new()?;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        let line = match editor.readline("fleetwatch> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => {
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Err(e) => return Err(e),
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        match parse_command(line) {
            Ok(Command::Quit) => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Ok(command) => execute(session, command),
            Err(msg) => println!(
                "{} Type {} for available commands.",
                msg.red(),
                "/help".bold()
            ),
        }
    }
    Ok(())
}

fn execute(session: &Session, command: Command) {
    match command {
        Command::Help => cmd_help(),
        Command::Status => cmd_status(session),
        Command::Fleet => cmd_fleet(session),
        Command::Stats => cmd_stats(session),
        Command::Trail(id) => cmd_trail(session, id),
        Command::Send {
            vehicle_id,
            command,
            reason,
        } => cmd_send(session, vehicle_id, command, reason),
        Command::Connect => cmd_connect(session),
        Command::Disconnect => {
            session.manager.disconnect();
            println!("Telemetry channel {}.", "disconnected".yellow());
        }
        Command::Export(path) => cmd_export(session, &path),
        Command::Quit => {}
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Command implementations
// ────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!("{}", "Available commands:".bold());
    let rows = [
        ("/help", "Show this help message"),
        ("/status", "Channel state, poller and merger counters"),
        ("/fleet", "List every vehicle in the current snapshot"),
        ("/stats", "Fetch dashboard counters"),
        ("/trail <id>", "Trajectory summary for one vehicle"),
        ("/lock <id> [reason]", "Force-lock a vehicle"),
        ("/unlock <id> [reason]", "Force-unlock a vehicle"),
        ("/connect", "Open the telemetry channel"),
        ("/disconnect", "Close the telemetry channel"),
        ("/export <path>", "Write markers and trails as GeoJSON"),
        ("/quit", "Exit fleetwatch"),
    ];
    for (cmd, desc) in rows {
        println!("  {:<24} {}", cmd.cyan(), desc);
    }
}

fn paint_state(state: ConnectionState) -> colored::ColoredString {
    match state {
        ConnectionState::Connected => state.to_string().green(),
        ConnectionState::Connecting => state.to_string().yellow(),
        ConnectionState::Disconnected => state.to_string().red(),
    }
}

fn paint_status(status: VehicleStatus) -> colored::ColoredString {
    match status {
        VehicleStatus::Idle => status.as_str().normal(),
        VehicleStatus::Riding => status.as_str().green(),
        VehicleStatus::Fault => status.as_str().red(),
    }
}

fn cmd_status(session: &Session) {
    let manager = &session.manager;
    let view = session.merger.view();
    println!("{}", "── Session ──".bold());
    println!("  Channel        : {} ({})", paint_state(manager.state()), manager.endpoint());
    println!("  Client id      : {}", manager.client_id());
    println!(
        "  Reconnects     : {}/{}{}",
        manager.reconnect_attempts(),
        manager.policy().max_attempts,
        if manager.has_pending_reconnect() { " (retry pending)" } else { "" }
    );
    println!(
        "  Poller         : {}",
        if session.poller.is_running() { "running".green() } else { "stopped".red() }
    );
    println!("  Vehicles       : {}", view.vehicles.len());
    println!("  Drawable trails: {}", view.trajectories.len());
    println!("  View revision  : {}", view.revision);
    println!("  Pushes handled : {}", session.ingest.message_count());
}

fn cmd_fleet(session: &Session) {
    let vehicles = match session.runtime.block_on(session.merger.snapshot()) {
        Ok(v) => v,
        Err(e) => {
            println!("{} {e}", "Snapshot unavailable:".red());
            return;
        }
    };
    if vehicles.is_empty() {
        println!("{}", "No vehicles yet. Waiting for the first poll.".yellow());
        return;
    }
    println!(
        "{}",
        format!(
            "  {:>5}  {:<12} {:<7} {:>4}  {:<24} {}",
            "ID", "CODE", "STATUS", "BAT", "POSITION", "LAST SEEN"
        )
        .bold()
    );
    for v in &vehicles {
        println!(
            "  {:>5}  {:<12} {:<7} {:>3}%  {:<24} {}",
            v.id,
            v.code,
            paint_status(v.status),
            v.battery_percent,
            format_position(v),
            format_last_seen(v),
        );
    }
}

fn format_position(v: &VehicleRecord) -> String {
    match (v.latitude, v.longitude) {
        (Some(lat), Some(lng)) => format!("{lat:.6}, {lng:.6}"),
        _ => "-".to_string(),
    }
}

fn format_last_seen(v: &VehicleRecord) -> String {
    match v.last_heartbeat_at {
        Some(at) => {
            let secs = (Utc::now() - at).num_seconds().max(0);
            format!("{secs}s ago")
        }
        None => "never".to_string(),
    }
}

fn cmd_stats(session: &Session) {
    let stats = match session.runtime.block_on(session.api.dashboard_stats()) {
        Ok(stats) => stats,
        Err(e) => match session.poller.latest_stats() {
            Some(cached) => {
                println!("{} {e} (showing last polled values)", "Fetch failed:".yellow());
                cached
            }
            None => {
                println!("{} {e}", "Fetch failed:".red());
                return;
            }
        },
    };
    println!("{}", "── Dashboard ──".bold());
    println!("  Vehicles : {} total", stats.total_vehicles);
    println!(
        "             {} idle, {} riding, {} fault",
        stats.idle_vehicles,
        stats.riding_vehicles.to_string().green(),
        stats.fault_vehicles.to_string().red()
    );
    println!("  Users    : {}", stats.total_users);
    println!("  Orders   : {} today", stats.today_orders);
    println!("  Revenue  : {:.2} today", stats.today_revenue);
}

fn cmd_trail(session: &Session, id: VehicleId) {
    let trail = match session.runtime.block_on(session.merger.trajectory_for(id)) {
        Ok(trail) => trail,
        Err(e) => {
            println!("{} {e}", "Trajectory unavailable:".red());
            return;
        }
    };
    let (Some(first), Some(last)) = (trail.first(), trail.last()) else {
        println!("Vehicle {id} has no trajectory.");
        return;
    };
    let length_m: f64 = trail
        .windows(2)
        .map(|w| {
            fleetwatch_geo::haversine_distance_meters(
                w[0].latitude,
                w[0].longitude,
                w[1].latitude,
                w[1].longitude,
            )
        })
        .sum();
    println!("Vehicle {id}: {} points, {:.1} m", trail.len(), length_m);
    println!("  from {:.6}, {:.6}", first.latitude, first.longitude);
    println!("  to   {:.6}, {:.6}", last.latitude, last.longitude);

    let skipped = trail.len().saturating_sub(TRAIL_LISTING);
    if skipped > 0 {
        println!("  {}", format!("… {skipped} earlier points").dimmed());
    }
    for point in &trail[skipped..] {
        let at = chrono::DateTime::from_timestamp_millis(point.captured_at_millis)
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "--:--:--".to_string());
        println!("  {at}  {:.6}, {:.6}", point.latitude, point.longitude);
    }
}

/// Most recent points listed by `/trail`.
const TRAIL_LISTING: usize = 20;

fn cmd_send(
    session: &Session,
    vehicle_id: VehicleId,
    command: VehicleCommand,
    reason: Option<String>,
) {
    let request = CommandRequest {
        vehicle_id,
        command,
        reason,
    };
    match session.runtime.block_on(session.api.send_command(&request)) {
        Ok(()) => println!("{} {command:?} sent to vehicle {vehicle_id}.", "✓".green()),
        Err(FleetError::CommandDelivery(msg)) => {
            println!("{} {msg}", "Command not delivered:".red())
        }
        Err(e) => println!("{} {e}", "Command failed:".red()),
    }
}

fn cmd_connect(session: &Session) {
    match session.runtime.block_on(session.manager.connect()) {
        Ok(()) => println!("Telemetry channel {}.", paint_state(session.manager.state())),
        Err(e) => println!(
            "{} {e}{}",
            "Connect failed:".red(),
            if session.manager.has_pending_reconnect() { " (retry scheduled)" } else { "" }
        ),
    }
}

fn cmd_export(session: &Session, path: &Path) {
    let geojson = {
        let surface = session.surface.lock().unwrap_or_else(PoisonError::into_inner);
        surface.to_geojson()
    };
    let result = serde_json::to_string_pretty(&geojson)
        .map_err(|e| e.to_string())
        .and_then(|raw| std::fs::write(path, raw).map_err(|e| e.to_string()));
    match result {
        Ok(()) => println!("Map layer written to {}.", path.display().to_string().cyan()),
        Err(e) => println!("{} {e}", "Export failed:".red()),
    }
}
