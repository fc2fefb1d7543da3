//! `fleetwatch-runtime` – fleet state and the glue around it.
//!
//! # Modules
//!
//! - [`merger`] – [`TelemetryStateMerger`]: the authoritative fleet snapshot
//!   and per-vehicle trajectories, fed by REST polls and telemetry pushes.
//! - [`service`] – [`spawn_merger`] moves the merger into its own task and
//!   hands out a cloneable [`MergerHandle`]; every mutation publishes a
//!   [`FleetView`].
//! - [`ingest`] – [`TelemetryIngest`]: topic handlers that translate
//!   `vehicle/{code}/…` pushes into merger patches.
//! - [`api`] – [`FleetApi`] / [`HttpFleetApi`]: the REST collaborator.
//! - [`poller`] – [`Poller`]: the fixed-interval poll loop.
//! - [`map`] – [`MapSurface`], [`MapSync`] and the in-memory
//!   [`GeoJsonSurface`].
//! - [`telemetry`] – [`init_tracing`]: the global `tracing` subscriber with
//!   optional OTLP export.
//!
//! # Data flow
//!
//! ```text
//! ConnectionManager ──frames──▶ TopicRouter ──▶ TelemetryIngest ─┐
//!                                                                ├─▶ merger task ──FleetView──▶ MapSync ──▶ MapSurface
//! Poller ──────────── GET /bikes ────────────────────────────────┘
//! ```

pub mod api;
pub mod ingest;
pub mod map;
pub mod merger;
pub mod poller;
pub mod service;
pub mod telemetry;

pub use api::{ApiError, FleetApi, HttpFleetApi};
pub use ingest::{TelemetryIngest, parse_vehicle_code};
pub use map::{GeoJsonSurface, MapSurface, MapSync, SyncReport};
pub use merger::{MergerConfig, PollSummary, TelemetryStateMerger};
pub use poller::{DEFAULT_POLL_INTERVAL, PollReport, Poller, poll_once};
pub use service::{FleetView, MergerHandle, spawn_merger};
pub use telemetry::{TracerProviderGuard, init_tracing};
