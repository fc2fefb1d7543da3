//! [`TelemetryStateMerger`] – the authoritative fleet snapshot.
//!
//! Two sources feed the same records:
//!
//! | Source | Entry point | May add ids | May remove ids |
//! |---|---|---|---|
//! | REST poll | [`TelemetryStateMerger::apply_poll`] | yes | yes |
//! | Push channel | [`TelemetryStateMerger::apply_push`] | no | no |
//!
//! Both merge at whole-call granularity and the later call wins, whichever
//! source carries the fresher data. There is no per-field timestamp
//! arbitration.
//!
//! # Trajectories
//!
//! A vehicle accumulates breadcrumb points only while its status is
//! [`VehicleStatus::Riding`] and it has a valid fix. Observing any other status
//! discards the trajectory on the spot. Points closer than
//! [`MergerConfig::epsilon_deg`] to the previous one (on both axes) are
//! dropped, the buffer is capped at [`MergerConfig::max_points`], and an
//! optional [`MergerConfig::session_gap`] splits riding sessions separated by
//! silence.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use fleetwatch_geo::is_valid_coordinate;
use fleetwatch_types::{TrajectoryPoint, VehicleId, VehiclePatch, VehicleRecord, VehicleStatus};
use tracing::debug;

/// Minimum number of points before a trajectory is worth drawing.
pub const MIN_DRAWABLE_POINTS: usize = 2;

/// Millisecond wall clock used to stamp trajectory points.
pub type Clock = Arc<dyn Fn() -> i64 + Send + Sync>;

/// Tuning for trajectory accumulation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MergerConfig {
    /// Anti-duplication threshold in degrees.
    pub epsilon_deg: f64,
    /// Per-vehicle point cap; the oldest point is evicted first.
    pub max_points: usize,
    /// When set, a silence longer than this between samples starts a fresh
    /// trajectory. When unset, consecutive riding sessions are one trail.
    pub session_gap: Option<Duration>,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self {
            epsilon_deg: 1e-6,
            max_points: 2000,
            session_gap: None,
        }
    }
}

/// What an [`TelemetryStateMerger::apply_poll`] call changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollSummary {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

pub struct TelemetryStateMerger {
    config: MergerConfig,
    vehicles: BTreeMap<VehicleId, VehicleRecord>,
    trajectories: HashMap<VehicleId, VecDeque<TrajectoryPoint>>,
    /// Time of the latest riding sample per vehicle, deduplicated ones
    /// included. Cleared together with the trajectory.
    last_sample: HashMap<VehicleId, i64>,
    clock: Clock,
}

impl std::fmt::Debug for TelemetryStateMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryStateMerger")
            .field("config", &self.config)
            .field("vehicles", &self.vehicles.len())
            .field("trajectories", &self.trajectories.len())
            .finish()
    }
}

impl Default for TelemetryStateMerger {
    fn default() -> Self {
        Self::new(MergerConfig::default())
    }
}

impl TelemetryStateMerger {
    pub fn new(config: MergerConfig) -> Self {
        Self::with_clock(config, Arc::new(|| chrono::Utc::now().timestamp_millis()))
    }

    /// Build a merger with an injected clock.
    pub fn with_clock(config: MergerConfig, clock: Clock) -> Self {
        Self {
            config,
            vehicles: BTreeMap::new(),
            trajectories: HashMap::new(),
            last_sample: HashMap::new(),
            clock,
        }
    }

    pub fn config(&self) -> &MergerConfig {
        &self.config
    }

    // ────────────────────────────────────────────────────────────────────────
    // Mutation
    // ────────────────────────────────────────────────────────────────────────

    /// Replace the fleet by id with a REST poll result.
    ///
    /// Ids in `records` are added or overwritten wholesale; known ids missing
    /// from `records` are removed together with their trajectories. If an id
    /// appears twice, the last occurrence wins.
    pub fn apply_poll(&mut self, records: Vec<VehicleRecord>) -> PollSummary {
        let mut summary = PollSummary::default();
        let incoming: HashSet<VehicleId> = records.iter().map(|r| r.id).collect();

        let stale: Vec<VehicleId> = self
            .vehicles
            .keys()
            .filter(|id| !incoming.contains(id))
            .copied()
            .collect();
        for id in stale {
            self.vehicles.remove(&id);
            self.discard_trajectory(id);
            summary.removed += 1;
        }

        let mut seen = HashSet::with_capacity(records.len());
        for mut record in records {
            let id = record.id;
            if let Some(position) = record.position()
                && !is_valid_coordinate(position.latitude, position.longitude)
            {
                debug!(
                    vehicle_id = id,
                    lat = position.latitude,
                    lng = position.longitude,
                    "invalid polled coordinate cleared"
                );
                record.latitude = None;
                record.longitude = None;
            }
            let previous = self.vehicles.insert(id, record);
            if seen.insert(id) {
                if previous.is_some() {
                    summary.updated += 1;
                } else {
                    summary.added += 1;
                }
            }
            self.track(id);
        }

        summary
    }

    /// Shallow-merge `patch` into a known vehicle.
    ///
    /// Returns `false` when `id` is unknown; the update is dropped rather
    /// than creating a record. Invalid coordinates in the patch are filtered
    /// out while the remaining fields still apply.
    pub fn apply_push(&mut self, id: VehicleId, patch: VehiclePatch) -> bool {
        let Some(record) = self.vehicles.get_mut(&id) else {
            debug!(vehicle_id = id, "push for unknown vehicle dropped");
            return false;
        };

        if let Some(status) = patch.status {
            record.status = status;
        }
        if let Some(battery) = patch.battery_percent {
            record.battery_percent = battery;
        }
        if let Some(position) = patch.position {
            if is_valid_coordinate(position.latitude, position.longitude) {
                record.latitude = Some(position.latitude);
                record.longitude = Some(position.longitude);
            } else {
                debug!(
                    vehicle_id = id,
                    lat = position.latitude,
                    lng = position.longitude,
                    "invalid coordinate filtered"
                );
            }
        }
        if let Some(at) = patch.last_heartbeat_at {
            record.last_heartbeat_at = Some(at);
        }

        self.track(id);
        true
    }

    /// Bring the trajectory of `id` in line with its current record.
    fn track(&mut self, id: VehicleId) {
        let Some(record) = self.vehicles.get(&id) else {
            return;
        };

        if record.status != VehicleStatus::Riding {
            let status = record.status;
            if self.discard_trajectory(id) {
                debug!(vehicle_id = id, %status, "trajectory discarded");
            }
            return;
        }

        let Some(position) = record.position() else {
            return;
        };
        if !is_valid_coordinate(position.latitude, position.longitude) {
            return;
        }

        let now = (self.clock)();
        let epsilon = self.config.epsilon_deg;
        let cap = self.config.max_points.max(1);
        let previous_sample = self.last_sample.insert(id, now);
        let trail = self.trajectories.entry(id).or_default();

        if let (Some(gap), Some(previous)) = (self.config.session_gap, previous_sample)
            && now.saturating_sub(previous) > gap.as_millis() as i64
        {
            debug!(vehicle_id = id, "session gap exceeded; starting new trajectory");
            trail.clear();
        }

        if let Some(last) = trail.back() {
            if (position.latitude - last.latitude).abs() < epsilon
                && (position.longitude - last.longitude).abs() < epsilon
            {
                return;
            }
        }

        while trail.len() >= cap {
            trail.pop_front();
        }
        trail.push_back(TrajectoryPoint {
            latitude: position.latitude,
            longitude: position.longitude,
            captured_at_millis: now,
        });
    }

    /// Drop the trajectory of `id` and its sample clock. Returns whether a
    /// trajectory existed.
    fn discard_trajectory(&mut self, id: VehicleId) -> bool {
        self.last_sample.remove(&id);
        self.trajectories.remove(&id).is_some()
    }

    // ────────────────────────────────────────────────────────────────────────
    // Read access (always copies)
    // ────────────────────────────────────────────────────────────────────────

    /// All known vehicles, ordered by id.
    pub fn snapshot(&self) -> Vec<VehicleRecord> {
        self.vehicles.values().cloned().collect()
    }

    pub fn vehicle(&self, id: VehicleId) -> Option<VehicleRecord> {
        self.vehicles.get(&id).cloned()
    }

    /// Points for `id` in arrival order; empty when there is none.
    pub fn trajectory_for(&self, id: VehicleId) -> Vec<TrajectoryPoint> {
        self.trajectories
            .get(&id)
            .map(|trail| trail.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Every trajectory with at least [`MIN_DRAWABLE_POINTS`] points.
    pub fn drawable_trajectories(&self) -> BTreeMap<VehicleId, Vec<TrajectoryPoint>> {
        self.trajectories
            .iter()
            .filter(|(_, trail)| trail.len() >= MIN_DRAWABLE_POINTS)
            .map(|(id, trail)| (*id, trail.iter().copied().collect()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.vehicles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vehicles.is_empty()
    }
}
