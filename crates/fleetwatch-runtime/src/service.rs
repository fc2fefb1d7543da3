//! Single-owner task around [`TelemetryStateMerger`].
//!
//! The merger lives inside one Tokio task. Everything else talks to it
//! through a cloneable [`MergerHandle`]: mutations are queued on an unbounded
//! channel and applied strictly in arrival order, reads are answered over a
//! oneshot. After every applied mutation the task publishes an immutable
//! [`FleetView`] on a `watch` channel for the map adapter.
//!
//! Mutation methods on the handle are synchronous so that topic handlers,
//! which run inside [`TopicRouter::dispatch`][fleetwatch_middleware::TopicRouter::dispatch],
//! can call them directly.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleetwatch_types::{FleetError, TrajectoryPoint, VehicleId, VehiclePatch, VehicleRecord};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::merger::{PollSummary, TelemetryStateMerger};

/// Read-only picture of the fleet after a given mutation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FleetView {
    /// Vehicles ordered by id.
    pub vehicles: Vec<VehicleRecord>,
    /// Drawable trajectories keyed by vehicle id.
    pub trajectories: BTreeMap<VehicleId, Vec<TrajectoryPoint>>,
    /// Bumped on every applied mutation.
    pub revision: u64,
}

impl FleetView {
    fn capture(merger: &TelemetryStateMerger, revision: u64) -> Self {
        Self {
            vehicles: merger.snapshot(),
            trajectories: merger.drawable_trajectories(),
            revision,
        }
    }
}

enum MergerCommand {
    Poll(Vec<VehicleRecord>, Option<oneshot::Sender<PollSummary>>),
    Push(VehicleId, VehiclePatch),
    Snapshot(oneshot::Sender<Vec<VehicleRecord>>),
    Trajectory(VehicleId, oneshot::Sender<Vec<TrajectoryPoint>>),
}

/// Cloneable front door to the merger task.
///
/// The task exits once every handle has been dropped.
#[derive(Clone)]
pub struct MergerHandle {
    commands: mpsc::UnboundedSender<MergerCommand>,
    view: watch::Receiver<Arc<FleetView>>,
}

impl std::fmt::Debug for MergerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergerHandle")
            .field("revision", &self.view.borrow().revision)
            .field("closed", &self.commands.is_closed())
            .finish()
    }
}

/// Move `merger` into its own task and return a handle to it.
pub fn spawn_merger(merger: TelemetryStateMerger) -> (MergerHandle, JoinHandle<()>) {
    let (commands, rx) = mpsc::unbounded_channel();
    let (view_tx, view) = watch::channel(Arc::new(FleetView::capture(&merger, 0)));
    let task = tokio::spawn(run(merger, rx, view_tx));
    (MergerHandle { commands, view }, task)
}

async fn run(
    mut merger: TelemetryStateMerger,
    mut rx: mpsc::UnboundedReceiver<MergerCommand>,
    view_tx: watch::Sender<Arc<FleetView>>,
) {
    let mut revision = 0u64;

    while let Some(command) = rx.recv().await {
        let changed = match command {
            MergerCommand::Poll(records, reply) => {
                let summary = merger.apply_poll(records);
                debug!(
                    added = summary.added,
                    updated = summary.updated,
                    removed = summary.removed,
                    "poll applied"
                );
                if let Some(reply) = reply {
                    let _ = reply.send(summary);
                }
                true
            }
            MergerCommand::Push(id, patch) => merger.apply_push(id, patch),
            MergerCommand::Snapshot(reply) => {
                let _ = reply.send(merger.snapshot());
                false
            }
            MergerCommand::Trajectory(id, reply) => {
                let _ = reply.send(merger.trajectory_for(id));
                false
            }
        };

        if changed {
            revision += 1;
            view_tx.send_replace(Arc::new(FleetView::capture(&merger, revision)));
        }
    }

    info!(revision, "merger task stopped");
}

fn closed() -> FleetError {
    FleetError::Channel("merger task stopped".to_string())
}

impl MergerHandle {
    /// Queue a REST poll result. Returns `false` if the task has stopped.
    pub fn apply_poll(&self, records: Vec<VehicleRecord>) -> bool {
        self.commands.send(MergerCommand::Poll(records, None)).is_ok()
    }

    /// Queue a poll result and wait for its summary.
    pub async fn apply_poll_and_wait(
        &self,
        records: Vec<VehicleRecord>,
    ) -> Result<PollSummary, FleetError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MergerCommand::Poll(records, Some(tx)))
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Queue a push update. Returns `false` if the task has stopped.
    pub fn apply_push(&self, id: VehicleId, patch: VehiclePatch) -> bool {
        self.commands.send(MergerCommand::Push(id, patch)).is_ok()
    }

    /// Fleet snapshot, taken after every mutation queued before this call.
    pub async fn snapshot(&self) -> Result<Vec<VehicleRecord>, FleetError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MergerCommand::Snapshot(tx))
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Trajectory of `id` (possibly a single point), in arrival order.
    pub async fn trajectory_for(&self, id: VehicleId) -> Result<Vec<TrajectoryPoint>, FleetError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(MergerCommand::Trajectory(id, tx))
            .map_err(|_| closed())?;
        rx.await.map_err(|_| closed())
    }

    /// Latest published view.
    pub fn view(&self) -> Arc<FleetView> {
        Arc::clone(&self.view.borrow())
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<FleetView>> {
        self.view.clone()
    }
}
