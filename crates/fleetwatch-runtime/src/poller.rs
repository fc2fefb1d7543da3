//! Fixed-interval REST poll loop.
//!
//! Every tick fetches the fleet listing (fed to the merger) and the dashboard
//! counters (published on a `watch` channel). The loop never looks at the
//! push channel: it keeps polling whether or not telemetry is connected.
//! Failures are logged and the next tick tries again.

use std::sync::Arc;
use std::time::Duration;

use fleetwatch_types::{DashboardStats, FleetError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use crate::api::FleetApi;
use crate::service::MergerHandle;

/// Default poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Outcome of one poll tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollReport {
    pub vehicles: Option<usize>,
    pub fleet_error: Option<FleetError>,
    pub stats_error: Option<FleetError>,
}

/// Run a single poll: fleet first, then stats.
pub async fn poll_once(
    api: &dyn FleetApi,
    merger: &MergerHandle,
    stats_tx: &watch::Sender<Option<DashboardStats>>,
) -> PollReport {
    let mut report = PollReport::default();

    match api.fetch_fleet().await {
        Ok(records) => {
            report.vehicles = Some(records.len());
            if !merger.apply_poll(records) {
                warn!("merger stopped; poll result discarded");
            }
        }
        Err(e) => {
            warn!(error = %e, "fleet poll failed");
            report.fleet_error = Some(e);
        }
    }

    match api.dashboard_stats().await {
        Ok(stats) => {
            stats_tx.send_replace(Some(stats));
        }
        Err(e) => {
            warn!(error = %e, "stats poll failed");
            report.stats_error = Some(e);
        }
    }

    report
}

/// Handle to a running poll loop.
#[derive(Debug)]
pub struct Poller {
    task: JoinHandle<()>,
    stats: watch::Receiver<Option<DashboardStats>>,
}

impl Poller {
    /// Start polling immediately and then every `interval`.
    pub fn spawn(api: Arc<dyn FleetApi>, merger: MergerHandle, interval: Duration) -> Self {
        let (stats_tx, stats) = watch::channel(None);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = interval.as_millis() as u64, "poll loop started");
            loop {
                ticker.tick().await;
                let report = poll_once(api.as_ref(), &merger, &stats_tx).await;
                if let Some(count) = report.vehicles {
                    info!(vehicles = count, "fleet poll applied");
                }
            }
        });
        Self { task, stats }
    }

    /// Latest dashboard counters, if any poll has succeeded yet.
    pub fn latest_stats(&self) -> Option<DashboardStats> {
        self.stats.borrow().clone()
    }

    pub fn subscribe_stats(&self) -> watch::Receiver<Option<DashboardStats>> {
        self.stats.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.task.is_finished()
    }

    /// Stop the loop. An in-flight request is abandoned.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::TelemetryStateMerger;
    use crate::service::spawn_merger;
    use async_trait::async_trait;
    use fleetwatch_types::{CommandRequest, VehicleRecord, VehicleStatus};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Serves a fixed fleet; fails the fleet call on selected poll numbers.
    #[derive(Default)]
    struct FakeApi {
        polls: AtomicUsize,
        failing_polls: Mutex<Vec<usize>>,
    }

    #[async_trait]
    impl FleetApi for FakeApi {
        async fn fetch_fleet(&self) -> Result<Vec<VehicleRecord>, FleetError> {
            let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.failing_polls.lock().unwrap().contains(&n) {
                return Err(FleetError::Http("connection refused".to_string()));
            }
            Ok(vec![VehicleRecord {
                id: n as u32,
                code: format!("{n:03}"),
                status: VehicleStatus::Idle,
                battery_percent: 100,
                latitude: None,
                longitude: None,
                last_heartbeat_at: None,
            }])
        }

        async fn send_command(&self, _request: &CommandRequest) -> Result<(), FleetError> {
            Ok(())
        }

        async fn dashboard_stats(&self) -> Result<DashboardStats, FleetError> {
            Ok(DashboardStats {
                total_vehicles: 1,
                ..Default::default()
            })
        }
    }

    /// One tick feeds both the merger and the stats channel.
    #[tokio::test]
    async fn poll_once_feeds_merger_and_stats() {
        let (merger, _task) = spawn_merger(TelemetryStateMerger::default());
        let (stats_tx, stats_rx) = watch::channel(None);
        let api = FakeApi::default();

        let report = poll_once(&api, &merger, &stats_tx).await;

        assert_eq!(report.vehicles, Some(1));
        assert!(report.fleet_error.is_none());
        assert_eq!(merger.snapshot().await.unwrap().len(), 1);
        assert_eq!(stats_rx.borrow().as_ref().unwrap().total_vehicles, 1);
    }

    /// A failing tick is logged and the loop keeps going.
    #[tokio::test(start_paused = true)]
    async fn loop_polls_on_interval_and_survives_failures() {
        let (merger, _task) = spawn_merger(TelemetryStateMerger::default());
        let api = Arc::new(FakeApi::default());
        api.failing_polls.lock().unwrap().push(2);

        let poller = Poller::spawn(api.clone(), merger.clone(), DEFAULT_POLL_INTERVAL);

        // Ticks at t = 0, 10, 20.
        tokio::time::sleep(Duration::from_secs(25)).await;

        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
        let ids: Vec<_> = merger.snapshot().await.unwrap().iter().map(|v| v.id).collect();
        assert_eq!(ids, vec![3]);
        assert!(poller.latest_stats().is_some());
        assert!(poller.is_running());

        poller.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(api.polls.load(Ordering::SeqCst), 3);
    }
}
