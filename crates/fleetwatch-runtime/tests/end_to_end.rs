//! Poll → push → snapshot, across the connection manager, router, ingest and
//! merger task, with an in-memory transport standing in for the socket.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fleetwatch_middleware::{ConnectionManager, DuplexChannel, TopicRouter, Transport};
use fleetwatch_runtime::{
    FleetView, GeoJsonSurface, MapSync, TelemetryIngest, TelemetryStateMerger, spawn_merger,
};
use fleetwatch_types::{ConnectionState, FleetError, VehicleRecord, VehicleStatus};
use futures_util::StreamExt;
use futures_util::stream;
use tokio::sync::mpsc;

type Feed = mpsc::UnboundedSender<Result<String, FleetError>>;

/// Opens exactly one channel whose inbound side is fed by the test.
struct LoopbackTransport {
    channel: Mutex<Option<DuplexChannel>>,
    _sent: Mutex<mpsc::UnboundedReceiver<String>>,
}

impl LoopbackTransport {
    fn new() -> (Arc<Self>, Feed) {
        let (outbound, sent) = mpsc::unbounded_channel::<String>();
        let (feed, rx) = mpsc::unbounded_channel();
        let inbound = stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        })
        .boxed();
        let transport = Arc::new(Self {
            channel: Mutex::new(Some(DuplexChannel { outbound, inbound })),
            _sent: Mutex::new(sent),
        });
        (transport, feed)
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    async fn open(&self) -> Result<DuplexChannel, FleetError> {
        self.channel
            .lock()
            .unwrap()
            .take()
            .ok_or_else(|| FleetError::Channel("loopback already used".to_string()))
    }

    fn describe(&self) -> String {
        "loopback".to_string()
    }
}

fn bike_005() -> VehicleRecord {
    serde_json::from_str(
        r#"{"id":5,"code":"BIKE_005","status":"riding","battery":90,"lat":30.0,"lng":120.0}"#,
    )
    .unwrap()
}

/// A polled riding vehicle moved by a push: snapshot, trail and map all follow.
#[tokio::test]
async fn push_after_poll_moves_vehicle_and_extends_trajectory() {
    let (merger, _merger_task) = spawn_merger(TelemetryStateMerger::default());
    let router = TopicRouter::new();
    let ingest = TelemetryIngest::install(&router, merger.clone()).unwrap();
    let (transport, feed) = LoopbackTransport::new();
    let manager = ConnectionManager::new(transport, router.clone());

    manager.connect().await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);

    merger.apply_poll_and_wait(vec![bike_005()]).await.unwrap();

    let mut views = merger.subscribe();
    feed.send(Ok(
        r#"{"type":"mqtt","topic":"vehicle/005/gps","data":{"lat":30.0001,"lng":120.0001}}"#
            .to_string(),
    ))
    .unwrap();

    let view: Arc<FleetView> = tokio::time::timeout(
        Duration::from_secs(5),
        views.wait_for(|v| v.trajectories.contains_key(&5)),
    )
    .await
    .expect("push reached the merger")
    .map(|v| Arc::clone(&v))
    .unwrap();

    let snapshot = merger.snapshot().await.unwrap();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].status, VehicleStatus::Riding);
    assert_eq!(snapshot[0].latitude, Some(30.0001));
    assert_eq!(snapshot[0].longitude, Some(120.0001));
    assert!(snapshot[0].last_heartbeat_at.is_some());

    let trail = merger.trajectory_for(5).await.unwrap();
    assert_eq!(trail.len(), 2);
    assert_eq!((trail[0].latitude, trail[0].longitude), (30.0, 120.0));
    assert_eq!((trail[1].latitude, trail[1].longitude), (30.0001, 120.0001));
    assert!(trail[0].captured_at_millis <= trail[1].captured_at_millis);

    // The same view drives the map adapter.
    let mut surface = GeoJsonSurface::new();
    let report = MapSync::new().apply(&view, &mut surface);
    assert_eq!(report.markers_upserted, 1);
    assert_eq!(report.polylines_upserted, 1);
    assert_eq!(surface.polyline(5).unwrap().len(), 2);

    assert_eq!(ingest.message_count(), 1);
    manager.disconnect();
}

/// Pushes for vehicles the poll never reported are ignored.
#[tokio::test]
async fn push_for_unpolled_vehicle_is_ignored() {
    let (merger, _merger_task) = spawn_merger(TelemetryStateMerger::default());
    let router = TopicRouter::new();
    let ingest = TelemetryIngest::install(&router, merger.clone()).unwrap();
    let (transport, feed) = LoopbackTransport::new();
    let manager = ConnectionManager::new(transport, router);
    manager.connect().await.unwrap();

    merger
        .apply_poll_and_wait(vec![VehicleRecord { id: 1, ..bike_005() }])
        .await
        .unwrap();
    feed.send(Ok(
        r#"{"type":"mqtt","topic":"vehicle/002/status","data":{"status":"riding"}}"#.to_string(),
    ))
    .unwrap();

    // Wait until the frame has been routed, then read through the merger.
    while ingest.message_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    let ids: Vec<_> = merger.snapshot().await.unwrap().iter().map(|v| v.id).collect();
    assert_eq!(ids, vec![1]);
    manager.disconnect();
}
