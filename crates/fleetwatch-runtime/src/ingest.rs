//! Topic handlers that turn telemetry pushes into merger updates.
//!
//! | Pattern | Payload | Patch |
//! |---|---|---|
//! | `vehicle/+/heartbeat` | `{lat, lng, battery, status}` | position, battery, status, heartbeat stamp |
//! | `vehicle/+/gps` | `{lat, lng}` | position, heartbeat stamp |
//! | `vehicle/+/status` | `{status}` | status |
//! | `vehicle/#` | any | message counter only |
//!
//! The middle segment is the vehicle code; [`parse_vehicle_code`] maps it to
//! a [`VehicleId`]. Numeric fields may arrive as JSON numbers or numeric
//! strings.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use fleetwatch_middleware::{Subscription, TopicRouter};
use fleetwatch_types::{
    Coordinate, FleetError, VehicleId, VehiclePatch, VehicleStatus, clamp_battery,
};
use serde_json::Value;
use tracing::{debug, info};

use crate::service::MergerHandle;

pub const HEARTBEAT_PATTERN: &str = "vehicle/+/heartbeat";
pub const GPS_PATTERN: &str = "vehicle/+/gps";
pub const STATUS_PATTERN: &str = "vehicle/+/status";
pub const ALL_VEHICLES_PATTERN: &str = "vehicle/#";

// ────────────────────────────────────────────────────────────────────────────
// Topic and payload parsing
// ────────────────────────────────────────────────────────────────────────────

/// Map a topic's code segment to a vehicle id.
///
/// `"007"` → 7 (whole segment), `"BIKE_005"` → 5 (trailing digits).
///
/// # Errors
///
/// [`FleetError::Payload`] when the segment carries no usable number.
pub fn parse_vehicle_code(code: &str) -> Result<VehicleId, FleetError> {
    if let Ok(id) = code.parse::<VehicleId>() {
        return Ok(id);
    }
    let digits_at = code
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i);
    digits_at
        .and_then(|i| code[i..].parse::<VehicleId>().ok())
        .ok_or_else(|| FleetError::Payload(format!("no vehicle id in code segment '{code}'")))
}

/// Vehicle id addressed by `topic` (`vehicle/{code}/…`).
pub fn vehicle_id_from_topic(topic: &str) -> Result<VehicleId, FleetError> {
    let code = topic
        .split('/')
        .nth(1)
        .ok_or_else(|| FleetError::Payload(format!("topic '{topic}' has no code segment")))?;
    parse_vehicle_code(code)
}

fn number_field(payload: &Value, key: &str) -> Result<Option<f64>, FleetError> {
    match payload.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => Ok(n.as_f64()),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| FleetError::Payload(format!("field '{key}' is not numeric: {s:?}"))),
        Some(other) => Err(FleetError::Payload(format!(
            "field '{key}' has unexpected type: {other}"
        ))),
    }
}

fn position_fields(payload: &Value) -> Result<Option<Coordinate>, FleetError> {
    match (number_field(payload, "lat")?, number_field(payload, "lng")?) {
        (Some(lat), Some(lng)) => Ok(Some(Coordinate::new(lat, lng))),
        _ => Ok(None),
    }
}

fn battery_field(payload: &Value) -> Result<Option<u8>, FleetError> {
    Ok(number_field(payload, "battery")?
        .filter(|b| b.is_finite())
        .map(clamp_battery))
}

/// Patch for a heartbeat payload. An unrecognised `status` is ignored while
/// the other fields still apply.
pub fn heartbeat_patch(payload: &Value, now: DateTime<Utc>) -> Result<VehiclePatch, FleetError> {
    if !payload.is_object() {
        return Err(FleetError::Payload("heartbeat payload is not an object".to_string()));
    }
    let status = payload.get("status").and_then(Value::as_str).and_then(|raw| {
        let parsed = VehicleStatus::parse(raw);
        if parsed.is_none() {
            debug!(status = raw, "ignoring unrecognised heartbeat status");
        }
        parsed
    });
    Ok(VehiclePatch {
        status,
        battery_percent: battery_field(payload)?,
        position: position_fields(payload)?,
        last_heartbeat_at: Some(now),
    })
}

/// Patch for a gps payload. Both `lat` and `lng` are required.
pub fn gps_patch(payload: &Value, now: DateTime<Utc>) -> Result<VehiclePatch, FleetError> {
    let position = position_fields(payload)?
        .ok_or_else(|| FleetError::Payload("gps payload needs both lat and lng".to_string()))?;
    Ok(VehiclePatch {
        position: Some(position),
        last_heartbeat_at: Some(now),
        ..Default::default()
    })
}

/// Patch for a status payload.
pub fn status_patch(payload: &Value) -> Result<VehiclePatch, FleetError> {
    let raw = payload
        .get("status")
        .and_then(Value::as_str)
        .ok_or_else(|| FleetError::Payload("status payload has no 'status' string".to_string()))?;
    let status = VehicleStatus::parse(raw)
        .ok_or_else(|| FleetError::Payload(format!("unknown status '{raw}'")))?;
    Ok(VehiclePatch {
        status: Some(status),
        ..Default::default()
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Installation
// ────────────────────────────────────────────────────────────────────────────

/// The set of telemetry subscriptions feeding one merger.
#[derive(Debug)]
pub struct TelemetryIngest {
    subscriptions: Vec<Subscription>,
    messages: Arc<AtomicU64>,
}

impl TelemetryIngest {
    /// Register every telemetry handler on `router`, feeding `merger`.
    pub fn install(router: &TopicRouter, merger: MergerHandle) -> Result<Self, FleetError> {
        let messages = Arc::new(AtomicU64::new(0));
        let mut subscriptions = Vec::with_capacity(4);

        let counter = Arc::clone(&messages);
        subscriptions.push(router.register(ALL_VEHICLES_PATTERN, move |topic, _| {
            counter.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %topic, "telemetry message");
            Ok(())
        })?);

        let heartbeat_merger = merger.clone();
        subscriptions.push(router.register(HEARTBEAT_PATTERN, move |topic, payload| {
            let id = vehicle_id_from_topic(topic)?;
            let patch = heartbeat_patch(payload, Utc::now())?;
            forward(&heartbeat_merger, id, patch)
        })?);

        let gps_merger = merger.clone();
        subscriptions.push(router.register(GPS_PATTERN, move |topic, payload| {
            let id = vehicle_id_from_topic(topic)?;
            let patch = gps_patch(payload, Utc::now())?;
            forward(&gps_merger, id, patch)
        })?);

        subscriptions.push(router.register(STATUS_PATTERN, move |topic, payload| {
            let id = vehicle_id_from_topic(topic)?;
            let patch = status_patch(payload)?;
            forward(&merger, id, patch)
        })?);

        info!(
            patterns = ?[ALL_VEHICLES_PATTERN, HEARTBEAT_PATTERN, GPS_PATTERN, STATUS_PATTERN],
            "telemetry subscriptions installed"
        );
        Ok(Self {
            subscriptions,
            messages,
        })
    }

    /// Messages seen on `vehicle/#` since installation.
    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// Remove every subscription. Safe to call more than once.
    pub fn uninstall(&self) {
        for subscription in &self.subscriptions {
            subscription.unregister();
        }
    }
}

fn forward(merger: &MergerHandle, id: VehicleId, patch: VehiclePatch) -> Result<(), FleetError> {
    if merger.apply_push(id, patch) {
        Ok(())
    } else {
        Err(FleetError::Channel("merger task stopped".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merger::TelemetryStateMerger;
    use crate::service::spawn_merger;
    use fleetwatch_types::VehicleRecord;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    // ── Code parsing ────────────────────────────────────────────────────────

    /// Whole-number codes, then trailing digits, else rejection.
    #[test]
    fn code_segment_parsing() {
        assert_eq!(parse_vehicle_code("007").unwrap(), 7);
        assert_eq!(parse_vehicle_code("42").unwrap(), 42);
        assert_eq!(parse_vehicle_code("BIKE_005").unwrap(), 5);
        assert_eq!(parse_vehicle_code("b12").unwrap(), 12);
        assert!(parse_vehicle_code("BIKE").is_err());
        assert!(parse_vehicle_code("").is_err());
        assert!(parse_vehicle_code("5x").is_err());
    }

    /// The id comes from the segment after `vehicle/`.
    #[test]
    fn vehicle_id_from_topic_uses_second_segment() {
        assert_eq!(vehicle_id_from_topic("vehicle/005/gps").unwrap(), 5);
        assert!(vehicle_id_from_topic("vehicle").is_err());
    }

    // ── Payloads ────────────────────────────────────────────────────────────

    /// A full heartbeat fills every patch field; numeric strings are accepted.
    #[test]
    fn heartbeat_patch_reads_every_field() {
        let patch = heartbeat_patch(
            &json!({"lat": 30.3078, "lng": "120.4851", "battery": 87, "status": "riding"}),
            now(),
        )
        .unwrap();
        assert_eq!(patch.status, Some(VehicleStatus::Riding));
        assert_eq!(patch.battery_percent, Some(87));
        assert_eq!(patch.position, Some(Coordinate::new(30.3078, 120.4851)));
        assert_eq!(patch.last_heartbeat_at, Some(now()));
    }

    /// An unknown status is ignored without dropping the rest.
    #[test]
    fn heartbeat_with_unknown_status_keeps_other_fields() {
        let payload = json!({"lat": 30.0, "lng": 120.0, "status": "parked"});
        let patch = heartbeat_patch(&payload, now()).unwrap();
        assert_eq!(patch.status, None);
        assert!(patch.position.is_some());
    }

    /// Battery readings are rounded into `0..=100`.
    #[test]
    fn battery_is_clamped() {
        let patch = heartbeat_patch(&json!({"battery": 140.2}), now()).unwrap();
        assert_eq!(patch.battery_percent, Some(100));
        let patch = heartbeat_patch(&json!({"battery": -3}), now()).unwrap();
        assert_eq!(patch.battery_percent, Some(0));
    }

    /// Half a fix is a payload error.
    #[test]
    fn gps_patch_requires_both_axes() {
        assert!(gps_patch(&json!({"lat": 30.0}), now()).is_err());
        assert!(gps_patch(&json!({"lat": true, "lng": 1.0}), now()).is_err());
        let patch = gps_patch(&json!({"lat": 30.0, "lng": 120.0, "mode": "real"}), now()).unwrap();
        assert_eq!(patch.position, Some(Coordinate::new(30.0, 120.0)));
        assert_eq!(patch.status, None);
    }

    #[test]
    fn status_patch_rejects_unknown_status() {
        assert_eq!(
            status_patch(&json!({"status": "fault"})).unwrap().status,
            Some(VehicleStatus::Fault)
        );
        assert!(status_patch(&json!({"status": "parked"})).is_err());
        assert!(status_patch(&json!({})).is_err());
    }

    // ── Installed handlers ──────────────────────────────────────────────────

    /// Installed handlers route pushes to the merger and count every message.
    #[tokio::test]
    async fn installed_handlers_feed_the_merger_and_count_messages() {
        let (merger, _task) = spawn_merger(TelemetryStateMerger::default());
        merger.apply_poll(vec![VehicleRecord {
            id: 7,
            code: "007".to_string(),
            status: VehicleStatus::Idle,
            battery_percent: 100,
            latitude: None,
            longitude: None,
            last_heartbeat_at: None,
        }]);

        let router = TopicRouter::new();
        let ingest = TelemetryIngest::install(&router, merger.clone()).unwrap();

        router.dispatch("vehicle/007/status", &json!({"status": "riding"}));
        router.dispatch("vehicle/007/gps", &json!({"lat": 30.0, "lng": 120.0}));
        router.dispatch(
            "vehicle/007/heartbeat",
            &json!({"lat": 30.001, "lng": 120.001, "battery": 64}),
        );
        router.dispatch("vehicle/nope/gps", &json!({"lat": 1.0, "lng": 1.0}));

        let snapshot = merger.snapshot().await.unwrap();
        let v = &snapshot[0];
        assert_eq!(v.status, VehicleStatus::Riding);
        assert_eq!(v.battery_percent, 64);
        assert_eq!(v.latitude, Some(30.001));
        assert!(v.last_heartbeat_at.is_some());
        assert_eq!(merger.trajectory_for(7).await.unwrap().len(), 2);
        assert_eq!(ingest.message_count(), 4);

        ingest.uninstall();
        ingest.uninstall();
        assert!(router.is_empty());
    }
}
