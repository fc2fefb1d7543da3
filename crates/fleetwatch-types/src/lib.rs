use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Numeric vehicle identity shared by the REST layer, the topic space and the
/// map adapter.
pub type VehicleId = u32;

/// Operational status reported for a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VehicleStatus {
    Idle,
    /// In active use; the only status that accumulates a trajectory.
    Riding,
    Fault,
}

impl VehicleStatus {
    /// Parse the lowercase wire form. Returns `None` for anything else.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "idle" => Some(Self::Idle),
            "riding" => Some(Self::Riding),
            "fault" => Some(Self::Fault),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Riding => "riding",
            Self::Fault => "fault",
        }
    }
}

impl std::fmt::Display for VehicleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A latitude/longitude pair in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }
}

/// One vehicle as known to the dashboard.
///
/// The serde shape follows the REST fleet listing
/// (`{id, code, status, battery, lat, lng, lastHeartbeat}`) and also accepts
/// the backend's column names (`bike_code`, `current_lat`, …).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleRecord {
    pub id: VehicleId,
    #[serde(alias = "bike_code")]
    pub code: String,
    pub status: VehicleStatus,
    #[serde(
        rename = "battery",
        default = "default_battery",
        deserialize_with = "deserialize_battery"
    )]
    pub battery_percent: u8,
    #[serde(rename = "lat", alias = "current_lat", default)]
    pub latitude: Option<f64>,
    #[serde(rename = "lng", alias = "current_lng", default)]
    pub longitude: Option<f64>,
    #[serde(
        rename = "lastHeartbeat",
        alias = "last_heartbeat",
        default,
        deserialize_with = "deserialize_heartbeat"
    )]
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

fn default_battery() -> u8 {
    100
}

/// Any numeric reading, rounded and clamped to `0..=100`. `null` reads as
/// the default.
fn deserialize_battery<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<f64> = Option::deserialize(deserializer)?;
    Ok(raw.map_or_else(default_battery, clamp_battery))
}

/// Round a raw battery reading into a percentage.
pub fn clamp_battery(raw: f64) -> u8 {
    if raw.is_nan() {
        return 0;
    }
    raw.round().clamp(0.0, 100.0) as u8
}

/// Accepts RFC 3339 timestamps as well as the offset-less form the backend
/// emits, which is read as UTC.
fn deserialize_heartbeat<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    let Some(raw) = raw else {
        return Ok(None);
    };
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(Some(ts.with_timezone(&Utc)));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| Some(naive.and_utc()))
        .map_err(serde::de::Error::custom)
}

impl VehicleRecord {
    /// The current fix, if both halves are present.
    pub fn position(&self) -> Option<Coordinate> {
        match (self.latitude, self.longitude) {
            (Some(latitude), Some(longitude)) => Some(Coordinate { latitude, longitude }),
            _ => None,
        }
    }
}

/// Partial field set carried by a push event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct VehiclePatch {
    pub status: Option<VehicleStatus>,
    pub battery_percent: Option<u8>,
    pub position: Option<Coordinate>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
}

impl VehiclePatch {
    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.battery_percent.is_none()
            && self.position.is_none()
            && self.last_heartbeat_at.is_none()
    }
}

/// A single breadcrumb sample. Immutable once recorded.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrajectoryPoint {
    pub latitude: f64,
    pub longitude: f64,
    pub captured_at_millis: i64,
}

/// Lifecycle of the duplex telemetry channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => f.write_str("disconnected"),
            Self::Connecting => f.write_str("connecting"),
            Self::Connected => f.write_str("connected"),
        }
    }
}

/// Remote command an operator can issue against a vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VehicleCommand {
    ForceLock,
    ForceUnlock,
}

/// Body of the REST command endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    pub vehicle_id: VehicleId,
    pub command: VehicleCommand,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Aggregate counters from the dashboard-stats endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DashboardStats {
    #[serde(alias = "total_bikes")]
    pub total_vehicles: u64,
    #[serde(alias = "idle_bikes")]
    pub idle_vehicles: u64,
    #[serde(alias = "riding_bikes")]
    pub riding_vehicles: u64,
    #[serde(alias = "fault_bikes")]
    pub fault_vehicles: u64,
    pub total_users: u64,
    pub today_orders: u64,
    pub today_revenue: f64,
}

/// Error taxonomy for the telemetry pipeline.
///
/// Infrastructure variants (`Channel`, `Frame`, `Payload`, `Http`) are
/// contained and logged where they occur. Only `CommandDelivery` is meant to
/// reach the operator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FleetError {
    #[error("Channel Error: {0}")]
    Channel(String),

    #[error("Malformed Frame: {0}")]
    Frame(String),

    #[error("Payload Error: {0}")]
    Payload(String),

    #[error("Invalid Topic Pattern: {0}")]
    InvalidPattern(String),

    #[error("HTTP Error: {0}")]
    Http(String),

    #[error("Command Delivery Failed: {0}")]
    CommandDelivery(String),

    #[error("Configuration Error: {0}")]
    Config(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// The REST listing shape with an RFC 3339 heartbeat.
    #[test]
    fn vehicle_record_parses_rest_shape() {
        let json = r#"{"id":5,"code":"BIKE_005","status":"riding","battery":88,
            "lat":30.0,"lng":120.0,"lastHeartbeat":"2026-03-01T08:00:00Z"}"#;
        let record: VehicleRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.id, 5);
        assert_eq!(record.code, "BIKE_005");
        assert_eq!(record.status, VehicleStatus::Riding);
        assert_eq!(record.battery_percent, 88);
        assert_eq!(record.position(), Some(Coordinate::new(30.0, 120.0)));
        assert!(record.last_heartbeat_at.is_some());
    }

    /// Backend column names and offset-less timestamps.
    #[test]
    fn vehicle_record_accepts_backend_column_names() {
        let json = r#"{"id":1,"bike_code":"001","status":"idle","battery":100,
            "current_lat":30.3,"current_lng":120.4,"last_heartbeat":"2026-03-01T08:00:00.123456"}"#;
        let record: VehicleRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.code, "001");
        assert_eq!(record.latitude, Some(30.3));
        let ts = record.last_heartbeat_at.unwrap();
        assert_eq!(ts.timestamp_subsec_micros(), 123_456);
    }

    /// Missing coordinates mean no position; battery defaults to full.
    #[test]
    fn vehicle_record_without_fix_has_no_position() {
        let json = r#"{"id":2,"code":"002","status":"fault","lat":null}"#;
        let record: VehicleRecord = serde_json::from_str(json).unwrap();
        assert_eq!(record.position(), None);
        assert_eq!(record.battery_percent, 100);
        assert_eq!(record.last_heartbeat_at, None);
    }

    /// Battery readings outside `u8` are clamped instead of failing the row.
    #[test]
    fn vehicle_record_clamps_battery() {
        let over: VehicleRecord =
            serde_json::from_str(r#"{"id":1,"code":"001","status":"idle","battery":300}"#).unwrap();
        assert_eq!(over.battery_percent, 100);
        let under: VehicleRecord =
            serde_json::from_str(r#"{"id":1,"code":"001","status":"idle","battery":-7}"#).unwrap();
        assert_eq!(under.battery_percent, 0);
        let fractional: VehicleRecord =
            serde_json::from_str(r#"{"id":1,"code":"001","status":"idle","battery":41.6}"#)
                .unwrap();
        assert_eq!(fractional.battery_percent, 42);
        let null: VehicleRecord =
            serde_json::from_str(r#"{"id":1,"code":"001","status":"idle","battery":null}"#)
                .unwrap();
        assert_eq!(null.battery_percent, 100);
    }

    #[test]
    fn status_parse_rejects_unknown_values() {
        assert_eq!(VehicleStatus::parse("riding"), Some(VehicleStatus::Riding));
        assert_eq!(VehicleStatus::parse("RIDING"), None);
        assert_eq!(VehicleStatus::parse("parked"), None);
    }

    /// Wire shape of the command body.
    #[test]
    fn command_request_uses_camel_case_and_snake_commands() {
        let req = CommandRequest {
            vehicle_id: 7,
            command: VehicleCommand::ForceLock,
            reason: None,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert_eq!(json, r#"{"vehicleId":7,"command":"force_lock"}"#);
    }

    /// Absent counters read as zero.
    #[test]
    fn dashboard_stats_fill_missing_fields_with_zero() {
        let stats: DashboardStats =
            serde_json::from_str(r#"{"total_bikes":12,"today_revenue":31.5}"#).unwrap();
        assert_eq!(stats.total_vehicles, 12);
        assert_eq!(stats.riding_vehicles, 0);
        assert!((stats.today_revenue - 31.5).abs() < f64::EPSILON);
    }

    #[test]
    fn empty_patch_reports_empty() {
        assert!(VehiclePatch::default().is_empty());
        let patch = VehiclePatch {
            battery_percent: Some(50),
            ..Default::default()
        };
        assert!(!patch.is_empty());
    }

    /// Error messages name their category.
    #[test]
    fn fleet_error_display() {
        let err = FleetError::CommandDelivery("HTTP 404".to_string());
        assert!(err.to_string().contains("Command Delivery Failed"));
        assert!(err.to_string().contains("HTTP 404"));
    }
}
