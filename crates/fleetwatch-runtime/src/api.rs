//! REST collaborator client.
//!
//! The backend owns vehicles, users and orders; this side only consumes three
//! endpoints:
//!
//! | Call | Endpoint |
//! |---|---|
//! | [`FleetApi::fetch_fleet`] | `GET {base}/bikes` |
//! | [`FleetApi::send_command`] | `POST {base}/admin/command` |
//! | [`FleetApi::dashboard_stats`] | `GET {base}/admin/dashboard` |
//!
//! Command failures of any kind surface as [`FleetError::CommandDelivery`]
//! and are never retried here. Poll and stats failures are
//! [`FleetError::Http`].

use std::time::Duration;

use async_trait::async_trait;
use fleetwatch_types::{CommandRequest, DashboardStats, FleetError, VehicleRecord};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Failure modes of a single HTTP exchange.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("HTTP {status}: {body}")]
    Rejected { status: u16, body: String },
}

impl From<ApiError> for FleetError {
    fn from(err: ApiError) -> Self {
        FleetError::Http(err.to_string())
    }
}

/// The REST operations the pipeline depends on.
#[async_trait]
pub trait FleetApi: Send + Sync {
    /// Current fleet listing.
    async fn fetch_fleet(&self) -> Result<Vec<VehicleRecord>, FleetError>;

    /// Deliver an operator command.
    async fn send_command(&self, request: &CommandRequest) -> Result<(), FleetError>;

    /// Aggregate dashboard counters.
    async fn dashboard_stats(&self) -> Result<DashboardStats, FleetError>;
}

/// The fleet endpoint answers either with a bare array or with a page object.
///
/// Rows are kept as raw JSON so one malformed vehicle cannot sink the whole
/// listing.
#[derive(Deserialize)]
#[serde(untagged)]
enum FleetListing {
    Bare(Vec<Value>),
    Page { items: Vec<Value> },
}

impl FleetListing {
    fn into_records(self) -> Vec<VehicleRecord> {
        let (Self::Bare(rows) | Self::Page { items: rows }) = self;
        rows.into_iter().filter_map(decode_row).collect()
    }
}

/// Decode one listing row; malformed rows are dropped with a `warn!`.
fn decode_row(row: Value) -> Option<VehicleRecord> {
    let id = row.get("id").cloned().unwrap_or(Value::Null);
    match serde_json::from_value::<VehicleRecord>(row) {
        Ok(record) => Some(record),
        Err(e) => {
            warn!(row_id = %id, error = %e, "dropping malformed fleet row");
            None
        }
    }
}

/// [`FleetApi`] over `reqwest`.
pub struct HttpFleetApi {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpFleetApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpFleetApi")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl HttpFleetApi {
    /// Build a client rooted at `base_url` (e.g. `http://localhost:8000/api`).
    ///
    /// An empty `token` is treated as no token.
    pub fn new(
        base_url: impl Into<String>,
        timeout: Duration,
        token: Option<String>,
    ) -> Result<Self, FleetError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FleetError::Http(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.filter(|t| !t.is_empty()),
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn authorise(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn checked(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(ApiError::Rejected {
            status: status.as_u16(),
            body,
        })
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.authorise(self.client.get(self.url(path))).send().await?;
        Ok(Self::checked(response).await?.json().await?)
    }
}

#[async_trait]
impl FleetApi for HttpFleetApi {
    async fn fetch_fleet(&self) -> Result<Vec<VehicleRecord>, FleetError> {
        let listing: FleetListing = self.get_json("/bikes").await?;
        let records = listing.into_records();
        debug!(count = records.len(), "fleet listing fetched");
        Ok(records)
    }

    async fn send_command(&self, request: &CommandRequest) -> Result<(), FleetError> {
        let outcome = async {
            let response = self
                .authorise(self.client.post(self.url("/admin/command")))
                .json(request)
                .send()
                .await?;
            Self::checked(response).await?;
            Ok::<(), ApiError>(())
        }
        .await;

        outcome.map_err(|e| {
            warn!(
                vehicle_id = request.vehicle_id,
                command = ?request.command,
                error = %e,
                "command delivery failed"
            );
            FleetError::CommandDelivery(e.to_string())
        })
    }

    async fn dashboard_stats(&self) -> Result<DashboardStats, FleetError> {
        Ok(self.get_json("/admin/dashboard").await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetwatch_types::{VehicleCommand, VehicleStatus};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// One-shot HTTP server: answers a single request with `status` and
    /// `body`, and hands back the raw request text.
    async fn serve_once(status: &'static str, body: &'static str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 4096];
            loop {
                let n = stream.read(&mut buf).await.unwrap();
                raw.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&raw).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let content_length = text[..head_end]
                        .lines()
                        .find_map(|l| {
                            let (name, value) = l.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length")
                                .then(|| value.trim().parse::<usize>().ok())
                                .flatten()
                        })
                        .unwrap_or(0);
                    if raw.len() >= head_end + 4 + content_length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.unwrap();
            String::from_utf8_lossy(&raw).to_string()
        });
        (base, handle)
    }

    fn api(base: &str, token: Option<&str>) -> HttpFleetApi {
        HttpFleetApi::new(base, Duration::from_secs(5), token.map(str::to_string)).unwrap()
    }

    /// The listing may be a plain JSON array.
    #[tokio::test]
    async fn fetch_fleet_accepts_bare_array() {
        let (base, server) = serve_once(
            "200 OK",
            r#"[{"id":5,"code":"BIKE_005","status":"riding","battery":90,"lat":30.0,"lng":120.0,"lastHeartbeat":null}]"#,
        )
        .await;

        let fleet = api(&base, None).fetch_fleet().await.unwrap();

        assert_eq!(fleet.len(), 1);
        assert_eq!(fleet[0].status, VehicleStatus::Riding);
        let request = server.await.unwrap();
        assert!(request.starts_with("GET /api/bikes "));
    }

    /// Paged listings with backend column names, sent with the bearer token.
    #[tokio::test]
    async fn fetch_fleet_accepts_page_object_with_backend_columns() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"total":1,"items":[{"id":1,"bike_code":"001","status":"idle","battery":100,"current_lat":30.3,"current_lng":120.4}]}"#,
        )
        .await;

        let fleet = api(&base, Some("secret")).fetch_fleet().await.unwrap();

        assert_eq!(fleet[0].code, "001");
        assert_eq!(fleet[0].longitude, Some(120.4));
        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.contains("authorization: bearer secret"));
    }

    /// One vehicle with an unknown status must not hide the rest of the fleet.
    #[tokio::test]
    async fn fetch_fleet_drops_only_the_malformed_row() {
        let (base, _server) = serve_once(
            "200 OK",
            r#"[{"id":1,"code":"BIKE_001","status":"idle","battery":80,"lat":30.0,"lng":120.0},{"id":2,"code":"BIKE_002","status":"maintenance","battery":50}]"#,
        )
        .await;

        let fleet = api(&base, None).fetch_fleet().await.unwrap();

        assert_eq!(fleet.len(), 1);
        assert_eq!(fleet[0].id, 1);
    }

    /// Out-of-range battery readings are clamped rather than rejected.
    #[tokio::test]
    async fn fetch_fleet_clamps_battery() {
        let (base, _server) = serve_once(
            "200 OK",
            r#"[{"id":1,"code":"BIKE_001","status":"idle","battery":300},{"id":2,"code":"BIKE_002","status":"fault","battery":-4}]"#,
        )
        .await;

        let fleet = api(&base, None).fetch_fleet().await.unwrap();

        assert_eq!(fleet.len(), 2);
        assert_eq!(fleet[0].battery_percent, 100);
        assert_eq!(fleet[1].battery_percent, 0);
    }

    #[test]
    fn decode_row_rejects_missing_id() {
        assert!(decode_row(serde_json::json!({"code":"X","status":"idle"})).is_none());
    }

    /// A 5xx on poll is an HTTP error carrying the status.
    #[tokio::test]
    async fn fetch_fleet_server_error_is_http_error() {
        let (base, _server) = serve_once("500 Internal Server Error", r#"{"detail":"boom"}"#).await;
        let err = api(&base, None).fetch_fleet().await.unwrap_err();
        assert!(matches!(err, FleetError::Http(ref m) if m.contains("500")), "{err:?}");
    }

    /// Commands post `{vehicleId, command, reason}`.
    #[tokio::test]
    async fn send_command_posts_camel_case_body() {
        let (base, server) = serve_once("200 OK", r#"{"success":true}"#).await;
        let request = CommandRequest {
            vehicle_id: 3,
            command: VehicleCommand::ForceUnlock,
            reason: Some("stuck".to_string()),
        };

        api(&base, None).send_command(&request).await.unwrap();

        let raw = server.await.unwrap();
        assert!(raw.starts_with("POST /api/admin/command "));
        assert!(raw.contains(r#""vehicleId":3"#));
        assert!(raw.contains(r#""command":"force_unlock""#));
        assert!(raw.contains(r#""reason":"stuck""#));
    }

    /// A rejected command surfaces the server's status and body.
    #[tokio::test]
    async fn rejected_command_is_command_delivery_error() {
        let (base, _server) = serve_once("404 Not Found", r#"{"detail":"bike not found"}"#).await;
        let request = CommandRequest {
            vehicle_id: 99,
            command: VehicleCommand::ForceLock,
            reason: None,
        };

        let err = api(&base, None).send_command(&request).await.unwrap_err();

        match err {
            FleetError::CommandDelivery(message) => {
                assert!(message.contains("404"));
                assert!(message.contains("bike not found"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    /// Transport failures on commands are delivery errors too.
    #[tokio::test]
    async fn unreachable_backend_command_is_command_delivery_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        drop(listener);
        let request = CommandRequest {
            vehicle_id: 1,
            command: VehicleCommand::ForceLock,
            reason: None,
        };

        let err = api(&base, None).send_command(&request).await.unwrap_err();
        assert!(matches!(err, FleetError::CommandDelivery(_)));
    }

    /// Dashboard counters accept the backend's `*_bikes` names.
    #[tokio::test]
    async fn dashboard_stats_parse_backend_names() {
        let (base, server) = serve_once(
            "200 OK",
            r#"{"total_bikes":10,"idle_bikes":6,"riding_bikes":3,"fault_bikes":1,"total_users":40,"today_orders":12,"today_revenue":58.5}"#,
        )
        .await;

        let stats = api(&base, None).dashboard_stats().await.unwrap();

        assert_eq!(stats.total_vehicles, 10);
        assert_eq!(stats.riding_vehicles, 3);
        assert_eq!(stats.today_orders, 12);
        assert!(server.await.unwrap().starts_with("GET /api/admin/dashboard "));
    }

    #[test]
    fn debug_redacts_token() {
        let api = api("http://localhost:8000/api/", Some("hunter2"));
        let rendered = format!("{api:?}");
        assert!(!rendered.contains("hunter2"));
        assert_eq!(api.base_url(), "http://localhost:8000/api");
    }
}
