//! Inbound frame codec for the duplex channel.
//!
//! The server sends JSON text frames tagged by `type`. Telemetry frames carry
//! a topic and an arbitrary payload:
//!
//! ```json
//! {"type": "mqtt", "topic": "vehicle/007/gps", "data": {"lat": 30.3, "lng": 120.4}}
//! ```
//!
//! Any other `type` decodes to [`InboundFrame::Other`] and is ignored by the
//! connection manager.

use fleetwatch_types::FleetError;
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundFrame {
    #[serde(rename = "mqtt", alias = "telemetry")]
    Telemetry {
        topic: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(other)]
    Other,
}

/// Decode one text frame.
///
/// # Errors
///
/// [`FleetError::Frame`] when the text is not JSON, has no `type`, or is a
/// telemetry frame without a string `topic`.
pub fn decode_frame(text: &str) -> Result<InboundFrame, FleetError> {
    serde_json::from_str(text).map_err(|e| FleetError::Frame(e.to_string()))
}
