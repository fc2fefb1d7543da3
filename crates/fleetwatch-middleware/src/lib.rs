//! `fleetwatch-middleware` – telemetry plumbing.
//!
//! Moves raw frames from the telemetry source to in-app subscribers without
//! caring what the payloads mean.
//!
//! # Modules
//!
//! - [`router`] – hierarchical topic pattern matcher and handler registry.
//! - [`frame`] – inbound frame decoding for the backend relay protocol.
//! - [`transport`] – the [`Transport`] seam and its WebSocket implementation.
//! - [`connection`] – [`ConnectionManager`]: the single owned duplex channel,
//!   with bounded automatic reconnection.

pub mod connection;
pub mod frame;
pub mod router;
pub mod transport;

pub use connection::{ConnectionManager, MAX_RECONNECT_ATTEMPTS, RECONNECT_DELAY, ReconnectPolicy};
pub use frame::{InboundFrame, decode_frame};
pub use router::{Subscription, TopicPattern, TopicRouter};
pub use transport::{DuplexChannel, Transport, WebSocketTransport};
