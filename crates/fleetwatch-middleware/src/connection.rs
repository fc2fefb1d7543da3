//! Duplex channel lifecycle.
//!
//! [`ConnectionManager`] owns at most one live channel and drives it through
//! `Disconnected → Connecting → Connected`. Every inbound telemetry frame is
//! decoded and handed to the shared [`TopicRouter`].
//!
//! # Reconnect policy
//!
//! | Event | Effect |
//! |---|---|
//! | open fails / channel lost, attempts < max | attempts += 1, retry after `delay` |
//! | open fails / channel lost, attempts = max | give up, stay `Disconnected` |
//! | successful open | attempts reset to 0 |
//! | [`ConnectionManager::disconnect`] | pending retry cancelled, no new retries |
//!
//! An explicit [`ConnectionManager::connect`] after giving up is always
//! honoured.
//!
//! Events from a superseded channel are told apart by an epoch counter that is
//! bumped on every teardown, so a late close or a late handshake never
//! clobbers newer state.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use fleetwatch_types::{ConnectionState, FleetError};
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::frame::{InboundFrame, decode_frame};
use crate::router::TopicRouter;
use crate::transport::Transport;

/// Retries scheduled after consecutive failures before giving up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Delay before each scheduled retry.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_RECONNECT_ATTEMPTS,
            delay: RECONNECT_DELAY,
        }
    }
}

struct ConnState {
    status: ConnectionState,
    reconnect_attempts: u32,
    epoch: u64,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    pending_reconnect: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    router: TopicRouter,
    policy: ReconnectPolicy,
    client_id: Uuid,
    state: Mutex<ConnState>,
    state_tx: watch::Sender<ConnectionState>,
}

/// Cheaply cloneable handle to a single managed channel.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("endpoint", &self.inner.transport.describe())
            .field("client_id", &self.inner.client_id)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>, router: TopicRouter) -> Self {
        Self::with_policy(transport, router, ReconnectPolicy::default())
    }

    pub fn with_policy(
        transport: Arc<dyn Transport>,
        router: TopicRouter,
        policy: ReconnectPolicy,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                transport,
                router,
                policy,
                client_id: Uuid::new_v4(),
                state: Mutex::new(ConnState {
                    status: ConnectionState::Disconnected,
                    reconnect_attempts: 0,
                    epoch: 0,
                    outbound: None,
                    reader: None,
                    pending_reconnect: None,
                }),
                state_tx,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, ConnState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, state: &mut ConnState, status: ConnectionState) {
        if state.status != status {
            debug!(from = %state.status, to = %status, "connection state change");
        }
        state.status = status;
        self.inner.state_tx.send_replace(status);
    }

    // ────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ────────────────────────────────────────────────────────────────────────

    /// Open the channel.
    ///
    /// No-op (returns `Ok`) unless the manager is `Disconnected`. A failed
    /// open is reported to the caller and also counts against the retry
    /// budget, scheduling a retry while budget remains.
    pub async fn connect(&self) -> Result<(), FleetError> {
        let epoch = {
            let mut state = self.lock();
            if state.status != ConnectionState::Disconnected {
                debug!(state = %state.status, "connect ignored");
                return Ok(());
            }
            self.set_status(&mut state, ConnectionState::Connecting);
            state.epoch
        };

        let endpoint = self.inner.transport.describe();
        info!(endpoint = %endpoint, client_id = %self.inner.client_id, "opening channel");

        match self.inner.transport.open().await {
            Ok(channel) => {
                let mut state = self.lock();
                if state.epoch != epoch || state.status != ConnectionState::Connecting {
                    // Torn down while the handshake was in flight.
                    return Err(FleetError::Channel(
                        "disconnected during handshake".to_string(),
                    ));
                }
                state.reconnect_attempts = 0;
                if let Some(pending) = state.pending_reconnect.take() {
                    pending.abort();
                }
                state.outbound = Some(channel.outbound);
                state.reader = Some(self.spawn_reader(epoch, channel.inbound));
                self.set_status(&mut state, ConnectionState::Connected);
                info!(endpoint = %endpoint, "channel connected");
                Ok(())
            }
            Err(e) => {
                warn!(endpoint = %endpoint, error = %e, "channel open failed");
                self.handle_channel_lost(epoch);
                Err(e)
            }
        }
    }

    /// Close the channel and cancel any pending retry. Idempotent.
    ///
    /// The retry counter is left as is; the next successful open resets it.
    pub fn disconnect(&self) {
        let mut state = self.lock();
        if let Some(pending) = state.pending_reconnect.take() {
            pending.abort();
        }
        if let Some(reader) = state.reader.take() {
            reader.abort();
        }
        let was_open = state.outbound.take().is_some();
        state.epoch += 1;
        self.set_status(&mut state, ConnectionState::Disconnected);
        if was_open {
            info!("channel closed by operator");
        }
    }

    /// Serialise `message` and queue it on the open channel.
    ///
    /// Returns `false` (and logs) when the channel is not connected.
    pub fn send<T: Serialize>(&self, message: &T) -> bool {
        let state = self.lock();
        let outbound = match (&state.outbound, state.status) {
            (Some(outbound), ConnectionState::Connected) => outbound,
            (_, status) => {
                warn!(state = %status, "dropping outbound message: channel not connected");
                return false;
            }
        };
        match serde_json::to_string(message) {
            Ok(text) => outbound.send(text).is_ok(),
            Err(e) => {
                warn!(error = %e, "dropping outbound message: serialisation failed");
                false
            }
        }
    }

    // ────────────────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────────────────

    fn spawn_reader(
        &self,
        epoch: u64,
        mut inbound: BoxStream<'static, Result<String, FleetError>>,
    ) -> JoinHandle<()> {
        let manager = self.clone();
        tokio::spawn(async move {
            while let Some(item) = inbound.next().await {
                match item {
                    Ok(text) => manager.handle_frame(&text),
                    Err(e) => {
                        warn!(error = %e, "channel lost");
                        break;
                    }
                }
            }
            manager.handle_channel_lost(epoch);
        })
    }

    fn handle_frame(&self, text: &str) {
        match decode_frame(text) {
            Ok(InboundFrame::Telemetry { topic, data }) => {
                let invoked = self.inner.router.dispatch(&topic, &data);
                debug!(topic = %topic, handlers = invoked, "telemetry frame");
            }
            Ok(InboundFrame::Other) => debug!("ignoring non-telemetry frame"),
            Err(e) => warn!(error = %e, "discarding malformed frame"),
        }
    }

    /// Tear down after an open failure or an unexpected closure of the
    /// channel opened at `epoch`, then schedule a retry if budget remains.
    fn handle_channel_lost(&self, epoch: u64) {
        let mut state = self.lock();
        if state.epoch != epoch {
            return;
        }
        state.epoch += 1;
        state.outbound = None;
        // Detach rather than abort: this may be running on the reader itself.
        state.reader = None;
        self.set_status(&mut state, ConnectionState::Disconnected);

        let policy = self.inner.policy;
        if state.reconnect_attempts >= policy.max_attempts {
            warn!(
                attempts = state.reconnect_attempts,
                "reconnect budget exhausted; giving up"
            );
            return;
        }

        state.reconnect_attempts += 1;
        let attempt = state.reconnect_attempts;
        let scheduled_epoch = state.epoch;
        info!(
            attempt,
            max_attempts = policy.max_attempts,
            delay_ms = policy.delay.as_millis() as u64,
            "scheduling reconnect"
        );

        if let Some(previous) = state.pending_reconnect.take() {
            previous.abort();
        }
        let manager = self.clone();
        state.pending_reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(policy.delay).await;
            {
                let mut state = manager.lock();
                if state.epoch != scheduled_epoch {
                    return;
                }
                state.pending_reconnect = None;
            }
            // Failures are logged and rescheduled inside connect().
            let _ = manager.connect().await;
        }));
    }

    // ────────────────────────────────────────────────────────────────────────
    // Accessors
    // ────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.lock().status
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.lock().reconnect_attempts
    }

    pub fn has_pending_reconnect(&self) -> bool {
        self.lock().pending_reconnect.is_some()
    }

    pub fn client_id(&self) -> Uuid {
        self.inner.client_id
    }

    pub fn endpoint(&self) -> String {
        self.inner.transport.describe()
    }

    pub fn policy(&self) -> ReconnectPolicy {
        self.inner.policy
    }

    /// Watch connection state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn router(&self) -> &TopicRouter {
        &self.inner.router
    }
}
