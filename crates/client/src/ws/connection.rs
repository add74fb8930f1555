//! Connection manager: one socket at a time, heartbeat, and reconnect with
//! capped exponential backoff.
//!
//! ```text
//!              connect()                 socket open
//! Disconnected ─────────► Connecting ────────────────► Connected
//!      ▲                      │ open failed                │ unsolicited close
//!      │                      ▼                            ▼
//!      └──── max attempts ── (caller: error)     ReconnectScheduled
//!                            (reconnect: close)   │  backoff elapsed
//!                                                 └────► Connecting
//! ```
//!
//! Timers (heartbeat, scheduled reconnect) and the socket reader are tokio
//! tasks owned by the manager. Each holds only a weak reference back and
//! re-checks the connection epoch under the state lock before acting, so
//! nothing they do can land after [`ConnectionManager::disconnect`] returns.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use chasper_shared::{ControlFrame, Event, FrameError};
use futures_channel::mpsc::{UnboundedReceiver, UnboundedSender};
use futures_util::StreamExt;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use url::Url;

use super::transport::{SocketFrame, Transport, TransportError};
use crate::config::ClientConfig;

/// Connection state of the manager.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    ReconnectScheduled,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting | ConnectionState::ReconnectScheduled
        )
    }
}

/// Configuration for auto-reconnect behavior
#[derive(Debug, Clone, PartialEq)]
pub struct ReconnectConfig {
    /// Delay before the first automatic attempt
    pub base_interval: Duration,
    /// Automatic attempts after an unsolicited close before giving up
    pub max_attempts: u32,
    /// Longest delay between attempts
    pub cap: Duration,
    /// Shave up to a fifth off each delay at random
    pub jitter: bool,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_interval: Duration::from_millis(5000),
            max_attempts: 5,
            cap: Duration::from_millis(30000),
            jitter: false,
        }
    }
}

impl ReconnectConfig {
    /// Delay before automatic attempt `attempt` (1-based):
    /// `min(base * 2^(attempt - 1), cap)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self.base_interval.saturating_mul(1u32 << exponent).min(self.cap);
        if !self.jitter {
            return delay;
        }

        let spread = (delay / 5).as_millis() as u64;
        if spread == 0 {
            return delay;
        }
        delay - Duration::from_millis(rand::thread_rng().gen_range(0..=spread))
    }
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("already connecting")]
    AlreadyConnecting,
    #[error("connect attempt aborted by disconnect")]
    Aborted,
    #[error("invalid server address: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Listener for parsed inbound events. An `Err` is logged and does not stop
/// other listeners.
pub type EventHandler = Arc<dyn Fn(&Event) -> anyhow::Result<()> + Send + Sync>;
/// Listener for connected (`true`) / disconnected (`false`) transitions.
pub type StateHandler = Arc<dyn Fn(bool) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HandlerKind {
    Event,
    State,
}

/// Registration returned by the `add_*_handler` methods.
pub struct Subscription {
    id: u64,
    kind: HandlerKind,
    shared: Weak<Shared>,
}

impl Subscription {
    /// Remove the listener. Later events are not delivered to it.
    pub fn unsubscribe(self) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        match self.kind {
            HandlerKind::Event => lock(&shared.event_handlers).retain(|(id, _)| *id != self.id),
            HandlerKind::State => lock(&shared.state_handlers).retain(|(id, _)| *id != self.id),
        }
    }
}

/// Who asked for a connect attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Reconnect,
}

#[derive(Default)]
struct Inner {
    state: ConnectionState,
    attempts: u32,
    /// Bumped whenever a socket or timer is superseded.
    epoch: u64,
    /// Address (with credential) of the last caller-initiated connect.
    address: Option<String>,
    outbound: Option<UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Inner {
    fn stop_tasks(&mut self) {
        for handle in [self.reader.take(), self.heartbeat.take(), self.reconnect.take()]
            .into_iter()
            .flatten()
        {
            handle.abort();
        }
    }
}

struct Shared {
    url: String,
    reconnect: ReconnectConfig,
    heartbeat_interval: Duration,
    transport: Arc<dyn Transport>,
    inner: Mutex<Inner>,
    event_handlers: Mutex<Vec<(u64, EventHandler)>>,
    state_handlers: Mutex<Vec<(u64, StateHandler)>>,
    next_handler_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Owner of the realtime connection. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        url: impl Into<String>,
        reconnect: ReconnectConfig,
        heartbeat_interval: Duration,
        transport: Arc<dyn Transport>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                url: url.into(),
                reconnect,
                heartbeat_interval,
                transport,
                inner: Mutex::new(Inner::default()),
                event_handlers: Mutex::new(Vec::new()),
                state_handlers: Mutex::new(Vec::new()),
                next_handler_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn from_config(config: &ClientConfig, transport: Arc<dyn Transport>) -> Self {
        Self::new(
            config.ws_url.clone(),
            config.reconnect.clone(),
            config.heartbeat_interval,
            transport,
        )
    }

    pub fn url(&self) -> &str {
        &self.shared.url
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.shared.inner).state
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    /// Automatic attempts made since the last successful open.
    pub fn attempts(&self) -> u32 {
        lock(&self.shared.inner).attempts
    }

    /// Open the connection, appending `credential` as the `token` query
    /// parameter. Automatic reconnects reuse the same address.
    ///
    /// Resolves immediately when already connected. A scheduled reconnect is
    /// cancelled and replaced by this attempt. A failed open is returned to
    /// the caller and does not schedule a retry.
    pub async fn connect(&self, credential: Option<&str>) -> Result<(), ConnectionError> {
        let address = self.address(credential)?;
        let epoch = {
            let mut inner = lock(&self.shared.inner);
            match inner.state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Connecting => return Err(ConnectionError::AlreadyConnecting),
                ConnectionState::ReconnectScheduled => {
                    if let Some(handle) = inner.reconnect.take() {
                        handle.abort();
                    }
                }
                ConnectionState::Disconnected => {}
            }
            inner.state = ConnectionState::Connecting;
            inner.epoch += 1;
            inner.address = Some(address.clone());
            inner.epoch
        };

        crate::log_info!("Connecting to {}", self.shared.url);
        self.establish(epoch, &address, Origin::Caller).await
    }

    /// Close the socket, stop every timer, and turn off automatic
    /// reconnection until the next [`connect`](Self::connect). Idempotent.
    pub fn disconnect(&self) {
        let was_connected = {
            let mut inner = lock(&self.shared.inner);
            inner.epoch += 1;
            inner.attempts = self.shared.reconnect.max_attempts;
            // Dropping the sender closes the socket
            inner.outbound = None;
            inner.stop_tasks();
            if inner.state.is_connecting() {
                crate::log_debug!("Cancelling pending connection to {}", self.shared.url);
            }
            let was_connected = inner.state.is_connected();
            inner.state = ConnectionState::Disconnected;
            was_connected
        };

        if was_connected {
            crate::log_info!("Disconnected from {}", self.shared.url);
            self.shared.notify_state(false);
        }
    }

    /// Serialize and transmit `payload`. When not connected the payload is
    /// dropped with a warning. Returns whether the frame was queued.
    pub fn send<T: Serialize + ?Sized>(&self, payload: &T) -> bool {
        let text = match serde_json::to_string(payload) {
            Ok(text) => text,
            Err(e) => {
                crate::log_error!("Serialize failed: {}", e);
                return false;
            }
        };

        let inner = lock(&self.shared.inner);
        match (&inner.outbound, inner.state) {
            (Some(outbound), ConnectionState::Connected) => outbound.unbounded_send(text).is_ok(),
            _ => {
                crate::log_warn!("WebSocket not connected, cannot send message");
                false
            }
        }
    }

    pub fn add_event_handler<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&Event) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.event_handlers).push((id, Arc::new(handler)));
        Subscription {
            id,
            kind: HandlerKind::Event,
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn add_connection_state_handler<F>(&self, handler: F) -> Subscription
    where
        F: Fn(bool) + Send + Sync + 'static,
    {
        let id = self.shared.next_handler_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.shared.state_handlers).push((id, Arc::new(handler)));
        Subscription {
            id,
            kind: HandlerKind::State,
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn address(&self, credential: Option<&str>) -> Result<String, ConnectionError> {
        let mut url =
            Url::parse(&self.shared.url).map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        if let Some(token) = credential {
            url.query_pairs_mut().append_pair("token", token);
        }
        Ok(url.into())
    }

    async fn establish(&self, epoch: u64, address: &str, origin: Origin) -> Result<(), ConnectionError> {
        let mut pending = PendingOpen {
            shared: &self.shared,
            epoch,
            armed: true,
        };
        let opened = self.shared.transport.open(address).await;
        pending.armed = false;

        let mut inner = lock(&self.shared.inner);
        if inner.epoch != epoch || inner.state != ConnectionState::Connecting {
            // disconnect() won the race; dropping the pair closes the socket
            return Err(ConnectionError::Aborted);
        }

        match opened {
            Ok(pair) => {
                inner.state = ConnectionState::Connected;
                inner.attempts = 0;
                inner.reconnect = None;
                inner.outbound = Some(pair.outbound);
                inner.reader = Some(tokio::spawn(read_loop(
                    Arc::downgrade(&self.shared),
                    epoch,
                    pair.inbound,
                )));
                inner.heartbeat = Some(tokio::spawn(heartbeat_loop(
                    Arc::downgrade(&self.shared),
                    epoch,
                    self.shared.heartbeat_interval,
                )));
                drop(inner);

                crate::log_info!("WebSocket connected to {}", self.shared.url);
                self.shared.notify_state(true);
                Ok(())
            }
            Err(e) => {
                inner.state = ConnectionState::Disconnected;
                if origin == Origin::Reconnect {
                    // Same as a close: report it and back off again
                    self.shared.schedule_reconnect(&mut inner);
                    drop(inner);
                    crate::log_error!("Reconnection failed: {}", e);
                    self.shared.notify_state(false);
                } else {
                    drop(inner);
                    crate::log_error!("WebSocket error for {}: {}", self.shared.url, e);
                }
                Err(e.into())
            }
        }
    }
}

/// Held across a transport open. If the attempt's future is dropped before
/// the open resolves, the manager falls back to `Disconnected` so a later
/// [`ConnectionManager::connect`] is not refused.
struct PendingOpen<'a> {
    shared: &'a Arc<Shared>,
    epoch: u64,
    armed: bool,
}

impl Drop for PendingOpen<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut inner = lock(&self.shared.inner);
        if inner.epoch == self.epoch && inner.state == ConnectionState::Connecting {
            inner.epoch += 1;
            inner.state = ConnectionState::Disconnected;
            drop(inner);
            crate::log_warn!("Connect attempt to {} was cancelled", self.shared.url);
        }
    }
}

impl Shared {
    /// Stop the live connection after an unsolicited close.
    fn handle_close(self: &Arc<Self>, epoch: u64, reason: &str) {
        {
            let mut inner = lock(&self.inner);
            if inner.epoch != epoch || !inner.state.is_connected() {
                return;
            }
            inner.outbound = None;
            if let Some(handle) = inner.heartbeat.take() {
                handle.abort();
            }
            // Called from the reader itself, which returns right after
            inner.reader = None;
            inner.state = ConnectionState::Disconnected;
            self.schedule_reconnect(&mut inner);
        }

        crate::log_info!("WebSocket to {} closed: {}", self.url, reason);
        self.notify_state(false);
    }

    /// Schedule the next automatic attempt unless the attempt budget is spent.
    fn schedule_reconnect(self: &Arc<Self>, inner: &mut Inner) {
        if inner.attempts >= self.reconnect.max_attempts {
            crate::log_info!("Max reconnect attempts reached");
            return;
        }

        inner.attempts += 1;
        let attempt = inner.attempts;
        let delay = self.reconnect.delay_for_attempt(attempt);
        let epoch = inner.epoch;
        inner.state = ConnectionState::ReconnectScheduled;

        let weak = Arc::downgrade(self);
        inner.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(shared) = weak.upgrade() {
                ConnectionManager { shared }.reconnect(epoch, attempt).await;
            }
        }));
        crate::log_info!("Reconnecting to {} in {:?} (attempt {})", self.url, delay, attempt);
    }

    fn send_heartbeat(&self, epoch: u64) -> bool {
        let inner = lock(&self.inner);
        if inner.epoch != epoch || !inner.state.is_connected() {
            return false;
        }
        let Some(outbound) = &inner.outbound else {
            return false;
        };
        match serde_json::to_string(&ControlFrame::Ping) {
            Ok(ping) => outbound.unbounded_send(ping).is_ok(),
            Err(e) => {
                crate::log_error!("Serialize failed: {}", e);
                false
            }
        }
    }

    fn dispatch_frame(&self, text: &str) {
        match Event::from_frame(text) {
            Ok(event) => self.notify_event(&event),
            Err(FrameError::UnknownType(kind)) if kind == "pong" => {
                crate::log_debug!("Heartbeat acknowledged");
            }
            Err(FrameError::UnknownType(kind)) => {
                crate::log_warn!("Unknown event type: {}", kind);
            }
            Err(e) => crate::log_error!("Failed to parse WebSocket message: {}", e),
        }
    }

    fn notify_event(&self, event: &Event) {
        let handlers: Vec<EventHandler> =
            lock(&self.event_handlers).iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => crate::log_error!("Event handler error: {:#}", e),
                Err(_) => crate::log_error!("Event handler panicked on {}", event.type_name()),
            }
        }
    }

    fn notify_state(&self, connected: bool) {
        let handlers: Vec<StateHandler> =
            lock(&self.state_handlers).iter().map(|(_, h)| h.clone()).collect();
        for handler in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(connected))).is_err() {
                crate::log_error!("Connection state handler panicked");
            }
        }
    }
}

impl ConnectionManager {
    /// Body of a scheduled reconnect, run once its backoff has elapsed.
    async fn reconnect(&self, epoch: u64, attempt: u32) {
        let (epoch, address) = {
            let mut inner = lock(&self.shared.inner);
            if inner.epoch != epoch || inner.state != ConnectionState::ReconnectScheduled {
                return;
            }
            let Some(address) = inner.address.clone() else {
                inner.state = ConnectionState::Disconnected;
                return;
            };
            inner.state = ConnectionState::Connecting;
            inner.epoch += 1;
            (inner.epoch, address)
        };

        crate::log_info!("Reconnecting... (attempt {})", attempt);
        // Failures are logged and rescheduled inside establish
        let _ = self.establish(epoch, &address, Origin::Reconnect).await;
    }
}

async fn read_loop(shared: Weak<Shared>, epoch: u64, mut inbound: UnboundedReceiver<SocketFrame>) {
    while let Some(frame) = inbound.next().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        match frame {
            SocketFrame::Text(text) => shared.dispatch_frame(&text),
            SocketFrame::Closed { reason } => {
                shared.handle_close(epoch, &reason);
                return;
            }
        }
    }

    if let Some(shared) = shared.upgrade() {
        shared.handle_close(epoch, "transport stream ended");
    }
}

async fn heartbeat_loop(shared: Weak<Shared>, epoch: u64, period: Duration) {
    // Zero disables the heartbeat
    if period.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if !shared.send_heartbeat(epoch) {
            return;
        }
        crate::log_debug!("Heartbeat sent");
    }
}
