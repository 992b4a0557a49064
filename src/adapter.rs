//! # WebSocketAdapter
//!
//! ## Responsibility
//! Owns one logical connection: dials through a [`Connector`], turns inbound
//! frames into a fan-out of named events, announces connection-state changes,
//! and re-dials on close with a fixed interval up to an attempt cap.
//!
//! ## Reconnect state machine
//! ```text
//! Idle ──connect()──> Connecting ──open──> Connected
//!                         ^                    │ close
//!                         │ interval elapsed   v
//!                  ReconnectScheduled <── attempts < max ──> Exhausted
//!                                                            (reconnect_failed)
//! ```
//! - A successful open resets the attempt counter to 0; `disconnect()` does not.
//! - Every `connect()` starts a new generation. Events from older handles and
//!   reconnect timers scheduled for older generations are inert.
//!
//! ## Guarantees
//! - Host callbacks (transport events, reconnect timers) for one adapter never
//!   run concurrently with each other.
//! - No handler panic or transport failure escapes an adapter method.
//!
//! ## NOT Responsible For
//! - Request/response correlation beyond arrival order (see `subscription`).
//! - Rendering anything.

use serde::Serialize;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

use crate::config::{AdapterConfig, ConfigPatch};
use crate::error::{AdapterError, Result};
use crate::events::{
    dispatch_keys, handler, lock, ConnectionState, EventHandler, EventRegistry, StateHandlers,
    EVENT_CONNECTED, EVENT_DISCONNECTED, EVENT_ERROR, EVENT_RECONNECT_FAILED,
};
use crate::subscription::PendingRequest;
use crate::transport::{
    CloseInfo, Connector, LifecycleSink, Transport, TransportEvents, TungsteniteConnector,
};

/// Outbound domain event envelope.
#[derive(Debug, Clone, Serialize)]
struct OutboundEvent<'a> {
    #[serde(rename = "type")]
    event_type: &'a str,
    action: &'a str,
    data: Value,
    timestamp: String,
}

/// ISO-8601 UTC timestamp with millisecond precision, e.g. `2024-05-01T12:00:00.000Z`.
pub fn now_iso() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[derive(Default)]
pub(crate) struct ConnSlot {
    transport: Option<Box<dyn Transport>>,
    connected: bool,
    reconnect_attempts: u32,
    generation: u64,
}

pub(crate) struct Inner {
    me: Weak<Inner>,
    config: Mutex<AdapterConfig>,
    connector: Arc<dyn Connector>,
    pub(crate) events: EventRegistry,
    state_handlers: StateHandlers,
    conn: Mutex<ConnSlot>,
    pub(crate) pending: Mutex<VecDeque<PendingRequest>>,
    pub(crate) next_request_id: AtomicU64,
    /// Serializes host callbacks.
    dispatch: Mutex<()>,
}

/// Connection/event adapter over one WebSocket endpoint.
///
/// Cheap to clone; clones share the same connection and registries.
#[derive(Clone)]
pub struct WebSocketAdapter {
    pub(crate) inner: Arc<Inner>,
}

impl WebSocketAdapter {
    /// Adapter dialing real WebSockets through [`TungsteniteConnector`].
    pub fn new(config: AdapterConfig) -> Self {
        Self::with_connector(config, Arc::new(TungsteniteConnector::new()))
    }

    pub fn with_connector(config: AdapterConfig, connector: Arc<dyn Connector>) -> Self {
        let inner = Arc::new_cyclic(|me| Inner {
            me: me.clone(),
            config: Mutex::new(config),
            connector,
            events: EventRegistry::new(),
            state_handlers: StateHandlers::default(),
            conn: Mutex::new(ConnSlot::default()),
            pending: Mutex::new(VecDeque::new()),
            next_request_id: AtomicU64::new(0),
            dispatch: Mutex::new(()),
        });
        let adapter = Self { inner };
        adapter.setup_default_handlers();
        adapter
    }

    fn setup_default_handlers(&self) {
        self.on(
            EVENT_ERROR,
            handler(|data| error!(error = %data, "WebSocket adapter error")),
        );
        self.on(
            EVENT_CONNECTED,
            handler(|_| info!("WebSocket adapter connected successfully")),
        );
        self.on(
            EVENT_DISCONNECTED,
            handler(|_| info!("WebSocket adapter disconnected")),
        );
    }

    // -- connection management ------------------------------------------

    /// Open a new transport handle, replacing (and closing) any previous one.
    ///
    /// Announces `connecting` before returning.
    ///
    /// # Errors
    /// [`AdapterError::InvalidOrigin`] when no endpoint URL can be built from
    /// the configured origin; nothing is dialed in that case.
    pub fn connect(&self) -> Result<()> {
        self.inner.connect()
    }

    /// Close the current handle, if any. Listeners and handlers stay registered.
    pub fn disconnect(&self) {
        let mut guard = lock(&self.inner.conn);
        let slot = &mut *guard;
        if let Some(transport) = slot.transport.as_ref() {
            slot.connected = false;
            transport.close();
        }
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.inner.conn).connected
    }

    /// Automatic reconnects attempted since the last successful open.
    pub fn reconnect_attempts(&self) -> u32 {
        lock(&self.inner.conn).reconnect_attempts
    }

    // -- events ---------------------------------------------------------

    pub fn on(&self, event: impl Into<String>, handler: EventHandler) {
        self.inner.events.on(event, handler);
    }

    pub fn off(&self, event: &str, handler: &EventHandler) {
        self.inner.events.off(event, handler);
    }

    pub fn emit(&self, event: &str, data: &Value) {
        self.inner.events.emit(event, data);
    }

    pub fn on_connection_state_change<F>(&self, handler: F)
    where
        F: Fn(ConnectionState, bool) + Send + Sync + 'static,
    {
        self.inner.state_handlers.push(Arc::new(handler));
    }

    /// Invoke every state handler with `(state, is_connected)`.
    pub fn notify_connection_state(&self, state: ConnectionState) {
        self.inner.notify(state);
    }

    // -- sending --------------------------------------------------------

    /// Send `{type, action, data, timestamp}`. `false` when not connected or
    /// when the transport refuses the frame.
    pub fn send_event(&self, event_type: &str, action: &str, data: Value) -> bool {
        if !self.is_connected() {
            warn!(event_type, action, "cannot send event: not connected");
            return false;
        }
        let envelope = OutboundEvent {
            event_type,
            action,
            data,
            timestamp: now_iso(),
        };
        let text = match serde_json::to_string(&envelope) {
            Ok(text) => text,
            Err(e) => {
                error!(error = %e, "failed to serialize event");
                return false;
            }
        };
        match self.inner.transmit(text) {
            Ok(()) => {
                debug!(event = %format_args!("{event_type}.{action}"), "sent event");
                true
            }
            Err(e) => {
                error!(error = %e, "failed to send event");
                false
            }
        }
    }

    /// Send pre-serialized text verbatim, with the same gate as [`send_event`](Self::send_event).
    pub fn send_raw_message(&self, text: &str) -> bool {
        if !self.is_connected() {
            warn!("cannot send message: WebSocket not connected");
            return false;
        }
        match self.inner.transmit(text.to_string()) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to send raw message");
                false
            }
        }
    }

    pub fn send_chat_message(&self, content: &str) -> bool {
        self.send_event("chat", "send", json!({ "message": { "content": content } }))
    }

    pub fn send_comment(&self, post_id: &str, content: &str) -> bool {
        self.send_event(
            "comment",
            "create",
            json!({ "comment": { "content": content }, "post_id": post_id }),
        )
    }

    pub fn update_comment(&self, comment_id: &str, content: &str) -> bool {
        self.send_event(
            "comment",
            "update",
            json!({ "comment": { "id": comment_id, "content": content } }),
        )
    }

    pub fn delete_comment(&self, comment_id: &str) -> bool {
        self.send_event(
            "comment",
            "delete",
            json!({ "comment": { "id": comment_id } }),
        )
    }

    // -- introspection --------------------------------------------------

    /// State derived from the current handle's native ready state only.
    pub fn get_connection_state(&self) -> ConnectionState {
        match lock(&self.inner.conn).transport.as_ref() {
            Some(transport) => ConnectionState::from_ready_state(transport.ready_state()),
            None => ConnectionState::NotInitialized,
        }
    }

    pub fn get_config(&self) -> AdapterConfig {
        lock(&self.inner.config).clone()
    }

    /// Shallow merge; takes effect on the next `connect()`.
    pub fn update_config(&self, patch: ConfigPatch) {
        lock(&self.inner.config).apply(patch);
    }

    pub fn endpoint_url(&self) -> Result<url::Url> {
        lock(&self.inner.config).endpoint_url()
    }
}

impl std::fmt::Debug for WebSocketAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let slot = lock(&self.inner.conn);
        f.debug_struct("WebSocketAdapter")
            .field("connected", &slot.connected)
            .field("generation", &slot.generation)
            .field("reconnect_attempts", &slot.reconnect_attempts)
            .field("events", &self.inner.events)
            .finish()
    }
}

impl Inner {
    fn connect(&self) -> Result<()> {
        let url = lock(&self.config).endpoint_url()?;
        info!(url = %url, "connecting to WebSocket");

        let generation = {
            let mut slot = lock(&self.conn);
            slot.generation += 1;
            slot.connected = false;
            slot.generation
        };
        // Announced before the handle exists: its events may arrive on another
        // thread as soon as `open` starts it.
        self.notify(ConnectionState::Connecting);

        let sink: Weak<dyn LifecycleSink> = self.me.clone();
        let transport = self
            .connector
            .open(&url, TransportEvents::new(sink, generation));

        let abandoned = {
            let mut slot = lock(&self.conn);
            if slot.generation == generation {
                slot.transport.replace(transport)
            } else {
                // A newer connect() won the race.
                Some(transport)
            }
        };
        if let Some(old) = abandoned {
            debug!("closing abandoned transport handle");
            old.close();
        }
        Ok(())
    }

    fn notify(&self, state: ConnectionState) {
        let connected = lock(&self.conn).connected;
        self.state_handlers.notify(state, connected);
    }

    fn transmit(&self, text: String) -> Result<()> {
        let slot = lock(&self.conn);
        if !slot.connected {
            return Err(AdapterError::NotConnected);
        }
        match slot.transport.as_ref() {
            Some(transport) => transport.send(text),
            None => Err(AdapterError::NotConnected),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let current = lock(&self.conn).generation;
        if current != generation {
            debug!(generation, current, "ignoring stale transport event");
        }
        current == generation
    }

    fn schedule_reconnect(&self, generation: u64) {
        let interval = lock(&self.config).reconnect_interval();
        let me = self.me.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    tokio::time::sleep(interval).await;
                    if let Some(inner) = me.upgrade() {
                        inner.reconnect_due(generation);
                    }
                });
            }
            Err(_) => warn!("no tokio runtime available; reconnect not scheduled"),
        }
    }

    fn reconnect_due(&self, generation: u64) {
        let _host = lock(&self.dispatch);
        let due = {
            let slot = lock(&self.conn);
            !slot.connected && slot.generation == generation
        };
        if !due {
            debug!(generation, "scheduled reconnect superseded");
            return;
        }
        if let Err(e) = self.connect() {
            error!(error = %e, "reconnect attempt failed to start");
        }
    }
}

impl LifecycleSink for Inner {
    fn on_open(&self, generation: u64) {
        let _host = lock(&self.dispatch);
        {
            let mut slot = lock(&self.conn);
            if slot.generation != generation {
                debug!(generation, "ignoring open from superseded transport");
                return;
            }
            slot.connected = true;
            slot.reconnect_attempts = 0;
        }
        info!("WebSocket connected");
        self.notify(ConnectionState::Connected);
        self.events.emit(EVENT_CONNECTED, &json!({}));
    }

    fn on_message(&self, generation: u64, text: &str) {
        let _host = lock(&self.dispatch);
        if !self.is_current(generation) {
            return;
        }
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "error parsing WebSocket message");
                self.events.emit(
                    EVENT_ERROR,
                    &json!({ "type": "parse_error", "error": e.to_string() }),
                );
                return;
            }
        };

        let [event_type, message, compound] = dispatch_keys(&frame);
        debug!(event = %compound, "received event");
        self.events.emit(&event_type, &frame);
        self.events.emit(&message, &frame);
        self.resolve_control_response(&frame);
        self.events.emit(&compound, &frame);
    }

    fn on_close(&self, generation: u64, close: CloseInfo) {
        let _host = lock(&self.dispatch);
        {
            let mut slot = lock(&self.conn);
            if slot.generation != generation {
                debug!(generation, "ignoring close from superseded transport");
                return;
            }
            slot.connected = false;
        }
        info!(code = close.code, reason = %close.reason, "WebSocket connection closed");
        self.notify(ConnectionState::Disconnected);
        self.events.emit(EVENT_DISCONNECTED, &json!({ "event": close }));

        let max = lock(&self.config).max_reconnect_attempts;
        let attempt = {
            let mut slot = lock(&self.conn);
            if slot.reconnect_attempts < max {
                slot.reconnect_attempts += 1;
                Some(slot.reconnect_attempts)
            } else {
                None
            }
        };
        match attempt {
            Some(attempt) => {
                info!(attempt, max, "scheduling reconnect");
                self.notify(ConnectionState::Reconnecting);
                self.schedule_reconnect(generation);
            }
            None => {
                error!(max, "max reconnect attempts reached");
                self.events.emit(EVENT_RECONNECT_FAILED, &json!({}));
            }
        }
    }

    fn on_error(&self, generation: u64, detail: String) {
        let _host = lock(&self.dispatch);
        if !self.is_current(generation) {
            return;
        }
        error!(error = %detail, "WebSocket error");
        self.notify(ConnectionState::Error);
        self.events.emit(
            EVENT_ERROR,
            &json!({ "type": "connection_error", "error": detail }),
        );
    }
}
