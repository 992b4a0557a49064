//! Event model: connection states, inbound frames and the handler registry.
//!
//! ## Dispatch contract
//! - `on` appends; several handlers per key are allowed, duplicates included.
//! - `off` removes the first entry pointing at the same `Arc` allocation.
//! - `emit` runs a snapshot of the key's handlers taken when it starts, in
//!   registration order. A panicking handler is logged and skipped over;
//!   the panic never reaches the emitter.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

/// Reserved keys emitted by the adapter itself.
pub const EVENT_MESSAGE: &str = "message";
pub const EVENT_CONNECTED: &str = "connected";
pub const EVENT_DISCONNECTED: &str = "disconnected";
pub const EVENT_ERROR: &str = "error";
pub const EVENT_RECONNECT_FAILED: &str = "reconnect_failed";

/// Rendering of a missing key part, matching JavaScript string conversion.
pub const UNDEFINED_KEY: &str = "undefined";

/// Callback registered under an event key.
pub type EventHandler = Arc<dyn Fn(&Value) + Send + Sync>;

/// Callback invoked on every connection-state announcement.
pub type StateHandler = Arc<dyn Fn(ConnectionState, bool) + Send + Sync>;

/// Wrap a closure as an [`EventHandler`]. Keep the returned `Arc` to call `off` later.
pub fn handler<F>(f: F) -> EventHandler
where
    F: Fn(&Value) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Connection state
// ---------------------------------------------------------------------------

/// Browser `WebSocket.readyState` codes reported by a transport.
pub mod ready_state {
    pub const CONNECTING: u8 = 0;
    pub const OPEN: u8 = 1;
    pub const CLOSING: u8 = 2;
    pub const CLOSED: u8 = 3;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    NotInitialized,
    Connecting,
    Connected,
    Disconnected,
    Closing,
    Reconnecting,
    Error,
    /// Transport reported a ready-state code outside the known four.
    Unknown,
}

impl ConnectionState {
    /// Map a native ready-state code.
    pub fn from_ready_state(code: u8) -> Self {
        match code {
            ready_state::CONNECTING => ConnectionState::Connecting,
            ready_state::OPEN => ConnectionState::Connected,
            ready_state::CLOSING => ConnectionState::Closing,
            ready_state::CLOSED => ConnectionState::Disconnected,
            _ => ConnectionState::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::NotInitialized => "not_initialized",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Closing => "closing",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
            ConnectionState::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Inbound frames
// ---------------------------------------------------------------------------

/// Lenient typed view of an inbound domain event.
///
/// Nothing is required; consumers read whatever the server sent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WsEvent {
    #[serde(rename = "type", default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub room_id: Option<String>,
}

impl WsEvent {
    /// Typed view of an emitted frame; `None` when the shape does not fit
    /// (for example a non-object frame or a non-string `type`).
    pub fn from_value(value: &Value) -> Option<Self> {
        serde_json::from_value(value.clone()).ok()
    }
}

/// Render one part of an event key the way JavaScript string conversion would.
pub fn key_part(value: Option<&Value>) -> String {
    match value {
        None => UNDEFINED_KEY.to_string(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// The three keys an inbound frame is emitted under, in emission order:
/// its `type`, `"message"`, and `"<type>.<action>"`.
pub fn dispatch_keys(frame: &Value) -> [String; 3] {
    let event_type = key_part(frame.get("type"));
    let action = key_part(frame.get("action"));
    let compound = format!("{event_type}.{action}");
    [event_type, EVENT_MESSAGE.to_string(), compound]
}

/// JavaScript truthiness of a JSON value.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

// ---------------------------------------------------------------------------
// Registries
// ---------------------------------------------------------------------------

/// Key → ordered handler list.
#[derive(Default)]
pub struct EventRegistry {
    handlers: Mutex<HashMap<String, Vec<EventHandler>>>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&self, event: impl Into<String>, handler: EventHandler) {
        lock(&self.handlers).entry(event.into()).or_default().push(handler);
    }

    /// Remove the first registration of `handler` under `event`. Unknown keys
    /// and unregistered handlers are ignored.
    pub fn off(&self, event: &str, handler: &EventHandler) {
        let mut guard = lock(&self.handlers);
        if let Some(list) = guard.get_mut(event) {
            if let Some(index) = list.iter().position(|h| same_handler(h, handler)) {
                list.remove(index);
            }
        }
    }

    pub fn emit(&self, event: &str, data: &Value) {
        let snapshot = match lock(&self.handlers).get(event) {
            Some(list) => list.clone(),
            None => return,
        };
        for h in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| h(data))) {
                error!(event, panic = %panic_message(&*panic), "event handler panicked");
            }
        }
    }

    /// Number of handlers registered under `event`.
    pub fn handler_count(&self, event: &str) -> usize {
        lock(&self.handlers).get(event).map(Vec::len).unwrap_or(0)
    }
}

impl std::fmt::Debug for EventRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = lock(&self.handlers);
        let counts: HashMap<&str, usize> =
            guard.iter().map(|(k, v)| (k.as_str(), v.len())).collect();
        f.debug_struct("EventRegistry").field("handlers", &counts).finish()
    }
}

/// Ordered state-change listeners.
#[derive(Default)]
pub struct StateHandlers {
    handlers: Mutex<Vec<StateHandler>>,
}

impl StateHandlers {
    pub fn push(&self, handler: StateHandler) {
        lock(&self.handlers).push(handler);
    }

    pub fn notify(&self, state: ConnectionState, connected: bool) {
        let snapshot = lock(&self.handlers).clone();
        for h in snapshot {
            if let Err(panic) = catch_unwind(AssertUnwindSafe(|| h(state, connected))) {
                error!(%state, panic = %panic_message(&*panic), "state handler panicked");
            }
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.handlers).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for StateHandlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateHandlers").field("len", &self.len()).finish()
    }
}

/// Identity comparison on the allocation, ignoring vtable pointers.
fn same_handler(a: &EventHandler, b: &EventHandler) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn recorder(log: &Arc<Mutex<Vec<String>>>, label: &'static str) -> EventHandler {
        let log = Arc::clone(log);
        handler(move |data| log.lock().unwrap().push(format!("{label}:{data}")))
    }

    #[test]
    fn test_emit_runs_handlers_in_registration_order() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.on("k", recorder(&log, "h1"));
        registry.on("k", recorder(&log, "h2"));
        registry.emit("k", &json!(1));
        assert_eq!(*log.lock().unwrap(), vec!["h1:1", "h2:1"]);
    }

    #[test]
    fn test_duplicate_registration_runs_twice_and_off_removes_one() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let h = recorder(&log, "h");
        registry.on("k", Arc::clone(&h));
        registry.on("k", Arc::clone(&h));
        registry.emit("k", &json!("a"));
        assert_eq!(log.lock().unwrap().len(), 2);

        registry.off("k", &h);
        assert_eq!(registry.handler_count("k"), 1);
        registry.emit("k", &json!("b"));
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_off_only_matches_identity() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let registered = recorder(&log, "same");
        let lookalike = recorder(&log, "same");
        registry.on("k", Arc::clone(&registered));
        registry.off("k", &lookalike);
        registry.off("missing", &registered);
        assert_eq!(registry.handler_count("k"), 1);
    }

    #[test]
    fn test_panicking_handler_does_not_stop_the_rest() {
        let registry = EventRegistry::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        registry.on("k", handler(|_| panic!("boom")));
        registry.on("k", recorder(&log, "after"));
        registry.emit("k", &json!(null));
        assert_eq!(*log.lock().unwrap(), vec!["after:null"]);
    }

    #[test]
    fn test_handler_added_during_emit_waits_for_next_emit() {
        let registry = Arc::new(EventRegistry::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let late = recorder(&log, "late");
        let reg = Arc::clone(&registry);
        registry.on("k", handler(move |_| reg.on("k", Arc::clone(&late))));
        registry.emit("k", &json!(1));
        assert!(log.lock().unwrap().is_empty());
        registry.emit("k", &json!(2));
        assert_eq!(*log.lock().unwrap(), vec!["late:2"]);
    }

    #[test]
    fn test_state_handlers_receive_state_and_flag() {
        let handlers = StateHandlers::default();
        let seen: Arc<Mutex<Vec<(ConnectionState, bool)>>> = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        handlers.push(Arc::new(|_: ConnectionState, _: bool| panic!("bad listener")));
        handlers.push(Arc::new(move |state: ConnectionState, connected: bool| {
            s.lock().unwrap().push((state, connected))
        }));
        handlers.notify(ConnectionState::Connected, true);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![(ConnectionState::Connected, true)]
        );
    }

    #[test]
    fn test_from_ready_state() {
        assert_eq!(
            ConnectionState::from_ready_state(0),
            ConnectionState::Connecting
        );
        assert_eq!(
            ConnectionState::from_ready_state(1),
            ConnectionState::Connected
        );
        assert_eq!(
            ConnectionState::from_ready_state(2),
            ConnectionState::Closing
        );
        assert_eq!(
            ConnectionState::from_ready_state(3),
            ConnectionState::Disconnected
        );
        assert_eq!(
            ConnectionState::from_ready_state(9),
            ConnectionState::Unknown
        );
    }

    #[test]
    fn test_state_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&ConnectionState::NotInitialized).unwrap(),
            "\"not_initialized\""
        );
        assert_eq!(ConnectionState::Reconnecting.to_string(), "reconnecting");
    }

    #[test]
    fn test_dispatch_keys() {
        let keys = dispatch_keys(&json!({"type": "chat", "action": "send"}));
        assert_eq!(keys, ["chat", "message", "chat.send"].map(String::from));

        let keys = dispatch_keys(&json!({"success": true}));
        assert_eq!(
            keys,
            ["undefined", "message", "undefined.undefined"].map(String::from)
        );

        let keys = dispatch_keys(&json!({"type": 7, "action": null}));
        assert_eq!(keys[2], "7.null");
    }

    #[test]
    fn test_truthiness() {
        assert!(is_truthy(&json!(true)));
        assert!(is_truthy(&json!(1)));
        assert!(is_truthy(&json!("x")));
        assert!(is_truthy(&json!({})));
        assert!(!is_truthy(&json!(false)));
        assert!(!is_truthy(&json!(0)));
        assert!(!is_truthy(&json!("")));
        assert!(!is_truthy(&json!(null)));
    }

    #[test]
    fn test_ws_event_view() {
        let frame = json!({
            "type": "chat",
            "action": "send",
            "data": {"message": {"content": "hi"}},
            "timestamp": "2024-01-01T00:00:00Z",
            "username": "alice",
            "extra": 1
        });
        let event = WsEvent::from_value(&frame).unwrap();
        assert_eq!(event.event_type.as_deref(), Some("chat"));
        assert_eq!(event.data["message"]["content"], "hi");
        assert!(event.event_id.is_none());
        assert!(WsEvent::from_value(&json!([1, 2])).is_none());
    }
}
