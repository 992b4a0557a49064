//! Crate-level error type.
//!
//! Call-scoped failures (sending, subscription requests, configuration) come
//! back as [`AdapterError`]. Ambient failures on the connection itself are
//! never returned; they are emitted as `"error"` / `"reconnect_failed"` events.

use std::time::Duration;

/// Which control request a subscription-layer error belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    Subscribe,
    Unsubscribe,
}

impl ControlKind {
    /// Noun used in "Failed to send ... request" / "... request timeout".
    pub fn request_noun(&self) -> &'static str {
        match self {
            ControlKind::Subscribe => "subscription",
            ControlKind::Unsubscribe => "unsubscribe",
        }
    }

    /// Reason used when the server rejects without an `error` field.
    pub fn default_rejection(&self) -> &'static str {
        match self {
            ControlKind::Subscribe => "Subscription failed",
            ControlKind::Unsubscribe => "Unsubscribe failed",
        }
    }
}

impl std::fmt::Display for ControlKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlKind::Subscribe => write!(f, "subscribe"),
            ControlKind::Unsubscribe => write!(f, "unsubscribe"),
        }
    }
}

/// Errors surfaced by the adapter's call-scoped operations.
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// No open connection; nothing was transmitted.
    #[error("WebSocket not connected")]
    NotConnected,

    /// The transport refused the frame.
    #[error("transport send failed: {0}")]
    Transport(String),

    /// A control request could not be handed to the transport.
    #[error("Failed to send {} request", .kind.request_noun())]
    SendFailed { kind: ControlKind },

    /// The server answered a control request with a falsy `success`.
    #[error("{reason}")]
    Rejected { kind: ControlKind, reason: String },

    /// No control response arrived in time.
    #[error("{} request timeout", capitalize(.kind.request_noun()))]
    Timeout { kind: ControlKind, after: Duration },

    /// The configuration file or patch is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configured page origin cannot be turned into a WebSocket endpoint.
    #[error("invalid origin '{origin}': {detail}")]
    InvalidOrigin { origin: String, detail: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AdapterError {
    /// The control request this error belongs to, if any.
    pub fn control_kind(&self) -> Option<ControlKind> {
        match self {
            AdapterError::SendFailed { kind }
            | AdapterError::Rejected { kind, .. }
            | AdapterError::Timeout { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, AdapterError::Timeout { .. })
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

pub type Result<T> = std::result::Result<T, AdapterError>;
