//! Subscription control protocol over the uncorrelated event stream.
//!
//! A control request (`{"action": "subscribe", ...}` or
//! `{"action": "unsubscribe"}`) is answered by a frame carrying a `success`
//! field. The wire format has no request id, so answers are matched by
//! arrival order: each answer completes the oldest request still waiting.
//! A request ends on exactly one of: answer, send failure, or
//! [`SUBSCRIPTION_TIMEOUT`].

use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::adapter::{Inner, WebSocketAdapter};
use crate::error::{AdapterError, ControlKind, Result};
use crate::events::{is_truthy, lock};

pub const SUBSCRIPTION_TIMEOUT: Duration = Duration::from_millis(5000);

/// Wildcard accepted for actions and resource ids.
pub const WILDCARD: &str = "*";

/// Control frames sent raw, outside the `{type, action, data}` envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ControlRequest {
    Subscribe {
        event_type: String,
        event_action: String,
        resource_id: String,
        filters: Value,
    },
    Unsubscribe,
}

impl ControlRequest {
    pub fn kind(&self) -> ControlKind {
        match self {
            ControlRequest::Subscribe { .. } => ControlKind::Subscribe,
            ControlRequest::Unsubscribe => ControlKind::Unsubscribe,
        }
    }
}

type Reply = std::result::Result<Option<String>, AdapterError>;

/// One in-flight control request.
pub(crate) struct PendingRequest {
    id: u64,
    kind: ControlKind,
    reply: oneshot::Sender<Reply>,
}

impl WebSocketAdapter {
    /// Ask the server to deliver `event_type.event_action` events for
    /// `resource_id`. Resolves with the server's `subscription_id`, if any.
    ///
    /// `filters` defaults to `{}`.
    pub async fn subscribe(
        &self,
        event_type: &str,
        event_action: &str,
        resource_id: &str,
        filters: Option<Value>,
    ) -> Result<Option<String>> {
        let request = ControlRequest::Subscribe {
            event_type: event_type.to_string(),
            event_action: event_action.to_string(),
            resource_id: resource_id.to_string(),
            filters: filters.unwrap_or_else(|| json!({})),
        };
        let id = self.control_request(request).await?;
        info!(
            subscription = %format_args!("{event_type}.{event_action}.{resource_id}"),
            subscription_id = id.as_deref().unwrap_or("none"),
            "subscribed"
        );
        Ok(id)
    }

    /// Every comment event on one post.
    pub async fn subscribe_to_post_comments(&self, post_id: &str) -> Result<Option<String>> {
        self.subscribe("comment", WILDCARD, post_id, None).await
    }

    /// Chat messages sent in one room.
    pub async fn subscribe_to_chat_room(&self, room_id: &str) -> Result<Option<String>> {
        self.subscribe("chat", "send", room_id, None).await
    }

    pub async fn unsubscribe_all(&self) -> Result<()> {
        self.control_request(ControlRequest::Unsubscribe).await?;
        info!("unsubscribed from all subscriptions");
        Ok(())
    }

    /// Number of control requests waiting for an answer.
    pub fn pending_control_requests(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    async fn control_request(&self, request: ControlRequest) -> Result<Option<String>> {
        let kind = request.kind();
        let text = serde_json::to_string(&request)
            .map_err(|e| AdapterError::Transport(e.to_string()))?;

        let (tx, mut rx) = oneshot::channel();
        let slot = PendingSlot {
            inner: &self.inner,
            id: self.inner.enqueue_pending(kind, tx),
        };

        if !self.send_raw_message(&text) {
            return Err(AdapterError::SendFailed { kind });
        }

        match tokio::time::timeout(SUBSCRIPTION_TIMEOUT, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(AdapterError::NotConnected),
            Err(_) => {
                if self.inner.remove_pending(slot.id) {
                    warn!(%kind, "control request timed out");
                    Err(AdapterError::Timeout {
                        kind,
                        after: SUBSCRIPTION_TIMEOUT,
                    })
                } else {
                    // Answered between the deadline and the removal.
                    rx.await.unwrap_or(Err(AdapterError::NotConnected))
                }
            }
        }
    }
}

/// Removes its request from the queue when the waiting call ends, including
/// when the caller drops the future early.
struct PendingSlot<'a> {
    inner: &'a Inner,
    id: u64,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.inner.remove_pending(self.id);
    }
}

impl Inner {
    fn enqueue_pending(&self, kind: ControlKind, reply: oneshot::Sender<Reply>) -> u64 {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed) + 1;
        lock(&self.pending).push_back(PendingRequest { id, kind, reply });
        id
    }

    /// `true` when the request was still waiting and is now gone.
    fn remove_pending(&self, id: u64) -> bool {
        let mut pending = lock(&self.pending);
        match pending.iter().position(|p| p.id == id) {
            Some(index) => {
                pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Complete the oldest pending request if `frame` is a control response.
    /// Requests whose caller is no longer waiting are discarded on the way.
    pub(crate) fn resolve_control_response(&self, frame: &Value) {
        let Some(success) = frame.get("success") else {
            return;
        };
        let request = {
            let mut pending = lock(&self.pending);
            pending.retain(|p| !p.reply.is_closed());
            pending.pop_front()
        };
        let Some(request) = request else {
            debug!("control response with no pending request");
            return;
        };
        let reply = if is_truthy(success) {
            Ok(subscription_id(frame))
        } else {
            Err(AdapterError::Rejected {
                kind: request.kind,
                reason: rejection_reason(frame, request.kind),
            })
        };
        // The caller may have stopped waiting; nothing to do then.
        let _ = request.reply.send(reply);
    }
}

fn subscription_id(frame: &Value) -> Option<String> {
    match frame.get("subscription_id") {
        None | Some(Value::Null) => None,
        Some(Value::String(id)) => Some(id.clone()),
        Some(other) => Some(other.to_string()),
    }
}

fn rejection_reason(frame: &Value, kind: ControlKind) -> String {
    match frame.get("error") {
        Some(Value::String(reason)) if !reason.is_empty() => reason.clone(),
        Some(other) if is_truthy(other) => other.to_string(),
        _ => kind.default_rejection().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_request_wire_shape() {
        let request = ControlRequest::Subscribe {
            event_type: "chat".into(),
            event_action: "send".into(),
            resource_id: "room1".into(),
            filters: json!({}),
        };
        let wire: Value = serde_json::from_str(&serde_json::to_string(&request).unwrap()).unwrap();
        assert_eq!(
            wire,
            json!({
                "action": "subscribe",
                "event_type": "chat",
                "event_action": "send",
                "resource_id": "room1",
                "filters": {}
            })
        );
    }

    #[test]
    fn test_unsubscribe_request_wire_shape() {
        let text = serde_json::to_string(&ControlRequest::Unsubscribe).unwrap();
        assert_eq!(text, r#"{"action":"unsubscribe"}"#);
        assert_eq!(ControlRequest::Unsubscribe.kind(), ControlKind::Unsubscribe);
    }

    #[test]
    fn test_subscription_id_rendering() {
        assert_eq!(
            subscription_id(&json!({"subscription_id": "abc"})),
            Some("abc".into())
        );
        assert_eq!(
            subscription_id(&json!({"subscription_id": 12})),
            Some("12".into())
        );
        assert_eq!(subscription_id(&json!({"subscription_id": null})), None);
        assert_eq!(subscription_id(&json!({"success": true})), None);
    }

    #[test]
    fn test_rejection_reason_falls_back_to_default() {
        let kind = ControlKind::Subscribe;
        assert_eq!(rejection_reason(&json!({"error": "nope"}), kind), "nope");
        assert_eq!(
            rejection_reason(&json!({"error": ""}), kind),
            "Subscription failed"
        );
        assert_eq!(rejection_reason(&json!({}), kind), "Subscription failed");
        assert_eq!(
            rejection_reason(&json!({}), ControlKind::Unsubscribe),
            "Unsubscribe failed"
        );
    }
}
