//! Duplex transport seam.
//!
//! The adapter never talks to a socket directly. A [`Connector`] opens one
//! [`Transport`] handle per `connect()` and reports that handle's lifecycle
//! through the [`TransportEvents`] it was given, mirroring the browser
//! `WebSocket` object: a synchronous `send`/`close`, a numeric ready state,
//! and asynchronous open/message/close/error callbacks.
//!
//! [`TungsteniteConnector`] is the production implementation: one tokio task
//! per handle running `tokio-tungstenite`, with outbound frames queued over an
//! unbounded channel so `send` never blocks.

use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

use crate::error::{AdapterError, Result};
use crate::events::ready_state;

/// Close code reported when the connection dropped without a close frame.
pub const CLOSE_ABNORMAL: u16 = 1006;
pub const CLOSE_NORMAL: u16 = 1000;

/// Details of a native close event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseInfo {
    pub code: u16,
    pub reason: String,
    pub was_clean: bool,
}

impl CloseInfo {
    pub fn normal() -> Self {
        Self {
            code: CLOSE_NORMAL,
            reason: String::new(),
            was_clean: true,
        }
    }

    pub fn abnormal() -> Self {
        Self {
            code: CLOSE_ABNORMAL,
            reason: String::new(),
            was_clean: false,
        }
    }
}

/// One open (or opening) connection handle.
///
/// Implementations must not call back into [`TransportEvents`] from inside
/// `send` or `close`; lifecycle events are always delivered later.
pub trait Transport: Send + Sync {
    /// Queue one text frame. Fails when the handle cannot transmit.
    fn send(&self, text: String) -> Result<()>;

    /// Request a close. The close event arrives asynchronously.
    fn close(&self);

    /// Browser ready-state code, see [`ready_state`].
    fn ready_state(&self) -> u8;
}

/// Factory for transport handles.
pub trait Connector: Send + Sync {
    /// Start opening a connection to `url`. Lifecycle events for the returned
    /// handle must be reported through `events`.
    fn open(&self, url: &url::Url, events: TransportEvents) -> Box<dyn Transport>;
}

/// Receiver of lifecycle events, implemented by the adapter.
pub(crate) trait LifecycleSink: Send + Sync {
    fn on_open(&self, generation: u64);
    fn on_message(&self, generation: u64, text: &str);
    fn on_close(&self, generation: u64, close: CloseInfo);
    fn on_error(&self, generation: u64, detail: String);
}

/// Lifecycle callback handle given to a [`Connector`] for one handle.
///
/// Tagged with the connection generation it was created for; the adapter
/// ignores events from superseded generations. Events delivered after the
/// adapter has been dropped go nowhere.
#[derive(Clone)]
pub struct TransportEvents {
    sink: Weak<dyn LifecycleSink>,
    generation: u64,
}

impl TransportEvents {
    pub(crate) fn new(sink: Weak<dyn LifecycleSink>, generation: u64) -> Self {
        Self { sink, generation }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn opened(&self) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_open(self.generation);
        }
    }

    pub fn message(&self, text: &str) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_message(self.generation, text);
        }
    }

    pub fn closed(&self, close: CloseInfo) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_close(self.generation, close);
        }
    }

    pub fn error(&self, detail: impl Into<String>) {
        if let Some(sink) = self.sink.upgrade() {
            sink.on_error(self.generation, detail.into());
        }
    }
}

impl std::fmt::Debug for TransportEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportEvents")
            .field("generation", &self.generation)
            .field("attached", &(self.sink.strong_count() > 0))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// tokio-tungstenite implementation
// ---------------------------------------------------------------------------

enum Outbound {
    Text(String),
    Close,
}

/// How long a closing handle waits for the peer's close frame before giving up.
pub const CLOSE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Opens real WebSocket connections on the ambient tokio runtime.
#[derive(Debug, Clone)]
pub struct TungsteniteConnector {
    close_timeout: Duration,
}

impl TungsteniteConnector {
    pub fn new() -> Self {
        Self::with_close_timeout(CLOSE_HANDSHAKE_TIMEOUT)
    }

    pub fn with_close_timeout(close_timeout: Duration) -> Self {
        Self { close_timeout }
    }
}

impl Default for TungsteniteConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for TungsteniteConnector {
    fn open(&self, url: &url::Url, events: TransportEvents) -> Box<dyn Transport> {
        let ready = Arc::new(AtomicU8::new(ready_state::CONNECTING));
        let (tx, rx) = mpsc::unbounded_channel();

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(run_socket(
                    url.to_string(),
                    rx,
                    events,
                    Arc::clone(&ready),
                    self.close_timeout,
                ));
            }
            Err(_) => {
                ready.store(ready_state::CLOSED, Ordering::Release);
                // Deliver the failure off this call stack, like a browser would.
                std::thread::spawn(move || {
                    events.error("no tokio runtime available to drive the connection");
                    events.closed(CloseInfo::abnormal());
                });
            }
        }

        Box::new(TungsteniteTransport { outbound: tx, ready })
    }
}

struct TungsteniteTransport {
    outbound: mpsc::UnboundedSender<Outbound>,
    ready: Arc<AtomicU8>,
}

impl Transport for TungsteniteTransport {
    fn send(&self, text: String) -> Result<()> {
        match self.ready.load(Ordering::Acquire) {
            ready_state::OPEN => self
                .outbound
                .send(Outbound::Text(text))
                .map_err(|_| AdapterError::Transport("socket task has exited".into())),
            ready_state::CONNECTING => {
                Err(AdapterError::Transport("socket is still connecting".into()))
            }
            _ => Err(AdapterError::Transport("socket is closed".into())),
        }
    }

    fn close(&self) {
        let state = self.ready.load(Ordering::Acquire);
        if state == ready_state::CONNECTING || state == ready_state::OPEN {
            self.ready.store(ready_state::CLOSING, Ordering::Release);
            let _ = self.outbound.send(Outbound::Close);
        }
    }

    fn ready_state(&self) -> u8 {
        self.ready.load(Ordering::Acquire)
    }
}

/// Drive one socket until it closes.
///
/// Always finishes with exactly one `closed` event; failures are preceded by
/// an `error` event, as in the browser. Once our close frame is out, the peer
/// has `close_timeout` to answer before the socket is dropped as abnormal.
async fn run_socket(
    url: String,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: TransportEvents,
    ready: Arc<AtomicU8>,
    close_timeout: Duration,
) {
    let ws = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok((ws, _response)) => ws,
        Err(e) => {
            ready.store(ready_state::CLOSED, Ordering::Release);
            events.error(e.to_string());
            events.closed(CloseInfo::abnormal());
            return;
        }
    };

    let (mut ws_sink, mut ws_stream) = ws.split();

    // close() during the handshake wins over the open.
    if ready
        .compare_exchange(
            ready_state::CONNECTING,
            ready_state::OPEN,
            Ordering::AcqRel,
            Ordering::Acquire,
        )
        .is_err()
    {
        let _ = ws_sink.send(WsMessage::Close(None)).await;
        ready.store(ready_state::CLOSED, Ordering::Release);
        events.closed(CloseInfo::abnormal());
        return;
    }
    events.opened();

    let mut close_info: Option<CloseInfo> = None;
    let mut outbound_open = true;
    // Armed when our close frame goes out.
    let close_deadline = tokio::time::sleep(close_timeout);
    tokio::pin!(close_deadline);

    loop {
        tokio::select! {
            cmd = outbound.recv(), if outbound_open => {
                match cmd {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = ws_sink.send(WsMessage::Text(text)).await {
                            warn!(error = %e, "WebSocket write failed");
                            events.error(e.to_string());
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        // Handle dropped or close requested: start the closing handshake
                        // and keep reading until the peer answers.
                        outbound_open = false;
                        ready.store(ready_state::CLOSING, Ordering::Release);
                        let frame = CloseFrame {
                            code: CloseCode::Normal,
                            reason: "".into(),
                        };
                        if ws_sink.send(WsMessage::Close(Some(frame))).await.is_err() {
                            break;
                        }
                        close_deadline
                            .as_mut()
                            .reset(tokio::time::Instant::now() + close_timeout);
                    }
                }
            }

            _ = &mut close_deadline, if !outbound_open => {
                warn!(timeout = ?close_timeout, "peer did not complete the close handshake");
                break;
            }

            msg = ws_stream.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => events.message(&text),
                    Some(Ok(WsMessage::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => events.message(&text),
                        Err(_) => debug!("ignoring non-UTF-8 binary frame"),
                    },
                    Some(Ok(WsMessage::Close(frame))) => {
                        ready.store(ready_state::CLOSING, Ordering::Release);
                        close_info = Some(match frame {
                            Some(frame) => CloseInfo {
                                code: u16::from(frame.code),
                                reason: frame.reason.into_owned(),
                                was_clean: true,
                            },
                            None => CloseInfo {
                                code: 1005,
                                reason: String::new(),
                                was_clean: true,
                            },
                        });
                    }
                    Some(Ok(_)) => {} // ping / pong / raw frames
                    Some(Err(e)) => {
                        if close_info.is_none() {
                            events.error(e.to_string());
                        }
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    ready.store(ready_state::CLOSED, Ordering::Release);
    events.closed(close_info.unwrap_or_else(CloseInfo::abnormal));
}
