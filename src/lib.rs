//! # chat-ws-adapter
//!
//! Client-side connection/event adapter for an event-based chat server.
//!
//! [`WebSocketAdapter`] wraps one same-origin `/ws` connection and gives
//! application code:
//! - a named-event registry (`on` / `off` / `emit`) fed by inbound frames,
//!   each frame fanned out under its `type`, under `"message"`, and under
//!   `"<type>.<action>"`;
//! - connection-state announcements on a separate listener channel;
//! - fixed-interval automatic reconnect with an attempt cap;
//! - `subscribe` / `unsubscribe_all` requests answered over the same stream.
//!
//! ```rust,ignore
//! let adapter = WebSocketAdapter::new(AdapterConfig::from_patch(
//!     ConfigPatch::default().origin("http://localhost:8080").username("alice"),
//! ));
//! adapter.on("chat.send", handler(|frame| println!("{frame}")));
//! adapter.connect()?;
//! let id = adapter.subscribe_to_chat_room("general").await?;
//! ```

pub mod adapter;
pub mod cli;
pub mod config;
pub mod console;
pub mod error;
pub mod events;
pub mod subscription;
pub mod transport;

pub use adapter::{now_iso, WebSocketAdapter};
pub use config::{AdapterConfig, ConfigPatch};
pub use error::{AdapterError, ControlKind};
pub use events::{handler, ConnectionState, EventHandler, StateHandler, WsEvent};
pub use subscription::{ControlRequest, SUBSCRIPTION_TIMEOUT};
pub use transport::{CloseInfo, Connector, Transport, TransportEvents, TungsteniteConnector};
