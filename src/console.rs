//! Terminal chat consumer.
//!
//! The one UI controller over the adapter: it only uses the adapter's public
//! surface. Rendered lines go to an output channel instead of stdout so the
//! binary decides where they end up.

use colored::*;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::adapter::WebSocketAdapter;
use crate::events::{
    handler, lock, ConnectionState, WsEvent, EVENT_CONNECTED, EVENT_DISCONNECTED, EVENT_MESSAGE,
};

// ---------------------------------------------------------------------------
// Chat lines
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineKind {
    Message,
    Join,
    Leave,
}

/// A chat event reduced to what a transcript shows.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatLine {
    pub id: Option<String>,
    pub username: String,
    pub content: String,
    pub room_id: Option<String>,
    pub timestamp: Option<String>,
    pub kind: LineKind,
}

impl ChatLine {
    /// `chat.send`, `chat.join` and `chat.leave` frames become lines; anything
    /// else is not part of the transcript.
    pub fn from_event(event: &WsEvent) -> Option<Self> {
        if event.event_type.as_deref() != Some("chat") {
            return None;
        }
        let kind = match event.action.as_deref() {
            Some("send") => LineKind::Message,
            Some("join") => LineKind::Join,
            Some("leave") => LineKind::Leave,
            _ => return None,
        };
        let username = event.username.clone().unwrap_or_else(|| "undefined".to_string());
        let content = match event.data.pointer("/message/content") {
            Some(Value::String(text)) => text.clone(),
            Some(other) if !other.is_null() => other.to_string(),
            _ => match kind {
                LineKind::Join => format!("{username} joined the chat"),
                _ => format!("{username} left the chat"),
            },
        };
        Some(Self {
            id: event.event_id.clone(),
            username,
            content,
            room_id: event.room_id.clone(),
            timestamp: event.timestamp.clone(),
            kind,
        })
    }

    /// One terminal line. Own messages are attributed to "You".
    pub fn render(&self, own_username: &str) -> String {
        match self.kind {
            LineKind::Join | LineKind::Leave => {
                format!("* {}", self.content).dimmed().to_string()
            }
            LineKind::Message => {
                let time = self
                    .timestamp
                    .as_deref()
                    .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
                    .map(|ts| local_clock(&ts))
                    .unwrap_or_default();
                let who = if self.username == own_username {
                    "You".green().bold()
                } else {
                    self.username.cyan().bold()
                };
                format!("{} {} {}", who, format!("[{time}]").dimmed(), self.content)
            }
        }
    }
}

fn local_clock(ts: &chrono::DateTime<chrono::FixedOffset>) -> String {
    ts.with_timezone(&chrono::Local)
        .format("%H:%M:%S")
        .to_string()
}

fn status_text(state: ConnectionState) -> ColoredString {
    match state {
        ConnectionState::Connected => "Connected".green(),
        ConnectionState::Connecting => "Connecting...".yellow(),
        ConnectionState::Reconnecting => "Reconnecting...".yellow(),
        ConnectionState::Disconnected => "Disconnected".red(),
        other => other.as_str().red(),
    }
}

// ---------------------------------------------------------------------------
// Input commands
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Chat(String),
    Comment { post_id: String, content: String },
    SubscribePost(String),
    Unsubscribe,
    State,
    Quit,
    Empty,
    Unknown(String),
}

impl Command {
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        if line.is_empty() {
            return Command::Empty;
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Command::Chat(line.to_string());
        };
        let (name, args) = match rest.split_once(char::is_whitespace) {
            Some((name, args)) => (name, args.trim()),
            None => (rest, ""),
        };
        match name {
            "quit" | "exit" => Command::Quit,
            "state" => Command::State,
            "unsubscribe" => Command::Unsubscribe,
            "subscribe-post" if !args.is_empty() => Command::SubscribePost(args.to_string()),
            "comment" => match args.split_once(char::is_whitespace) {
                Some((post_id, content)) if !content.trim().is_empty() => Command::Comment {
                    post_id: post_id.to_string(),
                    content: content.trim().to_string(),
                },
                _ => Command::Unknown(line.to_string()),
            },
            _ => Command::Unknown(line.to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Wires one adapter to a terminal transcript.
#[derive(Clone)]
pub struct ChatConsole {
    adapter: WebSocketAdapter,
    username: String,
    room: String,
    connected: Arc<AtomicBool>,
    subscription_id: Arc<Mutex<Option<String>>>,
    output: mpsc::UnboundedSender<String>,
}

impl ChatConsole {
    pub fn new(adapter: WebSocketAdapter, output: mpsc::UnboundedSender<String>) -> Self {
        let config = adapter.get_config();
        Self {
            adapter,
            username: config.username,
            room: config.room,
            connected: Arc::new(AtomicBool::new(false)),
            subscription_id: Arc::new(Mutex::new(None)),
            output,
        }
    }

    /// Register the console's handlers on the adapter. Call once, before `connect()`.
    pub fn attach(&self) {
        let console = self.clone();
        self.adapter.on_connection_state_change(move |state, connected| {
            console.connected.store(connected, Ordering::Release);
            console.print(format!("[{}]", status_text(state)));
        });

        let console = self.clone();
        self.adapter.on(
            EVENT_CONNECTED,
            handler(move |_| {
                let console = console.clone();
                tokio::spawn(async move {
                    match console.adapter.subscribe_to_chat_room(&console.room).await {
                        Ok(id) => {
                            info!(room = %console.room, "subscribed to chat room");
                            *lock(&console.subscription_id) = id;
                        }
                        Err(e) => error!(room = %console.room, error = %e, "subscribe failed"),
                    }
                });
            }),
        );

        let console = self.clone();
        self.adapter.on(
            EVENT_MESSAGE,
            handler(move |frame| console.handle_frame(frame)),
        );

        let console = self.clone();
        self.adapter.on(
            EVENT_DISCONNECTED,
            handler(move |_| {
                *lock(&console.subscription_id) = None;
            }),
        );
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    pub fn subscription_id(&self) -> Option<String> {
        lock(&self.subscription_id).clone()
    }

    fn handle_frame(&self, frame: &Value) {
        let Some(event) = WsEvent::from_value(frame) else {
            return;
        };
        match event.event_type.as_deref() {
            Some("chat") => {
                if let Some(line) = ChatLine::from_event(&event) {
                    self.print(line.render(&self.username));
                }
            }
            Some("error") => {
                let detail = event.data.get("error").cloned().unwrap_or_default();
                error!(error = %detail, "server reported an error");
            }
            _ => {}
        }
    }

    /// Act on one line of input. Returns `false` once the user asked to quit.
    pub async fn handle_line(&self, line: &str) -> bool {
        match Command::parse(line) {
            Command::Empty => {}
            Command::Chat(content) => {
                if !self.adapter.send_chat_message(&content) {
                    self.print("message not sent".red().to_string());
                }
            }
            Command::Comment { post_id, content } => {
                if !self.adapter.send_comment(&post_id, &content) {
                    self.print("comment not sent".red().to_string());
                }
            }
            Command::SubscribePost(post_id) => {
                match self.adapter.subscribe_to_post_comments(&post_id).await {
                    Ok(_) => self.print(format!("subscribed to comments on {post_id}")),
                    Err(e) => self.print(format!("subscribe failed: {e}").red().to_string()),
                }
            }
            Command::Unsubscribe => match self.adapter.unsubscribe_all().await {
                Ok(()) => {
                    *lock(&self.subscription_id) = None;
                    self.print("unsubscribed from everything".to_string());
                }
                Err(e) => self.print(format!("unsubscribe failed: {e}").red().to_string()),
            },
            Command::State => {
                let state = self.adapter.get_connection_state();
                self.print(format!("[{}]", status_text(state)));
            }
            Command::Unknown(raw) => {
                self.print(format!("unknown command: {raw}").yellow().to_string());
            }
            Command::Quit => {
                self.adapter.disconnect();
                return false;
            }
        }
        true
    }

    fn print(&self, line: String) {
        let _ = self.output.send(line);
    }
}
