//! Adapter configuration: defaults, shallow-merge patches, TOML loading and
//! the same-origin endpoint URL.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{AdapterError, Result};

pub const DEFAULT_ORIGIN: &str = "http://localhost:8080";
pub const DEFAULT_USERNAME: &str = "Anonymous";
pub const DEFAULT_ROOM: &str = "general";
pub const DEFAULT_ROOM_TYPE: &str = "chat";
pub const DEFAULT_RECONNECT_INTERVAL_MS: u64 = 3000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Path of the WebSocket endpoint on the page origin.
pub const WS_PATH: &str = "/ws";

const USER_ID_ALPHABET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const USER_ID_LEN: usize = 9;

/// Generate an opaque user id of the form `user_xxxxxxxxx` (base-36).
pub fn generate_user_id() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..USER_ID_LEN)
        .map(|_| {
            let index = rng.gen_range(0..USER_ID_ALPHABET.len());
            USER_ID_ALPHABET[index] as char
        })
        .collect();
    format!("user_{suffix}")
}

/// Connection target and reconnect policy for one adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// Origin of the page hosting the client, e.g. `https://chat.example.com`.
    pub origin: String,
    pub username: String,
    pub user_id: String,
    pub room: String,
    pub room_type: String,
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            origin: DEFAULT_ORIGIN.to_string(),
            username: DEFAULT_USERNAME.to_string(),
            user_id: generate_user_id(),
            room: DEFAULT_ROOM.to_string(),
            room_type: DEFAULT_ROOM_TYPE.to_string(),
            reconnect_interval_ms: DEFAULT_RECONNECT_INTERVAL_MS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}

impl AdapterConfig {
    /// Defaults with every field present in `patch` applied on top.
    pub fn from_patch(patch: ConfigPatch) -> Self {
        let mut config = Self::default();
        config.apply(patch);
        config
    }

    /// Shallow merge: each field set in `patch` replaces the current value.
    pub fn apply(&mut self, patch: ConfigPatch) {
        if let Some(origin) = patch.origin {
            self.origin = origin;
        }
        if let Some(username) = patch.username {
            self.username = username;
        }
        if let Some(user_id) = patch.user_id {
            self.user_id = user_id;
        }
        if let Some(room) = patch.room {
            self.room = room;
        }
        if let Some(room_type) = patch.room_type {
            self.room_type = room_type;
        }
        if let Some(ms) = patch.reconnect_interval_ms {
            self.reconnect_interval_ms = ms;
        }
        if let Some(max) = patch.max_reconnect_attempts {
            self.max_reconnect_attempts = max;
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        Duration::from_millis(self.reconnect_interval_ms)
    }

    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| AdapterError::Config(e.to_string()))
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Same-origin endpoint:
    /// `ws(s)://<origin host>/ws?username=..&user_id=..&room=..&room_type=..`.
    ///
    /// `https` origins select `wss`; every other scheme selects `ws`.
    pub fn endpoint_url(&self) -> Result<url::Url> {
        let page = url::Url::parse(&self.origin).map_err(|e| AdapterError::InvalidOrigin {
            origin: self.origin.clone(),
            detail: e.to_string(),
        })?;
        let host = page.host_str().ok_or_else(|| AdapterError::InvalidOrigin {
            origin: self.origin.clone(),
            detail: "origin has no host".into(),
        })?;
        let scheme = if page.scheme() == "https" { "wss" } else { "ws" };
        let authority = match page.port() {
            Some(port) => format!("{host}:{port}"),
            None => host.to_string(),
        };

        let mut endpoint = url::Url::parse(&format!("{scheme}://{authority}{WS_PATH}"))
            .map_err(|e| AdapterError::InvalidOrigin {
                origin: self.origin.clone(),
                detail: e.to_string(),
            })?;
        endpoint
            .query_pairs_mut()
            .append_pair("username", &self.username)
            .append_pair("user_id", &self.user_id)
            .append_pair("room", &self.room)
            .append_pair("room_type", &self.room_type);
        Ok(endpoint)
    }
}

/// All-optional mirror of [`AdapterConfig`] used for partial updates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_interval_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_reconnect_attempts: Option<u32>,
}

impl ConfigPatch {
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    pub fn room_type(mut self, room_type: impl Into<String>) -> Self {
        self.room_type = Some(room_type.into());
        self
    }

    pub fn reconnect_interval_ms(mut self, ms: u64) -> Self {
        self.reconnect_interval_ms = Some(ms);
        self
    }

    pub fn max_reconnect_attempts(mut self, max: u32) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }
}
