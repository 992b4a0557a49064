use clap::Parser;
use std::path::PathBuf;

use crate::config::{AdapterConfig, ConfigPatch};
use crate::error::Result;

#[derive(Parser, Debug)]
#[command(name = "chat-ws-adapter")]
#[command(version)]
#[command(about = "Terminal chat client over a reconnecting WebSocket event adapter")]
pub struct Args {
    /// Origin of the chat server page (scheme picks ws or wss)
    #[arg(long)]
    pub origin: Option<String>,

    /// Display name sent as the `username` query parameter
    #[arg(long, short)]
    pub username: Option<String>,

    /// Room to join
    #[arg(long, short)]
    pub room: Option<String>,

    /// Room type (chat or post)
    #[arg(long)]
    pub room_type: Option<String>,

    /// Fixed user id instead of a random one
    #[arg(long)]
    pub user_id: Option<String>,

    /// Delay between automatic reconnect attempts, in milliseconds
    #[arg(long)]
    pub reconnect_interval_ms: Option<u64>,

    /// Automatic reconnect attempts before giving up
    #[arg(long)]
    pub max_reconnect_attempts: Option<u32>,

    /// TOML config file; command-line values override it
    #[arg(long, short)]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Command-line values as a patch over whatever the config file says.
    pub fn patch(&self) -> ConfigPatch {
        ConfigPatch {
            origin: self.origin.clone(),
            username: self.username.clone(),
            user_id: self.user_id.clone(),
            room: self.room.clone(),
            room_type: self.room_type.clone(),
            reconnect_interval_ms: self.reconnect_interval_ms,
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }

    pub fn resolve_config(&self) -> Result<AdapterConfig> {
        let mut config = match &self.config {
            Some(path) => AdapterConfig::load(path)?,
            None => AdapterConfig::default(),
        };
        config.apply(self.patch());
        Ok(config)
    }
}
