//! Game server connections.
//!
//! A [`GameConnection`] is the opaque capability object the engine uses to
//! talk to one game server. Connections are built by a [`ConnectionFactory`]
//! keyed on [`GameType`] and cached by the [`ConnectionRegistry`].
//!
//! ## Built-in adapters
//!
//! - [`HttpConnection`]: generic JSON-over-HTTP bridge (`GENERIC`)
//! - [`MockConnection`]: in-process fake server (`MOCK`)

pub mod http;
pub mod mock;
pub mod registry;

use crate::error::EngineError;
use crate::event::PlayerRef;
use crate::model::GameType;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub use http::HttpConnection;
pub use mock::{MockConnection, MockConnectionFactory};
pub use registry::{ConnectionRegistry, ReachabilityTarget, StatusChange};

/// Per-server runtime settings handed to adapters.
pub type RuntimeSettings = HashMap<String, String>;

/// Outcome of a reachability probe. Probes report, they do not fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reachability {
    pub connectable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl Reachability {
    pub fn ok() -> Self {
        Self {
            connectable: true,
            reason: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            connectable: false,
            reason: Some(reason.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimension: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ban {
    pub player: PlayerRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// ISO 8601; `None` means permanent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandOutput {
    pub raw_result: String,
    pub success: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageOptions {
    /// Whisper to this player instead of broadcasting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<PlayerRef>,
}

impl MessageOptions {
    pub fn to_player(player: &PlayerRef) -> Self {
        Self {
            recipient: Some(player.clone()),
        }
    }
}

/// Capabilities every game adapter exposes.
#[async_trait]
pub trait GameConnection: Send + Sync {
    async fn test_reachability(&self) -> Reachability;

    async fn send_message(&self, message: &str, opts: &MessageOptions) -> Result<(), EngineError>;

    async fn list_players(&self) -> Result<Vec<PlayerRef>, EngineError>;

    async fn get_player_location(
        &self,
        player: &PlayerRef,
    ) -> Result<Option<Position>, EngineError>;

    async fn execute_console_command(&self, command: &str) -> Result<CommandOutput, EngineError>;

    async fn kick_player(&self, player: &PlayerRef, reason: &str) -> Result<(), EngineError>;

    async fn ban_player(&self, ban: &Ban) -> Result<(), EngineError>;

    async fn unban_player(&self, player: &PlayerRef) -> Result<(), EngineError>;

    async fn list_bans(&self) -> Result<Vec<Ban>, EngineError>;
}

/// Builds live connections for a game type.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn construct(
        &self,
        game_type: GameType,
        connection_info: &Value,
        settings: &RuntimeSettings,
        game_server_id: &str,
    ) -> Result<Arc<dyn GameConnection>, EngineError>;
}

/// Factory for the adapters shipped with this crate.
#[derive(Clone)]
pub struct DefaultConnectionFactory {
    client: reqwest::Client,
    request_timeout: Duration,
}

impl DefaultConnectionFactory {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::new(),
            request_timeout,
        }
    }
}

#[async_trait]
impl ConnectionFactory for DefaultConnectionFactory {
    async fn construct(
        &self,
        game_type: GameType,
        connection_info: &Value,
        settings: &RuntimeSettings,
        game_server_id: &str,
    ) -> Result<Arc<dyn GameConnection>, EngineError> {
        match game_type {
            GameType::Generic => Ok(Arc::new(HttpConnection::from_info(
                self.client.clone(),
                connection_info,
                settings,
                game_server_id,
                self.request_timeout,
            )?)),
            GameType::Mock => Ok(Arc::new(MockConnection::from_info(connection_info)?)),
            other => Err(EngineError::Unreachable(format!(
                "no adapter available for game type {other:?}"
            ))),
        }
    }
}
