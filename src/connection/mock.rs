//! In-process game server.
//!
//! [`MockConnection`] keeps its state in memory and records every message
//! sent through it, so modules and the dispatch pipeline can be exercised
//! without a real game. [`MockConnectionFactory`] hands out one shared mock
//! per server and counts constructions.

use super::{
    Ban, CommandOutput, ConnectionFactory, GameConnection, MessageOptions, Position,
    Reachability, RuntimeSettings,
};
use crate::error::EngineError;
use crate::event::PlayerRef;
use crate::model::GameType;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Deserialize, Default)]
struct MockInfo {
    #[serde(default)]
    players: Vec<PlayerRef>,
    #[serde(default)]
    unreachable: bool,
}

/// A message sent through a mock connection.
#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub message: String,
    pub recipient: Option<PlayerRef>,
}

#[derive(Default)]
struct MockState {
    players: Vec<PlayerRef>,
    bans: Vec<Ban>,
    messages: Vec<SentMessage>,
    unreachable: bool,
}

#[derive(Default)]
pub struct MockConnection {
    state: Mutex<MockState>,
}

impl MockConnection {
    pub fn new(players: Vec<PlayerRef>) -> Self {
        Self {
            state: Mutex::new(MockState {
                players,
                ..MockState::default()
            }),
        }
    }

    /// Build from connection info of the shape
    /// `{"players": [...], "unreachable": false}`.
    pub fn from_info(connection_info: &Value) -> Result<Self, EngineError> {
        let info: MockInfo = if connection_info.is_null() {
            MockInfo::default()
        } else {
            serde_json::from_value(connection_info.clone()).map_err(|e| {
                EngineError::Unreachable(format!("invalid mock connection info: {e}"))
            })?
        };

        let conn = Self::new(info.players);
        conn.set_unreachable(info.unreachable);
        Ok(conn)
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MockState) -> T) -> Result<T, EngineError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| EngineError::Internal("mock state lock poisoned".to_string()))?;
        Ok(f(&mut state))
    }

    fn ensure_reachable(&self) -> Result<(), EngineError> {
        if self.with_state(|s| s.unreachable)? {
            return Err(EngineError::Unreachable("mock server is offline".to_string()));
        }
        Ok(())
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        let _ = self.with_state(|s| s.unreachable = unreachable);
    }

    pub fn set_players(&self, players: Vec<PlayerRef>) {
        let _ = self.with_state(|s| s.players = players);
    }

    pub fn sent_messages(&self) -> Vec<SentMessage> {
        self.with_state(|s| s.messages.clone()).unwrap_or_default()
    }

    /// Messages whispered to the player with this game id.
    pub fn messages_to(&self, game_id: &str) -> Vec<String> {
        self.sent_messages()
            .into_iter()
            .filter(|m| m.recipient.as_ref().is_some_and(|p| p.game_id == game_id))
            .map(|m| m.message)
            .collect()
    }
}

#[async_trait]
impl GameConnection for MockConnection {
    async fn test_reachability(&self) -> Reachability {
        match self.ensure_reachable() {
            Ok(()) => Reachability::ok(),
            Err(e) => Reachability::failed(e.to_string()),
        }
    }

    async fn send_message(&self, message: &str, opts: &MessageOptions) -> Result<(), EngineError> {
        self.ensure_reachable()?;
        self.with_state(|s| {
            s.messages.push(SentMessage {
                message: message.to_string(),
                recipient: opts.recipient.clone(),
            })
        })
    }

    async fn list_players(&self) -> Result<Vec<PlayerRef>, EngineError> {
        self.ensure_reachable()?;
        self.with_state(|s| s.players.clone())
    }

    async fn get_player_location(
        &self,
        player: &PlayerRef,
    ) -> Result<Option<Position>, EngineError> {
        self.ensure_reachable()?;
        let online = self.with_state(|s| s.players.iter().any(|p| p.game_id == player.game_id))?;
        Ok(online.then(|| Position {
            x: 0.0,
            y: 0.0,
            z: 0.0,
            dimension: None,
        }))
    }

    async fn execute_console_command(&self, command: &str) -> Result<CommandOutput, EngineError> {
        self.ensure_reachable()?;
        Ok(CommandOutput {
            raw_result: format!("Command \"{command}\" executed successfully"),
            success: true,
        })
    }

    async fn kick_player(&self, player: &PlayerRef, _reason: &str) -> Result<(), EngineError> {
        self.ensure_reachable()?;
        self.with_state(|s| s.players.retain(|p| p.game_id != player.game_id))
    }

    async fn ban_player(&self, ban: &Ban) -> Result<(), EngineError> {
        self.ensure_reachable()?;
        self.with_state(|s| {
            s.bans.retain(|b| b.player.game_id != ban.player.game_id);
            s.bans.push(ban.clone());
            s.players.retain(|p| p.game_id != ban.player.game_id);
        })
    }

    async fn unban_player(&self, player: &PlayerRef) -> Result<(), EngineError> {
        self.ensure_reachable()?;
        self.with_state(|s| s.bans.retain(|b| b.player.game_id != player.game_id))
    }

    async fn list_bans(&self) -> Result<Vec<Ban>, EngineError> {
        self.ensure_reachable()?;
        self.with_state(|s| s.bans.clone())
    }
}

/// Factory that hands out one shared [`MockConnection`] per game server.
///
/// Every server is treated as a mock regardless of its declared game type.
/// An optional construction delay makes concurrent construction observable.
#[derive(Default)]
pub struct MockConnectionFactory {
    connections: DashMap<String, Arc<MockConnection>>,
    constructed: AtomicUsize,
    attempts: AtomicUsize,
    delay: Option<Duration>,
}

impl MockConnectionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Number of times `construct` ran to completion.
    pub fn constructed(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    /// Number of times `construct` was called, failed or not.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// The mock backing a server, once it has been constructed.
    pub fn connection(&self, game_server_id: &str) -> Option<Arc<MockConnection>> {
        self.connections.get(game_server_id).map(|c| c.clone())
    }
}

#[async_trait]
impl ConnectionFactory for MockConnectionFactory {
    async fn construct(
        &self,
        _game_type: GameType,
        connection_info: &Value,
        _settings: &RuntimeSettings,
        game_server_id: &str,
    ) -> Result<Arc<dyn GameConnection>, EngineError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let conn = Arc::new(MockConnection::from_info(connection_info)?);
        self.connections
            .insert(game_server_id.to_string(), conn.clone());
        self.constructed.fetch_add(1, Ordering::SeqCst);
        Ok(conn)
    }
}
