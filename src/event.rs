//! Core event types for hookline.
//!
//! [`GameEvent`] is the closed set of events the engine reacts to. Game
//! adapters emit them, the ingress server queues them as [`IngressEvent`]
//! envelopes, and the worker feeds them through the dispatch pipeline.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Discriminator shared by events and hooks.
///
/// Hooks declare the event type they listen for; matching compares this
/// value before anything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventType {
    ChatMessage,
    PlayerConnected,
    PlayerDisconnected,
    #[serde(rename = "log")]
    LogLine,
    /// Platform event: a server's reachability flipped.
    ServerStatusChanged,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::ChatMessage => "chat-message",
            EventType::PlayerConnected => "player-connected",
            EventType::PlayerDisconnected => "player-disconnected",
            EventType::LogLine => "log",
            EventType::ServerStatusChanged => "server-status-changed",
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to a player as reported by a game server.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerRef {
    /// Identifier the game server uses for this player
    pub game_id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steam_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub epic_online_services_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xbox_live_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ping: Option<u32>,
}

impl PlayerRef {
    pub fn new(game_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            game_id: game_id.into(),
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_steam_id(mut self, steam_id: impl Into<String>) -> Self {
        self.steam_id = Some(steam_id.into());
        self
    }

    /// All identifiers a player can be addressed by in chat.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.game_id.as_str())
            .chain(self.steam_id.as_deref())
            .chain(self.epic_online_services_id.as_deref())
            .chain(self.xbox_live_id.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatChannel {
    #[default]
    Global,
    Team,
    Friends,
    Whisper,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventChatMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<PlayerRef>,

    pub msg: String,

    #[serde(default)]
    pub channel: ChatChannel,

    /// ISO 8601 timestamp reported by the adapter
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl EventChatMessage {
    pub fn new(player: PlayerRef, msg: impl Into<String>) -> Self {
        Self {
            player: Some(player),
            msg: msg.into(),
            channel: ChatChannel::Global,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPlayerPresence {
    pub player: PlayerRef,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventLogLine {
    pub msg: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventServerStatusChanged {
    pub online: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// An event flowing through the engine.
///
/// # Example
///
/// ```json
/// {
///   "type": "chat-message",
///   "player": { "gameId": "76561198000000000", "name": "Steve" },
///   "msg": "/tp home",
///   "channel": "global"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum GameEvent {
    ChatMessage(EventChatMessage),
    PlayerConnected(EventPlayerPresence),
    PlayerDisconnected(EventPlayerPresence),
    #[serde(rename = "log")]
    LogLine(EventLogLine),
    ServerStatusChanged(EventServerStatusChanged),
}

impl GameEvent {
    pub fn event_type(&self) -> EventType {
        match self {
            GameEvent::ChatMessage(_) => EventType::ChatMessage,
            GameEvent::PlayerConnected(_) => EventType::PlayerConnected,
            GameEvent::PlayerDisconnected(_) => EventType::PlayerDisconnected,
            GameEvent::LogLine(_) => EventType::LogLine,
            GameEvent::ServerStatusChanged(_) => EventType::ServerStatusChanged,
        }
    }

    /// Text that hook regexes are applied to, if the event carries any.
    pub fn match_text(&self) -> Option<&str> {
        match self {
            GameEvent::ChatMessage(e) => Some(&e.msg),
            GameEvent::LogLine(e) => Some(&e.msg),
            GameEvent::PlayerConnected(e) | GameEvent::PlayerDisconnected(e) => e.msg.as_deref(),
            GameEvent::ServerStatusChanged(_) => None,
        }
    }

    pub fn player(&self) -> Option<&PlayerRef> {
        match self {
            GameEvent::ChatMessage(e) => e.player.as_ref(),
            GameEvent::PlayerConnected(e) | GameEvent::PlayerDisconnected(e) => Some(&e.player),
            GameEvent::LogLine(_) | GameEvent::ServerStatusChanged(_) => None,
        }
    }
}

/// A game event addressed to one tenant's game server.
///
/// This is the unit the ingress server appends to the event stream and the
/// worker reads back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressEvent {
    pub tenant_id: String,

    pub game_server_id: String,

    pub event: GameEvent,

    /// ISO 8601 timestamp when the event was received (set by server)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub received_at: Option<String>,

    /// Correlation ID for tracing event flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl IngressEvent {
    pub fn new(
        tenant_id: impl Into<String>,
        game_server_id: impl Into<String>,
        event: GameEvent,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            game_server_id: game_server_id.into(),
            event,
            received_at: None,
            correlation_id: None,
        }
    }

    pub fn with_received_at(mut self, timestamp: impl Into<String>) -> Self {
        self.received_at = Some(timestamp.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Field/value pairs appended to the event stream with `XADD`.
    ///
    /// `eventType` is duplicated outside the payload so stream consumers can
    /// filter without parsing it.
    pub fn to_stream_fields(&self) -> Result<Vec<(&'static str, String)>, serde_json::Error> {
        let mut fields = vec![
            ("tenantId", self.tenant_id.clone()),
            ("gameServerId", self.game_server_id.clone()),
            ("eventType", self.event.event_type().to_string()),
            ("payload", serde_json::to_string(&self.event)?),
        ];
        if let Some(received_at) = &self.received_at {
            fields.push(("receivedAt", received_at.clone()));
        }
        if let Some(correlation_id) = &self.correlation_id {
            fields.push(("correlationId", correlation_id.clone()));
        }
        Ok(fields)
    }

    /// Rebuild an envelope from the fields of a stream entry.
    pub fn from_stream_fields(fields: &HashMap<String, String>) -> Result<Self, StreamDecodeError> {
        let required = |name: &'static str| {
            fields
                .get(name)
                .filter(|v| !v.is_empty())
                .cloned()
                .ok_or(StreamDecodeError::MissingField(name))
        };
        let optional = |name: &str| fields.get(name).filter(|v| !v.is_empty()).cloned();

        let payload = required("payload")?;
        Ok(Self {
            tenant_id: required("tenantId")?,
            game_server_id: required("gameServerId")?,
            event: serde_json::from_str(&payload)?,
            received_at: optional("receivedAt"),
            correlation_id: optional("correlationId"),
        })
    }
}

/// Why a stream entry could not be turned back into an [`IngressEvent`].
#[derive(Debug, Error)]
pub enum StreamDecodeError {
    #[error("stream entry is missing field '{0}'")]
    MissingField(&'static str),

    #[error("stream entry has an invalid payload: {0}")]
    Payload(#[from] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_deserialize_chat_message() {
        let json_str = r#"{
            "type": "chat-message",
            "player": {"gameId": "42", "name": "Steve"},
            "msg": "/help"
        }"#;

        let event: GameEvent = serde_json::from_str(json_str).unwrap();
        assert_eq!(event.event_type(), EventType::ChatMessage);
        assert_eq!(event.match_text(), Some("/help"));
        assert_eq!(event.player().unwrap().name, "Steve");

        match event {
            GameEvent::ChatMessage(chat) => assert_eq!(chat.channel, ChatChannel::Global),
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn test_event_deserialize_log_line() {
        let json_str = r#"{"type": "log", "msg": "INF Time: 12.3m"}"#;

        let event: GameEvent = serde_json::from_str(json_str).unwrap();
        assert_eq!(event.event_type(), EventType::LogLine);
        assert!(event.player().is_none());
    }

    #[test]
    fn test_unknown_event_type_is_rejected() {
        let json_str = r#"{"type": "entity-spawned", "msg": "zombie"}"#;
        assert!(serde_json::from_str::<GameEvent>(json_str).is_err());
    }

    #[test]
    fn test_presence_without_message_has_no_match_text() {
        let event = GameEvent::PlayerConnected(EventPlayerPresence {
            player: PlayerRef::new("1", "Alex"),
            msg: None,
        });

        assert_eq!(event.match_text(), None);
        assert_eq!(event.event_type().to_string(), "player-connected");
    }

    #[test]
    fn test_ingress_event_serialize() {
        let event = IngressEvent::new(
            "tenant-1",
            "server-1",
            GameEvent::LogLine(EventLogLine {
                msg: "hello".to_string(),
            }),
        )
        .with_correlation_id("abc-123");

        let json_str = serde_json::to_string(&event).unwrap();
        assert!(json_str.contains("tenantId"));
        assert!(json_str.contains("gameServerId"));
        assert!(json_str.contains("correlationId"));
        // receivedAt should be omitted when None
        assert!(!json_str.contains("receivedAt"));
    }

    #[test]
    fn test_stream_fields_decode() {
        let event = IngressEvent::new(
            "t1",
            "s1",
            GameEvent::ChatMessage(EventChatMessage::new(PlayerRef::new("1", "Steve"), "/tp home")),
        )
        .with_received_at("2026-01-01T00:00:00Z");

        let fields: HashMap<String, String> = event
            .to_stream_fields()
            .unwrap()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v))
            .collect();
        assert_eq!(fields["eventType"], "chat-message");
        assert!(!fields.contains_key("correlationId"));

        let decoded = IngressEvent::from_stream_fields(&fields).unwrap();
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_stream_fields_missing_tenant() {
        let mut fields = HashMap::new();
        fields.insert("gameServerId".to_string(), "s1".to_string());
        fields.insert("payload".to_string(), r#"{"type":"log","msg":"x"}"#.to_string());

        assert!(matches!(
            IngressEvent::from_stream_fields(&fields),
            Err(StreamDecodeError::MissingField("tenantId"))
        ));
    }

    #[test]
    fn test_player_identifiers() {
        let player = PlayerRef::new("7", "Steve").with_steam_id("7656");
        let ids: Vec<&str> = player.identifiers().collect();
        assert_eq!(ids, vec!["7", "7656"]);
    }
}
