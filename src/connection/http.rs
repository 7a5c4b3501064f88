//! Generic JSON-over-HTTP game adapter.
//!
//! Every capability becomes one `POST` to the bridge URL:
//!
//! ```json
//! { "gameServerId": "...", "operation": "getPlayers", "data": { ... } }
//! ```
//!
//! The bridge answers `{ "data": ... }` on success or `{ "error": "..." }`.

use super::{
    Ban, CommandOutput, GameConnection, MessageOptions, Position, Reachability, RuntimeSettings,
};
use crate::error::EngineError;
use crate::event::PlayerRef;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Settings key that overrides the bridge request timeout, in milliseconds
pub const SETTING_REQUEST_TIMEOUT_MS: &str = "genericRequestTimeoutMs";

#[derive(Debug, Deserialize)]
struct HttpConnectionInfo {
    url: String,
    #[serde(default)]
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct HttpConnection {
    client: Client,
    url: String,
    token: Option<String>,
    game_server_id: String,
    timeout: Duration,
}

impl HttpConnection {
    pub fn from_info(
        client: Client,
        connection_info: &Value,
        settings: &RuntimeSettings,
        game_server_id: &str,
        default_timeout: Duration,
    ) -> Result<Self, EngineError> {
        let info: HttpConnectionInfo = serde_json::from_value(connection_info.clone())
            .map_err(|e| EngineError::Unreachable(format!("invalid connection info: {e}")))?;

        if !info.url.starts_with("http://") && !info.url.starts_with("https://") {
            return Err(EngineError::Unreachable(format!(
                "bridge url must start with http:// or https://, got '{}'",
                info.url
            )));
        }

        let timeout = settings
            .get(SETTING_REQUEST_TIMEOUT_MS)
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_millis)
            .unwrap_or(default_timeout);

        Ok(Self {
            client,
            url: info.url,
            token: info.token,
            game_server_id: game_server_id.to_string(),
            timeout,
        })
    }

    async fn request(&self, operation: &str, data: Value) -> Result<Value, EngineError> {
        debug!(
            game_server_id = %self.game_server_id,
            operation = %operation,
            "Requesting from game server"
        );

        let mut request = self
            .client
            .post(&self.url)
            .timeout(self.timeout)
            .json(&json!({
                "gameServerId": self.game_server_id,
                "operation": operation,
                "data": data,
            }));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            warn!(
                game_server_id = %self.game_server_id,
                operation = %operation,
                error = %e,
                "Bridge request failed"
            );
            EngineError::Unreachable(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(EngineError::Unreachable(format!(
                "bridge returned status {status}"
            )));
        }

        let body: BridgeResponse = response
            .json()
            .await
            .map_err(|e| EngineError::Internal(format!("invalid bridge response: {e}")))?;

        if let Some(error) = body.error {
            return Err(EngineError::Internal(format!("Error from server: {error}")));
        }
        Ok(body.data)
    }

    async fn request_as<T: DeserializeOwned>(
        &self,
        operation: &str,
        data: Value,
    ) -> Result<T, EngineError> {
        let value = self.request(operation, data).await?;
        serde_json::from_value(value).map_err(|e| {
            EngineError::Internal(format!(
                "unexpected response to {operation}, is the server responding the right data? ({e})"
            ))
        })
    }
}

fn player_ref(player: &PlayerRef) -> Value {
    json!({ "gameId": player.game_id })
}

#[async_trait]
impl GameConnection for HttpConnection {
    async fn test_reachability(&self) -> Reachability {
        match self.request_as::<Reachability>("testReachability", json!({})).await {
            Ok(reach) => reach,
            Err(e) => Reachability::failed(e.to_string()),
        }
    }

    async fn send_message(&self, message: &str, opts: &MessageOptions) -> Result<(), EngineError> {
        self.request("sendMessage", json!({ "message": message, "opts": opts }))
            .await
            .map(|_| ())
    }

    async fn list_players(&self) -> Result<Vec<PlayerRef>, EngineError> {
        self.request_as("getPlayers", json!({})).await
    }

    async fn get_player_location(
        &self,
        player: &PlayerRef,
    ) -> Result<Option<Position>, EngineError> {
        self.request_as("getPlayerLocation", player_ref(player)).await
    }

    async fn execute_console_command(&self, command: &str) -> Result<CommandOutput, EngineError> {
        self.request_as("executeConsoleCommand", json!({ "command": command }))
            .await
    }

    async fn kick_player(&self, player: &PlayerRef, reason: &str) -> Result<(), EngineError> {
        self.request("kickPlayer", json!({ "player": player, "reason": reason }))
            .await
            .map(|_| ())
    }

    async fn ban_player(&self, ban: &Ban) -> Result<(), EngineError> {
        let data = serde_json::to_value(ban)
            .map_err(|e| EngineError::Internal(format!("failed to encode ban: {e}")))?;
        self.request("banPlayer", data).await.map(|_| ())
    }

    async fn unban_player(&self, player: &PlayerRef) -> Result<(), EngineError> {
        self.request("unbanPlayer", player_ref(player)).await.map(|_| ())
    }

    async fn list_bans(&self) -> Result<Vec<Ban>, EngineError> {
        self.request_as("listBans", json!({})).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(info: Value, settings: &RuntimeSettings) -> Result<HttpConnection, EngineError> {
        HttpConnection::from_info(
            Client::new(),
            &info,
            settings,
            "s1",
            Duration::from_secs(5),
        )
    }

    #[test]
    fn test_from_info() {
        let conn = build(
            json!({"url": "https://bridge.example.com/rpc", "token": "secret"}),
            &RuntimeSettings::new(),
        )
        .unwrap();

        assert_eq!(conn.url, "https://bridge.example.com/rpc");
        assert_eq!(conn.token.as_deref(), Some("secret"));
        assert_eq!(conn.timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_setting_override() {
        let mut settings = RuntimeSettings::new();
        settings.insert(SETTING_REQUEST_TIMEOUT_MS.to_string(), "250".to_string());

        let conn = build(json!({"url": "http://localhost:9000"}), &settings).unwrap();
        assert_eq!(conn.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_rejects_bad_info() {
        assert!(build(json!({}), &RuntimeSettings::new()).is_err());
        assert!(build(json!({"url": "ftp://x"}), &RuntimeSettings::new()).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_bridge_reports_reason() {
        // Port 9 (discard) is closed on test hosts.
        let conn = build(json!({"url": "http://127.0.0.1:9"}), &RuntimeSettings::new()).unwrap();

        let reach = conn.test_reachability().await;
        assert!(!reach.connectable);
        assert!(reach.reason.is_some());
    }
}
