//! Mirror that writes one structured log line per event.

use super::{EventMirror, MirrorError, MirroredEvent};
use async_trait::async_trait;
use tracing::info;

#[derive(Debug, Clone)]
pub struct LogMirror {
    prefix: String,
}

impl LogMirror {
    pub fn new() -> Self {
        Self::with_prefix("event")
    }

    /// The prefix distinguishes several log mirrors in the output.
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LogMirror {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventMirror for LogMirror {
    fn name(&self) -> &str {
        "log"
    }

    async fn publish(&self, event: &MirroredEvent) -> Result<(), MirrorError> {
        let payload = serde_json::to_string(&event.event)?;

        info!(
            prefix = %self.prefix,
            tenant_id = %event.tenant_id,
            game_server_id = %event.game_server_id,
            event_type = %event.event_type,
            payload = %payload,
            "[{}] {}/{}",
            self.prefix,
            event.game_server_id,
            event.event_type
        );
        Ok(())
    }
}
