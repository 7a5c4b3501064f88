//! Redis pub/sub mirror.
//!
//! Each tenant gets its own channel, `hookline:mirror:{tenantId}`, so a
//! real-time gateway only subscribes to the tenants it serves.

use super::{EventMirror, MirrorError, MirroredEvent};
use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use tracing::debug;

/// Prefix of the per-tenant pub/sub channels
pub const MIRROR_CHANNEL_PREFIX: &str = "hookline:mirror";

pub fn mirror_channel(tenant_id: &str) -> String {
    format!("{MIRROR_CHANNEL_PREFIX}:{tenant_id}")
}

#[derive(Clone)]
pub struct RedisMirror {
    pool: Pool,
}

impl RedisMirror {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventMirror for RedisMirror {
    fn name(&self) -> &str {
        "redis"
    }

    async fn publish(&self, event: &MirroredEvent) -> Result<(), MirrorError> {
        let payload = serde_json::to_string(event)?;
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| MirrorError::Transport(e.to_string()))?;

        let receivers: u64 = cmd("PUBLISH")
            .arg(mirror_channel(&event.tenant_id))
            .arg(&payload)
            .query_async(&mut conn)
            .await
            .map_err(|e| MirrorError::Transport(e.to_string()))?;

        debug!(
            tenant_id = %event.tenant_id,
            event_type = %event.event_type,
            receivers,
            "Event mirrored to Redis"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_per_tenant() {
        assert_eq!(mirror_channel("t1"), "hookline:mirror:t1");
    }
}
