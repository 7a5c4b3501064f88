//! Outward mirroring of processed events.
//!
//! After an event has been through commands and hooks, the worker hands the
//! `(type, event)` pair to every configured [`EventMirror`] so live
//! subscribers of the tenant can see it.
//!
//! ## Built-in mirrors
//!
//! - [`LogMirror`]: structured log line per event
//! - [`BroadcastMirror`]: in-process `tokio::sync::broadcast` channel
//! - [`RedisMirror`]: Redis pub/sub, one channel per tenant

pub mod broadcast;
pub mod log;
pub mod redis;

use crate::event::{EventType, GameEvent};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub use broadcast::BroadcastMirror;
pub use log::LogMirror;
pub use redis::RedisMirror;

#[derive(Error, Debug)]
pub enum MirrorError {
    #[error("mirror transport error: {0}")]
    Transport(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// What subscribers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirroredEvent {
    pub tenant_id: String,
    pub game_server_id: String,
    pub event_type: EventType,
    pub event: GameEvent,
}

impl MirroredEvent {
    pub fn new(tenant_id: &str, game_server_id: &str, event: &GameEvent) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            game_server_id: game_server_id.to_string(),
            event_type: event.event_type(),
            event: event.clone(),
        }
    }
}

#[async_trait]
pub trait EventMirror: Send + Sync {
    fn name(&self) -> &str;

    async fn publish(&self, event: &MirroredEvent) -> Result<(), MirrorError>;
}

/// Publishes to several mirrors, isolating their failures.
#[derive(Clone, Default)]
pub struct MirrorSet {
    mirrors: Vec<Arc<dyn EventMirror>>,
}

impl MirrorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, mirror: Arc<dyn EventMirror>) -> Self {
        self.mirrors.push(mirror);
        self
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.mirrors.iter().map(|m| m.name()).collect()
    }

    /// Publish to every mirror. Returns the number of failures.
    pub async fn publish(&self, event: &MirroredEvent) -> usize {
        let mut failures = 0;
        for mirror in &self.mirrors {
            if let Err(e) = mirror.publish(event).await {
                failures += 1;
                warn!(
                    mirror = %mirror.name(),
                    tenant_id = %event.tenant_id,
                    event_type = %event.event_type,
                    error = %e,
                    "Failed to mirror event"
                );
            }
        }
        failures
    }
}
