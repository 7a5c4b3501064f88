//! Connection cache with single-flight construction.
//!
//! The registry is the only long-lived shared state in the engine. It holds
//! at most one live connection per game server, and concurrent requests for
//! a server whose connection is still being built wait for that construction
//! instead of starting another one.

use super::{ConnectionFactory, GameConnection, Reachability, RuntimeSettings};
use crate::error::EngineError;
use crate::event::{EventServerStatusChanged, GameEvent};
use crate::model::GameType;
use crate::repository::Repository;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Default timeout for building a connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for a reachability probe
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

type CacheKey = (String, String);

/// Cache slot holding the outcome of one construction. Replaced, never
/// reset, on invalidation. A failed outcome is shared with everyone who
/// waited on it, then evicted.
type Slot = Arc<OnceCell<Result<Arc<dyn GameConnection>, EngineError>>>;

/// What to probe.
#[derive(Debug, Clone)]
pub enum ReachabilityTarget {
    /// A persisted server, probed through its cached connection
    Server {
        tenant_id: String,
        game_server_id: String,
    },
    /// Parameters that are not persisted yet, probed on a throwaway connection
    Raw {
        game_type: GameType,
        connection_info: Value,
        settings: RuntimeSettings,
    },
}

/// A reachability flip detected by [`ConnectionRegistry::probe_status`].
#[derive(Debug, Clone, PartialEq)]
pub struct StatusChange {
    pub tenant_id: String,
    pub game_server_id: String,
    pub online: bool,
    pub reason: Option<String>,
}

impl StatusChange {
    /// Platform event to feed back into the worker so hooks on it fire.
    pub fn into_event(self) -> GameEvent {
        GameEvent::ServerStatusChanged(EventServerStatusChanged {
            online: self.online,
            reason: self.reason,
        })
    }
}

pub struct ConnectionRegistry {
    repo: Arc<dyn Repository>,
    factory: Arc<dyn ConnectionFactory>,
    slots: DashMap<CacheKey, Slot>,
    connect_timeout: Duration,
    probe_timeout: Duration,
}

impl ConnectionRegistry {
    pub fn new(repo: Arc<dyn Repository>, factory: Arc<dyn ConnectionFactory>) -> Self {
        Self {
            repo,
            factory,
            slots: DashMap::new(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeouts(mut self, connect: Duration, probe: Duration) -> Self {
        self.connect_timeout = connect;
        self.probe_timeout = probe;
        self
    }

    /// Number of cached (or in-flight) connections.
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Return the live connection for a server, building it on first use.
    pub async fn get_connection(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Arc<dyn GameConnection>, EngineError> {
        let key = (tenant_id.to_string(), game_server_id.to_string());

        // One retry covers an invalidation that lands mid-construction: the
        // connection built from the old parameters is handed to no one.
        let mut attempt = 0;
        loop {
            attempt += 1;
            let slot = self
                .slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone();

            let outcome = slot
                .get_or_init(|| self.construct(tenant_id, game_server_id))
                .await;

            let conn = match outcome {
                Ok(conn) => conn.clone(),
                Err(e) => {
                    // Callers arriving after this point start a fresh attempt.
                    self.slots.remove_if(&key, |_, s| Arc::ptr_eq(s, &slot));
                    return Err(e.clone());
                }
            };

            let current = self
                .slots
                .get(&key)
                .is_some_and(|s| Arc::ptr_eq(s.value(), &slot));

            if current || attempt >= 2 {
                return Ok(conn);
            }

            debug!(
                tenant_id = %tenant_id,
                game_server_id = %game_server_id,
                "Connection invalidated during construction, rebuilding"
            );
        }
    }

    async fn construct(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Arc<dyn GameConnection>, EngineError> {
        let server = self
            .repo
            .find_game_server(tenant_id, game_server_id)
            .await?
            .ok_or_else(|| EngineError::not_found("game server", game_server_id))?;

        if !server.enabled {
            return Err(EngineError::Unreachable(format!(
                "game server {game_server_id} is disabled"
            )));
        }

        let settings = self
            .repo
            .find_settings_for_server(tenant_id, game_server_id)
            .await?;

        debug!(
            tenant_id = %tenant_id,
            game_server_id = %game_server_id,
            game_type = ?server.game_type,
            "Constructing game connection"
        );

        let conn = tokio::time::timeout(
            self.connect_timeout,
            self.factory.construct(
                server.game_type,
                &server.connection_info,
                &settings,
                game_server_id,
            ),
        )
        .await
        .map_err(|_| {
            EngineError::Unreachable(format!(
                "timed out after {}ms constructing connection",
                self.connect_timeout.as_millis()
            ))
        })??;

        info!(
            tenant_id = %tenant_id,
            game_server_id = %game_server_id,
            "Game connection established"
        );
        Ok(conn)
    }

    /// Drop the cached connection. The next `get_connection` rebuilds it.
    pub fn invalidate(&self, tenant_id: &str, game_server_id: &str) {
        let key = (tenant_id.to_string(), game_server_id.to_string());
        if self.slots.remove(&key).is_some() {
            info!(
                tenant_id = %tenant_id,
                game_server_id = %game_server_id,
                "Game connection invalidated"
            );
        }
    }

    /// Probe a server or raw parameters. Failures are reported in the
    /// result, never returned as errors.
    pub async fn test_reachability(&self, target: ReachabilityTarget) -> Reachability {
        let conn = match target {
            ReachabilityTarget::Server {
                tenant_id,
                game_server_id,
            } => self.get_connection(&tenant_id, &game_server_id).await,
            ReachabilityTarget::Raw {
                game_type,
                connection_info,
                settings,
            } => tokio::time::timeout(
                self.connect_timeout,
                self.factory
                    .construct(game_type, &connection_info, &settings, "reachability-probe"),
            )
            .await
            .unwrap_or_else(|_| {
                Err(EngineError::Unreachable(
                    "timed out constructing connection".to_string(),
                ))
            }),
        };

        let conn = match conn {
            Ok(conn) => conn,
            Err(e) => return Reachability::failed(e.to_string()),
        };

        match tokio::time::timeout(self.probe_timeout, conn.test_reachability()).await {
            Ok(reach) => reach,
            Err(_) => Reachability::failed(format!(
                "reachability probe timed out after {}ms",
                self.probe_timeout.as_millis()
            )),
        }
    }

    /// Probe a persisted server and compare against its stored reachable
    /// flag. Returns `Some` only when the flag should flip; persisting it is
    /// up to the caller. A server found unreachable is evicted from the cache.
    pub async fn probe_status(
        &self,
        tenant_id: &str,
        game_server_id: &str,
    ) -> Result<Option<StatusChange>, EngineError> {
        let server = self
            .repo
            .find_game_server(tenant_id, game_server_id)
            .await?
            .ok_or_else(|| EngineError::not_found("game server", game_server_id))?;

        let reach = self
            .test_reachability(ReachabilityTarget::Server {
                tenant_id: tenant_id.to_string(),
                game_server_id: game_server_id.to_string(),
            })
            .await;

        if !reach.connectable {
            self.invalidate(tenant_id, game_server_id);
        }

        if reach.connectable == server.reachable {
            return Ok(None);
        }

        warn!(
            tenant_id = %tenant_id,
            game_server_id = %game_server_id,
            online = reach.connectable,
            reason = ?reach.reason,
            "Game server reachability changed"
        );

        Ok(Some(StatusChange {
            tenant_id: tenant_id.to_string(),
            game_server_id: game_server_id.to_string(),
            online: reach.connectable,
            reason: reach.reason,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::MockConnectionFactory;
    use crate::model::GameServer;
    use crate::storage::MemoryRepository;
    use serde_json::json;

    fn server(id: &str) -> GameServer {
        GameServer {
            id: id.to_string(),
            tenant_id: "t1".to_string(),
            name: format!("server {id}"),
            game_type: GameType::Mock,
            connection_info: json!({}),
            reachable: true,
            enabled: true,
        }
    }

    fn setup(factory: MockConnectionFactory) -> (Arc<MemoryRepository>, Arc<MockConnectionFactory>, ConnectionRegistry) {
        let repo = Arc::new(MemoryRepository::new());
        let factory = Arc::new(factory);
        let registry = ConnectionRegistry::new(repo.clone(), factory.clone());
        (repo, factory, registry)
    }

    #[tokio::test]
    async fn test_concurrent_gets_construct_once() {
        let (repo, factory, registry) =
            setup(MockConnectionFactory::new().with_delay(Duration::from_millis(50)));
        repo.add_game_server(server("s1"));
        let registry = Arc::new(registry);

        let mut handles = vec![];
        for _ in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_connection("t1", "s1").await.map(|_| ())
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(factory.constructed(), 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_failed_construction_shared() {
        let (repo, factory, registry) =
            setup(MockConnectionFactory::new().with_delay(Duration::from_millis(50)));
        let mut broken = server("s1");
        broken.connection_info = json!({ "players": "not a list" });
        repo.add_game_server(broken);
        let registry = Arc::new(registry);

        let mut handles = vec![];
        for _ in 0..10 {
            let registry = registry.clone();
            handles.push(tokio::spawn(async move {
                registry.get_connection("t1", "s1").await.map(|_| ())
            }));
        }
        for handle in handles {
            let result = handle.await.unwrap();
            assert!(matches!(result, Err(EngineError::Unreachable(_))));
        }

        assert_eq!(factory.attempts(), 1);
        assert!(registry.is_empty());

        // The next call, after the failure settled, tries again.
        assert!(registry.get_connection("t1", "s1").await.is_err());
        assert_eq!(factory.attempts(), 2);
    }

    #[tokio::test]
    async fn test_invalidate_rebuilds() {
        let (repo, factory, registry) = setup(MockConnectionFactory::new());
        repo.add_game_server(server("s1"));

        registry.get_connection("t1", "s1").await.unwrap();
        registry.get_connection("t1", "s1").await.unwrap();
        assert_eq!(factory.constructed(), 1);

        registry.invalidate("t1", "s1");
        registry.get_connection("t1", "s1").await.unwrap();
        assert_eq!(factory.constructed(), 2);
    }

    #[tokio::test]
    async fn test_disabled_and_missing_servers() {
        let (repo, factory, registry) = setup(MockConnectionFactory::new());
        let mut disabled = server("s2");
        disabled.enabled = false;
        repo.add_game_server(disabled);

        let missing = registry.get_connection("t1", "nope").await;
        assert!(matches!(missing, Err(EngineError::NotFound { .. })));

        let off = registry.get_connection("t1", "s2").await;
        assert!(matches!(off, Err(EngineError::Unreachable(_))));
        assert_eq!(factory.constructed(), 0);
    }

    #[tokio::test]
    async fn test_other_tenant_not_visible() {
        let (repo, _factory, registry) = setup(MockConnectionFactory::new());
        repo.add_game_server(server("s1"));

        let result = registry.get_connection("t2", "s1").await;
        assert!(matches!(result, Err(EngineError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_construct_timeout_reported() {
        let (repo, _factory, registry) =
            setup(MockConnectionFactory::new().with_delay(Duration::from_millis(200)));
        let registry = registry.with_timeouts(Duration::from_millis(20), Duration::from_secs(1));
        repo.add_game_server(server("s1"));

        let reach = registry
            .test_reachability(ReachabilityTarget::Server {
                tenant_id: "t1".to_string(),
                game_server_id: "s1".to_string(),
            })
            .await;

        assert!(!reach.connectable);
        assert!(reach.reason.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_raw_probe_is_not_cached() {
        let (_repo, factory, registry) = setup(MockConnectionFactory::new());

        let reach = registry
            .test_reachability(ReachabilityTarget::Raw {
                game_type: GameType::Mock,
                connection_info: json!({}),
                settings: RuntimeSettings::new(),
            })
            .await;

        assert!(reach.connectable);
        assert_eq!(factory.constructed(), 1);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_probe_status_reports_flip() {
        let (repo, _factory, registry) = setup(MockConnectionFactory::new());
        let mut s = server("s1");
        s.connection_info = json!({"unreachable": true});
        repo.add_game_server(s);

        let change = registry.probe_status("t1", "s1").await.unwrap().unwrap();
        assert!(!change.online);
        assert!(registry.is_empty());

        repo.set_reachable("t1", "s1", false);
        assert_eq!(registry.probe_status("t1", "s1").await.unwrap(), None);

        let event = change.into_event();
        assert_eq!(event.event_type(), crate::event::EventType::ServerStatusChanged);
    }
}
