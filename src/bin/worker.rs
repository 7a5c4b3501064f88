//! hookline worker.
//!
//! Consumes the event stream, routes every event onto its server's lane and
//! acknowledges it once the lane has processed it. Alongside the consumer it
//! runs two periodic loops: the work queue ticker (delayed jobs and cron
//! firings) and reachability probes that turn status flips into
//! `server-status-changed` events.
//!
//! ## Configuration
//!
//! `config/hookline.toml` (or `HOOKLINE_CONFIG`), overridden by:
//! - `REDIS_URL`: Redis connection string
//! - `HOOKLINE_WORKER_NAME`: consumer name (default: hostname or UUID)
//! - `HOOKLINE_CONSUMER_GROUP`: consumer group name
//! - `RUST_LOG`: logging filter (default: "info")

use chrono::Utc;
use deadpool_redis::redis::streams::{StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{cmd, AsyncCommands, Value as RedisValue};
use deadpool_redis::{Config, Pool, Runtime};
use std::collections::HashMap;
use std::env;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hookline::catalog::Catalog;
use hookline::commands::CommandDispatcher;
use hookline::config::EngineConfig;
use hookline::connection::{ConnectionRegistry, DefaultConnectionFactory};
use hookline::cronjobs::CronJobScheduler;
use hookline::event::IngressEvent;
use hookline::hooks::HookDispatcher;
use hookline::queue::redis::RedisWorkQueue;
use hookline::repository::Repository;
use hookline::shutdown::ShutdownSignal;
use hookline::storage::MemoryRepository;
use hookline::worker::{EventLanes, EventWorker};
use hookline::{DEFAULT_CONSUMER_GROUP, EVENT_STREAM_NAME};

/// Idle time after which another worker's pending entries are claimed
const PENDING_IDLE_THRESHOLD_MS: u64 = 30_000;

/// Entries read per batch
const READ_BATCH: usize = 10;

/// Entries read when picking up this consumer's own pending list
const RECOVERY_BATCH: usize = 100;

/// Interval between reachability probes of every known server
const PROBE_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Default)]
struct Stats {
    processed: AtomicU64,
    failed: AtomicU64,
}

fn get_worker_name(config: &EngineConfig) -> String {
    if let Ok(name) = env::var("HOOKLINE_WORKER_NAME") {
        return name;
    }
    if let Some(name) = &config.worker.name {
        return name.clone();
    }
    if let Ok(hostname) = hostname::get() {
        if let Some(name) = hostname.to_str() {
            return format!("worker-{name}");
        }
    }
    format!("worker-{}", uuid::Uuid::new_v4())
}

fn get_consumer_group(config: &EngineConfig) -> String {
    env::var("HOOKLINE_CONSUMER_GROUP").unwrap_or_else(|_| {
        if config.worker.consumer_group.is_empty() {
            DEFAULT_CONSUMER_GROUP.to_string()
        } else {
            config.worker.consumer_group.clone()
        }
    })
}

fn field_str(value: &RedisValue) -> Option<String> {
    match value {
        RedisValue::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
        RedisValue::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}

fn parse_entry(map: &HashMap<String, RedisValue>) -> Option<IngressEvent> {
    let fields: HashMap<String, String> = map
        .iter()
        .filter_map(|(k, v)| field_str(v).map(|s| (k.clone(), s)))
        .collect();

    match IngressEvent::from_stream_fields(&fields) {
        Ok(event) => Some(event),
        Err(e) => {
            warn!(error = %e, "Failed to decode stream entry");
            None
        }
    }
}

async fn ack(pool: &Pool, consumer_group: &str, id: &str) {
    match pool.get().await {
        Ok(mut conn) => {
            let result: Result<(), _> = conn.xack(EVENT_STREAM_NAME, consumer_group, &[id]).await;
            if let Err(e) = result {
                error!(id = %id, error = %e, "Failed to ACK event");
            }
        }
        Err(e) => error!(id = %id, error = %e, "Failed to get Redis connection for ACK"),
    }
}

async fn ensure_consumer_group(pool: &Pool, consumer_group: &str) -> Result<(), Box<dyn std::error::Error>> {
    let mut conn = pool.get().await?;
    let result: Result<(), _> = cmd("XGROUP")
        .arg("CREATE")
        .arg(EVENT_STREAM_NAME)
        .arg(consumer_group)
        .arg("$")
        .arg("MKSTREAM")
        .query_async(&mut conn)
        .await;

    match result {
        Ok(()) => info!(consumer_group = %consumer_group, "Created consumer group"),
        Err(e) if e.to_string().contains("BUSYGROUP") => {
            info!(consumer_group = %consumer_group, "Consumer group already exists")
        }
        Err(e) => return Err(Box::new(e)),
    }
    Ok(())
}

/// Take over entries another worker left pending for too long.
async fn claim_pending(pool: &Pool, consumer_group: &str, worker_name: &str) -> usize {
    let mut conn = match pool.get().await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(error = %e, "Failed to get Redis connection for pending recovery");
            return 0;
        }
    };

    #[allow(clippy::type_complexity)]
    let result: Result<(String, Vec<(String, HashMap<String, RedisValue>)>), _> = cmd("XAUTOCLAIM")
        .arg(EVENT_STREAM_NAME)
        .arg(consumer_group)
        .arg(worker_name)
        .arg(PENDING_IDLE_THRESHOLD_MS)
        .arg("0-0")
        .arg("COUNT")
        .arg(100)
        .query_async(&mut conn)
        .await;

    match result {
        Ok((_, claimed)) => {
            if !claimed.is_empty() {
                info!(count = claimed.len(), "Claimed pending events from other workers");
            }
            claimed.len()
        }
        Err(e) => {
            debug!(error = %e, "XAUTOCLAIM failed, skipping pending recovery");
            0
        }
    }
}

fn load_repository(config: &EngineConfig) -> Result<(Arc<MemoryRepository>, Catalog), Box<dyn std::error::Error>> {
    let catalog = match &config.catalog.path {
        Some(path) => {
            let catalog = Catalog::load(path)?;
            info!(path = %path.display(), tenants = catalog.tenants.len(), "Catalog loaded");
            catalog
        }
        None => {
            warn!("No catalog configured, starting with an empty repository");
            Catalog::default()
        }
    };
    let repo = Arc::new(MemoryRepository::from_catalog(&catalog)?);
    Ok((repo, catalog))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::load()?;
    let worker_name = get_worker_name(&config);
    let consumer_group = get_consumer_group(&config);
    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis.url.clone());

    info!(
        worker_name = %worker_name,
        consumer_group = %consumer_group,
        "hookline worker starting"
    );

    let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;
    let (repo, catalog) = load_repository(&config)?;
    let queue = Arc::new(RedisWorkQueue::new(pool.clone()));

    let registry = Arc::new(
        ConnectionRegistry::new(
            repo.clone(),
            Arc::new(DefaultConnectionFactory::new(config.engine.adapter_timeout())),
        )
        .with_timeouts(config.engine.connect_timeout(), config.engine.probe_timeout()),
    );

    // Bring repeating schedules in line with the catalog before consuming.
    let scheduler = CronJobScheduler::new(repo.clone(), queue.clone())
        .with_concurrency(config.engine.cron_concurrency);
    for tenant in &catalog.tenants {
        for server in &tenant.servers {
            for installation in repo.find_installations_for_server(&tenant.id, &server.id).await? {
                match scheduler.install(&installation).await {
                    Ok(report) if !report.is_success() => warn!(
                        installation_id = %installation.id,
                        failures = report.failure_count(),
                        "Some cron jobs could not be scheduled"
                    ),
                    Ok(_) => {}
                    Err(e) => error!(
                        installation_id = %installation.id,
                        error = %e,
                        "Failed to reconcile cron jobs"
                    ),
                }
            }
        }
    }

    let mirrors = config.build_mirrors(Some(&pool));
    info!(mirrors = ?mirrors.names(), "Mirrors configured");

    let worker = Arc::new(EventWorker::new(
        repo.clone(),
        CommandDispatcher::new(repo.clone(), queue.clone(), registry.clone())
            .with_default_prefix(&config.engine.command_prefix),
        HookDispatcher::new(repo.clone(), queue.clone()),
        mirrors,
    ));
    let lanes = Arc::new(EventLanes::with_capacity(worker, config.worker.lane_capacity));

    ensure_consumer_group(&pool, &consumer_group).await?;
    claim_pending(&pool, &consumer_group, &worker_name).await;

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    // Queue ticker
    let ticker = {
        let queue = queue.clone();
        let shutdown = shutdown.clone();
        let interval = config.engine.tick_interval();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticks.tick() => {
                        match queue.tick(Utc::now()).await {
                            Ok(report) if report.promoted + report.fired > 0 => debug!(
                                promoted = report.promoted,
                                fired = report.fired,
                                "Queue tick"
                            ),
                            Ok(_) => {}
                            Err(e) => warn!(error = %e, "Queue tick failed"),
                        }
                    }
                }
            }
        })
    };

    // Reachability probes
    let prober = {
        let registry = registry.clone();
        let repo = repo.clone();
        let lanes = lanes.clone();
        let shutdown = shutdown.clone();
        let servers: Vec<(String, String)> = catalog
            .tenants
            .iter()
            .flat_map(|t| t.servers.iter().map(move |s| (t.id.clone(), s.id.clone())))
            .collect();
        tokio::spawn(async move {
            let mut ticks = tokio::time::interval(PROBE_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticks.tick() => {
                        for (tenant_id, game_server_id) in &servers {
                            match registry.probe_status(tenant_id, game_server_id).await {
                                Ok(Some(change)) => {
                                    repo.set_reachable(tenant_id, game_server_id, change.online);
                                    let event = IngressEvent::new(tenant_id, game_server_id, change.into_event())
                                        .with_received_at(Utc::now().to_rfc3339());
                                    if let Err(e) = lanes.submit(event).await {
                                        warn!(error = %e, "Failed to submit status change");
                                    }
                                }
                                Ok(None) => {}
                                Err(e) => debug!(
                                    tenant_id = %tenant_id,
                                    game_server_id = %game_server_id,
                                    error = %e,
                                    "Reachability probe skipped"
                                ),
                            }
                        }
                    }
                }
            }
        })
    };

    info!(stream = %EVENT_STREAM_NAME, "Listening for events");

    let stats = Arc::new(Stats::default());
    let mut acks = JoinSet::new();
    // Start with our own pending entries, then switch to new ones.
    let mut cursor = "0";

    loop {
        if shutdown.is_shutdown() {
            break;
        }

        // Reap finished ack tasks.
        while acks.try_join_next().is_some() {}

        let mut conn = match pool.get().await {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "Failed to get Redis connection");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };

        let batch = if cursor == "0" { RECOVERY_BATCH } else { READ_BATCH };
        let opts = StreamReadOptions::default()
            .group(&consumer_group, &worker_name)
            .block(2000)
            .count(batch);

        let cursors = [cursor];
        let result: Result<StreamReadReply, _> = tokio::select! {
            _ = shutdown.recv() => break,
            result = conn.xread_options(&[EVENT_STREAM_NAME], &cursors, &opts) => result,
        };
        drop(conn);

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                let err_str = e.to_string();
                if !err_str.contains("timed out") && !err_str.contains("response was nil") {
                    warn!(error = %e, "Stream read error");
                }
                continue;
            }
        };

        // Pending entries are read once; later reads only take new ones.
        cursor = ">";

        for stream_key in reply.keys {
            for element in stream_key.ids {
                let id = element.id;

                let Some(event) = parse_entry(&element.map) else {
                    warn!(id = %id, "Skipping unparseable event");
                    ack(&pool, &consumer_group, &id).await;
                    continue;
                };

                match lanes.submit_tracked(event).await {
                    Ok(done) => {
                        let pool = pool.clone();
                        let consumer_group = consumer_group.clone();
                        let stats = stats.clone();
                        acks.spawn(async move {
                            match done.await {
                                Ok(report) => {
                                    if report.is_success() {
                                        stats.processed.fetch_add(1, Ordering::Relaxed);
                                    } else {
                                        stats.failed.fetch_add(1, Ordering::Relaxed);
                                        warn!(
                                            id = %id,
                                            stage_errors = report.stage_errors.len(),
                                            "Event processed with failures"
                                        );
                                    }
                                    ack(&pool, &consumer_group, &id).await;
                                }
                                // Lane dropped the event; leave it pending for recovery.
                                Err(_) => warn!(id = %id, "Event was not processed"),
                            }
                        });
                    }
                    Err(e) => error!(id = %id, error = %e, "Failed to route event to lane"),
                }
            }
        }
    }

    info!("Shutdown requested, draining lanes");
    let grace = shutdown.timeout();
    let drained = tokio::time::timeout(grace, async {
        lanes.shutdown().await;
        while acks.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(timeout_secs = grace.as_secs(), "Lanes did not drain in time");
    }

    let _ = ticker.await;
    let _ = prober.await;

    info!(
        events_processed = stats.processed.load(Ordering::Relaxed),
        events_failed = stats.failed.load(Ordering::Relaxed),
        "Worker shutdown complete"
    );
    Ok(())
}
