//! hookline ingress server.
//!
//! Game adapters POST events for one tenant's server; each accepted event is
//! appended to the Redis event stream for the workers.

use axum::{
    extract::{Path, Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::{self, Next},
    response::{Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::env;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use hookline::config::EngineConfig;
use hookline::event::{GameEvent, IngressEvent};
use hookline::shutdown::ShutdownSignal;
use hookline::EVENT_STREAM_NAME;

struct Metrics {
    events_received: AtomicU64,
    events_rejected: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            events_rejected: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

#[derive(Clone)]
struct AppState {
    redis_pool: Pool,
    api_key: String,
    metrics: Arc<Metrics>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventResponse {
    /// Stream id assigned to the event
    id: String,
    status: String,
    correlation_id: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = EngineConfig::load()?;

    let redis_url = env::var("REDIS_URL").unwrap_or_else(|_| config.redis.url.clone());
    let api_key = env::var("HOOKLINE_API_KEY")
        .ok()
        .or_else(|| config.server.api_key.clone())
        .unwrap_or_else(|| {
            warn!("No API key configured, defaulting to 'dev-key'. DO NOT USE IN PRODUCTION.");
            "dev-key".to_string()
        });

    let pool = Config::from_url(redis_url).create_pool(Some(Runtime::Tokio1))?;

    let app_state = Arc::new(AppState {
        redis_pool: pool,
        api_key,
        metrics: Arc::new(Metrics::new()),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route(
            "/api/v1/tenants/:tenant_id/servers/:game_server_id/events",
            post(emit_event),
        )
        .layer(middleware::from_fn_with_state(app_state.clone(), auth_middleware))
        .with_state(app_state);

    let port = env::var("PORT")
        .ok()
        .and_then(|p| p.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let shutdown = ShutdownSignal::new();
    let signal = shutdown.clone();
    tokio::spawn(async move { signal.wait().await });

    info!(addr = %addr, "hookline ingress listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.recv().await })
        .await?;

    info!("Ingress server stopped");
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    match token {
        Some(token) if token == state.api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!(error = %e, "Failed to get Redis connection");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!(error = %e, "Redis PING failed");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(json!({ "status": "ok", "redis": "connected" })))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "events": {
            "received": state.metrics.events_received.load(Ordering::Relaxed),
            "rejected": state.metrics.events_rejected.load(Ordering::Relaxed),
        },
        "status": "running"
    }))
}

async fn emit_event(
    State(state): State<Arc<AppState>>,
    Path((tenant_id, game_server_id)): Path<(String, String)>,
    headers: HeaderMap,
    Json(event): Json<GameEvent>,
) -> Result<(StatusCode, Json<EventResponse>), StatusCode> {
    state.metrics.events_received.fetch_add(1, Ordering::Relaxed);

    let correlation_id = headers
        .get("X-Correlation-ID")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    let ingress = IngressEvent::new(&tenant_id, &game_server_id, event)
        .with_received_at(Utc::now().to_rfc3339())
        .with_correlation_id(&correlation_id);

    debug!(
        tenant_id = %tenant_id,
        game_server_id = %game_server_id,
        event_type = %ingress.event.event_type(),
        correlation_id = %correlation_id,
        "Received event"
    );

    let fields = ingress.to_stream_fields().map_err(|e| {
        error!(error = %e, "Failed to encode event");
        state.metrics.events_rejected.fetch_add(1, Ordering::Relaxed);
        StatusCode::BAD_REQUEST
    })?;

    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!(error = %e, "Failed to get Redis connection");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let mut xadd = cmd("XADD");
    xadd.arg(EVENT_STREAM_NAME).arg("*");
    for (field, value) in &fields {
        xadd.arg(*field).arg(value);
    }

    let id: String = xadd.query_async(&mut conn).await.map_err(|e| {
        error!(error = %e, "Failed to append event to stream");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    info!(
        id = %id,
        tenant_id = %tenant_id,
        game_server_id = %game_server_id,
        event_type = %ingress.event.event_type(),
        correlation_id = %correlation_id,
        "Event accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(EventResponse {
            id,
            status: "accepted".to_string(),
            correlation_id,
        }),
    ))
}
