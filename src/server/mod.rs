//! HTTP surface.
//!
//! Session and context routes are gated on service readiness and answer 503
//! while the daemon is starting or rebuilding its components. `/health`,
//! `/stats` and `/stream` are always served.

mod routes;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;

use crate::error::ApiError;
use crate::service::Service;

/// How long `/context/count` answers from cache.
pub const COUNT_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<Service>,
    counts: Arc<CountCache>,
    // Makes the duplicate-prompt check and the insert one step.
    init_lock: Arc<tokio::sync::Mutex<()>>,
}

impl AppState {
    pub fn new(service: Arc<Service>) -> Self {
        Self {
            service,
            counts: Arc::new(CountCache::new(COUNT_CACHE_TTL)),
            init_lock: Arc::new(tokio::sync::Mutex::new(())),
        }
    }
}

/// Per-project observation counts with a fixed time-to-live.
pub struct CountCache {
    ttl: Duration,
    entries: Mutex<HashMap<String, (Instant, u64)>>,
}

impl CountCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn get(&self, project: &str) -> Option<u64> {
        let entries = self.entries.lock().ok()?;
        entries
            .get(project)
            .filter(|(at, _)| at.elapsed() < self.ttl)
            .map(|(_, count)| *count)
    }

    pub fn put(&self, project: &str, count: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(project.to_string(), (Instant::now(), count));
        }
    }
}

async fn require_ready(State(state): State<AppState>, request: Request, next: Next) -> Response {
    if !state.service.is_ready() {
        return ApiError::NotReady.into_response();
    }
    next.run(request).await
}

pub fn router(service: Arc<Service>) -> Router {
    let state = AppState::new(service);

    let gated = Router::new()
        .route("/sessions/init", post(routes::init_session))
        .route("/sessions/{id}/init", post(routes::activate_session))
        .route("/sessions/observations", post(routes::queue_observation))
        .route("/sessions/subagent-complete", post(routes::subagent_complete))
        .route("/sessions/{id}/summarize", post(routes::queue_summarize))
        .route("/context/search", get(routes::search))
        .route("/context/inject", get(routes::inject))
        .route("/context/count", get(routes::count))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_ready));

    Router::new()
        .route("/health", get(routes::health))
        .route("/stats", get(routes::stats))
        .route("/stream", get(routes::stream))
        .merge(gated)
        .with_state(state)
}

/// Serve on `listener` until the service's HTTP stop token fires. The task
/// handle is registered with the service so shutdown can wait for in-flight
/// requests.
pub fn spawn(service: Arc<Service>, listener: TcpListener) {
    let app = router(service.clone());
    let stop = service.http_stop_token();
    let handle = tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(stop.cancelled_owned())
            .await;
        match result {
            Ok(()) => tracing::info!("http server stopped"),
            Err(e) => tracing::error!(error = %e, "http server failed"),
        }
    });
    service.attach_server(handle);
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(addr = %listener.local_addr()?, "listening");
    Ok(listener)
}
