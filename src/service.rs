//! The running daemon: live components, lifecycle and teardown.
//!
//! [`Components`] is the swappable set (store, session manager, vector index,
//! processor) that the self-healing supervisor rebuilds when the database
//! disappears. Handlers clone the current `Arc<Components>` under a brief read
//! lock; a rebuild happens off to the side and only the pointer swap takes the
//! write lock. Model handles ([`Backends`]), stats and the stale queue outlive
//! any one component set.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::{expand_tilde, MemoriaConfig};
use crate::embedding::EmbeddingProvider;
use crate::expansion::{KeywordExpander, QueryExpander};
use crate::memory::Store;
use crate::processor::{DirectProcessor, ObservationProcessor};
use crate::queue::QueueProcessor;
use crate::rerank::{CrossEncoderReranker, Reranker};
use crate::retrieval::recent::RecentQueries;
use crate::retrieval::staleness::{StaleQueue, StaleVerifyRequest, STALE_QUEUE_CAPACITY};
use crate::retrieval::stats::RetrievalStats;
use crate::retrieval::{RetrievalSettings, Retriever};
use crate::session::SessionManager;
use crate::supervisor::SupervisorHandle;
use crate::vector::{SqliteVecIndex, VectorIndex};
use crate::worker::{self, FileSystemVerifier, StalenessVerifier};

/// Database path value selecting a private in-memory store.
pub const IN_MEMORY_DB: &str = ":memory:";

/// Rebuild attempts before the daemon asks to be restarted.
pub const REBUILD_ATTEMPTS: u32 = 3;
/// Delay before the second rebuild attempt; doubles on each retry.
const REBUILD_BACKOFF: Duration = Duration::from_millis(100);

/// Events pushed to `/stream` subscribers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StatusEvent {
    #[serde(rename_all = "camelCase")]
    Processing {
        active_sessions: usize,
        queue_depth: usize,
        processing: bool,
    },
    #[serde(rename_all = "camelCase")]
    SessionDeleted { session_id: i64 },
    Reinitialized,
    SettingsChanged,
}

impl StatusEvent {
    /// SSE event name.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Processing { .. } => "processing",
            Self::SessionDeleted { .. } => "sessionDeleted",
            Self::Reinitialized => "reinitialized",
            Self::SettingsChanged => "settingsChanged",
        }
    }
}

/// Teardown steps, in the order [`Service::shutdown`] runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStep {
    Cancel,
    Watchers,
    Sessions,
    Http,
    Vector,
    Store,
    Tasks,
}

/// Model-backed collaborators, loaded once per process.
#[derive(Clone)]
pub struct Backends {
    pub embedder: Option<Arc<dyn EmbeddingProvider>>,
    pub reranker: Option<Arc<dyn Reranker>>,
    pub expander: Option<Arc<dyn QueryExpander>>,
    pub verifier: Arc<dyn StalenessVerifier>,
}

impl Default for Backends {
    /// No models: full-text retrieval only, no reranking.
    fn default() -> Self {
        Self {
            embedder: None,
            reranker: None,
            expander: Some(Arc::new(KeywordExpander::new())),
            verifier: Arc::new(FileSystemVerifier),
        }
    }
}

impl Backends {
    /// Load whatever models are available. Missing models are logged and left
    /// unconfigured.
    pub fn load(config: &MemoriaConfig) -> Self {
        let embedder: Option<Arc<dyn EmbeddingProvider>> =
            match crate::embedding::create_provider(&config.embedding) {
                Ok(provider) => Some(Arc::from(provider)),
                Err(e) => {
                    tracing::warn!(error = %e, "embedding model unavailable, vector search disabled");
                    None
                }
            };
        let reranker: Option<Arc<dyn Reranker>> = if config.rerank.enabled {
            let dir = expand_tilde(&config.embedding.cache_dir).join(&config.rerank.model);
            match CrossEncoderReranker::load(&dir) {
                Ok(r) => Some(Arc::new(r)),
                Err(e) => {
                    tracing::warn!(error = %e, "reranker unavailable, reranking disabled");
                    None
                }
            }
        } else {
            None
        };
        Self {
            embedder,
            reranker,
            ..Self::default()
        }
    }
}

/// The swappable component set.
pub struct Components {
    pub store: Arc<Store>,
    pub sessions: Arc<SessionManager>,
    pub vector: Option<Arc<dyn VectorIndex>>,
    pub processor: Arc<dyn ObservationProcessor>,
}

impl Components {
    /// Open the store at `db_path` (creating directories and migrating) and
    /// build everything that depends on it.
    pub fn build(db_path: &std::path::Path, backends: &Backends) -> Result<Self> {
        let store = if db_path.as_os_str() == IN_MEMORY_DB {
            Store::open_in_memory()?
        } else {
            Store::open(db_path)
                .with_context(|| format!("failed to open store at {}", db_path.display()))?
        };
        let store = Arc::new(store);
        let vector: Option<Arc<dyn VectorIndex>> = backends.embedder.as_ref().map(|embedder| {
            Arc::new(SqliteVecIndex::new(store.clone(), embedder.clone())) as Arc<dyn VectorIndex>
        });
        let processor = Arc::new(DirectProcessor::new(store.clone(), vector.clone()));
        let sessions = Arc::new(SessionManager::new(store.clone()));
        Ok(Self {
            store,
            sessions,
            vector,
            processor,
        })
    }
}

pub struct Service {
    config: MemoriaConfig,
    db_path: PathBuf,
    backends: Backends,
    settings: RetrievalSettings,
    components: RwLock<Arc<Components>>,
    ready: AtomicBool,
    reinitializing: AtomicBool,
    exit_requested: AtomicBool,
    token: CancellationToken,
    http_stop: CancellationToken,
    tracker: TaskTracker,
    events: broadcast::Sender<StatusEvent>,
    stats: Arc<RetrievalStats>,
    recent: Arc<RecentQueries>,
    stale_queue: StaleQueue,
    stale_rx: Mutex<Option<mpsc::Receiver<StaleVerifyRequest>>>,
    queue: Arc<QueueProcessor>,
    watcher: Mutex<Option<SupervisorHandle>>,
    server: Mutex<Option<JoinHandle<()>>>,
    shutdown_log: Mutex<Vec<ShutdownStep>>,
    started_at: Instant,
}

impl Service {
    /// Open the store and build the initial component set. The service is not
    /// ready until [`Service::start`].
    pub fn new(config: MemoriaConfig, backends: Backends) -> Result<Arc<Self>> {
        let db_path = if config.storage.db_path == IN_MEMORY_DB {
            PathBuf::from(IN_MEMORY_DB)
        } else {
            config.resolved_db_path()
        };
        let components = Components::build(&db_path, &backends)?;
        tracing::info!(db = %db_path.display(), "store ready");

        let (events, _) = broadcast::channel(256);
        let (stale_queue, stale_rx) = StaleQueue::new(STALE_QUEUE_CAPACITY);
        let settings = RetrievalSettings::from_config(&config);
        let queue = Arc::new(QueueProcessor::new(Duration::from_millis(config.queue.tick_ms)));

        let service = Arc::new(Self {
            config,
            db_path,
            backends,
            settings,
            components: RwLock::new(Arc::new(components)),
            ready: AtomicBool::new(false),
            reinitializing: AtomicBool::new(false),
            exit_requested: AtomicBool::new(false),
            token: CancellationToken::new(),
            http_stop: CancellationToken::new(),
            tracker: TaskTracker::new(),
            events,
            stats: Arc::new(RetrievalStats::new()),
            recent: Arc::new(RecentQueries::default()),
            stale_queue,
            stale_rx: Mutex::new(Some(stale_rx)),
            queue,
            watcher: Mutex::new(None),
            server: Mutex::new(None),
            shutdown_log: Mutex::new(Vec::new()),
            started_at: Instant::now(),
        });
        service.wire(&service.components());
        Ok(service)
    }

    /// Spawn the stale worker and queue processor, then mark ready.
    pub fn start(self: &Arc<Self>) {
        let rx = self.stale_rx.lock().ok().and_then(|mut slot| slot.take());
        if let Some(rx) = rx {
            self.tracker.spawn(worker::run(self.clone(), rx));
        }
        self.tracker
            .spawn(self.queue.clone().run(self.clone()));
        self.ready.store(true, Ordering::Release);
        tracing::info!("service ready");
    }

    /// Cross-component callbacks: session deletions reach `/stream`.
    fn wire(&self, components: &Components) {
        let events = self.events.clone();
        components.sessions.set_on_delete(move |session_id| {
            let _ = events.send(StatusEvent::SessionDeleted { session_id });
        });
    }

    pub fn config(&self) -> &MemoriaConfig {
        &self.config
    }

    pub fn db_path(&self) -> &std::path::Path {
        &self.db_path
    }

    /// Current component set.
    pub fn components(&self) -> Arc<Components> {
        match self.components.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn http_stop_token(&self) -> CancellationToken {
        self.http_stop.clone()
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    pub fn queue(&self) -> &Arc<QueueProcessor> {
        &self.queue
    }

    pub fn stats(&self) -> &Arc<RetrievalStats> {
        &self.stats
    }

    pub fn recent(&self) -> &Arc<RecentQueries> {
        &self.recent
    }

    pub fn verifier(&self) -> Arc<dyn StalenessVerifier> {
        self.backends.verifier.clone()
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.events.subscribe()
    }

    /// Send to subscribers, if any.
    pub fn broadcast(&self, event: StatusEvent) {
        let _ = self.events.send(event);
    }

    /// A retrieval pipeline over the current components.
    pub fn retriever(&self) -> Retriever {
        let components = self.components();
        Retriever {
            store: components.store.clone(),
            vector: components.vector.clone(),
            reranker: self.backends.reranker.clone(),
            expander: self.backends.expander.clone(),
            settings: self.settings.clone(),
            stats: self.stats.clone(),
            recent: self.recent.clone(),
            stale_queue: self.stale_queue.clone(),
            tracker: self.tracker.clone(),
            token: self.token.clone(),
        }
    }

    /// Ask the binary to exit cleanly so an outer supervisor restarts it.
    pub fn request_exit(&self) {
        self.exit_requested.store(true, Ordering::Release);
        self.token.cancel();
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub fn attach_watcher(&self, handle: SupervisorHandle) {
        if let Ok(mut slot) = self.watcher.lock() {
            *slot = Some(handle);
        }
    }

    pub fn attach_server(&self, handle: JoinHandle<()>) {
        if let Ok(mut slot) = self.server.lock() {
            *slot = Some(handle);
        }
    }

    /// Rebuild the component set after the database disappeared.
    ///
    /// Single flight: returns `Ok(false)` if a rebuild is already running.
    pub async fn reinitialize(&self) -> Result<bool> {
        if self
            .reinitializing
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!("reinitialization already in progress");
            return Ok(false);
        }
        let result = self.rebuild().await;
        self.reinitializing.store(false, Ordering::Release);
        result.map(|()| true)
    }

    async fn rebuild(&self) -> Result<()> {
        tracing::warn!(db = %self.db_path.display(), "database missing, reinitializing");
        self.ready.store(false, Ordering::Release);

        let old = self.components();
        if let Some(vector) = &old.vector {
            vector.close();
        }
        if let Err(e) = old.store.close() {
            tracing::warn!(error = %e, "closing old store failed");
        }
        old.sessions.shutdown_all(Duration::from_secs(5)).await;

        let mut attempt = 1;
        let fresh = loop {
            match self.build_fresh().await {
                Ok(fresh) => break fresh,
                Err(e) if attempt < REBUILD_ATTEMPTS => {
                    let backoff = REBUILD_BACKOFF * 2u32.pow(attempt - 1);
                    tracing::warn!(
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %format!("{e:#}"),
                        "rebuild failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = self.token.cancelled() => {
                            return Err(e.context("shutdown during reinitialization"));
                        }
                        _ = tokio::time::sleep(backoff) => {}
                    }
                }
                Err(e) => {
                    tracing::error!(
                        attempts = attempt,
                        error = %format!("{e:#}"),
                        "rebuild failed, exiting for restart"
                    );
                    self.request_exit();
                    return Err(e);
                }
            }
        };

        self.wire(&fresh);
        let fresh = Arc::new(fresh);
        match self.components.write() {
            Ok(mut guard) => *guard = fresh,
            Err(poisoned) => *poisoned.into_inner() = fresh,
        }
        self.ready.store(true, Ordering::Release);
        self.broadcast(StatusEvent::Reinitialized);
        tracing::info!(attempts = attempt, "reinitialization complete");
        Ok(())
    }

    /// Recreate the database directory and open a fresh component set.
    async fn build_fresh(&self) -> Result<Components> {
        let db_path = self.db_path.clone();
        let backends = self.backends.clone();
        tokio::task::spawn_blocking(move || {
            if let Some(parent) = db_path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            Components::build(&db_path, &backends)
        })
        .await
        .context("rebuild task panicked")?
    }

    fn log_step(&self, step: ShutdownStep) {
        tracing::info!(?step, "shutdown step");
        if let Ok(mut log) = self.shutdown_log.lock() {
            log.push(step);
        }
    }

    /// Steps taken by [`Service::shutdown`] so far, in order.
    pub fn shutdown_steps(&self) -> Vec<ShutdownStep> {
        self.shutdown_log
            .lock()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Tear everything down within `deadline`, shared across the waiting
    /// steps. Each step is best effort: failures are logged and the sequence
    /// continues.
    pub async fn shutdown(&self, deadline: Duration) {
        tracing::info!(deadline_ms = deadline.as_millis() as u64, "shutting down");
        let started = Instant::now();
        let remaining = || deadline.saturating_sub(started.elapsed());
        self.ready.store(false, Ordering::Release);

        self.token.cancel();
        self.log_step(ShutdownStep::Cancel);

        let watcher = self.watcher.lock().ok().and_then(|mut slot| slot.take());
        if let Some(watcher) = watcher {
            watcher.stop();
        }
        self.log_step(ShutdownStep::Watchers);

        let components = self.components();
        components.sessions.shutdown_all(remaining()).await;
        self.log_step(ShutdownStep::Sessions);

        self.http_stop.cancel();
        let server = self.server.lock().ok().and_then(|mut slot| slot.take());
        if let Some(server) = server {
            match tokio::time::timeout(remaining(), server).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "http server task failed"),
                Err(_) => tracing::warn!("http server did not drain before deadline"),
            }
        }
        self.log_step(ShutdownStep::Http);

        if let Some(vector) = &components.vector {
            vector.close();
        }
        self.log_step(ShutdownStep::Vector);

        if let Err(e) = components.store.close() {
            tracing::warn!(error = %e, "store close failed");
        }
        self.log_step(ShutdownStep::Store);

        self.tracker.close();
        if tokio::time::timeout(remaining(), self.tracker.wait()).await.is_err() {
            tracing::warn!("background tasks still running at deadline");
        }
        self.log_step(ShutdownStep::Tasks);
        tracing::info!("shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_config() -> MemoriaConfig {
        let mut config = MemoriaConfig::default();
        config.storage.db_path = IN_MEMORY_DB.into();
        config
    }

    #[tokio::test]
    async fn not_ready_until_started() {
        let service = Service::new(memory_config(), Backends::default()).unwrap();
        assert!(!service.is_ready());
        service.start();
        assert!(service.is_ready());
        service.shutdown(Duration::from_secs(1)).await;
        assert!(!service.is_ready());
    }

    #[tokio::test]
    async fn shutdown_runs_steps_in_order() {
        let service = Service::new(memory_config(), Backends::default()).unwrap();
        service.start();
        service.shutdown(Duration::from_secs(1)).await;
        assert_eq!(
            service.shutdown_steps(),
            vec![
                ShutdownStep::Cancel,
                ShutdownStep::Watchers,
                ShutdownStep::Sessions,
                ShutdownStep::Http,
                ShutdownStep::Vector,
                ShutdownStep::Store,
                ShutdownStep::Tasks,
            ]
        );
        assert!(service.components().store.is_closed());
    }

    #[tokio::test]
    async fn session_deletion_is_broadcast() {
        let service = Service::new(memory_config(), Backends::default()).unwrap();
        let mut rx = service.subscribe();
        let sessions = service.components().sessions.clone();
        sessions.queue_summarize(9, None, None);
        sessions.delete_session(9);
        assert_eq!(rx.recv().await.unwrap(), StatusEvent::SessionDeleted { session_id: 9 });
    }

    #[test]
    fn status_events_serialize_tagged() {
        let json = serde_json::to_value(StatusEvent::Processing {
            active_sessions: 1,
            queue_depth: 2,
            processing: false,
        })
        .unwrap();
        assert_eq!(json["type"], "processing");
        assert_eq!(json["queueDepth"], 2);
    }
}
