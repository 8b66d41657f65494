//! Periodic dispatcher from session queues to the observation processor.
//!
//! Every tick snapshots the active sessions and, one session at a time,
//! drains its queue and hands each message to the processor in order. A
//! summarize message ends the session. The same path runs on demand for a
//! single session when a subagent completes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;

use crate::processor::SessionContext;
use crate::service::{Components, Service, StatusEvent};
use crate::session::{Message, SessionSnapshot};

pub const DEFAULT_TICK: Duration = Duration::from_secs(2);

pub struct QueueProcessor {
    interval: Duration,
    // Serializes the tick with the subagent side channel.
    dispatch: Mutex<()>,
    ticks: AtomicU64,
}

impl QueueProcessor {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            dispatch: Mutex::new(()),
            ticks: AtomicU64::new(0),
        }
    }

    /// Number of completed ticks.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Acquire)
    }

    /// Tick until the service is cancelled.
    pub async fn run(self: Arc<Self>, service: Arc<Service>) {
        let token = service.token();
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick of an interval fires immediately.
        interval.tick().await;

        tracing::info!(interval_ms = self.interval.as_millis() as u64, "queue processor started");
        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {
                    if token.is_cancelled() {
                        break;
                    }
                    self.tick(&service).await;
                }
            }
        }
        tracing::info!("queue processor stopped");
    }

    /// Drain and dispatch every active session once, then broadcast status.
    /// Returns the number of messages dispatched.
    pub async fn tick(&self, service: &Service) -> usize {
        let _guard = self.dispatch.lock().await;
        let components = service.components();
        let mut dispatched = 0;
        if service.is_ready() {
            for session in components.sessions.get_all_sessions() {
                dispatched += dispatch_session(&components, &session).await;
            }
        }
        self.ticks.fetch_add(1, Ordering::AcqRel);

        service.broadcast(StatusEvent::Processing {
            active_sessions: components.sessions.get_active_session_count(),
            queue_depth: components.sessions.get_total_queue_depth(),
            processing: components.sessions.is_any_session_processing(),
        });
        dispatched
    }

    /// Immediately drain and dispatch one session, bypassing the tick.
    pub async fn process_now(&self, service: &Service, session_id: i64) -> usize {
        let _guard = self.dispatch.lock().await;
        let components = service.components();
        let Some(session) = components.sessions.get_session(session_id) else {
            return 0;
        };
        let dispatched = dispatch_session(&components, &session).await;
        tracing::debug!(session_id, dispatched, "session drained on demand");
        dispatched
    }
}

async fn dispatch_session(components: &Arc<Components>, session: &SessionSnapshot) -> usize {
    let messages = components.sessions.drain_messages(session.id);
    if messages.is_empty() {
        return 0;
    }
    let ctx = SessionContext {
        session_id: session.id,
        project: session.project.clone(),
        prompt_number: session.prompt_number,
        user_prompt: session.user_prompt.clone(),
    };

    components.sessions.set_processing(session.id, true);
    let total = messages.len();
    let mut dispatched = 0;

    for (index, message) in messages.into_iter().enumerate() {
        dispatched += 1;
        let processor = components.processor.clone();
        let task_ctx = ctx.clone();
        match message {
            Message::Observation(obs) => {
                let tool = obs.tool_name.clone();
                let result = tokio::task::spawn_blocking(move || {
                    processor.process_observation(&task_ctx, &obs)
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(session_id = session.id, tool = %tool, error = %e, "observation processing failed")
                    }
                    Err(e) => {
                        tracing::error!(session_id = session.id, error = %e, "observation task panicked")
                    }
                }
            }
            Message::Summarize(summary) => {
                let result = tokio::task::spawn_blocking(move || {
                    processor.process_summary(&task_ctx, &summary)
                })
                .await;
                match result {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        tracing::warn!(session_id = session.id, error = %e, "summary processing failed")
                    }
                    Err(e) => {
                        tracing::error!(session_id = session.id, error = %e, "summary task panicked")
                    }
                }
                let discarded = total - index - 1;
                if discarded > 0 {
                    tracing::warn!(session_id = session.id, discarded, "messages after summarize discarded");
                }
                components.sessions.delete_session(session.id);
                return dispatched;
            }
        }
    }

    components.sessions.set_processing(session.id, false);
    dispatched
}
