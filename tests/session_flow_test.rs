mod helpers;

use std::time::Duration;

use helpers::*;
use memoria::memory::types::SessionStatus;
use memoria::retrieval::SearchRequest;
use memoria::service::StatusEvent;
use memoria::session::ObservationMessage;
use serde_json::json;

fn edit(path: &str, output: &str) -> ObservationMessage {
    ObservationMessage {
        tool_name: "Edit".into(),
        tool_input: json!({ "file_path": path }),
        tool_output: json!(output),
        cwd: None,
    }
}

#[tokio::test]
async fn tick_turns_queued_tool_events_into_searchable_observations() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let components = service.components();
    let record = components
        .store
        .create_or_get_session("conv-1", "demo")
        .unwrap();
    components
        .sessions
        .initialize_session(record.id, Some("tighten session cookies"), Some(1))
        .unwrap()
        .unwrap();

    let source = dir.path().join("cookies.rs");
    std::fs::write(&source, "pub fn secure() {}").unwrap();
    let path = source.display().to_string();
    assert!(components
        .sessions
        .queue_observation(record.id, edit(&path, "marked session cookies secure")));
    assert!(components.sessions.queue_observation(
        record.id,
        edit(&path, "rotated <private>sk-live-123</private> signing key")
    ));

    let dispatched = service.queue().tick(&service).await;
    assert_eq!(dispatched, 2);
    assert_eq!(components.sessions.get_total_queue_depth(), 0);

    let resp = service
        .retriever()
        .search(SearchRequest {
            project: "demo".into(),
            query: "cookies secure".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(!resp.observations.is_empty());
    let stored = &resp.observations[0];
    assert_eq!(stored.title, format!("Edit: {path}"));
    assert_eq!(stored.session_id, Some(record.id));
    assert!(stored.file_mtimes.contains_key(&path));

    assert_eq!(components.store.count_observations("demo").unwrap(), 2);
    let all = components.store.recent_observations("demo", 10).unwrap();
    assert!(all.iter().all(|o| !o.narrative.contains("sk-live")));

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn summarize_completes_and_forgets_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let mut events = service.subscribe();
    let components = service.components();
    let record = components
        .store
        .create_or_get_session("conv-2", "demo")
        .unwrap();
    components
        .sessions
        .initialize_session(record.id, Some("add rate limiting"), Some(1))
        .unwrap();

    components
        .sessions
        .queue_observation(record.id, edit("/tmp/limits.rs", "token bucket added"));
    components.sessions.queue_summarize(
        record.id,
        Some("add rate limiting".into()),
        Some("Added a token bucket limiter".into()),
    );
    // Anything after the summarize belongs to a finished session.
    components
        .sessions
        .queue_observation(record.id, edit("/tmp/late.rs", "late event"));

    service.queue().tick(&service).await;

    assert!(components.sessions.get_session(record.id).is_none());
    assert_eq!(components.store.count_observations("demo").unwrap(), 1);
    let persisted = components.store.get_session(record.id).unwrap().unwrap();
    assert_eq!(persisted.status, SessionStatus::Completed);
    let summary = components.store.latest_summary(record.id).unwrap().unwrap();
    assert_eq!(summary.request.as_deref(), Some("add rate limiting"));
    assert_eq!(summary.completed.as_deref(), Some("Added a token bucket limiter"));

    let mut saw_delete = false;
    while let Ok(event) = events.try_recv() {
        if event == (StatusEvent::SessionDeleted { session_id: record.id }) {
            saw_delete = true;
        }
    }
    assert!(saw_delete);

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn uninitialized_sessions_are_resolved_from_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let components = service.components();
    let record = components
        .store
        .create_or_get_session("conv-3", "lazy")
        .unwrap();

    // Queued before any activation: the entry is created lazily.
    components
        .sessions
        .queue_observation(record.id, edit("/tmp/lazy.rs", "lazily created"));
    let dispatched = service.queue().process_now(&service, record.id).await;

    assert_eq!(dispatched, 1);
    let stored = components.store.recent_observations("lazy", 5).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].project, "lazy");

    service.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn ticks_broadcast_processing_status() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let mut events = service.subscribe();

    service.queue().tick(&service).await;

    let event = events.recv().await.unwrap();
    assert!(matches!(event, StatusEvent::Processing { queue_depth: 0, .. }));
    service.shutdown(Duration::from_secs(1)).await;
}
