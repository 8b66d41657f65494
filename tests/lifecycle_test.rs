mod helpers;

use std::time::Duration;

use helpers::*;
use memoria::retrieval::staleness::StaleVerifyRequest;
use memoria::retrieval::SearchRequest;
use memoria::service::{Service, ShutdownStep, StatusEvent};
use memoria::supervisor;
use memoria::worker::{self, Outcome};

async fn wait_for(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    check()
}

fn position(steps: &[ShutdownStep], step: ShutdownStep) -> usize {
    steps.iter().position(|s| *s == step).unwrap()
}

#[tokio::test]
async fn no_ticks_after_shutdown_and_store_closes_last() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config_in(&dir);
    config.queue.tick_ms = 20;
    let service = Service::new(config, hash_backends()).unwrap();
    service.start();
    spawn_server(&service).await;

    assert!(wait_for(|| service.queue().ticks() >= 2).await);
    service.shutdown(Duration::from_secs(2)).await;

    let ticks = service.queue().ticks();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(service.queue().ticks(), ticks);

    let steps = service.shutdown_steps();
    assert_eq!(steps.len(), 7);
    assert!(position(&steps, ShutdownStep::Sessions) < position(&steps, ShutdownStep::Store));
    assert!(position(&steps, ShutdownStep::Http) < position(&steps, ShutdownStep::Store));
    assert!(position(&steps, ShutdownStep::Store) < position(&steps, ShutdownStep::Tasks));
    assert!(service.components().store.is_closed());
    assert!(!service.components().sessions.queue_observation(
        1,
        memoria::session::ObservationMessage {
            tool_name: "Read".into(),
            tool_input: serde_json::Value::Null,
            tool_output: serde_json::Value::Null,
            cwd: None,
        }
    ));
}

#[tokio::test]
async fn invalid_stale_observation_is_gone_on_next_search() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("session.rs"), "mod old;").unwrap();
    let service = started_service(&dir);
    let store = service.components().store.clone();
    let doomed = insert_with_file(&store, "demo", "Session store rewrite", "session.rs", 1);
    std::fs::remove_file(workdir.path().join("session.rs")).unwrap();

    let request = SearchRequest {
        project: "demo".into(),
        query: "session store".into(),
        cwd: Some(workdir.path().display().to_string()),
        limit: None,
    };
    let first = service.retriever().search(request.clone()).await.unwrap();
    assert!(first.observations.is_empty());
    assert_eq!(first.stale_excluded, 1);

    let lookup = store.clone();
    let id = doomed.id.clone();
    assert!(wait_for(|| lookup.get_observation(&id).unwrap().is_none()).await);

    let second = service.retriever().search(request).await.unwrap();
    assert!(second.observations.iter().all(|o| o.id != doomed.id));
    assert_eq!(second.stale_excluded, 0);
    let stats = service.stats().for_project("demo");
    assert_eq!(stats.stale_verified, 1);
    assert_eq!(stats.deleted_invalid, 1);

    service.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn valid_stale_observation_gets_fresh_mtimes() {
    let dir = tempfile::tempdir().unwrap();
    let workdir = tempfile::tempdir().unwrap();
    std::fs::write(workdir.path().join("lib.rs"), "pub mod api;").unwrap();
    let service = Service::new(config_in(&dir), hash_backends()).unwrap();
    service.start();
    let store = service.components().store.clone();
    let obs = insert_with_file(&store, "demo", "Public api module", "lib.rs", 1);

    let outcome = worker::verify_one(
        &service,
        StaleVerifyRequest {
            observation_id: obs.id.clone(),
            cwd: Some(workdir.path().to_path_buf()),
        },
    )
    .await;

    assert_eq!(outcome, Outcome::Refreshed);
    let refreshed = store.get_observation(&obs.id).unwrap().unwrap();
    assert!(refreshed.file_mtimes["lib.rs"] > 1);
    assert_eq!(service.stats().for_project("demo").deleted_invalid, 0);

    let missing = worker::verify_one(
        &service,
        StaleVerifyRequest {
            observation_id: "no-such-id".into(),
            cwd: None,
        },
    )
    .await;
    assert_eq!(missing, Outcome::Skipped);

    service.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn reinitialize_swaps_in_a_fresh_store() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let mut events = service.subscribe();
    let before = service.components();
    insert(&before.store, "demo", "Lost on rebuild", "");
    std::fs::remove_file(service.db_path()).unwrap();

    assert!(service.reinitialize().await.unwrap());

    assert!(service.is_ready());
    assert!(before.store.is_closed());
    let after = service.components();
    assert!(!after.store.is_closed());
    assert_eq!(after.store.count_observations("demo").unwrap(), 0);
    assert!(service.db_path().exists());
    let mut saw = false;
    while let Ok(event) = events.try_recv() {
        saw |= event == StatusEvent::Reinitialized;
    }
    assert!(saw);

    // The rebuilt store serves the full pipeline.
    insert(&after.store, "demo", "Written after rebuild", "");
    let resp = service
        .retriever()
        .search(SearchRequest {
            project: "demo".into(),
            query: "rebuild".into(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(resp.observations.len(), 1);

    service.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn concurrent_reinitializations_run_once() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    std::fs::remove_file(service.db_path()).unwrap();

    let (a, b) = tokio::join!(service.reinitialize(), service.reinitialize());
    let ran = [a.unwrap(), b.unwrap()].iter().filter(|r| **r).count();

    assert!(ran >= 1);
    assert!(service.is_ready());
    service.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn supervisor_rebuilds_when_database_is_deleted() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let mut events = service.subscribe();
    service.attach_watcher(supervisor::start(service.clone()).unwrap());

    let old_store = service.components().store.clone();
    std::fs::remove_file(service.db_path()).unwrap();

    let rebuilt = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(StatusEvent::Reinitialized) => return true,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false);

    assert!(rebuilt);
    assert!(old_store.is_closed());
    assert!(service.db_path().exists());
    service.shutdown(Duration::from_secs(2)).await;
}

async fn next_reinitialized(events: &mut tokio::sync::broadcast::Receiver<StatusEvent>) -> bool {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            match events.recv().await {
                Ok(StatusEvent::Reinitialized) => return true,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return false,
            }
        }
    })
    .await
    .unwrap_or(false)
}

#[tokio::test]
async fn supervisor_survives_repeated_directory_removal() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let mut events = service.subscribe();
    service.attach_watcher(supervisor::start(service.clone()).unwrap());
    let data = service.db_path().parent().unwrap().to_path_buf();

    for round in 0..2 {
        let before = service.components().store.clone();
        std::fs::remove_dir_all(&data).unwrap();

        assert!(next_reinitialized(&mut events).await, "round {round}");
        assert!(before.is_closed(), "round {round}");
        assert!(service.db_path().exists(), "round {round}");
        assert!(service.is_ready(), "round {round}");
    }

    service.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn failed_rebuild_requests_exit() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let data = service.db_path().parent().unwrap().to_path_buf();
    std::fs::remove_dir_all(&data).unwrap();
    // A file where the database directory should be.
    std::fs::write(&data, "not a directory").unwrap();

    assert!(service.reinitialize().await.is_err());

    assert!(!service.is_ready());
    assert!(service.exit_requested());
    assert!(service.token().is_cancelled());
    service.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn rebuild_retries_until_the_directory_is_usable() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let data = service.db_path().parent().unwrap().to_path_buf();
    std::fs::remove_dir_all(&data).unwrap();
    std::fs::write(&data, "not a directory").unwrap();

    let blocker = data.clone();
    let unblock = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        std::fs::remove_file(blocker).unwrap();
    });

    assert!(service.reinitialize().await.unwrap());
    unblock.await.unwrap();
    assert!(service.is_ready());
    assert!(!service.exit_requested());
    assert!(service.db_path().exists());
    service.shutdown(Duration::from_secs(2)).await;
}

#[tokio::test]
async fn shutdown_shares_one_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let service = started_service(&dir);
    let sessions = service.components().sessions.clone();
    let record = service
        .components()
        .store
        .create_or_get_session("stuck", "demo")
        .unwrap();
    sessions.initialize_session(record.id, None, None).unwrap();
    sessions.set_processing(record.id, true);
    service.tracker().spawn(std::future::pending::<()>());

    let started = std::time::Instant::now();
    service.shutdown(Duration::from_millis(300)).await;

    assert!(started.elapsed() < Duration::from_millis(550));
    assert_eq!(service.shutdown_steps().len(), 7);
}

#[tokio::test]
async fn settings_change_requests_exit() {
    let dir = tempfile::tempdir().unwrap();
    let settings = dir.path().join("config.toml");
    std::fs::write(&settings, "[server]\nport = 0\n").unwrap();
    let mut config = config_in(&dir);
    config.source_path = Some(settings.clone());
    let service = Service::new(config, hash_backends()).unwrap();
    service.start();
    service.attach_watcher(supervisor::start(service.clone()).unwrap());

    std::fs::write(&settings, "[server]\nport = 1\n").unwrap();

    let token = service.token();
    let exited = tokio::time::timeout(Duration::from_secs(10), token.cancelled())
        .await
        .is_ok();
    assert!(exited);
    assert!(service.exit_requested());
    service.shutdown(Duration::from_secs(2)).await;
}
