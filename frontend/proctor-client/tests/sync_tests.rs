use std::sync::Arc;
use std::time::Duration;

use proctor_api::models::EventType;
use proctor_client::{
    EventTransport, FileQueueStore, FlushOutcome, HttpTransport, MemoryQueueStore, SessionContext,
    SyncClient, SyncError,
};
use serde_json::Map;

mod common;

use common::TestServer;

fn context(attempt_id: &str) -> SessionContext {
    let mut context = SessionContext::new("student-1", "assessment-1");
    context.attempt_id = Some(attempt_id.to_string());
    context
}

#[tokio::test]
async fn test_flush_delivers_and_counts_violations() {
    let server = TestServer::spawn().await;
    let attempt_id = server.start_attempt("student-1").await;
    let client = common::sync_client(&server, Arc::new(MemoryQueueStore::new()));
    let ctx = context(&attempt_id);

    for event_type in [
        EventType::WindowBlur,
        EventType::FocusRestored,
        EventType::CopyAttempt,
    ] {
        client.log(&ctx, event_type, Map::new()).await.unwrap();
    }

    let outcome = client.flush().await.unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Delivered {
            sent: 3,
            inserted: 3,
            duplicates: 0
        }
    );
    assert!(client.pending().await.is_empty());
    assert_eq!(server.attempt(&attempt_id).await.violation_count, 2);
}

#[tokio::test]
async fn test_redelivered_batch_is_not_double_counted() {
    let server = TestServer::spawn().await;
    let attempt_id = server.start_attempt("student-1").await;
    let client = common::sync_client(&server, Arc::new(MemoryQueueStore::new()));
    client
        .log(&context(&attempt_id), EventType::TabSwitch, Map::new())
        .await
        .unwrap();
    let batch = client.pending().await;

    // first delivery committed but its response was lost
    let transport = server.transport();
    transport.send_batch(&batch).await.unwrap();

    let outcome = client.flush().await.unwrap();
    assert_eq!(
        outcome,
        FlushOutcome::Delivered {
            sent: 1,
            inserted: 0,
            duplicates: 1
        }
    );
    assert_eq!(server.attempt(&attempt_id).await.violation_count, 1);
    assert_eq!(server.events(&attempt_id).await.len(), 2);
}

#[tokio::test]
async fn test_locked_attempt_events_are_dropped() {
    let server = TestServer::spawn().await;
    let open = server.start_attempt("student-1").await;
    let locked = server.start_attempt("student-2").await;
    let client = common::sync_client(&server, Arc::new(MemoryQueueStore::new()));

    client.log(&context(&open), EventType::TabSwitch, Map::new()).await.unwrap();
    client.log(&context(&locked), EventType::TabSwitch, Map::new()).await.unwrap();

    use proctor_client::AttemptApi;
    server
        .transport()
        .submit_attempt(&locked, &Default::default())
        .await
        .unwrap();

    // the whole batch is refused; only the locked attempt's events are discarded
    assert_eq!(
        client.flush().await.unwrap(),
        FlushOutcome::Dropped { dropped: 1 }
    );
    let pending = client.pending().await;
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].attempt_id, open);

    client.flush().await.unwrap();
    assert!(client.pending().await.is_empty());
    assert_eq!(server.attempt(&open).await.violation_count, 1);
    assert_eq!(server.attempt(&locked).await.violation_count, 0);
}

#[tokio::test]
async fn test_unknown_attempt_events_are_dropped() {
    let server = TestServer::spawn().await;
    let client = common::sync_client(&server, Arc::new(MemoryQueueStore::new()));
    client.log(&context("ghost"), EventType::TabSwitch, Map::new()).await.unwrap();

    assert_eq!(
        client.flush().await.unwrap(),
        FlushOutcome::Dropped { dropped: 1 }
    );
    assert!(client.pending().await.is_empty());
}

#[tokio::test]
async fn test_misrouted_batch_keeps_queue() {
    let server = TestServer::spawn().await;
    let attempt_id = server.start_attempt("student-1").await;
    // missing the /api prefix, so every request hits the JSON 404 fallback
    let base_url = server.base_url.trim_end_matches("/api").to_string();
    let transport = Arc::new(HttpTransport::new(base_url, Duration::from_secs(2)).unwrap());
    let store = Arc::new(MemoryQueueStore::new());
    let client = SyncClient::new(common::sync_config(), store.clone(), transport);

    let ctx = context(&attempt_id);
    client.log(&ctx, EventType::TabSwitch, Map::new()).await.unwrap();
    client.log(&ctx, EventType::CopyAttempt, Map::new()).await.unwrap();
    let before = client.pending().await;

    let err = client.flush().await.unwrap_err();
    assert!(matches!(err, SyncError::Transient(_)));
    assert!(!err.is_terminal());
    assert_eq!(client.pending().await, before);
    assert_eq!(store.snapshot(), before);
    assert_eq!(server.attempt(&attempt_id).await.violation_count, 0);
}

#[tokio::test]
async fn test_unreachable_server_keeps_queue() {
    let base_url = common::closed_base_url().await;
    let transport = Arc::new(HttpTransport::new(base_url, Duration::from_secs(2)).unwrap());
    let store = Arc::new(MemoryQueueStore::new());
    let client = SyncClient::new(common::sync_config(), store.clone(), transport);

    client.log(&context("a-1"), EventType::TabSwitch, Map::new()).await.unwrap();
    let before = client.pending().await;

    let err = client.flush().await.unwrap_err();
    assert!(matches!(err, SyncError::Transient(_)));
    assert_eq!(client.pending().await, before);
    assert_eq!(store.snapshot(), before);
}

#[tokio::test]
async fn test_queue_survives_reload() {
    let server = TestServer::spawn().await;
    let attempt_id = server.start_attempt("student-1").await;
    let dir = std::env::temp_dir().join(format!("proctor-reload-{}", uuid::Uuid::new_v4()));
    tokio::fs::create_dir_all(&dir).await.unwrap();
    let path = dir.join("events_queue.json");

    {
        let client = common::sync_client(&server, Arc::new(FileQueueStore::new(&path)));
        client.set_online(false);
        client
            .log(&context(&attempt_id), EventType::PasteAttempt, Map::new())
            .await
            .unwrap();
        client
            .log(&context(&attempt_id), EventType::QuestionViewed, Map::new())
            .await
            .unwrap();
        assert!(client.flush().await.is_ok());
    }

    let reloaded = common::sync_client(&server, Arc::new(FileQueueStore::new(&path)));
    assert_eq!(reloaded.load().await.unwrap(), 2);
    let outcome = reloaded.shutdown().await.unwrap();
    assert!(matches!(outcome, FlushOutcome::Delivered { sent: 2, .. }));
    assert_eq!(server.attempt(&attempt_id).await.violation_count, 1);

    let fresh = common::sync_client(&server, Arc::new(FileQueueStore::new(&path)));
    assert_eq!(fresh.load().await.unwrap(), 0);

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}

#[tokio::test]
async fn test_timer_flushes_periodically() {
    let server = TestServer::spawn().await;
    let attempt_id = server.start_attempt("student-1").await;
    let mut config = common::sync_config();
    config.sync_interval = Duration::from_millis(50);
    let client = SyncClient::new(config, Arc::new(MemoryQueueStore::new()), server.transport());

    client.start();
    assert!(client.is_running());
    client
        .log(&context(&attempt_id), EventType::ContextMenu, Map::new())
        .await
        .unwrap();

    for _ in 0..40 {
        if client.pending().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(client.pending().await.is_empty());
    assert_eq!(server.attempt(&attempt_id).await.violation_count, 1);

    client.stop();
    assert!(!client.is_running());
}
