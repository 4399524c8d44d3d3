//! End-to-end publish scenarios through PublishService
//!
//! Uses mock platforms over both the in-memory and the SQLite store.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use libcrosspost::config::ExecutorConfig;
use libcrosspost::platforms::mock::{MockPlatform, MockResponse};
use libcrosspost::service::events::Event;
use libcrosspost::{
    CrosspostError, ErrorKind, MemoryStore, PlatformError, PlatformRegistry, PublishRequest,
    PublishService, PublishStatus, RecordStore, SqliteStore,
};
use tempfile::TempDir;

fn executor_config(max_attempts: u32) -> ExecutorConfig {
    ExecutorConfig {
        workers: 4,
        max_attempts,
        base_delay_ms: 1,
        max_delay_ms: 5,
        jitter_ms: 1,
        attempt_timeout_secs: 5,
        lease_secs: 60,
    }
}

fn request(targets: &[&str]) -> PublishRequest {
    PublishRequest {
        owner_id: 9,
        title: "Spring sale".to_string(),
        body: "Everything 20% off this weekend".to_string(),
        media_refs: vec!["https://cdn.example.com/banner.jpg".to_string()],
        targets: targets.iter().map(|t| t.to_string()).collect(),
        ..Default::default()
    }
}

fn rate_limited() -> MockResponse {
    MockResponse::Fail(PlatformError::RateLimited {
        message: "slow down".to_string(),
        retry_after: Some(Duration::from_millis(5)),
    })
}

#[tokio::test]
async fn test_rate_limited_target_recovers() {
    let a = MockPlatform::success("A");
    let b = MockPlatform::scripted("B", vec![rate_limited(), rate_limited()]);
    let mut registry = PlatformRegistry::new();
    registry.register(a.clone());
    registry.register(b.clone());
    let service = PublishService::new(Arc::new(MemoryStore::new()), registry, &executor_config(3));

    let id = service.create_publish(request(&["A", "B"])).await.unwrap();
    let record = service.await_settled(&id).await.unwrap();

    assert_eq!(record.status, PublishStatus::Published);
    assert_eq!(record.outcome("A").unwrap().attempt_count, 1);
    assert_eq!(record.outcome("B").unwrap().attempt_count, 3);
    assert_eq!(a.publish_call_count(), 1);
    assert_eq!(b.publish_call_count(), 3);
}

#[tokio::test]
async fn test_rejected_target_partially_fails() {
    let b = MockPlatform::failing("B", PlatformError::Rejected("policy violation".to_string()));
    let mut registry = PlatformRegistry::new();
    registry.register(MockPlatform::success("A"));
    registry.register(b.clone());
    let service = PublishService::new(Arc::new(MemoryStore::new()), registry, &executor_config(3));

    let id = service.create_publish(request(&["A", "B"])).await.unwrap();
    let record = service.await_settled(&id).await.unwrap();

    assert_eq!(record.status, PublishStatus::PartiallyFailed);
    let outcome = record.outcome("B").unwrap();
    assert_eq!(outcome.error_kind, Some(ErrorKind::Rejected));
    assert_eq!(outcome.attempt_count, 1);
    assert!(outcome.error_message.as_deref().unwrap().contains("policy violation"));
}

#[tokio::test]
async fn test_schedule_then_cancel_never_dispatches() {
    let a = MockPlatform::success("A");
    let mut registry = PlatformRegistry::new();
    registry.register(a.clone());
    let service = PublishService::new(Arc::new(MemoryStore::new()), registry, &executor_config(3));
    service.start().await.unwrap();

    let id = service
        .create_publish(PublishRequest {
            scheduled_at: Some(Utc::now() + chrono::Duration::minutes(10)),
            ..request(&["A"])
        })
        .await
        .unwrap();
    assert_eq!(
        service.get_publish(&id).await.unwrap().status,
        PublishStatus::Scheduled
    );

    service.cancel_publish(&id).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.shutdown().await;

    let record = service.get_publish(&id).await.unwrap();
    assert_eq!(record.status, PublishStatus::Cancelled);
    assert!(record.per_platform_results.is_empty());
    assert_eq!(a.publish_call_count(), 0);
}

#[tokio::test]
async fn test_misconfigured_registry_fails_without_calls() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = PlatformRegistry::new();
    registry.register(MockPlatform::success("A"));
    registry.register(MockPlatform::success("B"));
    let service = PublishService::new(store.clone(), registry, &executor_config(3));

    // Stored while the platforms were configured, dispatched after they went away
    let id = service
        .create_publish(PublishRequest {
            draft: true,
            ..request(&["A", "B"])
        })
        .await
        .unwrap();
    let empty = PublishService::new(store, PlatformRegistry::new(), &executor_config(3));
    empty.publish_now(&id).await.unwrap();
    let record = empty.await_settled(&id).await.unwrap();

    assert_eq!(record.status, PublishStatus::Failed);
    for target in ["A", "B"] {
        let outcome = record.outcome(target).unwrap();
        assert_eq!(outcome.error_kind, Some(ErrorKind::UnsupportedPlatform));
        assert_eq!(outcome.attempt_count, 0);
        assert!(outcome.terminal);
    }
}

#[tokio::test]
async fn test_scheduled_publish_fires_once() {
    let a = MockPlatform::success("A");
    let mut registry = PlatformRegistry::new();
    registry.register(a.clone());
    let service = PublishService::new(Arc::new(MemoryStore::new()), registry, &executor_config(3));
    service.start().await.unwrap();

    let id = service
        .create_publish(PublishRequest {
            scheduled_at: Some(Utc::now() + chrono::Duration::milliseconds(100)),
            ..request(&["A"])
        })
        .await
        .unwrap();

    // Resyncing while the entry is pending or just fired must not duplicate it
    service.resync().await.unwrap();
    let record = service.await_settled(&id).await.unwrap();
    service.resync().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.shutdown().await;

    assert_eq!(record.status, PublishStatus::Published);
    assert_eq!(a.publish_call_count(), 1);
    assert!(record.finished_at.is_some());
}

#[tokio::test]
async fn test_cancel_after_due_time_fails() {
    let store = Arc::new(MemoryStore::new());
    let mut registry = PlatformRegistry::new();
    registry.register(MockPlatform::success("A"));
    let service = PublishService::new(store.clone(), registry, &executor_config(3));

    let id = service
        .create_publish(PublishRequest {
            scheduled_at: Some(Utc::now() + chrono::Duration::milliseconds(30)),
            ..request(&["A"])
        })
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    let err = service.cancel_publish(&id).await.unwrap_err();
    assert!(matches!(err, CrosspostError::NotFound(_)));
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        PublishStatus::Scheduled
    );
}

#[tokio::test]
async fn test_events_follow_lifecycle() {
    let mut registry = PlatformRegistry::new();
    registry.register(MockPlatform::success("A"));
    let service = PublishService::new(Arc::new(MemoryStore::new()), registry, &executor_config(3));
    let mut events = service.subscribe();

    let id = service.create_publish(request(&["A"])).await.unwrap();
    service.await_settled(&id).await.unwrap();

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        let finished = matches!(event, Event::PublishFinished { .. });
        seen.push(event);
        if finished {
            break;
        }
    }

    assert!(matches!(seen[0], Event::PublishStarted { .. }));
    assert!(matches!(
        seen[1],
        Event::TargetAttempted { attempt: 1, terminal: true, .. }
    ));
    assert_eq!(
        seen[2],
        Event::PublishFinished {
            record_id: id.clone(),
            status: PublishStatus::Published,
        }
    );
}

#[tokio::test]
async fn test_terminal_records_have_terminal_outcomes() {
    let mut registry = PlatformRegistry::new();
    registry.register(MockPlatform::success("A"));
    registry.register(MockPlatform::failing(
        "B",
        PlatformError::AuthExpired("token revoked".to_string()),
    ));
    registry.register(MockPlatform::failing(
        "C",
        PlatformError::Ambiguous("connection reset mid-response".to_string()),
    ));
    let service = PublishService::new(Arc::new(MemoryStore::new()), registry, &executor_config(2));

    let id = service.create_publish(request(&["A", "B", "C"])).await.unwrap();
    let record = service.await_settled(&id).await.unwrap();

    assert_eq!(record.status, PublishStatus::PartiallyFailed);
    for target in &record.targets {
        assert!(record.outcome(target).unwrap().terminal, "{} not terminal", target);
    }
    assert_eq!(record.outcome("B").unwrap().attempt_count, 1);
    assert_eq!(record.outcome("C").unwrap().attempt_count, 2);
    assert_eq!(record.outcome("C").unwrap().error_kind, Some(ErrorKind::Ambiguous));
}

#[tokio::test]
async fn test_sqlite_store_survives_restart() {
    let temp_dir = TempDir::new().unwrap();
    let db_path = temp_dir.path().join("crosspost.db");
    let db_path = db_path.to_str().unwrap();

    let a = MockPlatform::success("A");
    let id = {
        let store = SqliteStore::new(db_path).await.unwrap();
        let mut registry = PlatformRegistry::new();
        registry.register(a.clone());
        let service = PublishService::new(Arc::new(store), registry, &executor_config(3));
        service
            .create_publish(PublishRequest {
                scheduled_at: Some(Utc::now() + chrono::Duration::milliseconds(150)),
                ..request(&["A"])
            })
            .await
            .unwrap()
    };

    // A fresh process restores the pending entry from storage
    let store = SqliteStore::new(db_path).await.unwrap();
    let mut registry = PlatformRegistry::new();
    registry.register(a.clone());
    let service = PublishService::new(Arc::new(store), registry, &executor_config(3));
    service.start().await.unwrap();
    assert!(service.scheduler().is_pending(&id));

    let record = service.await_settled(&id).await.unwrap();
    service.shutdown().await;

    assert_eq!(record.status, PublishStatus::Published);
    assert_eq!(a.publish_call_count(), 1);
}

#[tokio::test]
async fn test_second_service_does_not_steal_running_publish() {
    let store = Arc::new(MemoryStore::new());
    let a = MockPlatform::with_delay("A", Duration::from_millis(300));

    let service = |platform: &MockPlatform| {
        let mut registry = PlatformRegistry::new();
        registry.register(platform.clone());
        PublishService::new(store.clone(), registry, &executor_config(3))
    };
    let first = service(&a);
    let second = service(&a);

    let id = first.create_publish(request(&["A"])).await.unwrap();
    while store.get(&id).await.unwrap().unwrap().status != PublishStatus::Publishing {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // A second process starting up sees the record in `publishing`
    second.start().await.unwrap();
    second.executor().drain().await;

    let record = first.await_settled(&id).await.unwrap();
    second.shutdown().await;

    assert_eq!(record.status, PublishStatus::Published);
    assert_eq!(a.publish_call_count(), 1);
    assert_eq!(record.outcome("A").unwrap().attempt_count, 1);
}

#[tokio::test]
async fn test_second_service_does_not_retry_during_backoff() {
    let store = Arc::new(MemoryStore::new());
    let a = MockPlatform::scripted(
        "A",
        vec![MockResponse::Fail(PlatformError::RateLimited {
            message: "slow down".to_string(),
            retry_after: Some(Duration::from_millis(300)),
        })],
    );
    let config = ExecutorConfig {
        max_delay_ms: 1000,
        ..executor_config(3)
    };

    let service = |platform: &MockPlatform| {
        let mut registry = PlatformRegistry::new();
        registry.register(platform.clone());
        PublishService::new(store.clone(), registry, &config)
    };
    let first = service(&a);
    let second = service(&a);

    let id = first.create_publish(request(&["A"])).await.unwrap();
    while a.publish_call_count() == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    second.start().await.unwrap();
    second.executor().drain().await;
    assert_eq!(a.publish_call_count(), 1);

    let record = first.await_settled(&id).await.unwrap();
    second.shutdown().await;

    assert_eq!(record.status, PublishStatus::Published);
    assert_eq!(record.outcome("A").unwrap().attempt_count, 2);
    assert_eq!(a.publish_call_count(), 2);
}
