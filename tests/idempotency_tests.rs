mod common;

use chrono::Duration;
use idempotency_service::error::AppError;
use idempotency_service::idempotency::{
    Admission, ConfigRegistry, IdempotencyOrchestrator, RetryPolicy,
};
use idempotency_service::models::{FailureKind, LockGrant, OperationKey, Outcome, SettledOutcome};
use idempotency_service::models::now_micros;
use idempotency_service::repositories::{MemoryStore, ReservationStore, Stores};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Charge {
    charge_id: String,
    amount_cents: u64,
}

async fn acquire(orchestrator: &IdempotencyOrchestrator, key: &OperationKey) -> LockGrant {
    match orchestrator.begin(key).await.expect("begin") {
        Admission::Acquired(grant) => grant,
        other => panic!("expected lock, got {:?}", other),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_invokes_execute_once() {
    let (orchestrator, _) = common::memory_orchestrator(Duration::seconds(30), true).await;
    let executions = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for _ in 0..16 {
        let orchestrator = Arc::clone(&orchestrator);
        let executions = Arc::clone(&executions);
        handles.push(tokio::spawn(async move {
            orchestrator
                .invoke(&common::charge_key("order-42"), || async move {
                    executions.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(json!({"chargeId": "ch_1"}))
                })
                .await
        }));
    }

    for handle in handles {
        match handle.await.unwrap() {
            Ok(payload) => assert_eq!(payload, json!({"chargeId": "ch_1"})),
            Err(AppError::OperationInProgress { .. }) => {}
            Err(other) => panic!("unexpected error: {:?}", other),
        }
    }

    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_invokes_return_identical_payload() {
    let (orchestrator, store) = common::memory_orchestrator(Duration::seconds(30), true).await;
    let key = common::charge_key("order-7");
    let executions = AtomicU32::new(0);
    let counter = &executions;

    let first: Charge = orchestrator
        .invoke(&key, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Charge { charge_id: "ch_7".to_string(), amount_cents: 1250 })
        })
        .await
        .unwrap();

    for _ in 0..5 {
        let again: Charge = orchestrator
            .invoke(&key, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(Charge { charge_id: "ch_other".to_string(), amount_cents: 1 })
            })
            .await
            .unwrap();
        assert_eq!(again, first);
    }

    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(store.operation_records(&key).len(), 1);
    assert_eq!(orchestrator.metrics().snapshot().cached_responses, 5);
}

#[tokio::test]
async fn test_expired_lock_can_be_reacquired() {
    let (orchestrator, store) = common::memory_orchestrator(Duration::milliseconds(1), true).await;
    let key = common::charge_key("order-42");

    let first = acquire(&orchestrator, &key).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let second = acquire(&orchestrator, &key).await;

    assert_ne!(first.lock_id, second.lock_id);
    assert_eq!(store.operation_records(&key).len(), 2);
}

#[tokio::test]
async fn test_expired_lock_without_result_blocks_when_reexecution_forbidden() {
    let (orchestrator, _) = common::memory_orchestrator(Duration::milliseconds(1), false).await;
    let key = common::charge_key("order-42");

    let grant = acquire(&orchestrator, &key).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let executed = AtomicU32::new(0);
    let counter = &executed;
    let result: Result<serde_json::Value, AppError> = orchestrator
        .invoke(&key, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({}))
        })
        .await;

    match result {
        Err(AppError::ExpiredWithoutResult { lock_id, expired_at }) => {
            assert_eq!(lock_id, grant.lock_id);
            assert_eq!(expired_at, grant.expired_at);
        }
        other => panic!("expected ExpiredWithoutResult, got {:?}", other),
    }
    assert_eq!(executed.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_purged_reservation_without_result_is_not_reexecuted() {
    let (orchestrator, store) = common::memory_orchestrator(Duration::milliseconds(1), false).await;
    let key = common::charge_key("order-42");

    let abandoned = acquire(&orchestrator, &key).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    store.purge_expired(now_micros()).await.unwrap();

    let executions = AtomicU32::new(0);
    let counter = &executions;
    for _ in 0..2 {
        let result: Result<serde_json::Value, AppError> = orchestrator
            .invoke(&key, move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"chargeId": "ch_dup"}))
            })
            .await;

        match result {
            Err(AppError::ExpiredWithoutResult { lock_id, .. }) => assert_eq!(lock_id, abandoned.lock_id),
            other => panic!("expected ExpiredWithoutResult, got {:?}", other),
        }
    }

    assert_eq!(executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_racing_completions_agree_on_winner() {
    let (orchestrator, _) = common::memory_orchestrator(Duration::milliseconds(1), true).await;
    let key = common::charge_key("order-42");

    let stale = acquire(&orchestrator, &key).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    let fresh = acquire(&orchestrator, &key).await;

    let (a, b) = tokio::join!(
        orchestrator.complete(&stale, Outcome::Success(json!({"chargeId": "ch_a"}))),
        orchestrator.complete(&fresh, Outcome::Success(json!({"chargeId": "ch_b"}))),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a, b);
    assert!(
        a == SettledOutcome::Success(json!({"chargeId": "ch_a"}))
            || a == SettledOutcome::Success(json!({"chargeId": "ch_b"}))
    );

    let cached = match orchestrator.begin(&key).await.unwrap() {
        Admission::Cached(payload) => SettledOutcome::Success(payload),
        other => panic!("expected cached result, got {:?}", other),
    };
    assert_eq!(cached, a);
}

#[tokio::test]
async fn test_billing_charge_scenario() {
    let (orchestrator, _) = common::memory_orchestrator(Duration::seconds(30), false).await;
    let key = common::charge_key("order-42");

    let grant = acquire(&orchestrator, &key).await;

    match orchestrator.begin(&key).await {
        Err(AppError::OperationInProgress { expires_at }) => assert_eq!(expires_at, grant.expired_at),
        other => panic!("expected OperationInProgress, got {:?}", other),
    }

    let settled = orchestrator
        .complete(&grant, Outcome::Success(json!({"chargeId": "ch_1"})))
        .await
        .unwrap();
    assert_eq!(settled, SettledOutcome::Success(json!({"chargeId": "ch_1"})));

    assert_eq!(
        orchestrator.begin(&key).await.unwrap(),
        Admission::Cached(json!({"chargeId": "ch_1"}))
    );
}

#[tokio::test]
async fn test_late_release_does_not_unlock_new_holder() {
    let (orchestrator, _) = common::memory_orchestrator(Duration::milliseconds(1), true).await;
    let key = common::charge_key("order-42");

    let stale = acquire(&orchestrator, &key).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    // Re-register with a long lock so the new holder stays live.
    let registry = orchestrator.registry();
    registry
        .register(
            idempotency_service::models::OperationConfig::new("billing", "charge", Duration::seconds(30), true)
                .unwrap(),
        )
        .await
        .unwrap();
    let fresh = acquire(&orchestrator, &key).await;

    orchestrator
        .complete(&stale, Outcome::Failure("gateway timeout".to_string()))
        .await
        .unwrap();

    match orchestrator.begin(&key).await {
        Err(AppError::OperationInProgress { expires_at }) => assert_eq!(expires_at, fresh.expired_at),
        other => panic!("expected the new holder to keep the key, got {:?}", other),
    }
}

#[tokio::test]
async fn test_recorded_failure_returned_when_reexecution_forbidden() {
    let (orchestrator, _) = common::memory_orchestrator(Duration::seconds(30), false).await;
    let key = common::charge_key("order-9");
    let executions = AtomicU32::new(0);
    let counter = &executions;

    let first: Result<serde_json::Value, AppError> = orchestrator
        .invoke(&key, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(AppError::Internal(anyhow::anyhow!("card declined")))
        })
        .await;
    assert!(matches!(first, Err(AppError::Internal(_))));

    let second: Result<serde_json::Value, AppError> = orchestrator
        .invoke(&key, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"chargeId": "ch_9"}))
        })
        .await;

    match second {
        Err(AppError::OperationFailed { message, .. }) => assert!(message.contains("card declined")),
        other => panic!("expected OperationFailed, got {:?}", other),
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recorded_failure_allows_retry_when_reexecution_allowed() {
    let (orchestrator, store) = common::memory_orchestrator(Duration::seconds(30), true).await;
    let key = common::charge_key("order-10");

    let first: Result<serde_json::Value, AppError> = orchestrator
        .invoke(&key, || async { Err(AppError::Validation("insufficient funds".to_string())) })
        .await;
    assert!(matches!(first, Err(AppError::Validation(_))));

    let second: serde_json::Value = orchestrator
        .invoke(&key, || async { Ok(json!({"chargeId": "ch_10"})) })
        .await
        .unwrap();

    assert_eq!(second, json!({"chargeId": "ch_10"}));
    assert_eq!(store.failures_for(&key).len(), 1);
    assert_eq!(store.failures_for(&key)[0].kind, FailureKind::OperationFailed);
}

#[tokio::test]
async fn test_missing_configuration_never_executes() {
    let store = Arc::new(MemoryStore::new());
    let stores = Stores::memory(store);
    let registry = Arc::new(ConfigRegistry::new(stores.configs.clone(), RetryPolicy::none()));
    let orchestrator = IdempotencyOrchestrator::new(stores, registry, RetryPolicy::none());

    let executions = AtomicU32::new(0);
    let counter = &executions;
    let result: Result<serde_json::Value, AppError> = orchestrator
        .invoke(&OperationKey::new("mail", "send", "welcome-1"), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        })
        .await;

    assert!(matches!(result, Err(AppError::ConfigurationMissing { .. })));
    assert_eq!(executions.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_reaped_lock_reports_expiry() {
    let (orchestrator, store) = common::memory_orchestrator(Duration::milliseconds(1), false).await;
    let key = common::charge_key("order-11");

    acquire(&orchestrator, &key).await;
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;

    let summary = orchestrator.reap_expired_locks(10).await.unwrap();
    assert_eq!(summary.locks_expired, 1);
    assert_eq!(store.reservation_count(), 0);

    assert!(matches!(
        orchestrator.begin(&key).await,
        Err(AppError::ExpiredWithoutResult { .. })
    ));
}

#[test]
fn test_invoke_from_blocking_context() {
    let (orchestrator, _) = tokio_test::block_on(common::memory_orchestrator(Duration::seconds(30), true));
    let key = common::charge_key("order-12");

    let payload: serde_json::Value = tokio_test::block_on(
        orchestrator.invoke(&key, || async { Ok(json!({"chargeId": "ch_12"})) }),
    )
    .unwrap();

    assert_eq!(payload, json!({"chargeId": "ch_12"}));
}
