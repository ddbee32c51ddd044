//! Integration tests for the shutdown coordinator
//!
//! Uses the same three subscribers the capture tool registers:
//! process (1 copy), session (2 copies) and sink (2 copies).

use common::test_utils::{DEFAULT_TEST_TIMEOUT, with_timeout};
use common::{ShutdownCoordinator, ShutdownReason, ShutdownSubscription};
use std::time::Duration;

fn app_subscriptions(
    coordinator: &ShutdownCoordinator,
) -> (ShutdownSubscription, ShutdownSubscription, ShutdownSubscription) {
    (
        coordinator.subscribe("process", 1).unwrap(),
        coordinator.subscribe("session", 2).unwrap(),
        coordinator.subscribe("sink", 2).unwrap(),
    )
}

async fn drain(sub: &ShutdownSubscription) -> usize {
    let mut received = 0;
    while let Ok(Some(_)) = tokio::time::timeout(Duration::from_millis(100), sub.recv()).await {
        received += 1;
    }
    received
}

#[tokio::test]
async fn test_single_trigger_delivers_registered_copies() {
    let coordinator = ShutdownCoordinator::new();
    let (process, session, sink) = app_subscriptions(&coordinator);

    assert!(coordinator.trigger(ShutdownReason::Interrupt));

    assert_eq!(drain(&process).await, 1);
    assert_eq!(drain(&session).await, 2);
    assert_eq!(drain(&sink).await, 2);
}

#[tokio::test]
async fn test_second_trigger_delivers_nothing_extra() {
    let coordinator = ShutdownCoordinator::new();
    let (process, session, sink) = app_subscriptions(&coordinator);

    assert!(coordinator.trigger(ShutdownReason::Interrupt));
    assert!(!coordinator.trigger(ShutdownReason::Interrupt));
    assert!(!coordinator.trigger(ShutdownReason::Requested));

    assert_eq!(drain(&process).await, 1);
    assert_eq!(drain(&session).await, 2);
    assert_eq!(drain(&sink).await, 2);
}

#[tokio::test]
async fn test_late_subscription_still_receives_copies() {
    let coordinator = ShutdownCoordinator::new();
    coordinator.trigger(ShutdownReason::Requested);

    let late = coordinator.subscribe("sink", 2).unwrap();
    assert_eq!(drain(&late).await, 2);
}

#[tokio::test]
async fn test_copies_split_between_consumers() {
    let coordinator = ShutdownCoordinator::new();
    let session = coordinator.subscribe("session", 2).unwrap();

    // Two independent waiters share one subscription, each takes one copy
    let watcher = {
        let sub = session.clone();
        tokio::spawn(async move { sub.recv().await })
    };
    let retry_delay = {
        let sub = session.clone();
        tokio::spawn(async move { sub.recv().await })
    };

    tokio::task::yield_now().await;
    coordinator.trigger(ShutdownReason::Interrupt);

    let a = with_timeout(DEFAULT_TEST_TIMEOUT, watcher).await.unwrap().unwrap();
    let b = with_timeout(DEFAULT_TEST_TIMEOUT, retry_delay).await.unwrap().unwrap();
    assert_eq!(a, Some(ShutdownReason::Interrupt));
    assert_eq!(b, Some(ShutdownReason::Interrupt));
    assert_eq!(session.try_recv(), None);
}

#[tokio::test]
async fn test_concurrent_triggers_fire_once() {
    let coordinator = ShutdownCoordinator::new();
    let (process, session, sink) = app_subscriptions(&coordinator);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let c = coordinator.clone();
        handles.push(tokio::spawn(async move { c.trigger(ShutdownReason::Requested) }));
    }

    let mut fired = 0;
    for handle in handles {
        if handle.await.unwrap() {
            fired += 1;
        }
    }
    assert_eq!(fired, 1);

    assert_eq!(drain(&process).await, 1);
    assert_eq!(drain(&session).await, 2);
    assert_eq!(drain(&sink).await, 2);
}

#[tokio::test]
async fn test_wait_and_token_observe_trigger() {
    let coordinator = ShutdownCoordinator::new();
    let token = coordinator.token();

    let waiter = {
        let c = coordinator.clone();
        tokio::spawn(async move { c.wait().await })
    };

    coordinator.trigger(ShutdownReason::Requested);
    with_timeout(DEFAULT_TEST_TIMEOUT, waiter)
        .await
        .unwrap()
        .unwrap();
    assert!(token.is_cancelled());
    assert!(coordinator.is_triggered());
}

#[tokio::test]
async fn test_recv_returns_none_when_coordinator_dropped() {
    let coordinator = ShutdownCoordinator::new();
    let sub = coordinator.subscribe("process", 1).unwrap();
    drop(coordinator);

    let result = with_timeout(DEFAULT_TEST_TIMEOUT, sub.recv()).await.unwrap();
    assert_eq!(result, None);
}
