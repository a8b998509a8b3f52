mod common;

use std::time::Duration;

use common::{Harness, input, test_config};
use serde_json::json;
use splitmerge::error::HarnessError;
use splitmerge::runtime::storage::OrchestrationBackend;
use splitmerge::runtime::task::{MainInput, PathInput, TaskKind};

#[tokio::test]
async fn test_beats_carry_increasing_sequence() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "dict.txt");
    let task = harness
        .claim(TaskKind::Divide, input(&main, PathInput::root(), vec![main.root_key()], false))
        .await;
    let updater = harness.updater(&task);

    for expected in 1..=3 {
        let ack = updater.beat(Some(json!({ "step": expected }))).await.unwrap();
        assert!(!ack.cancel_requested);
        assert_eq!(updater.sequence().await, expected);
    }
}

#[tokio::test]
async fn test_backend_rejects_stale_sequence() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "dict.txt");
    let task = harness
        .claim(TaskKind::Divide, input(&main, PathInput::root(), vec![main.root_key()], false))
        .await;

    harness
        .backend
        .record_activity_task_heartbeat(&task.task_token, 5, None)
        .await
        .unwrap();
    let err = harness
        .backend
        .record_activity_task_heartbeat(&task.task_token, 5, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::HeartbeatOutOfOrder { sent: 5, last: 5, .. }));

    // An updater sharing the token now starts behind and is refused.
    let updater = harness.updater(&task);
    let err = updater.beat(None).await.unwrap_err();
    assert!(matches!(err, HarnessError::HeartbeatOutOfOrder { sent: 1, last: 5, .. }));
    assert!(!err.is_retryable());
}

#[tokio::test]
async fn test_ack_reports_cancellation() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "dict.txt");
    let task = harness
        .claim(TaskKind::Divide, input(&main, PathInput::root(), vec![main.root_key()], false))
        .await;
    harness
        .backend
        .request_cancel_workflow_execution(&task.execution, "operator")
        .await
        .unwrap();

    let ack = harness.updater(&task).beat(None).await.unwrap();
    assert!(ack.cancel_requested);
}

#[tokio::test]
async fn test_ticker_stops_once_task_is_gone() {
    let harness = Harness::new(test_config());
    let main = MainInput::new("data", "dict.txt");
    let task = harness
        .claim(TaskKind::Divide, input(&main, PathInput::root(), vec![main.root_key()], false))
        .await;
    let updater = harness.updater(&task);
    harness
        .backend
        .respond_activity_task_completed(&task.task_token, json!({}))
        .await
        .unwrap();

    let fatal = tokio::time::timeout(Duration::from_secs(5), updater.run_ticker(Duration::from_millis(10)))
        .await
        .expect("ticker should stop on its own");
    assert!(matches!(fatal, HarnessError::UnknownToken(_)));
}
