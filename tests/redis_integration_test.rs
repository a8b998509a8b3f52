use std::sync::Arc;
use std::time::Duration;

use redis::Client;
use splitmerge::cli::wait_for_close;
use splitmerge::config::HarnessConfig;
use splitmerge::error::HarnessError;
use splitmerge::retry::RetryPolicy;
use splitmerge::runtime::context::Context;
use splitmerge::runtime::decider::Decider;
use splitmerge::runtime::history::WorkflowStatus;
use splitmerge::runtime::redis_storage::{RedisBackend, RedisBlobStore};
use splitmerge::runtime::registry::TaskRegistry;
use splitmerge::runtime::storage::{BlobStore, OrchestrationBackend};
use splitmerge::runtime::task::{MainInput, MergeOutput};
use splitmerge::runtime::worker::Worker;
use tokio::sync::watch;

// Set SPLITMERGE_REDIS_URL to point these at a scratch database.
fn get_redis_client() -> Client {
    let url = std::env::var("SPLITMERGE_REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/6".to_string());
    redis::Client::open(url).expect("Invalid Redis URL")
}

fn redis_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.region = format!("test-{}", uuid::Uuid::new_v4());
    config.worker.poll_timeout_ms = 1000;
    config.decider.poll_timeout_ms = 1000;
    config.policy.fan_out = 3;
    config.policy.max_depth = 2;
    config.policy.min_shard_bytes = 32;
    config.retry = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_millis(100));
    config
}

#[tokio::test]
#[ignore] // Needs a running Redis
async fn test_redis_distributed_sort() {
    let client = get_redis_client();
    let config = redis_config();
    let backend = RedisBackend::new(client.clone(), config.namespace(), config.timeouts.clone());
    backend.ping().await.expect("Failed to connect to Redis");
    let backend: Arc<dyn OrchestrationBackend> = Arc::new(backend);
    let store = Arc::new(RedisBlobStore::new(client, config.namespace(), &config.config_bucket));
    let ctx = Context::new(config, store);

    let words: Vec<String> = (0..200).map(|i| format!("entry{:03}", (i * 77) % 200)).collect();
    let main = MainInput::new("it", "words.txt");
    ctx.blobs
        .put(&main.root_key(), format!("{}\n", words.join("\n")).into_bytes())
        .await
        .unwrap();

    let registry = Arc::new(TaskRegistry::standard(&ctx.config).unwrap());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = Vec::new();
    for i in 0..3 {
        let worker = Worker::new(backend.clone(), registry.clone(), ctx.clone()).with_identity(format!("it-{}", i));
        let shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move { worker.run(shutdown).await }));
    }
    let decider = Decider::new(backend.clone(), ctx.config.clone());
    loops.push(tokio::spawn(async move { decider.run(shutdown_rx).await }));

    let execution = backend
        .start_workflow_execution(&ctx.config.domain, "it-sort", &ctx.config.task_list, main.clone())
        .await
        .unwrap();
    let duplicate = backend
        .start_workflow_execution(&ctx.config.domain, "it-sort", &ctx.config.task_list, main)
        .await;
    assert!(matches!(duplicate, Err(HarnessError::WorkflowAlreadyStarted(_))));

    let description = tokio::time::timeout(
        Duration::from_secs(60),
        wait_for_close(&backend, &execution, Duration::from_millis(100)),
    )
    .await
    .expect("workflow hung")
    .unwrap();
    shutdown_tx.send(true).unwrap();
    for handle in loops {
        handle.await.unwrap();
    }

    let result = match description.status {
        WorkflowStatus::Completed { result } => result,
        other => panic!("workflow did not complete: {:?}", other),
    };
    let output: MergeOutput = serde_json::from_value(result).unwrap();
    let sorted = String::from_utf8(ctx.blobs.get(&output.zip_name).await.unwrap()).unwrap();
    let mut expected = words.clone();
    expected.sort();
    assert_eq!(sorted.lines().collect::<Vec<_>>(), expected);
}

#[tokio::test]
#[ignore] // Needs a running Redis
async fn test_redis_heartbeat_ordering_and_blob_listing() {
    let client = get_redis_client();
    let config = redis_config();
    let backend = Arc::new(RedisBackend::new(client.clone(), config.namespace(), config.timeouts.clone()));
    backend.ping().await.expect("Failed to connect to Redis");
    let store = RedisBlobStore::new(client, config.namespace(), &config.config_bucket);

    for name in ["c", "a", "b"] {
        store.put_object(&format!("dir/{}", name), name.as_bytes().to_vec()).await.unwrap();
    }
    let page = store.list_objects("dir/", None, 2).await.unwrap();
    assert_eq!(page.keys, vec!["dir/a", "dir/b"]);
    let rest = store.list_objects("dir/", page.next_continuation, 2).await.unwrap();
    assert_eq!(rest.keys, vec!["dir/c"]);
    assert!(rest.next_continuation.is_none());

    let main = MainInput::new("it", "hb.txt");
    backend
        .start_workflow_execution(&config.domain, "it-hb", &config.task_list, main.clone())
        .await
        .unwrap();
    let decision = backend
        .poll_for_decision_task(&config.domain, &config.task_list, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("no decision task");
    let decider = Decider::new(backend.clone(), Arc::new(config.clone()));
    let decisions = decider.decide(&decision.events).unwrap();
    backend
        .respond_decision_task_completed(&decision.task_token, decisions)
        .await
        .unwrap();
    let task = backend
        .poll_for_activity_task(&config.domain, &config.task_list, "it", Duration::from_secs(2))
        .await
        .unwrap()
        .expect("no activity task");

    backend.record_activity_task_heartbeat(&task.task_token, 1, None).await.unwrap();
    backend.record_activity_task_heartbeat(&task.task_token, 2, None).await.unwrap();
    let err = backend
        .record_activity_task_heartbeat(&task.task_token, 2, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HarnessError::HeartbeatOutOfOrder { .. }));
}

#[tokio::test]
#[ignore] // Needs a running Redis
async fn test_redis_abandoned_pop_is_requeued() {
    let client = get_redis_client();
    let mut config = redis_config();
    config.timeouts.claim_grace_ms = 0;
    let backend = RedisBackend::new(client.clone(), config.namespace(), config.timeouts.clone());
    backend.ping().await.expect("Failed to connect to Redis");

    let main = MainInput::new("it", "lost.txt");
    let execution = backend
        .start_workflow_execution(&config.domain, "it-lost", &config.task_list, main)
        .await
        .unwrap();

    // A poller that popped the run and died before claiming it.
    let queue = backend.decision_queue_key(&config.domain, &config.task_list);
    let mut conn = client.get_multiplexed_async_connection().await.unwrap();
    let moved: Option<String> = redis::cmd("LMOVE")
        .arg(&queue)
        .arg(backend.claimed_key(&queue))
        .arg("LEFT")
        .arg("RIGHT")
        .query_async(&mut conn)
        .await
        .unwrap();
    assert_eq!(moved.as_deref(), Some(execution.run_id.as_str()));

    // The first sweep only notes the entry; the next one gives it back.
    let first = backend
        .poll_for_decision_task(&config.domain, &config.task_list, Duration::from_secs(1))
        .await
        .unwrap();
    assert!(first.is_none());
    let task = backend
        .poll_for_decision_task(&config.domain, &config.task_list, Duration::from_secs(1))
        .await
        .unwrap()
        .expect("abandoned decision was not requeued");
    assert_eq!(task.execution.run_id, execution.run_id);
    assert_eq!(task.events.len(), 1);

    let claimed: Vec<String> = redis::cmd("LRANGE")
        .arg(backend.claimed_key(&queue))
        .arg(0)
        .arg(-1)
        .query_async(&mut conn)
        .await
        .unwrap();
    assert!(claimed.is_empty());
}
