#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use splitmerge::config::HarnessConfig;
use splitmerge::retry::RetryPolicy;
use splitmerge::runtime::context::Context;
use splitmerge::runtime::heartbeat::HeartbeatUpdater;
use splitmerge::runtime::history::Decision;
use splitmerge::runtime::storage::{InMemoryBackend, InMemoryBlobStore, OrchestrationBackend};
use splitmerge::runtime::task::{ActivityInput, ActivityTask, ActivityType, MainInput, PathInput, TaskKind};

pub const POLL: Duration = Duration::from_secs(1);

/// Config with no retry delays worth waiting for.
pub fn test_config() -> HarnessConfig {
    let mut config = HarnessConfig::default();
    config.retry = RetryPolicy::new(3, Duration::from_millis(1), Duration::from_millis(5));
    config
}

pub struct Harness {
    pub config: HarnessConfig,
    pub backend: Arc<InMemoryBackend>,
    pub store: Arc<InMemoryBlobStore>,
    pub ctx: Context,
}

impl Harness {
    pub fn new(config: HarnessConfig) -> Self {
        let backend = Arc::new(InMemoryBackend::new(config.timeouts.clone()));
        let store = Arc::new(InMemoryBlobStore::new());
        let ctx = Context::new(config.clone(), store.clone());
        Self {
            config,
            backend,
            store,
            ctx,
        }
    }

    pub fn dyn_backend(&self) -> Arc<dyn OrchestrationBackend> {
        self.backend.clone()
    }

    pub fn updater(&self, task: &ActivityTask) -> HeartbeatUpdater {
        HeartbeatUpdater::new(self.dyn_backend(), task.task_token.clone(), self.config.retry.clone())
    }

    /// Starts a fresh workflow and schedules exactly one activity in it by
    /// answering the first decision task by hand.
    pub async fn schedule(&self, activity_type: ActivityType, input: ActivityInput) -> String {
        let workflow_id = format!("wf-{}", uuid::Uuid::new_v4());
        let execution = self
            .backend
            .start_workflow_execution(
                &self.config.domain,
                &workflow_id,
                &self.config.task_list,
                input.main_input.clone(),
            )
            .await
            .expect("start failed");
        let decision = self
            .backend
            .poll_for_decision_task(&self.config.domain, &self.config.task_list, POLL)
            .await
            .expect("decision poll failed")
            .expect("no decision task");
        self.backend
            .respond_decision_task_completed(
                &decision.task_token,
                vec![Decision::ScheduleActivityTask {
                    activity_id: format!("test{}#1", input.path_input),
                    activity_type,
                    input,
                    attempt: 1,
                }],
            )
            .await
            .expect("respond failed");
        execution.run_id
    }

    /// Schedules and claims one activity, returning the claimed task.
    pub async fn claim(&self, kind: TaskKind, input: ActivityInput) -> ActivityTask {
        self.schedule(self.config.activity_type(kind).clone(), input).await;
        self.backend
            .poll_for_activity_task(&self.config.domain, &self.config.task_list, "test-worker", POLL)
            .await
            .expect("activity poll failed")
            .expect("no activity task")
    }
}

pub fn input(main: &MainInput, path: PathInput, child_inputs: Vec<String>, leaf: bool) -> ActivityInput {
    ActivityInput {
        main_input: main.clone(),
        path_input: path,
        child_inputs,
        leaf,
    }
}

pub fn lines(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body).lines().map(str::to_string).collect()
}
