use std::sync::Arc;

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, info, warn};

use crate::error::{HarnessError, Result};
use crate::retry::retry;
use crate::runtime::context::Context;
use crate::runtime::heartbeat::HeartbeatUpdater;
use crate::runtime::registry::TaskRegistry;
use crate::runtime::storage::OrchestrationBackend;
use crate::runtime::task::{ActivityFailure, ActivityTask};

/// 工作进程
///
/// Polls activity tasks, runs the registered handler under a heartbeat
/// ticker and reports the outcome. A failing task never stops the loop.
pub struct Worker {
    backend: Arc<dyn OrchestrationBackend>,
    registry: Arc<TaskRegistry>,
    ctx: Context,
    identity: String,
}

impl Worker {
    pub fn new(backend: Arc<dyn OrchestrationBackend>, registry: Arc<TaskRegistry>, ctx: Context) -> Self {
        let identity = ctx.config.identity();
        Self {
            backend,
            registry,
            ctx,
            identity,
        }
    }

    pub fn with_identity(mut self, identity: impl Into<String>) -> Self {
        self.identity = identity.into();
        self
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Claims and processes at most one task. Returns whether one arrived.
    pub async fn poll_once(&self) -> Result<bool> {
        let config = &self.ctx.config;
        let timeout = config.worker_poll_timeout();
        let task = retry(&config.retry, "poll_for_activity_task", || {
            self.backend
                .poll_for_activity_task(&config.domain, &config.task_list, &self.identity, timeout)
        })
        .await?;
        let Some(task) = task else {
            return Ok(false);
        };

        info!(
            activity_id = %task.activity_id,
            activity_type = %task.activity_type,
            attempt = task.attempt,
            "Executing activity"
        );
        let outcome = self.execute(&task).await;
        self.report(&task, outcome).await;
        Ok(true)
    }

    /// Runs the handler for `task` while heartbeating. A rejected heartbeat
    /// aborts the handler. The handler runs on its own task, so a panic is
    /// reported as a permanent failure instead of unwinding into the loop.
    pub async fn execute(&self, task: &ActivityTask) -> Result<Value> {
        let handler = self.registry.resolve(&task.activity_type)?;
        handler.validate(&task.input)?;

        let updater = Arc::new(HeartbeatUpdater::new(
            self.backend.clone(),
            task.task_token.clone(),
            self.ctx.config.retry.clone(),
        ));
        // Dropping the set aborts the handler.
        let mut running = JoinSet::new();
        {
            let ctx = self.ctx.clone();
            let task = task.clone();
            let updater = updater.clone();
            running.spawn(async move { handler.execute(&ctx, &task, &updater).await });
        }
        tokio::select! {
            joined = running.join_next() => match joined {
                Some(Ok(result)) => result,
                Some(Err(e)) => Err(crash_error(e)),
                None => Err(HarnessError::Handler("handler task vanished".to_string())),
            },
            fatal = updater.run_ticker(self.ctx.config.heartbeat_interval()) => {
                error!(activity_id = %task.activity_id, error = %fatal, "Heartbeat rejected; aborting handler");
                Err(fatal)
            }
        }
    }

    async fn report(&self, task: &ActivityTask, outcome: Result<Value>) {
        let retry_policy = &self.ctx.config.retry;
        let token = task.task_token.as_str();
        let reported = match outcome {
            Ok(result) => {
                info!(activity_id = %task.activity_id, "Activity completed");
                retry(retry_policy, "respond_activity_task_completed", || {
                    self.backend.respond_activity_task_completed(token, result.clone())
                })
                .await
            }
            Err(e) => {
                let failure = failure_report(&e);
                warn!(
                    activity_id = %task.activity_id,
                    reason = %failure.reason,
                    retryable = failure.retryable,
                    error = %e,
                    "Activity failed"
                );
                retry(retry_policy, "respond_activity_task_failed", || {
                    self.backend.respond_activity_task_failed(token, failure.clone())
                })
                .await
            }
        };
        if let Err(e) = reported {
            // The backend times the task out and reschedules it.
            error!(activity_id = %task.activity_id, error = %e, "Failed to report activity outcome");
        }
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(identity = %self.identity, task_list = %self.ctx.config.task_list, "Worker started");
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = self.poll_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Activity poll failed");
                        tokio::time::sleep(self.ctx.config.retry.delay_for(1)).await;
                    }
                }
            }
        }
        info!(identity = %self.identity, "Worker stopped");
    }
}

fn crash_error(e: JoinError) -> HarnessError {
    if !e.is_panic() {
        return HarnessError::Handler(format!("handler task cancelled: {}", e));
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    HarnessError::Handler(format!("handler panicked: {}", message))
}

/// Reason, details and retry classification reported for a handler error.
pub fn failure_report(error: &HarnessError) -> ActivityFailure {
    ActivityFailure {
        reason: error.reason().to_string(),
        details: error.to_string(),
        retryable: error.is_retryable(),
    }
}
