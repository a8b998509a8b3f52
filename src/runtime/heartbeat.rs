use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, warn};

use crate::error::{HarnessError, Result};
use crate::retry::{RetryPolicy, retry};
use crate::runtime::storage::OrchestrationBackend;
use crate::runtime::task::HeartbeatAck;

/// Liveness/progress reporter for one claimed activity.
///
/// Shared by the periodic ticker and the handler itself. Each report takes
/// the next sequence number under a lock, so reports for a token reach the
/// backend strictly ordered.
pub struct HeartbeatUpdater {
    backend: Arc<dyn OrchestrationBackend>,
    task_token: String,
    sequence: Mutex<u64>,
    retry: RetryPolicy,
}

impl HeartbeatUpdater {
    pub fn new(backend: Arc<dyn OrchestrationBackend>, task_token: String, retry: RetryPolicy) -> Self {
        Self {
            backend,
            task_token,
            sequence: Mutex::new(0),
            retry,
        }
    }

    pub fn task_token(&self) -> &str {
        &self.task_token
    }

    /// Last sequence number handed out.
    pub async fn sequence(&self) -> u64 {
        *self.sequence.lock().await
    }

    pub async fn beat(&self, details: Option<Value>) -> Result<HeartbeatAck> {
        let mut sequence = self.sequence.lock().await;
        // Retried reports take a fresh number too.
        retry(&self.retry, "record_activity_task_heartbeat", || {
            *sequence += 1;
            self.backend
                .record_activity_task_heartbeat(&self.task_token, *sequence, details.clone())
        })
        .await
    }

    /// Beats every `period` until a report is rejected. Transient failures
    /// that outlast the retry budget are logged and the ticker keeps going;
    /// the backend's own timeout decides whether the task is abandoned.
    pub async fn run_ticker(&self, period: Duration) -> HarnessError {
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.beat(None).await {
                Ok(ack) => {
                    debug!(task_token = %self.task_token, cancel_requested = ack.cancel_requested, "Heartbeat sent");
                }
                Err(e @ (HarnessError::HeartbeatOutOfOrder { .. } | HarnessError::UnknownToken(_))) => return e,
                Err(e) => warn!(task_token = %self.task_token, error = %e, "Heartbeat failed"),
            }
        }
    }
}
