use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::error::{HarnessError, Result};
use crate::runtime::history::{
    Decision, DecisionTask, EventKind, HistoryEvent, QueuedActivity, TimeoutType, WorkflowDescription,
    WorkflowStatus, plan_decisions,
};
use crate::runtime::task::{ActivityFailure, ActivityTask, HeartbeatAck, MainInput, WorkflowExecution};

// --- Interfaces ---

/// Workflow orchestration service. Every method is a black-box RPC; the
/// backend owns history, task tokens and timeouts.
#[async_trait]
pub trait OrchestrationBackend: Send + Sync {
    async fn start_workflow_execution(
        &self,
        domain: &str,
        workflow_id: &str,
        task_list: &str,
        input: MainInput,
    ) -> Result<WorkflowExecution>;

    /// Long-polls for a decision task. `Ok(None)` means the poll timed out.
    async fn poll_for_decision_task(&self, domain: &str, task_list: &str, timeout: Duration) -> Result<Option<DecisionTask>>;

    async fn respond_decision_task_completed(&self, task_token: &str, decisions: Vec<Decision>) -> Result<()>;

    /// Long-polls for an activity task. `Ok(None)` means the poll timed out.
    async fn poll_for_activity_task(
        &self,
        domain: &str,
        task_list: &str,
        identity: &str,
        timeout: Duration,
    ) -> Result<Option<ActivityTask>>;

    async fn respond_activity_task_completed(&self, task_token: &str, result: Value) -> Result<()>;

    async fn respond_activity_task_failed(&self, task_token: &str, failure: ActivityFailure) -> Result<()>;

    /// `sequence` must strictly increase per task token.
    async fn record_activity_task_heartbeat(
        &self,
        task_token: &str,
        sequence: u64,
        details: Option<Value>,
    ) -> Result<HeartbeatAck>;

    async fn request_cancel_workflow_execution(&self, execution: &WorkflowExecution, cause: &str) -> Result<()>;

    async fn describe_workflow_execution(&self, execution: &WorkflowExecution) -> Result<WorkflowDescription>;
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListPage {
    pub keys: Vec<String>,
    pub next_continuation: Option<String>,
}

/// Byte blobs under flat string keys.
#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>>;
    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()>;
    /// Keys in ascending order, starting after `continuation`.
    async fn list_objects(&self, prefix: &str, continuation: Option<String>, max_keys: usize) -> Result<ListPage>;
    async fn create_multipart_upload(&self, key: &str) -> Result<String>;
    async fn upload_part(&self, upload_id: &str, part_number: u32, body: Vec<u8>) -> Result<()>;
    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: u32) -> Result<()>;
    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()>;
}

// --- In-Memory Implementations ---

struct RunState {
    execution: WorkflowExecution,
    task_list: String,
    events: Vec<HistoryEvent>,
    status: WorkflowStatus,
    decision_queued: bool,
    decision_outstanding: Option<String>,
    redecide: bool,
}

impl RunState {
    fn append(&mut self, kind: EventKind) -> u64 {
        let event_id = self.events.len() as u64 + 1;
        self.events.push(HistoryEvent { event_id, kind });
        event_id
    }
}

struct OpenActivity {
    run_id: String,
    scheduled_event_id: u64,
    last_sequence: u64,
    heartbeat_deadline: Instant,
    close_deadline: Instant,
}

struct OpenDecision {
    run_id: String,
    deadline: Instant,
}

#[derive(Default)]
struct BackendState {
    runs: HashMap<String, RunState>,
    decision_queues: HashMap<String, VecDeque<String>>,
    activity_queues: HashMap<String, VecDeque<QueuedActivity>>,
    open_decisions: HashMap<String, OpenDecision>,
    open_activities: HashMap<String, OpenActivity>,
}

fn queue_key(domain: &str, task_list: &str) -> String {
    format!("{}/{}", domain, task_list)
}

impl BackendState {
    fn request_decision(&mut self, run_id: &str) {
        let Some(run) = self.runs.get_mut(run_id) else {
            return;
        };
        if run.status.is_closed() {
            return;
        }
        if run.decision_outstanding.is_some() {
            run.redecide = true;
            return;
        }
        if !run.decision_queued {
            run.decision_queued = true;
            let key = queue_key(&run.execution.domain, &run.task_list);
            self.decision_queues.entry(key).or_default().push_back(run_id.to_string());
        }
    }

    fn sweep(&mut self, now: Instant) {
        let expired: Vec<(String, TimeoutType)> = self
            .open_activities
            .iter()
            .filter_map(|(token, open)| {
                if now >= open.close_deadline {
                    Some((token.clone(), TimeoutType::StartToClose))
                } else if now >= open.heartbeat_deadline {
                    Some((token.clone(), TimeoutType::Heartbeat))
                } else {
                    None
                }
            })
            .collect();
        for (token, timeout_type) in expired {
            if let Some(open) = self.open_activities.remove(&token) {
                if let Some(run) = self.runs.get_mut(&open.run_id) {
                    if !run.status.is_closed() {
                        run.append(EventKind::ActivityTaskTimedOut {
                            scheduled_event_id: open.scheduled_event_id,
                            timeout_type,
                        });
                    }
                }
                self.request_decision(&open.run_id);
            }
        }

        let stale: Vec<String> = self
            .open_decisions
            .iter()
            .filter(|(_, open)| now >= open.deadline)
            .map(|(token, _)| token.clone())
            .collect();
        for token in stale {
            if let Some(open) = self.open_decisions.remove(&token) {
                if let Some(run) = self.runs.get_mut(&open.run_id) {
                    run.decision_outstanding = None;
                    run.redecide = false;
                }
                self.request_decision(&open.run_id);
            }
        }
    }

    fn apply_decisions(&mut self, run_id: &str, decisions: Vec<Decision>) {
        let Some(run) = self.runs.get_mut(run_id) else {
            return;
        };
        if run.status.is_closed() {
            return;
        }
        let mut scheduled = Vec::new();
        for planned in plan_decisions(decisions) {
            let event_id = run.append(planned.kind.clone());
            if let Some(status) = planned.closes {
                run.status = status;
            } else if let Some(queued) = QueuedActivity::from_scheduled(run_id, event_id, planned.kind) {
                scheduled.push(queued);
            }
        }
        let key = queue_key(&run.execution.domain, &run.task_list);
        let queue = self.activity_queues.entry(key).or_default();
        queue.extend(scheduled);
    }

    fn close_activity(&mut self, task_token: &str, kind: impl FnOnce(u64) -> EventKind) -> Result<()> {
        let open = self
            .open_activities
            .remove(task_token)
            .ok_or_else(|| HarnessError::UnknownToken(task_token.to_string()))?;
        if let Some(run) = self.runs.get_mut(&open.run_id) {
            if !run.status.is_closed() {
                run.append(kind(open.scheduled_event_id));
            }
        }
        self.request_decision(&open.run_id);
        Ok(())
    }
}

/// In-process orchestration backend with the same task-token, heartbeat and
/// timeout semantics as the distributed one.
pub struct InMemoryBackend {
    state: Mutex<BackendState>,
    notify: Notify,
    timeouts: TimeoutConfig,
}

const POLL_RECHECK: Duration = Duration::from_millis(25);

impl InMemoryBackend {
    pub fn new(timeouts: TimeoutConfig) -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            notify: Notify::new(),
            timeouts,
        }
    }

    /// Full history of a run, for inspection.
    pub async fn history(&self, run_id: &str) -> Vec<HistoryEvent> {
        let state = self.state.lock().await;
        state.runs.get(run_id).map(|r| r.events.clone()).unwrap_or_default()
    }

    /// Number of activities currently claimed by workers.
    pub async fn open_activity_count(&self) -> usize {
        self.state.lock().await.open_activities.len()
    }

    async fn wait_for_work(&self, deadline: Instant) -> bool {
        let now = Instant::now();
        if now >= deadline {
            return false;
        }
        let wait = (deadline - now).min(POLL_RECHECK);
        let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        true
    }
}

#[async_trait]
impl OrchestrationBackend for InMemoryBackend {
    async fn start_workflow_execution(
        &self,
        domain: &str,
        workflow_id: &str,
        task_list: &str,
        input: MainInput,
    ) -> Result<WorkflowExecution> {
        let mut state = self.state.lock().await;
        let duplicate = state.runs.values().any(|run| {
            run.execution.domain == domain && run.execution.workflow_id == workflow_id && !run.status.is_closed()
        });
        if duplicate {
            return Err(HarnessError::WorkflowAlreadyStarted(workflow_id.to_string()));
        }

        let execution = WorkflowExecution {
            domain: domain.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id: Uuid::new_v4().to_string(),
        };
        let mut run = RunState {
            execution: execution.clone(),
            task_list: task_list.to_string(),
            events: Vec::new(),
            status: WorkflowStatus::Open,
            decision_queued: false,
            decision_outstanding: None,
            redecide: false,
        };
        run.append(EventKind::WorkflowExecutionStarted { input });
        state.runs.insert(execution.run_id.clone(), run);
        state.request_decision(&execution.run_id);
        drop(state);

        self.notify.notify_waiters();
        Ok(execution)
    }

    async fn poll_for_decision_task(&self, domain: &str, task_list: &str, timeout: Duration) -> Result<Option<DecisionTask>> {
        let deadline = Instant::now() + timeout;
        let key = queue_key(domain, task_list);
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.sweep(now);
                let next = state.decision_queues.get_mut(&key).and_then(|q| q.pop_front());
                if let Some(run_id) = next {
                    let token = Uuid::new_v4().to_string();
                    let decision_timeout = Duration::from_millis(self.timeouts.decision_timeout_ms);
                    if let Some(run) = state.runs.get_mut(&run_id) {
                        run.decision_queued = false;
                        if !run.status.is_closed() {
                            run.decision_outstanding = Some(token.clone());
                            let task = DecisionTask {
                                task_token: token.clone(),
                                execution: run.execution.clone(),
                                events: run.events.clone(),
                            };
                            state.open_decisions.insert(
                                token,
                                OpenDecision {
                                    run_id,
                                    deadline: now + decision_timeout,
                                },
                            );
                            return Ok(Some(task));
                        }
                    }
                    continue;
                }
            }
            if !self.wait_for_work(deadline).await {
                return Ok(None);
            }
        }
    }

    async fn respond_decision_task_completed(&self, task_token: &str, decisions: Vec<Decision>) -> Result<()> {
        let mut state = self.state.lock().await;
        let open = state
            .open_decisions
            .remove(task_token)
            .ok_or_else(|| HarnessError::UnknownToken(task_token.to_string()))?;
        state.apply_decisions(&open.run_id, decisions);
        let redecide = match state.runs.get_mut(&open.run_id) {
            Some(run) => {
                run.decision_outstanding = None;
                std::mem::take(&mut run.redecide)
            }
            None => false,
        };
        if redecide {
            state.request_decision(&open.run_id);
        }
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn poll_for_activity_task(
        &self,
        domain: &str,
        task_list: &str,
        identity: &str,
        timeout: Duration,
    ) -> Result<Option<ActivityTask>> {
        let deadline = Instant::now() + timeout;
        let key = queue_key(domain, task_list);
        loop {
            {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                state.sweep(now);
                let next = state.activity_queues.get_mut(&key).and_then(|q| q.pop_front());
                if let Some(queued) = next {
                    let Some(run) = state.runs.get_mut(&queued.run_id) else {
                        continue;
                    };
                    if run.status.is_closed() {
                        continue;
                    }
                    run.append(EventKind::ActivityTaskStarted {
                        scheduled_event_id: queued.scheduled_event_id,
                        identity: identity.to_string(),
                    });
                    let token = Uuid::new_v4().to_string();
                    let open = OpenActivity {
                        run_id: queued.run_id.clone(),
                        scheduled_event_id: queued.scheduled_event_id,
                        last_sequence: 0,
                        heartbeat_deadline: now + Duration::from_millis(self.timeouts.heartbeat_timeout_ms),
                        close_deadline: now + Duration::from_millis(self.timeouts.start_to_close_ms),
                    };
                    let task = queued.into_task(token.clone(), run.execution.clone());
                    state.open_activities.insert(token, open);
                    return Ok(Some(task));
                }
            }
            if !self.wait_for_work(deadline).await {
                return Ok(None);
            }
        }
    }

    async fn respond_activity_task_completed(&self, task_token: &str, result: Value) -> Result<()> {
        let mut state = self.state.lock().await;
        state.close_activity(task_token, |scheduled_event_id| EventKind::ActivityTaskCompleted {
            scheduled_event_id,
            result,
        })?;
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn respond_activity_task_failed(&self, task_token: &str, failure: ActivityFailure) -> Result<()> {
        let mut state = self.state.lock().await;
        state.close_activity(task_token, |scheduled_event_id| EventKind::ActivityTaskFailed {
            scheduled_event_id,
            reason: failure.reason,
            details: failure.details,
            retryable: failure.retryable,
        })?;
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn record_activity_task_heartbeat(
        &self,
        task_token: &str,
        sequence: u64,
        _details: Option<Value>,
    ) -> Result<HeartbeatAck> {
        let mut state = self.state.lock().await;
        state.sweep(Instant::now());
        let heartbeat_timeout = Duration::from_millis(self.timeouts.heartbeat_timeout_ms);
        let open = state
            .open_activities
            .get_mut(task_token)
            .ok_or_else(|| HarnessError::UnknownToken(task_token.to_string()))?;
        if sequence <= open.last_sequence {
            return Err(HarnessError::HeartbeatOutOfOrder {
                token: task_token.to_string(),
                sent: sequence,
                last: open.last_sequence,
            });
        }
        open.last_sequence = sequence;
        open.heartbeat_deadline = Instant::now() + heartbeat_timeout;
        let run_id = open.run_id.clone();

        let cancel_requested = state.runs.get(&run_id).is_some_and(|run| {
            run.status.is_closed()
                || run
                    .events
                    .iter()
                    .any(|e| matches!(e.kind, EventKind::WorkflowExecutionCancelRequested { .. }))
        });
        Ok(HeartbeatAck { cancel_requested })
    }

    async fn request_cancel_workflow_execution(&self, execution: &WorkflowExecution, cause: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        let run = state.runs.get_mut(&execution.run_id).ok_or_else(|| HarnessError::NotFound {
            key: execution.to_string(),
        })?;
        if run.status.is_closed() {
            return Ok(());
        }
        run.append(EventKind::WorkflowExecutionCancelRequested {
            cause: cause.to_string(),
        });
        state.request_decision(&execution.run_id);
        drop(state);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn describe_workflow_execution(&self, execution: &WorkflowExecution) -> Result<WorkflowDescription> {
        let state = self.state.lock().await;
        let run = state.runs.get(&execution.run_id).ok_or_else(|| HarnessError::NotFound {
            key: execution.to_string(),
        })?;
        Ok(WorkflowDescription {
            execution: run.execution.clone(),
            status: run.status.clone(),
            history_length: run.events.len(),
        })
    }
}

pub struct InMemoryBlobStore {
    objects: DashMap<String, Vec<u8>>,
    // Map<UploadID, (Key, Map<PartNumber, Bytes>)>
    uploads: DashMap<String, (String, BTreeMap<u32, Vec<u8>>)>,
    failing_puts: AtomicUsize,
    uploaded_parts: AtomicUsize,
}

impl Default for InMemoryBlobStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self {
            objects: DashMap::new(),
            uploads: DashMap::new(),
            failing_puts: AtomicUsize::new(0),
            uploaded_parts: AtomicUsize::new(0),
        }
    }

    /// Makes the next `count` object writes fail with a transient storage error.
    pub fn fail_next_puts(&self, count: usize) {
        self.failing_puts.store(count, Ordering::SeqCst);
    }

    /// Multipart parts accepted so far, across all uploads.
    pub fn uploaded_parts(&self) -> usize {
        self.uploaded_parts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    fn take_injected_failure(&self) -> Result<()> {
        let injected = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match injected {
            Ok(_) => Err(HarnessError::Storage("injected put failure".to_string())),
            Err(_) => Ok(()),
        }
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .get(key)
            .map(|v| v.value().clone())
            .ok_or_else(|| HarnessError::NotFound { key: key.to_string() })
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        self.take_injected_failure()?;
        self.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn list_objects(&self, prefix: &str, continuation: Option<String>, max_keys: usize) -> Result<ListPage> {
        let mut keys: Vec<String> = self
            .objects
            .iter()
            .map(|item| item.key().clone())
            .filter(|k| k.starts_with(prefix))
            .filter(|k| continuation.as_ref().is_none_or(|after| k > after))
            .collect();
        keys.sort();

        let max_keys = max_keys.max(1);
        let next_continuation = if keys.len() > max_keys {
            keys.truncate(max_keys);
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next_continuation })
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.uploads.insert(upload_id.clone(), (key.to_string(), BTreeMap::new()));
        Ok(upload_id)
    }

    async fn upload_part(&self, upload_id: &str, part_number: u32, body: Vec<u8>) -> Result<()> {
        self.take_injected_failure()?;
        let mut upload = self
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| HarnessError::NotFound { key: upload_id.to_string() })?;
        upload.1.insert(part_number, body);
        self.uploaded_parts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: u32) -> Result<()> {
        let (_, (upload_key, uploaded)) = self
            .uploads
            .remove(upload_id)
            .ok_or_else(|| HarnessError::NotFound { key: upload_id.to_string() })?;
        if upload_key != key {
            return Err(HarnessError::MalformedInput(format!(
                "upload {} belongs to {}, not {}",
                upload_id, upload_key, key
            )));
        }
        let mut body = Vec::new();
        for part_number in 1..=parts {
            let part = uploaded.get(&part_number).ok_or_else(|| {
                HarnessError::MalformedInput(format!("upload {} is missing part {}", upload_id, part_number))
            })?;
            body.extend_from_slice(part);
        }
        self.objects.insert(key.to_string(), body);
        Ok(())
    }

    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        self.uploads.remove(upload_id);
        Ok(())
    }
}
