use async_trait::async_trait;
use redis::AsyncCommands;
use serde::Deserialize;
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;
use uuid::Uuid;

use crate::config::TimeoutConfig;
use crate::error::{HarnessError, Result};
use crate::runtime::history::{
    Decision, DecisionTask, EventKind, HistoryEvent, QueuedActivity, TimeoutType, WorkflowDescription,
    WorkflowStatus, plan_decisions,
};
use crate::runtime::storage::{BlobStore, ListPage, OrchestrationBackend};
use crate::runtime::task::{ActivityFailure, ActivityTask, HeartbeatAck, MainInput, WorkflowExecution};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Activity queue entry as the apply script writes it: the scheduled event
/// verbatim, tagged with its run and event id.
#[derive(Debug, Deserialize)]
struct QueuedEntry {
    run_id: String,
    scheduled_event_id: u64,
    event: EventKind,
}

fn decode_entry(raw: &str) -> Result<QueuedActivity> {
    let entry: QueuedEntry = serde_json::from_str(raw)?;
    QueuedActivity::from_scheduled(&entry.run_id, entry.scheduled_event_id, entry.event).ok_or_else(|| {
        HarnessError::Backend(format!(
            "queued event {} of run {} is not a scheduled activity",
            entry.scheduled_event_id, entry.run_id
        ))
    })
}

// Queues the run unless it is closed, already queued, or mid-decision (then
// flags it so the decider's response re-queues it).
const REQUEST_DECISION: &str = r#"
local function request_decision(meta, queue, run_id)
    if redis.call("HGET", meta, "closed") == "1" then
        return 0
    end
    local outstanding = redis.call("HGET", meta, "outstanding")
    if outstanding and outstanding ~= "" then
        redis.call("HSET", meta, "redecide", "1")
        return 0
    end
    if redis.call("HGET", meta, "queued") == "1" then
        return 0
    end
    redis.call("HSET", meta, "queued", "1")
    redis.call("RPUSH", queue, run_id)
    return 1
end
"#;

// KEYS: open run, meta, history, decision queue
// ARGV: run id, domain, workflow id, task list, open status, started event
const START_WORKFLOW: &str = r#"
if not redis.call("SET", KEYS[1], ARGV[1], "NX") then
    return 0
end
redis.call("HSET", KEYS[2],
    "domain", ARGV[2], "workflow_id", ARGV[3], "task_list", ARGV[4], "status", ARGV[5],
    "closed", "0", "queued", "0", "outstanding", "", "redecide", "0")
redis.call("RPUSH", KEYS[3], ARGV[6])
request_decision(KEYS[2], KEYS[4], ARGV[1])
return 1
"#;

// KEYS: claimed list, claimed-since, meta, decision token, decision deadlines
// ARGV: run id, token, deadline
const CLAIM_DECISION: &str = r#"
if redis.call("LREM", KEYS[1], 1, ARGV[1]) == 0 then
    return -1
end
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("HSET", KEYS[3], "queued", "0")
if redis.call("HGET", KEYS[3], "closed") == "1" then
    return 0
end
redis.call("HSET", KEYS[3], "outstanding", ARGV[2])
redis.call("SET", KEYS[4], ARGV[1])
redis.call("ZADD", KEYS[5], ARGV[3], ARGV[2])
return 1
"#;

// KEYS: decision token, decision deadlines, meta, history, activity queue,
//       decision queue, open run
// ARGV: run id, token, then (event, role, status) per event
const APPLY_DECISIONS: &str = r#"
if redis.call("GET", KEYS[1]) ~= ARGV[1] then
    return 0
end
redis.call("DEL", KEYS[1])
redis.call("ZREM", KEYS[2], ARGV[2])
local closed = redis.call("HGET", KEYS[3], "closed") == "1"
for i = 3, #ARGV, 3 do
    if closed then
        break
    end
    local event, role = ARGV[i], ARGV[i + 1]
    local id = redis.call("RPUSH", KEYS[4], event)
    if role == "schedule" then
        redis.call("RPUSH", KEYS[5],
            '{"run_id":' .. cjson.encode(ARGV[1]) .. ',"scheduled_event_id":' .. id .. ',"event":' .. event .. '}')
    elseif role == "close" then
        redis.call("HSET", KEYS[3], "closed", "1", "status", ARGV[i + 2])
        if redis.call("GET", KEYS[7]) == ARGV[1] then
            redis.call("DEL", KEYS[7])
        end
        closed = true
    end
end
local redecide = redis.call("HGET", KEYS[3], "redecide") == "1"
redis.call("HSET", KEYS[3], "outstanding", "", "redecide", "0")
if redecide then
    request_decision(KEYS[3], KEYS[6], ARGV[1])
end
return 1
"#;

// KEYS: decision deadlines, decision token, meta, decision queue
// ARGV: token, run id
const EXPIRE_DECISION: &str = r#"
if redis.call("ZREM", KEYS[1], ARGV[1]) == 0 then
    return 0
end
redis.call("DEL", KEYS[2])
if redis.call("HGET", KEYS[3], "outstanding") == ARGV[1] then
    redis.call("HSET", KEYS[3], "outstanding", "", "redecide", "0")
end
request_decision(KEYS[3], KEYS[4], ARGV[2])
return 1
"#;

// KEYS: claimed list, claimed-since, meta, history, activity token,
//       heartbeat deadlines, close deadlines
// ARGV: entry, started event, token, run id, scheduled event id,
//       heartbeat deadline, close deadline
const START_ACTIVITY: &str = r#"
if redis.call("LREM", KEYS[1], 1, ARGV[1]) == 0 then
    return -1
end
redis.call("ZREM", KEYS[2], ARGV[1])
if redis.call("HGET", KEYS[3], "closed") == "1" then
    return 0
end
redis.call("RPUSH", KEYS[4], ARGV[2])
redis.call("HSET", KEYS[5], "run_id", ARGV[4], "scheduled_event_id", ARGV[5], "last_sequence", "0")
redis.call("ZADD", KEYS[6], ARGV[6], ARGV[3])
redis.call("ZADD", KEYS[7], ARGV[7], ARGV[3])
return 1
"#;

// KEYS: activity token, heartbeat deadlines, close deadlines, meta, history,
//       decision queue
// ARGV: token, scheduled event id, closing event, run id
const CLOSE_ACTIVITY: &str = r#"
if redis.call("HGET", KEYS[1], "scheduled_event_id") ~= ARGV[2] then
    return 0
end
redis.call("DEL", KEYS[1])
redis.call("ZREM", KEYS[2], ARGV[1])
redis.call("ZREM", KEYS[3], ARGV[1])
if redis.call("HGET", KEYS[4], "closed") ~= "1" then
    redis.call("RPUSH", KEYS[5], ARGV[3])
end
request_decision(KEYS[4], KEYS[6], ARGV[4])
return 1
"#;

// KEYS: activity token, heartbeat deadlines, meta
// ARGV: sequence, heartbeat deadline, token
const HEARTBEAT: &str = r#"
local last = redis.call("HGET", KEYS[1], "last_sequence")
if not last then
    return {-1, 0, 0}
end
last = tonumber(last)
if tonumber(ARGV[1]) <= last then
    return {0, last, 0}
end
redis.call("HSET", KEYS[1], "last_sequence", ARGV[1])
redis.call("ZADD", KEYS[2], ARGV[2], ARGV[3])
local cancel = 0
if redis.call("HGET", KEYS[3], "closed") == "1" or redis.call("HGET", KEYS[3], "cancel_requested") == "1" then
    cancel = 1
end
return {1, last, cancel}
"#;

// KEYS: meta, history, decision queue
// ARGV: run id, cancel requested event
const REQUEST_CANCEL: &str = r#"
if redis.call("EXISTS", KEYS[1]) == 0 then
    return -1
end
if redis.call("HGET", KEYS[1], "closed") == "1" then
    return 0
end
redis.call("RPUSH", KEYS[2], ARGV[2])
redis.call("HSET", KEYS[1], "cancel_requested", "1")
request_decision(KEYS[1], KEYS[3], ARGV[1])
return 1
"#;

// Entries popped into a claimed list but never claimed go back to the queue
// once they have been seen there for the grace period.
// KEYS: queue, claimed list, claimed-since
// ARGV: now, grace
const REQUEUE_STALE: &str = r#"
local requeued = 0
for _, entry in ipairs(redis.call("LRANGE", KEYS[2], 0, -1)) do
    local seen = redis.call("ZSCORE", KEYS[3], entry)
    if not seen then
        redis.call("ZADD", KEYS[3], ARGV[1], entry)
    elseif tonumber(ARGV[1]) - tonumber(seen) >= tonumber(ARGV[2]) then
        redis.call("LREM", KEYS[2], 1, entry)
        redis.call("ZREM", KEYS[3], entry)
        redis.call("RPUSH", KEYS[1], entry)
        requeued = requeued + 1
    end
end
for _, entry in ipairs(redis.call("ZRANGE", KEYS[3], 0, -1)) do
    if not redis.call("LPOS", KEYS[2], entry) then
        redis.call("ZREM", KEYS[3], entry)
    end
end
return requeued
"#;

/// Every state transition runs as one script, so a crashed caller never
/// leaves a run half-updated.
struct Scripts {
    start_workflow: redis::Script,
    claim_decision: redis::Script,
    apply_decisions: redis::Script,
    expire_decision: redis::Script,
    start_activity: redis::Script,
    close_activity: redis::Script,
    heartbeat: redis::Script,
    request_cancel: redis::Script,
    requeue_stale: redis::Script,
}

impl Scripts {
    fn new() -> Self {
        let requesting = |body: &str| redis::Script::new(&format!("{}{}", REQUEST_DECISION, body));
        Self {
            start_workflow: requesting(START_WORKFLOW),
            claim_decision: redis::Script::new(CLAIM_DECISION),
            apply_decisions: requesting(APPLY_DECISIONS),
            expire_decision: requesting(EXPIRE_DECISION),
            start_activity: redis::Script::new(START_ACTIVITY),
            close_activity: requesting(CLOSE_ACTIVITY),
            heartbeat: redis::Script::new(HEARTBEAT),
            request_cancel: requesting(REQUEST_CANCEL),
            requeue_stale: redis::Script::new(REQUEUE_STALE),
        }
    }
}

/// Orchestration backend over Redis so deciders and workers can run as
/// separate processes. History is a list per run; an event's id is its
/// 1-based position in that list.
///
/// Pollers move queue entries into a per-queue claimed list and remove
/// them when the claim script commits. Entries a crashed poller left there
/// are requeued by the sweep after `claim_grace_ms`.
pub struct RedisBackend {
    client: redis::Client,
    namespace: String,
    timeouts: TimeoutConfig,
    scripts: Scripts,
}

impl RedisBackend {
    pub fn new(client: redis::Client, namespace: String, timeouts: TimeoutConfig) -> Self {
        Self {
            client,
            namespace,
            timeouts,
            scripts: Scripts::new(),
        }
    }

    /// Fails fast when the server cannot be reached.
    pub async fn ping(&self) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    fn history_key(&self, run_id: &str) -> String {
        format!("{}:run:{}:history", self.namespace, run_id)
    }

    fn meta_key(&self, run_id: &str) -> String {
        format!("{}:run:{}:meta", self.namespace, run_id)
    }

    fn open_run_key(&self, domain: &str, workflow_id: &str) -> String {
        format!("{}:open:{}:{}", self.namespace, domain, workflow_id)
    }

    pub fn decision_queue_key(&self, domain: &str, task_list: &str) -> String {
        format!("{}:decisions:{}/{}", self.namespace, domain, task_list)
    }

    pub fn activity_queue_key(&self, domain: &str, task_list: &str) -> String {
        format!("{}:activities:{}/{}", self.namespace, domain, task_list)
    }

    /// Entries popped from `queue` that no claim has committed yet.
    pub fn claimed_key(&self, queue: &str) -> String {
        format!("{}:claimed", queue)
    }

    fn claimed_since_key(&self, queue: &str) -> String {
        format!("{}:claimed-since", queue)
    }

    fn decision_token_key(&self, token: &str) -> String {
        format!("{}:decision-token:{}", self.namespace, token)
    }

    fn activity_token_key(&self, token: &str) -> String {
        format!("{}:activity-token:{}", self.namespace, token)
    }

    fn decision_deadlines_key(&self) -> String {
        format!("{}:decision-deadlines", self.namespace)
    }

    fn heartbeat_deadlines_key(&self) -> String {
        format!("{}:heartbeat-deadlines", self.namespace)
    }

    fn close_deadlines_key(&self) -> String {
        format!("{}:close-deadlines", self.namespace)
    }

    async fn meta(&self, conn: &mut redis::aio::MultiplexedConnection, run_id: &str) -> Result<HashMap<String, String>> {
        let meta: HashMap<String, String> = conn.hgetall(self.meta_key(run_id)).await?;
        if meta.is_empty() {
            return Err(HarnessError::NotFound {
                key: format!("run {}", run_id),
            });
        }
        Ok(meta)
    }

    fn execution_from(meta: &HashMap<String, String>, run_id: &str) -> WorkflowExecution {
        WorkflowExecution {
            domain: meta.get("domain").cloned().unwrap_or_default(),
            workflow_id: meta.get("workflow_id").cloned().unwrap_or_default(),
            run_id: run_id.to_string(),
        }
    }

    /// Decision and activity queue of the run's task list.
    fn run_queues(&self, meta: &HashMap<String, String>) -> (String, String) {
        let domain = meta.get("domain").map(String::as_str).unwrap_or_default();
        let task_list = meta.get("task_list").map(String::as_str).unwrap_or_default();
        (
            self.decision_queue_key(domain, task_list),
            self.activity_queue_key(domain, task_list),
        )
    }

    async fn read_history(&self, conn: &mut redis::aio::MultiplexedConnection, run_id: &str) -> Result<Vec<HistoryEvent>> {
        let raw: Vec<String> = conn.lrange(self.history_key(run_id), 0, -1).await?;
        let mut events = Vec::with_capacity(raw.len());
        for (index, entry) in raw.iter().enumerate() {
            let kind: EventKind = serde_json::from_str(entry)?;
            events.push(HistoryEvent {
                event_id: index as u64 + 1,
                kind,
            });
        }
        Ok(events)
    }

    /// Closes an open activity with the event `kind` builds. Returns false
    /// if another caller (completion or timeout sweep) already closed it.
    async fn try_close_activity(
        &self,
        conn: &mut redis::aio::MultiplexedConnection,
        task_token: &str,
        kind: impl FnOnce(u64) -> EventKind,
    ) -> Result<bool> {
        let fields: HashMap<String, String> = conn.hgetall(self.activity_token_key(task_token)).await?;
        let (Some(run_id), Some(scheduled)) = (fields.get("run_id"), fields.get("scheduled_event_id")) else {
            let _: () = redis::pipe()
                .zrem(self.heartbeat_deadlines_key(), task_token)
                .ignore()
                .zrem(self.close_deadlines_key(), task_token)
                .ignore()
                .query_async(conn)
                .await?;
            return Ok(false);
        };
        let scheduled_event_id: u64 = scheduled.parse().map_err(|_| {
            HarnessError::Backend(format!("activity token {} has a bad scheduled event id", task_token))
        })?;
        let meta = self.meta(conn, run_id).await?;
        let (decision_queue, _) = self.run_queues(&meta);
        let event = serde_json::to_string(&kind(scheduled_event_id))?;

        let closed: i64 = self
            .scripts
            .close_activity
            .key(self.activity_token_key(task_token))
            .key(self.heartbeat_deadlines_key())
            .key(self.close_deadlines_key())
            .key(self.meta_key(run_id))
            .key(self.history_key(run_id))
            .key(decision_queue)
            .arg(task_token)
            .arg(scheduled)
            .arg(event)
            .arg(run_id)
            .invoke_async(conn)
            .await?;
        Ok(closed == 1)
    }

    async fn expire_decision(&self, conn: &mut redis::aio::MultiplexedConnection, token: &str) -> Result<()> {
        let run_id: Option<String> = conn.get(self.decision_token_key(token)).await?;
        let Some(run_id) = run_id else {
            let _: () = conn.zrem(self.decision_deadlines_key(), token).await?;
            return Ok(());
        };
        let meta = self.meta(conn, &run_id).await?;
        let (decision_queue, _) = self.run_queues(&meta);
        let _: i64 = self
            .scripts
            .expire_decision
            .key(self.decision_deadlines_key())
            .key(self.decision_token_key(token))
            .key(self.meta_key(&run_id))
            .key(decision_queue)
            .arg(token)
            .arg(&run_id)
            .invoke_async(conn)
            .await?;
        Ok(())
    }

    async fn sweep(&self, conn: &mut redis::aio::MultiplexedConnection, domain: &str, task_list: &str) -> Result<()> {
        let now = now_ms();
        for queue in [
            self.decision_queue_key(domain, task_list),
            self.activity_queue_key(domain, task_list),
        ] {
            let requeued: i64 = self
                .scripts
                .requeue_stale
                .key(&queue)
                .key(self.claimed_key(&queue))
                .key(self.claimed_since_key(&queue))
                .arg(now)
                .arg(self.timeouts.claim_grace_ms)
                .invoke_async(conn)
                .await?;
            if requeued > 0 {
                warn!(queue = %queue, requeued, "Requeued entries abandoned before their claim");
            }
        }

        for (deadlines, timeout_type) in [
            (self.close_deadlines_key(), TimeoutType::StartToClose),
            (self.heartbeat_deadlines_key(), TimeoutType::Heartbeat),
        ] {
            let expired: Vec<String> = conn.zrangebyscore(&deadlines, 0, now).await?;
            for token in expired {
                self.try_close_activity(conn, &token, |scheduled_event_id| EventKind::ActivityTaskTimedOut {
                    scheduled_event_id,
                    timeout_type,
                })
                .await?;
            }
        }

        let stale: Vec<String> = conn.zrangebyscore(self.decision_deadlines_key(), 0, now).await?;
        for token in stale {
            self.expire_decision(conn, &token).await?;
        }
        Ok(())
    }

    /// Moves the head of `queue` to its claimed list.
    async fn blocking_move(&self, queue: &str, timeout: Duration) -> Result<Option<String>> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        // BLMOVE takes seconds; keep at least one second so short polls still block.
        let seconds = timeout.as_secs_f64().max(1.0);
        let moved: Option<String> = redis::cmd("BLMOVE")
            .arg(queue)
            .arg(self.claimed_key(queue))
            .arg("LEFT")
            .arg("RIGHT")
            .arg(seconds)
            .query_async(&mut conn)
            .await?;
        Ok(moved)
    }
}

#[async_trait]
impl OrchestrationBackend for RedisBackend {
    async fn start_workflow_execution(
        &self,
        domain: &str,
        workflow_id: &str,
        task_list: &str,
        input: MainInput,
    ) -> Result<WorkflowExecution> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let run_id = Uuid::new_v4().to_string();
        let status = serde_json::to_string(&WorkflowStatus::Open)?;
        let started = serde_json::to_string(&EventKind::WorkflowExecutionStarted { input })?;

        let created: i64 = self
            .scripts
            .start_workflow
            .key(self.open_run_key(domain, workflow_id))
            .key(self.meta_key(&run_id))
            .key(self.history_key(&run_id))
            .key(self.decision_queue_key(domain, task_list))
            .arg(&run_id)
            .arg(domain)
            .arg(workflow_id)
            .arg(task_list)
            .arg(status)
            .arg(started)
            .invoke_async(&mut conn)
            .await?;
        if created == 0 {
            return Err(HarnessError::WorkflowAlreadyStarted(workflow_id.to_string()));
        }

        Ok(WorkflowExecution {
            domain: domain.to_string(),
            workflow_id: workflow_id.to_string(),
            run_id,
        })
    }

    async fn poll_for_decision_task(&self, domain: &str, task_list: &str, timeout: Duration) -> Result<Option<DecisionTask>> {
        let queue = self.decision_queue_key(domain, task_list);
        {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            self.sweep(&mut conn, domain, task_list).await?;
        }
        let Some(run_id) = self.blocking_move(&queue, timeout).await? else {
            return Ok(None);
        };

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let token = Uuid::new_v4().to_string();
        let deadline = now_ms() + self.timeouts.decision_timeout_ms;
        let claimed: i64 = self
            .scripts
            .claim_decision
            .key(self.claimed_key(&queue))
            .key(self.claimed_since_key(&queue))
            .key(self.meta_key(&run_id))
            .key(self.decision_token_key(&token))
            .key(self.decision_deadlines_key())
            .arg(&run_id)
            .arg(&token)
            .arg(deadline)
            .invoke_async(&mut conn)
            .await?;
        if claimed != 1 {
            return Ok(None);
        }

        let meta = self.meta(&mut conn, &run_id).await?;
        let events = self.read_history(&mut conn, &run_id).await?;
        Ok(Some(DecisionTask {
            task_token: token,
            execution: Self::execution_from(&meta, &run_id),
            events,
        }))
    }

    async fn respond_decision_task_completed(&self, task_token: &str, decisions: Vec<Decision>) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let run_id: Option<String> = conn.get(self.decision_token_key(task_token)).await?;
        let run_id = run_id.ok_or_else(|| HarnessError::UnknownToken(task_token.to_string()))?;
        let meta = self.meta(&mut conn, &run_id).await?;
        let (decision_queue, activity_queue) = self.run_queues(&meta);
        let execution = Self::execution_from(&meta, &run_id);

        let mut invocation = self.scripts.apply_decisions.prepare_invoke();
        invocation
            .key(self.decision_token_key(task_token))
            .key(self.decision_deadlines_key())
            .key(self.meta_key(&run_id))
            .key(self.history_key(&run_id))
            .key(activity_queue)
            .key(decision_queue)
            .key(self.open_run_key(&execution.domain, &execution.workflow_id))
            .arg(&run_id)
            .arg(task_token);
        for planned in plan_decisions(decisions) {
            let (role, status) = match (&planned.closes, &planned.kind) {
                (Some(status), _) => ("close", serde_json::to_string(status)?),
                (None, EventKind::ActivityTaskScheduled { .. }) => ("schedule", String::new()),
                (None, _) => ("append", String::new()),
            };
            invocation.arg(serde_json::to_string(&planned.kind)?).arg(role).arg(status);
        }
        let applied: i64 = invocation.invoke_async(&mut conn).await?;
        if applied == 0 {
            return Err(HarnessError::UnknownToken(task_token.to_string()));
        }
        Ok(())
    }

    async fn poll_for_activity_task(
        &self,
        domain: &str,
        task_list: &str,
        identity: &str,
        timeout: Duration,
    ) -> Result<Option<ActivityTask>> {
        let queue = self.activity_queue_key(domain, task_list);
        {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            self.sweep(&mut conn, domain, task_list).await?;
        }
        let Some(raw) = self.blocking_move(&queue, timeout).await? else {
            return Ok(None);
        };

        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let queued = match decode_entry(&raw) {
            Ok(queued) => queued,
            Err(e) => {
                let _: i64 = conn.lrem(self.claimed_key(&queue), 1, &raw).await?;
                return Err(e);
            }
        };
        let meta = match self.meta(&mut conn, &queued.run_id).await {
            Ok(meta) => meta,
            Err(HarnessError::NotFound { .. }) => {
                let _: i64 = conn.lrem(self.claimed_key(&queue), 1, &raw).await?;
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let token = Uuid::new_v4().to_string();
        let started = serde_json::to_string(&EventKind::ActivityTaskStarted {
            scheduled_event_id: queued.scheduled_event_id,
            identity: identity.to_string(),
        })?;
        let now = now_ms();
        let outcome: i64 = self
            .scripts
            .start_activity
            .key(self.claimed_key(&queue))
            .key(self.claimed_since_key(&queue))
            .key(self.meta_key(&queued.run_id))
            .key(self.history_key(&queued.run_id))
            .key(self.activity_token_key(&token))
            .key(self.heartbeat_deadlines_key())
            .key(self.close_deadlines_key())
            .arg(&raw)
            .arg(started)
            .arg(&token)
            .arg(&queued.run_id)
            .arg(queued.scheduled_event_id)
            .arg(now + self.timeouts.heartbeat_timeout_ms)
            .arg(now + self.timeouts.start_to_close_ms)
            .invoke_async(&mut conn)
            .await?;
        if outcome != 1 {
            return Ok(None);
        }

        let execution = Self::execution_from(&meta, &queued.run_id);
        Ok(Some(queued.into_task(token, execution)))
    }

    async fn respond_activity_task_completed(&self, task_token: &str, result: Value) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let closed = self
            .try_close_activity(&mut conn, task_token, |scheduled_event_id| EventKind::ActivityTaskCompleted {
                scheduled_event_id,
                result,
            })
            .await?;
        if !closed {
            return Err(HarnessError::UnknownToken(task_token.to_string()));
        }
        Ok(())
    }

    async fn respond_activity_task_failed(&self, task_token: &str, failure: ActivityFailure) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let closed = self
            .try_close_activity(&mut conn, task_token, |scheduled_event_id| EventKind::ActivityTaskFailed {
                scheduled_event_id,
                reason: failure.reason,
                details: failure.details,
                retryable: failure.retryable,
            })
            .await?;
        if !closed {
            return Err(HarnessError::UnknownToken(task_token.to_string()));
        }
        Ok(())
    }

    async fn record_activity_task_heartbeat(
        &self,
        task_token: &str,
        sequence: u64,
        _details: Option<Value>,
    ) -> Result<HeartbeatAck> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let run_id: Option<String> = conn.hget(self.activity_token_key(task_token), "run_id").await?;
        let run_id = run_id.ok_or_else(|| HarnessError::UnknownToken(task_token.to_string()))?;

        let outcome: Vec<i64> = self
            .scripts
            .heartbeat
            .key(self.activity_token_key(task_token))
            .key(self.heartbeat_deadlines_key())
            .key(self.meta_key(&run_id))
            .arg(sequence)
            .arg(now_ms() + self.timeouts.heartbeat_timeout_ms)
            .arg(task_token)
            .invoke_async(&mut conn)
            .await?;
        match outcome.first().copied() {
            Some(1) => Ok(HeartbeatAck {
                cancel_requested: outcome.get(2).copied() == Some(1),
            }),
            Some(0) => Err(HarnessError::HeartbeatOutOfOrder {
                token: task_token.to_string(),
                sent: sequence,
                last: outcome.get(1).copied().unwrap_or_default() as u64,
            }),
            _ => Err(HarnessError::UnknownToken(task_token.to_string())),
        }
    }

    async fn request_cancel_workflow_execution(&self, execution: &WorkflowExecution, cause: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let meta = self.meta(&mut conn, &execution.run_id).await?;
        let (decision_queue, _) = self.run_queues(&meta);
        let event = serde_json::to_string(&EventKind::WorkflowExecutionCancelRequested {
            cause: cause.to_string(),
        })?;
        let outcome: i64 = self
            .scripts
            .request_cancel
            .key(self.meta_key(&execution.run_id))
            .key(self.history_key(&execution.run_id))
            .key(decision_queue)
            .arg(&execution.run_id)
            .arg(event)
            .invoke_async(&mut conn)
            .await?;
        if outcome < 0 {
            return Err(HarnessError::NotFound {
                key: format!("run {}", execution.run_id),
            });
        }
        Ok(())
    }

    async fn describe_workflow_execution(&self, execution: &WorkflowExecution) -> Result<WorkflowDescription> {
        let mut conn = self.client.get_multiplexed_async_connection().await?;
        let meta = self.meta(&mut conn, &execution.run_id).await?;
        let status = match meta.get("status") {
            Some(s) => serde_json::from_str(s)?,
            None => WorkflowStatus::Open,
        };
        let history_length: usize = conn.llen(self.history_key(&execution.run_id)).await?;
        Ok(WorkflowDescription {
            execution: Self::execution_from(&meta, &execution.run_id),
            status,
            history_length,
        })
    }
}

/// Blob store over Redis strings, with a lexicographic index for listing.
pub struct RedisBlobStore {
    client: redis::Client,
    namespace: String,
}

impl RedisBlobStore {
    pub fn new(client: redis::Client, namespace: String, bucket: &str) -> Self {
        Self {
            client,
            namespace: format!("{}:bucket:{}", namespace, bucket),
        }
    }

    fn object_key(&self, key: &str) -> String {
        format!("{}:object:{}", self.namespace, key)
    }

    fn index_key(&self) -> String {
        format!("{}:index", self.namespace)
    }

    fn upload_key(&self, upload_id: &str) -> String {
        format!("{}:upload:{}", self.namespace, upload_id)
    }

    fn part_key(&self, upload_id: &str, part_number: u32) -> String {
        format!("{}:upload:{}:part:{}", self.namespace, upload_id, part_number)
    }
}

fn storage_error(e: redis::RedisError) -> HarnessError {
    if e.is_io_error() || e.is_timeout() || e.is_connection_dropped() || e.is_connection_refusal() {
        HarnessError::Storage(e.to_string())
    } else {
        HarnessError::Redis(e)
    }
}

#[async_trait]
impl BlobStore for RedisBlobStore {
    async fn get_object(&self, key: &str) -> Result<Vec<u8>> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(storage_error)?;
        let body: Option<Vec<u8>> = conn.get(self.object_key(key)).await.map_err(storage_error)?;
        body.ok_or_else(|| HarnessError::NotFound { key: key.to_string() })
    }

    async fn put_object(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(storage_error)?;
        let _: () = redis::pipe()
            .atomic()
            .set(self.object_key(key), body)
            .ignore()
            .zadd(self.index_key(), key, 0)
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn list_objects(&self, prefix: &str, continuation: Option<String>, max_keys: usize) -> Result<ListPage> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(storage_error)?;
        let max_keys = max_keys.max(1);
        let min = match &continuation {
            Some(after) if after.as_str() >= prefix => format!("({}", after),
            _ => format!("[{}", prefix),
        };
        let raw: Vec<String> = redis::cmd("ZRANGEBYLEX")
            .arg(self.index_key())
            .arg(min)
            .arg("+")
            .arg("LIMIT")
            .arg(0)
            .arg(max_keys + 1)
            .query_async(&mut conn)
            .await
            .map_err(storage_error)?;

        let mut keys: Vec<String> = raw.into_iter().take_while(|k| k.starts_with(prefix)).collect();
        let next_continuation = if keys.len() > max_keys {
            keys.truncate(max_keys);
            keys.last().cloned()
        } else {
            None
        };
        Ok(ListPage { keys, next_continuation })
    }

    async fn create_multipart_upload(&self, key: &str) -> Result<String> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(storage_error)?;
        let upload_id = Uuid::new_v4().to_string();
        let _: () = conn.set(self.upload_key(&upload_id), key).await.map_err(storage_error)?;
        Ok(upload_id)
    }

    async fn upload_part(&self, upload_id: &str, part_number: u32, body: Vec<u8>) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(storage_error)?;
        let _: () = conn
            .set(self.part_key(upload_id, part_number), body)
            .await
            .map_err(storage_error)?;
        Ok(())
    }

    async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: u32) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(storage_error)?;
        let upload_key: Option<String> = conn.get(self.upload_key(upload_id)).await.map_err(storage_error)?;
        match upload_key {
            Some(k) if k == key => {}
            Some(k) => {
                return Err(HarnessError::MalformedInput(format!(
                    "upload {} belongs to {}, not {}",
                    upload_id, k, key
                )));
            }
            None => return Err(HarnessError::NotFound { key: upload_id.to_string() }),
        }

        let mut body = Vec::new();
        for part_number in 1..=parts {
            let part: Option<Vec<u8>> = conn
                .get(self.part_key(upload_id, part_number))
                .await
                .map_err(storage_error)?;
            let part = part.ok_or_else(|| {
                HarnessError::MalformedInput(format!("upload {} is missing part {}", upload_id, part_number))
            })?;
            body.extend_from_slice(&part);
        }
        self.put_object(key, body).await?;
        self.abort_multipart_upload(upload_id).await
    }

    async fn abort_multipart_upload(&self, upload_id: &str) -> Result<()> {
        let mut conn = self.client.get_multiplexed_async_connection().await.map_err(storage_error)?;
        let pattern = format!("{}:part:*", self.upload_key(upload_id));
        let parts: Vec<String> = conn.keys(pattern).await.map_err(storage_error)?;
        let mut pipe = redis::pipe();
        pipe.del(self.upload_key(upload_id)).ignore();
        for part in parts {
            pipe.del(part).ignore();
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(storage_error)?;
        Ok(())
    }
}
