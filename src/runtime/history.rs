use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::runtime::task::{ActivityInput, ActivityTask, ActivityType, MainInput, WorkflowExecution};

/// Append-only workflow history entry. Completion events point back at the
/// `ActivityTaskScheduled` event they resolve through `scheduled_event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub event_id: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EventKind {
    WorkflowExecutionStarted {
        input: MainInput,
    },
    ActivityTaskScheduled {
        activity_id: String,
        activity_type: ActivityType,
        input: ActivityInput,
        attempt: u32,
    },
    ActivityTaskStarted {
        scheduled_event_id: u64,
        identity: String,
    },
    ActivityTaskCompleted {
        scheduled_event_id: u64,
        result: Value,
    },
    ActivityTaskFailed {
        scheduled_event_id: u64,
        reason: String,
        details: String,
        retryable: bool,
    },
    ActivityTaskTimedOut {
        scheduled_event_id: u64,
        timeout_type: TimeoutType,
    },
    WorkflowExecutionCancelRequested {
        cause: String,
    },
    WorkflowExecutionCompleted {
        result: Value,
    },
    WorkflowExecutionFailed {
        reason: String,
        details: String,
    },
    WorkflowExecutionCanceled {
        details: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeoutType {
    Heartbeat,
    StartToClose,
}

/// 决策任务：自上次决策以来的完整历史
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionTask {
    pub task_token: String,
    pub execution: WorkflowExecution,
    pub events: Vec<HistoryEvent>,
}

/// Decisions a decider answers a decision task with. The backend turns each
/// into the matching history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Decision {
    ScheduleActivityTask {
        activity_id: String,
        activity_type: ActivityType,
        input: ActivityInput,
        attempt: u32,
    },
    CompleteWorkflowExecution {
        result: Value,
    },
    FailWorkflowExecution {
        reason: String,
        details: String,
    },
    CancelWorkflowExecution {
        details: String,
    },
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Decision::ScheduleActivityTask { .. })
    }

    /// The history event this decision appends.
    pub fn into_event(self) -> PlannedEvent {
        match self {
            Decision::ScheduleActivityTask {
                activity_id,
                activity_type,
                input,
                attempt,
            } => PlannedEvent {
                kind: EventKind::ActivityTaskScheduled {
                    activity_id,
                    activity_type,
                    input,
                    attempt,
                },
                closes: None,
            },
            Decision::CompleteWorkflowExecution { result } => PlannedEvent {
                kind: EventKind::WorkflowExecutionCompleted { result: result.clone() },
                closes: Some(WorkflowStatus::Completed { result }),
            },
            Decision::FailWorkflowExecution { reason, details } => PlannedEvent {
                kind: EventKind::WorkflowExecutionFailed {
                    reason: reason.clone(),
                    details: details.clone(),
                },
                closes: Some(WorkflowStatus::Failed { reason, details }),
            },
            Decision::CancelWorkflowExecution { details } => PlannedEvent {
                kind: EventKind::WorkflowExecutionCanceled { details: details.clone() },
                closes: Some(WorkflowStatus::Canceled { details }),
            },
        }
    }
}

/// An event a backend appends while applying decisions. `closes` is set
/// when the event ends the run.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedEvent {
    pub kind: EventKind,
    pub closes: Option<WorkflowStatus>,
}

/// 决策落地：两个后端共用
///
/// Events for one decision batch, in order. Nothing after the first closing
/// decision is kept.
pub fn plan_decisions(decisions: Vec<Decision>) -> Vec<PlannedEvent> {
    let mut planned = Vec::with_capacity(decisions.len());
    for decision in decisions {
        let terminal = decision.is_terminal();
        planned.push(decision.into_event());
        if terminal {
            break;
        }
    }
    planned
}

/// An activity waiting in a task list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueuedActivity {
    pub run_id: String,
    pub scheduled_event_id: u64,
    pub activity_id: String,
    pub activity_type: ActivityType,
    pub input: ActivityInput,
    pub attempt: u32,
}

impl QueuedActivity {
    /// `None` unless `kind` is an `ActivityTaskScheduled` event.
    pub fn from_scheduled(run_id: &str, scheduled_event_id: u64, kind: EventKind) -> Option<Self> {
        match kind {
            EventKind::ActivityTaskScheduled {
                activity_id,
                activity_type,
                input,
                attempt,
            } => Some(Self {
                run_id: run_id.to_string(),
                scheduled_event_id,
                activity_id,
                activity_type,
                input,
                attempt,
            }),
            _ => None,
        }
    }

    pub fn into_task(self, task_token: String, execution: WorkflowExecution) -> ActivityTask {
        ActivityTask {
            task_token,
            activity_id: self.activity_id,
            activity_type: self.activity_type,
            execution,
            input: self.input,
            attempt: self.attempt,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum WorkflowStatus {
    Open,
    Completed { result: Value },
    Failed { reason: String, details: String },
    Canceled { details: String },
}

impl WorkflowStatus {
    pub fn is_closed(&self) -> bool {
        !matches!(self, WorkflowStatus::Open)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDescription {
    pub execution: WorkflowExecution,
    pub status: WorkflowStatus,
    pub history_length: usize,
}
