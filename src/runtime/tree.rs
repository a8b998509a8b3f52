use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::runtime::history::{EventKind, HistoryEvent, TimeoutType};
use crate::runtime::task::{
    ActivityInput, ActivityType, BuildOutput, ChildShard, DivideOutput, MainInput, MergeOutput, PathInput, TaskKind,
};

/// Activity types the decider schedules, and the reverse lookup used on replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskTypes {
    pub divide: ActivityType,
    pub merge: ActivityType,
    pub build: ActivityType,
    /// Whether the root's merge is followed by a build step.
    pub build_enabled: bool,
}

impl TaskTypes {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            divide: config.divide_task.clone(),
            merge: config.merge_task.clone(),
            build: config.build_task.clone(),
            build_enabled: config.policy.build,
        }
    }

    pub fn get(&self, kind: TaskKind) -> &ActivityType {
        match kind {
            TaskKind::Divide => &self.divide,
            TaskKind::Merge => &self.merge,
            TaskKind::Build => &self.build,
        }
    }

    pub fn kind_of(&self, activity_type: &ActivityType) -> Option<TaskKind> {
        if *activity_type == self.divide {
            Some(TaskKind::Divide)
        } else if *activity_type == self.merge {
            Some(TaskKind::Merge)
        } else if *activity_type == self.build {
            Some(TaskKind::Build)
        } else {
            None
        }
    }
}

/// Outcome of the latest attempt of one activity slot.
#[derive(Debug, Clone, PartialEq)]
pub enum SlotStatus {
    NotScheduled,
    /// Scheduled or started; still owned by the backend.
    Open,
    Completed(Value),
    Failed {
        reason: String,
        details: String,
        retryable: bool,
    },
    TimedOut(TimeoutType),
}

/// One activity of one node.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    pub status: SlotStatus,
    pub attempt: u32,
    /// Input of the latest attempt, reused verbatim on retry.
    pub input: Option<ActivityInput>,
}

impl Default for Slot {
    fn default() -> Self {
        Self {
            status: SlotStatus::NotScheduled,
            attempt: 0,
            input: None,
        }
    }
}

impl Slot {
    pub fn is_open(&self) -> bool {
        self.status == SlotStatus::Open
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.status, SlotStatus::Completed(_))
    }

    pub fn is_scheduled(&self) -> bool {
        self.status != SlotStatus::NotScheduled
    }
}

/// 树节点状态
#[derive(Debug, Clone, PartialEq)]
pub struct NodeState {
    pub path: PathInput,
    /// Raw shard this node covers.
    pub shard_key: String,
    pub shard_bytes: Option<u64>,
    pub divide: Slot,
    pub merge: Slot,
    /// Only ever scheduled on the root.
    pub build: Slot,
    /// Set once the node's divide has completed.
    pub children: Option<Vec<ChildShard>>,
    pub merge_output: Option<MergeOutput>,
}

impl NodeState {
    fn new(path: PathInput, shard_key: String, shard_bytes: Option<u64>) -> Self {
        Self {
            path,
            shard_key,
            shard_bytes,
            divide: Slot::default(),
            merge: Slot::default(),
            build: Slot::default(),
            children: None,
            merge_output: None,
        }
    }

    pub fn slot(&self, kind: TaskKind) -> &Slot {
        match kind {
            TaskKind::Divide => &self.divide,
            TaskKind::Merge => &self.merge,
            TaskKind::Build => &self.build,
        }
    }

    fn slot_mut(&mut self, kind: TaskKind) -> &mut Slot {
        match kind {
            TaskKind::Divide => &mut self.divide,
            TaskKind::Merge => &mut self.merge,
            TaskKind::Build => &mut self.build,
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduledRef {
    kind: TaskKind,
    path: PathInput,
    attempt: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WorkflowOutcome {
    Completed,
    Failed,
    Canceled,
}

/// Everything the decider knows about one execution, rebuilt from scratch
/// out of its history on every decision task.
#[derive(Debug, Clone)]
pub struct TreeState {
    pub types: TaskTypes,
    pub main_input: Option<MainInput>,
    pub nodes: BTreeMap<PathInput, NodeState>,
    pub cancel_requested: Option<String>,
    pub closed: Option<WorkflowOutcome>,
    scheduled: HashMap<u64, ScheduledRef>,
}

impl TreeState {
    pub fn new(types: TaskTypes) -> Self {
        Self {
            types,
            main_input: None,
            nodes: BTreeMap::new(),
            cancel_requested: None,
            closed: None,
            scheduled: HashMap::new(),
        }
    }

    /// Folds a full history, oldest event first.
    pub fn replay(events: &[HistoryEvent], types: TaskTypes) -> Result<Self> {
        let mut tree = Self::new(types);
        for event in events {
            tree.apply(event)?;
        }
        Ok(tree)
    }

    pub fn root(&self) -> Option<&NodeState> {
        self.nodes.get(&PathInput::root())
    }

    pub fn node(&self, path: &PathInput) -> Option<&NodeState> {
        self.nodes.get(path)
    }

    /// Activities scheduled but not yet resolved.
    pub fn open_activities(&self) -> usize {
        self.nodes
            .values()
            .map(|n| [&n.divide, &n.merge, &n.build].iter().filter(|s| s.is_open()).count())
            .sum()
    }

    pub fn apply(&mut self, event: &HistoryEvent) -> Result<()> {
        match &event.kind {
            EventKind::WorkflowExecutionStarted { input } => {
                if self.main_input.is_some() {
                    return Err(HarnessError::InconsistentHistory(format!(
                        "event {}: workflow started twice",
                        event.event_id
                    )));
                }
                let root = PathInput::root();
                self.nodes
                    .insert(root.clone(), NodeState::new(root, input.root_key(), None));
                self.main_input = Some(input.clone());
            }
            EventKind::ActivityTaskScheduled {
                activity_type,
                input,
                attempt,
                ..
            } => {
                let kind = self.types.kind_of(activity_type).ok_or_else(|| {
                    HarnessError::InconsistentHistory(format!(
                        "event {}: unexpected activity type {}",
                        event.event_id, activity_type
                    ))
                })?;
                let path = input.path_input.clone();
                let node = self.nodes.get_mut(&path).ok_or_else(|| {
                    HarnessError::InconsistentHistory(format!(
                        "event {}: {} scheduled for unknown node '{}'",
                        event.event_id,
                        kind.as_str(),
                        path
                    ))
                })?;
                let slot = node.slot_mut(kind);
                slot.status = SlotStatus::Open;
                slot.attempt = *attempt;
                slot.input = Some(input.clone());
                self.scheduled.insert(
                    event.event_id,
                    ScheduledRef {
                        kind,
                        path,
                        attempt: *attempt,
                    },
                );
            }
            EventKind::ActivityTaskStarted { scheduled_event_id, .. } => {
                self.lookup(event.event_id, *scheduled_event_id)?;
            }
            EventKind::ActivityTaskCompleted {
                scheduled_event_id,
                result,
            } => {
                let scheduled = self.lookup(event.event_id, *scheduled_event_id)?;
                if !self.is_current(&scheduled) {
                    return Ok(());
                }
                match scheduled.kind {
                    TaskKind::Divide => self.complete_divide(&scheduled.path, result)?,
                    TaskKind::Merge => self.complete_merge(&scheduled.path, result)?,
                    TaskKind::Build => self.complete_build(&scheduled.path, result)?,
                }
            }
            EventKind::ActivityTaskFailed {
                scheduled_event_id,
                reason,
                details,
                retryable,
            } => {
                let scheduled = self.lookup(event.event_id, *scheduled_event_id)?;
                self.resolve(
                    &scheduled,
                    SlotStatus::Failed {
                        reason: reason.clone(),
                        details: details.clone(),
                        retryable: *retryable,
                    },
                );
            }
            EventKind::ActivityTaskTimedOut {
                scheduled_event_id,
                timeout_type,
            } => {
                let scheduled = self.lookup(event.event_id, *scheduled_event_id)?;
                self.resolve(&scheduled, SlotStatus::TimedOut(*timeout_type));
            }
            EventKind::WorkflowExecutionCancelRequested { cause } => {
                self.cancel_requested = Some(cause.clone());
            }
            EventKind::WorkflowExecutionCompleted { .. } => self.closed = Some(WorkflowOutcome::Completed),
            EventKind::WorkflowExecutionFailed { .. } => self.closed = Some(WorkflowOutcome::Failed),
            EventKind::WorkflowExecutionCanceled { .. } => self.closed = Some(WorkflowOutcome::Canceled),
        }
        Ok(())
    }

    fn lookup(&self, event_id: u64, scheduled_event_id: u64) -> Result<ScheduledRef> {
        self.scheduled.get(&scheduled_event_id).cloned().ok_or_else(|| {
            HarnessError::InconsistentHistory(format!(
                "event {} refers to unknown scheduled event {}",
                event_id, scheduled_event_id
            ))
        })
    }

    /// Results from a superseded attempt are ignored.
    fn is_current(&self, scheduled: &ScheduledRef) -> bool {
        self.nodes
            .get(&scheduled.path)
            .map(|n| {
                let slot = n.slot(scheduled.kind);
                slot.attempt == scheduled.attempt && slot.is_open()
            })
            .unwrap_or(false)
    }

    fn resolve(&mut self, scheduled: &ScheduledRef, status: SlotStatus) {
        if !self.is_current(scheduled) {
            return;
        }
        if let Some(node) = self.nodes.get_mut(&scheduled.path) {
            node.slot_mut(scheduled.kind).status = status;
        }
    }

    fn complete_divide(&mut self, path: &PathInput, result: &Value) -> Result<()> {
        let output: DivideOutput = serde_json::from_value(result.clone()).map_err(|e| {
            HarnessError::InconsistentHistory(format!("divide{} returned an unreadable result: {}", path, e))
        })?;
        for (index, child) in output.children.iter().enumerate() {
            let child_path = path.child(index);
            self.nodes.insert(
                child_path.clone(),
                NodeState::new(child_path, child.zip_name.clone(), Some(child.bytes)),
            );
        }
        if let Some(node) = self.nodes.get_mut(path) {
            node.divide.status = SlotStatus::Completed(result.clone());
            node.children = Some(output.children);
        }
        Ok(())
    }

    fn complete_merge(&mut self, path: &PathInput, result: &Value) -> Result<()> {
        let output: MergeOutput = serde_json::from_value(result.clone()).map_err(|e| {
            HarnessError::InconsistentHistory(format!("merge{} returned an unreadable result: {}", path, e))
        })?;
        if let Some(node) = self.nodes.get_mut(path) {
            node.merge.status = SlotStatus::Completed(result.clone());
            node.merge_output = Some(output);
        }
        Ok(())
    }

    fn complete_build(&mut self, path: &PathInput, result: &Value) -> Result<()> {
        serde_json::from_value::<BuildOutput>(result.clone()).map_err(|e| {
            HarnessError::InconsistentHistory(format!("build{} returned an unreadable result: {}", path, e))
        })?;
        if let Some(node) = self.nodes.get_mut(path) {
            node.build.status = SlotStatus::Completed(result.clone());
        }
        Ok(())
    }
}
