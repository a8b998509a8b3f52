use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{HarnessConfig, PolicyConfig};
use crate::error::{HarnessError, Result};
use crate::retry::retry;
use crate::runtime::history::{Decision, DecisionTask, HistoryEvent};
use crate::runtime::storage::OrchestrationBackend;
use crate::runtime::task::{ActivityInput, MainInput, PathInput, TaskKind};
use crate::runtime::tree::{NodeState, Slot, SlotStatus, TaskTypes, TreeState};

/// Decides whether a node's shard is divided further or merged as a leaf.
/// Must be a pure function of its arguments: it is re-evaluated on every replay.
pub trait DividePolicy: Send + Sync {
    fn should_divide(&self, path: &PathInput, shard_bytes: u64) -> bool;
}

impl<F> DividePolicy for F
where
    F: Fn(&PathInput, u64) -> bool + Send + Sync,
{
    fn should_divide(&self, path: &PathInput, shard_bytes: u64) -> bool {
        self(path, shard_bytes)
    }
}

/// Divide while above `max_depth` and the shard exceeds `min_shard_bytes`.
#[derive(Debug, Clone, PartialEq)]
pub struct ThresholdPolicy {
    pub max_depth: usize,
    pub min_shard_bytes: u64,
}

impl From<&PolicyConfig> for ThresholdPolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            max_depth: config.max_depth,
            min_shard_bytes: config.min_shard_bytes,
        }
    }
}

impl DividePolicy for ThresholdPolicy {
    fn should_divide(&self, path: &PathInput, shard_bytes: u64) -> bool {
        path.depth() < self.max_depth && shard_bytes > self.min_shard_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecisionLimits {
    pub max_in_flight: usize,
    pub max_activity_attempts: u32,
}

impl DecisionLimits {
    pub fn from_config(config: &HarnessConfig) -> Self {
        Self {
            max_in_flight: config.decider.max_in_flight,
            max_activity_attempts: config.decider.max_activity_attempts,
        }
    }
}

pub fn activity_id(kind: TaskKind, path: &PathInput, attempt: u32) -> String {
    format!("{}{}#{}", kind.as_str(), path, attempt)
}

struct Candidate {
    kind: TaskKind,
    input: ActivityInput,
    attempt: u32,
}

/// 决策函数：根据重放出的树状态计算下一批决策
///
/// Pure: the same tree always yields the same decisions, whatever order
/// sibling events arrived in.
pub fn next_decisions(tree: &TreeState, policy: &dyn DividePolicy, limits: &DecisionLimits) -> Result<Vec<Decision>> {
    if tree.closed.is_some() {
        return Ok(Vec::new());
    }
    let main_input = tree
        .main_input
        .as_ref()
        .ok_or_else(|| HarnessError::InconsistentHistory("history has no start event".to_string()))?;
    if let Some(cause) = &tree.cancel_requested {
        return Ok(vec![Decision::CancelWorkflowExecution { details: cause.clone() }]);
    }

    for node in tree.nodes.values() {
        for kind in [TaskKind::Divide, TaskKind::Merge, TaskKind::Build] {
            if let Some(failure) = terminal_failure(kind, node, limits) {
                return Ok(vec![failure]);
            }
        }
    }

    let root = tree
        .root()
        .ok_or_else(|| HarnessError::InconsistentHistory("root node missing".to_string()))?;
    let mut candidates = Vec::new();
    if let SlotStatus::Completed(result) = &root.merge.status {
        if !tree.types.build_enabled {
            return Ok(vec![Decision::CompleteWorkflowExecution { result: result.clone() }]);
        }
        if let SlotStatus::Completed(built) = &root.build.status {
            return Ok(vec![Decision::CompleteWorkflowExecution { result: built.clone() }]);
        }
        let sorted = root.merge_output.as_ref().map(|m| m.zip_name.clone()).ok_or_else(|| {
            HarnessError::InconsistentHistory("root merge completed without an output".to_string())
        })?;
        let build_input = || ActivityInput {
            main_input: main_input.clone(),
            path_input: root.path.clone(),
            child_inputs: vec![sorted.clone()],
            leaf: false,
        };
        schedule_slot(TaskKind::Build, &root.build, build_input, &mut candidates);
    } else {
        visit(tree, root, main_input, policy, &mut candidates)?;
    }

    let budget = limits.max_in_flight.saturating_sub(tree.open_activities());
    Ok(candidates
        .into_iter()
        .take(budget)
        .map(|c| Decision::ScheduleActivityTask {
            activity_id: activity_id(c.kind, &c.input.path_input, c.attempt),
            activity_type: tree.types.get(c.kind).clone(),
            input: c.input,
            attempt: c.attempt,
        })
        .collect())
}

fn terminal_failure(kind: TaskKind, node: &NodeState, limits: &DecisionLimits) -> Option<Decision> {
    let slot = node.slot(kind);
    let label = format!("{}{}", kind.as_str(), node.path);
    match &slot.status {
        SlotStatus::Failed {
            reason,
            details,
            retryable: false,
        } => Some(Decision::FailWorkflowExecution {
            reason: reason.clone(),
            details: format!("{} attempt {}: {}", label, slot.attempt, details),
        }),
        SlotStatus::Failed { reason, details, .. } if slot.attempt >= limits.max_activity_attempts => {
            Some(Decision::FailWorkflowExecution {
                reason: reason.clone(),
                details: format!("{} gave up after {} attempts: {}", label, slot.attempt, details),
            })
        }
        SlotStatus::TimedOut(timeout) if slot.attempt >= limits.max_activity_attempts => {
            Some(Decision::FailWorkflowExecution {
                reason: "ActivityTimedOut".to_string(),
                details: format!("{} timed out ({:?}) after {} attempts", label, timeout, slot.attempt),
            })
        }
        _ => None,
    }
}

/// Depth-first walk in child order, collecting work that can start now.
fn visit(
    tree: &TreeState,
    node: &NodeState,
    main_input: &MainInput,
    policy: &dyn DividePolicy,
    out: &mut Vec<Candidate>,
) -> Result<()> {
    let leaf_input = || ActivityInput {
        main_input: main_input.clone(),
        path_input: node.path.clone(),
        child_inputs: vec![node.shard_key.clone()],
        leaf: true,
    };

    match &node.divide.status {
        SlotStatus::NotScheduled => {
            if node.merge.is_scheduled() {
                schedule_slot(TaskKind::Merge, &node.merge, leaf_input, out);
            } else if node.path.is_root() || policy.should_divide(&node.path, node.shard_bytes.unwrap_or(0)) {
                out.push(Candidate {
                    kind: TaskKind::Divide,
                    input: ActivityInput {
                        leaf: false,
                        ..leaf_input()
                    },
                    attempt: 1,
                });
            } else {
                out.push(Candidate {
                    kind: TaskKind::Merge,
                    input: leaf_input(),
                    attempt: 1,
                });
            }
        }
        SlotStatus::Open => {}
        SlotStatus::Failed { .. } | SlotStatus::TimedOut(_) => {
            schedule_slot(TaskKind::Divide, &node.divide, leaf_input, out);
        }
        SlotStatus::Completed(_) => {
            let children = node.children.as_deref().unwrap_or_default();
            if children.is_empty() {
                schedule_slot(TaskKind::Merge, &node.merge, leaf_input, out);
                return Ok(());
            }

            let mut sorted = Vec::with_capacity(children.len());
            for index in 0..children.len() {
                let child_path = node.path.child(index);
                let child = tree.node(&child_path).ok_or_else(|| {
                    HarnessError::InconsistentHistory(format!("child '{}' missing from tree", child_path))
                })?;
                visit(tree, child, main_input, policy, out)?;
                if let Some(output) = &child.merge_output {
                    sorted.push(output.zip_name.clone());
                }
            }
            if sorted.len() == children.len() {
                let merge_input = || ActivityInput {
                    main_input: main_input.clone(),
                    path_input: node.path.clone(),
                    child_inputs: sorted.clone(),
                    leaf: false,
                };
                schedule_slot(TaskKind::Merge, &node.merge, merge_input, out);
            }
        }
    }
    Ok(())
}

/// First attempt if never scheduled, next attempt if the last one failed.
fn schedule_slot(kind: TaskKind, slot: &Slot, fresh: impl Fn() -> ActivityInput, out: &mut Vec<Candidate>) {
    match &slot.status {
        SlotStatus::NotScheduled => out.push(Candidate {
            kind,
            input: fresh(),
            attempt: 1,
        }),
        SlotStatus::Failed { .. } | SlotStatus::TimedOut(_) => out.push(Candidate {
            kind,
            input: slot.input.clone().unwrap_or_else(fresh),
            attempt: slot.attempt + 1,
        }),
        SlotStatus::Open | SlotStatus::Completed(_) => {}
    }
}

/// 决策器
///
/// Long-polls decision tasks, replays each history into a `TreeState` and
/// answers with `next_decisions`. Keeps no state between tasks.
pub struct Decider {
    backend: Arc<dyn OrchestrationBackend>,
    config: Arc<HarnessConfig>,
    policy: Arc<dyn DividePolicy>,
    limits: DecisionLimits,
    types: TaskTypes,
}

impl Decider {
    pub fn new(backend: Arc<dyn OrchestrationBackend>, config: Arc<HarnessConfig>) -> Self {
        Self {
            policy: Arc::new(ThresholdPolicy::from(&config.policy)),
            limits: DecisionLimits::from_config(&config),
            types: TaskTypes::from_config(&config),
            backend,
            config,
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn DividePolicy>) -> Self {
        self.policy = policy;
        self
    }

    pub fn decide(&self, events: &[HistoryEvent]) -> Result<Vec<Decision>> {
        let tree = TreeState::replay(events, self.types.clone())?;
        next_decisions(&tree, self.policy.as_ref(), &self.limits)
    }

    /// Handles at most one decision task. Returns whether one arrived.
    pub async fn poll_once(&self) -> Result<bool> {
        let timeout = self.config.decider_poll_timeout();
        let task = retry(&self.config.retry, "poll_for_decision_task", || {
            self.backend
                .poll_for_decision_task(&self.config.domain, &self.config.task_list, timeout)
        })
        .await?;
        let Some(task) = task else {
            return Ok(false);
        };
        self.handle(task).await?;
        Ok(true)
    }

    async fn handle(&self, task: DecisionTask) -> Result<()> {
        let decisions = match self.decide(&task.events) {
            Ok(decisions) => decisions,
            Err(e) => {
                error!(execution = %task.execution, error = %e, "Cannot decide; leaving task for redelivery");
                return Ok(());
            }
        };
        info!(
            execution = %task.execution,
            events = task.events.len(),
            decisions = decisions.len(),
            "Decision made"
        );
        for decision in &decisions {
            debug!(?decision, "Emitting decision");
        }
        retry(&self.config.retry, "respond_decision_task_completed", || {
            self.backend
                .respond_decision_task_completed(&task.task_token, decisions.clone())
        })
        .await
    }

    /// Runs until `shutdown` flips to true or its sender is dropped.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(domain = %self.config.domain, task_list = %self.config.task_list, "Decider started");
        while !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                result = self.poll_once() => {
                    if let Err(e) = result {
                        warn!(error = %e, "Decision poll failed");
                        tokio::time::sleep(self.config.retry.delay_for(1)).await;
                    }
                }
            }
        }
        info!("Decider stopped");
    }
}
