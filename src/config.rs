use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use serde::{Deserialize, Serialize};

use crate::retry::RetryPolicy;
use crate::runtime::task::{ActivityType, TaskKind};

/// 进程级配置
///
/// Loaded once at startup (YAML file, then CLI overrides) and handed to the
/// worker, the decider and every handler through `Context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    pub domain: String,
    pub task_list: String,
    pub region: String,
    /// Bucket namespace all shard blobs live under.
    pub config_bucket: String,
    pub redis_url: String,
    pub identity: Option<String>,
    pub log_level: String,
    pub divide_task: ActivityType,
    pub merge_task: ActivityType,
    pub build_task: ActivityType,
    pub worker: WorkerConfig,
    pub decider: DeciderConfig,
    pub timeouts: TimeoutConfig,
    pub policy: PolicyConfig,
    pub blob: BlobConfig,
    pub retry: RetryPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            domain: "splitmerge".to_string(),
            task_list: "default".to_string(),
            region: "local".to_string(),
            config_bucket: "splitmerge-data".to_string(),
            redis_url: "redis://127.0.0.1:6379/0".to_string(),
            identity: None,
            log_level: "info".to_string(),
            divide_task: ActivityType::new("divide", "1"),
            merge_task: ActivityType::new("merge", "1"),
            build_task: ActivityType::new("build", "1"),
            worker: WorkerConfig::default(),
            decider: DeciderConfig::default(),
            timeouts: TimeoutConfig::default(),
            policy: PolicyConfig::default(),
            blob: BlobConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub heartbeat_interval_ms: u64,
    pub poll_timeout_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 30_000,
            poll_timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeciderConfig {
    /// Upper bound on open activities per workflow execution.
    pub max_in_flight: usize,
    /// Attempts per activity before a retryable failure or timeout fails the workflow.
    pub max_activity_attempts: u32,
    pub poll_timeout_ms: u64,
}

impl Default for DeciderConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 50,
            max_activity_attempts: 3,
            poll_timeout_ms: 20_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub heartbeat_timeout_ms: u64,
    pub start_to_close_ms: u64,
    pub decision_timeout_ms: u64,
    /// How long a task may sit popped but unclaimed before the Redis
    /// backend hands it to another poller.
    pub claim_grace_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 90_000,
            start_to_close_ms: 3_600_000,
            decision_timeout_ms: 30_000,
            claim_grace_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub max_depth: usize,
    pub min_shard_bytes: u64,
    pub fan_out: usize,
    /// Run the build step over the root's sorted output before completing.
    pub build: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_depth: 3,
            min_shard_bytes: 1 << 20,
            fan_out: 4,
            build: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    pub multipart_threshold_bytes: usize,
    pub part_size_bytes: usize,
    pub list_page_size: usize,
    pub shard_extension: String,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            multipart_threshold_bytes: 8 << 20,
            part_size_bytes: 5 << 20,
            list_page_size: 1000,
            shard_extension: "txt".to_string(),
        }
    }
}

impl HarnessConfig {
    pub fn load(file_path: impl AsRef<Path>) -> Result<Self> {
        let file_path = file_path.as_ref();
        let yaml_content = fs::read_to_string(file_path)
            .with_context(|| format!("Failed to read config file from {}", file_path.display()))?;

        let config: HarnessConfig = serde_yaml::from_str(&yaml_content)
            .with_context(|| format!("Failed to deserialize config from {}", file_path.display()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.policy.fan_out < 2 {
            anyhow::bail!("policy.fan_out must be at least 2, got {}", self.policy.fan_out);
        }
        if self.decider.max_in_flight == 0 {
            anyhow::bail!("decider.max_in_flight must be positive");
        }
        if self.blob.part_size_bytes == 0 {
            anyhow::bail!("blob.part_size_bytes must be positive");
        }
        if self.divide_task == self.merge_task
            || self.divide_task == self.build_task
            || self.merge_task == self.build_task
        {
            anyhow::bail!("divide, merge and build tasks must use distinct activity types");
        }
        Ok(())
    }

    pub fn activity_type(&self, kind: TaskKind) -> &ActivityType {
        match kind {
            TaskKind::Divide => &self.divide_task,
            TaskKind::Merge => &self.merge_task,
            TaskKind::Build => &self.build_task,
        }
    }

    /// Worker identity reported to the backend; falls back to the process id.
    pub fn identity(&self) -> String {
        self.identity
            .clone()
            .unwrap_or_else(|| format!("worker-{}", std::process::id()))
    }

    /// Key prefix that scopes backend and blob keys to one region.
    pub fn namespace(&self) -> String {
        format!("splitmerge:{}", self.region)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.worker.heartbeat_interval_ms)
    }

    pub fn worker_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.worker.poll_timeout_ms)
    }

    pub fn decider_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.decider.poll_timeout_ms)
    }
}
