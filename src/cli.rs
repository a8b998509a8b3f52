use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use clap::Args;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::config::HarnessConfig;
use crate::runtime::context::Context;
use crate::runtime::decider::Decider;
use crate::runtime::history::{WorkflowDescription, WorkflowStatus};
use crate::runtime::registry::TaskRegistry;
use crate::runtime::storage::{InMemoryBackend, InMemoryBlobStore, OrchestrationBackend};
use crate::runtime::task::{ActivityType, MainInput, WorkflowExecution};
use crate::runtime::worker::Worker;

/// Flags shared by every binary. Each one overrides the matching config field.
#[derive(Args, Debug, Clone, Default)]
pub struct CommonArgs {
    /// YAML config file; defaults apply when omitted
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Orchestration domain
    #[arg(long)]
    pub domain: Option<String>,

    /// Task list to poll and schedule on
    #[arg(long)]
    pub task_list: Option<String>,

    /// Divide activity type, as `name` or `name:version`
    #[arg(long)]
    pub div_task: Option<String>,

    /// Merge activity type, as `name` or `name:version`
    #[arg(long)]
    pub merge_task: Option<String>,

    /// Build activity type, as `name` or `name:version`
    #[arg(long)]
    pub build_task: Option<String>,

    /// Run the build step after the root merge
    #[arg(long)]
    pub build: bool,

    #[arg(long)]
    pub region: Option<String>,

    /// Bucket all shard blobs are stored under
    #[arg(long)]
    pub config_bucket: Option<String>,

    /// Redis connection URL
    #[arg(long)]
    pub redis: Option<String>,

    /// Worker identity reported to the backend
    #[arg(long)]
    pub identity: Option<String>,
}

impl CommonArgs {
    /// Loads the config file (if any), then applies the flags on top.
    pub fn resolve(&self) -> Result<HarnessConfig> {
        let mut config = match &self.config {
            Some(path) => HarnessConfig::load(path)?,
            None => HarnessConfig::default(),
        };
        if let Some(domain) = &self.domain {
            config.domain = domain.clone();
        }
        if let Some(task_list) = &self.task_list {
            config.task_list = task_list.clone();
        }
        if let Some(task) = &self.div_task {
            config.divide_task = parse_activity_type(task)?;
        }
        if let Some(task) = &self.merge_task {
            config.merge_task = parse_activity_type(task)?;
        }
        if let Some(task) = &self.build_task {
            config.build_task = parse_activity_type(task)?;
        }
        if self.build {
            config.policy.build = true;
        }
        if let Some(region) = &self.region {
            config.region = region.clone();
        }
        if let Some(bucket) = &self.config_bucket {
            config.config_bucket = bucket.clone();
        }
        if let Some(redis) = &self.redis {
            config.redis_url = redis.clone();
        }
        if let Some(identity) = &self.identity {
            config.identity = Some(identity.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

/// `divide:2` -> ("divide", "2"); a bare name gets version "1".
pub fn parse_activity_type(value: &str) -> Result<ActivityType> {
    let (name, version) = value.split_once(':').unwrap_or((value, "1"));
    if name.is_empty() || version.is_empty() {
        anyhow::bail!("invalid activity type '{}', expected name or name:version", value);
    }
    Ok(ActivityType::new(name, version))
}

/// `RUST_LOG` wins over the configured level.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

/// Polls `describe_workflow_execution` until the execution closes.
pub async fn wait_for_close(
    backend: &Arc<dyn OrchestrationBackend>,
    execution: &WorkflowExecution,
    poll_interval: Duration,
) -> Result<WorkflowDescription> {
    loop {
        let description = backend
            .describe_workflow_execution(execution)
            .await
            .with_context(|| format!("Failed to describe {}", execution))?;
        if description.status.is_closed() {
            return Ok(description);
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Result of an in-process run.
#[derive(Debug)]
pub struct LocalRun {
    pub description: WorkflowDescription,
    /// Final sorted output (the dictionary when the build step ran),
    /// present when the workflow completed.
    pub output: Option<Vec<u8>>,
}

/// Sorts `body` with an in-process backend, blob store, decider and
/// `workers` worker loops.
pub async fn run_local(config: HarnessConfig, file_name: &str, body: Vec<u8>, workers: usize) -> Result<LocalRun> {
    let backend: Arc<dyn OrchestrationBackend> = Arc::new(InMemoryBackend::new(config.timeouts.clone()));
    let ctx = Context::new(config, Arc::new(InMemoryBlobStore::new()));
    let registry = Arc::new(TaskRegistry::standard(&ctx.config)?);

    let main_input = MainInput::new("local", file_name);
    ctx.blobs.put(&main_input.root_key(), body).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = JoinSet::new();
    for i in 0..workers.max(1) {
        let worker = Worker::new(backend.clone(), registry.clone(), ctx.clone()).with_identity(format!("local-{}", i));
        let shutdown = shutdown_rx.clone();
        loops.spawn(async move { worker.run(shutdown).await });
    }
    let decider = Decider::new(backend.clone(), ctx.config.clone());
    loops.spawn(async move { decider.run(shutdown_rx).await });

    let execution = backend
        .start_workflow_execution(&ctx.config.domain, file_name, &ctx.config.task_list, main_input)
        .await?;
    info!(execution = %execution, "Started local run");
    let description = wait_for_close(&backend, &execution, Duration::from_millis(20)).await;

    let _ = shutdown_tx.send(true);
    while let Some(joined) = loops.join_next().await {
        joined.context("Loop panicked")?;
    }

    let description = description?;
    let output = match &description.status {
        WorkflowStatus::Completed { result } => {
            let output_key = result
                .get("zip_name")
                .and_then(|v| v.as_str())
                .context("Workflow result names no output")?;
            Some(ctx.blobs.get(output_key).await?)
        }
        _ => None,
    };
    Ok(LocalRun { description, output })
}
