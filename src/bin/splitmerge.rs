use std::sync::Arc;

use anyhow::{Context as AnyhowContext, Result};
use clap::Parser;
use splitmerge::cli::{CommonArgs, init_tracing};
use splitmerge::runtime::context::Context;
use splitmerge::runtime::decider::Decider;
use splitmerge::runtime::redis_storage::{RedisBackend, RedisBlobStore};
use splitmerge::runtime::registry::TaskRegistry;
use splitmerge::runtime::storage::OrchestrationBackend;
use splitmerge::runtime::worker::Worker;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about = "Divide/merge activity worker and decider", long_about = None)]
struct Args {
    #[command(flatten)]
    common: CommonArgs,

    /// Also run the decider loop in this process
    #[arg(long)]
    run_decider: bool,

    /// Number of worker loops to run
    #[arg(long, default_value_t = 1)]
    workers: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = args.common.resolve()?;
    init_tracing(&config.log_level);

    let client = redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL {}", config.redis_url))?;
    let redis_backend = RedisBackend::new(client.clone(), config.namespace(), config.timeouts.clone());
    redis_backend
        .ping()
        .await
        .with_context(|| format!("Cannot reach orchestration backend at {}", config.redis_url))?;
    let backend: Arc<dyn OrchestrationBackend> = Arc::new(redis_backend);
    let blobs = Arc::new(RedisBlobStore::new(client, config.namespace(), &config.config_bucket));

    let ctx = Context::new(config, blobs);
    let registry = Arc::new(TaskRegistry::standard(&ctx.config)?);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut loops = JoinSet::new();

    let identity = ctx.config.identity();
    for i in 0..args.workers.max(1) {
        let worker = Worker::new(backend.clone(), registry.clone(), ctx.clone()).with_identity(format!("{}-{}", identity, i));
        let shutdown = shutdown_rx.clone();
        loops.spawn(async move { worker.run(shutdown).await });
    }
    if args.run_decider {
        let decider = Decider::new(backend.clone(), ctx.config.clone());
        let shutdown = shutdown_rx.clone();
        loops.spawn(async move { decider.run(shutdown).await });
    }
    info!(
        domain = %ctx.config.domain,
        task_list = %ctx.config.task_list,
        workers = args.workers.max(1),
        decider = args.run_decider,
        "Ready. Press Ctrl-C to stop"
    );

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    info!("Shutting down");
    let _ = shutdown_tx.send(true);
    while let Some(joined) = loops.join_next().await {
        joined.context("Loop panicked")?;
    }
    Ok(())
}
