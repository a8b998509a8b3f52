use std::fs;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as AnyhowContext, Result};
use clap::{Parser, Subcommand};
use splitmerge::cli::{CommonArgs, init_tracing, run_local, wait_for_close};
use splitmerge::config::HarnessConfig;
use splitmerge::runtime::blob::BlobStoreAdapter;
use splitmerge::runtime::history::{WorkflowDescription, WorkflowStatus};
use splitmerge::runtime::redis_storage::{RedisBackend, RedisBlobStore};
use splitmerge::runtime::storage::OrchestrationBackend;
use splitmerge::runtime::task::{MainInput, WorkflowExecution};
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "Start, inspect and cancel divide/merge runs", long_about = None)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload a local file and start a workflow over it
    Start {
        /// Local newline-delimited input file
        #[arg(long)]
        input: PathBuf,

        /// Blob directory the input and all derived shards go under
        #[arg(long)]
        s3_dir: String,

        /// Workflow id; defaults to the input file name
        #[arg(long)]
        workflow_id: Option<String>,

        /// Block until the workflow closes and print its final status
        #[arg(long)]
        wait: bool,
    },
    /// Print the status of a workflow execution
    Status {
        #[arg(long)]
        workflow_id: String,
        #[arg(long)]
        run_id: String,
    },
    /// Request cancellation of a workflow execution
    Cancel {
        #[arg(long)]
        workflow_id: String,
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value = "canceled by operator")]
        cause: String,
    },
    /// Run the whole pipeline in-process over a local file (Standalone Mode)
    Local {
        #[arg(long, short)]
        input: PathBuf,

        /// Where to write the sorted output
        #[arg(long, short)]
        output: PathBuf,

        #[arg(long, default_value_t = 4)]
        workers: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.common.resolve()?;
    init_tracing(&config.log_level);

    let succeeded = match cli.command {
        Commands::Start {
            input,
            s3_dir,
            workflow_id,
            wait,
        } => start(&config, &input, s3_dir, workflow_id, wait).await?,
        Commands::Status { workflow_id, run_id } => {
            let backend = connect(&config).await?;
            let description = backend
                .describe_workflow_execution(&execution(&config, workflow_id, run_id))
                .await?;
            print_description(&description)?;
            true
        }
        Commands::Cancel {
            workflow_id,
            run_id,
            cause,
        } => {
            let backend = connect(&config).await?;
            let execution = execution(&config, workflow_id, run_id);
            backend.request_cancel_workflow_execution(&execution, &cause).await?;
            info!(execution = %execution, "Cancellation requested");
            true
        }
        Commands::Local { input, output, workers } => {
            let body = fs::read(&input).with_context(|| format!("Failed to read {}", input.display()))?;
            let file_name = file_name(&input)?;
            let run = run_local(config, &file_name, body, workers).await?;
            print_description(&run.description)?;
            match run.output {
                Some(sorted) => {
                    fs::write(&output, sorted).with_context(|| format!("Failed to write {}", output.display()))?;
                    info!(output = %output.display(), "Sorted output written");
                    true
                }
                None => false,
            }
        }
    };

    if !succeeded {
        process::exit(1);
    }
    Ok(())
}

async fn start(
    config: &HarnessConfig,
    input: &PathBuf,
    s3_dir: String,
    workflow_id: Option<String>,
    wait: bool,
) -> Result<bool> {
    let body = fs::read(input).with_context(|| format!("Failed to read {}", input.display()))?;
    let file_name = file_name(input)?;
    let main_input = MainInput::new(s3_dir, file_name.clone());

    let client = redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL {}", config.redis_url))?;
    let blobs = BlobStoreAdapter::new(
        Arc::new(RedisBlobStore::new(client, config.namespace(), &config.config_bucket)),
        config.retry.clone(),
        config.blob.clone(),
    );
    blobs.put(&main_input.root_key(), body).await?;
    info!(key = %main_input.root_key(), "Input uploaded");

    let backend = connect(config).await?;
    let workflow_id = workflow_id.unwrap_or(file_name);
    let execution = backend
        .start_workflow_execution(&config.domain, &workflow_id, &config.task_list, main_input)
        .await?;
    println!("{}", serde_json::to_string_pretty(&execution)?);

    if !wait {
        return Ok(true);
    }
    let description = wait_for_close(&backend, &execution, Duration::from_secs(1)).await?;
    print_description(&description)?;
    Ok(matches!(description.status, WorkflowStatus::Completed { .. }))
}

async fn connect(config: &HarnessConfig) -> Result<Arc<dyn OrchestrationBackend>> {
    let client = redis::Client::open(config.redis_url.as_str())
        .with_context(|| format!("Invalid Redis URL {}", config.redis_url))?;
    let backend = RedisBackend::new(client, config.namespace(), config.timeouts.clone());
    backend
        .ping()
        .await
        .with_context(|| format!("Cannot reach orchestration backend at {}", config.redis_url))?;
    Ok(Arc::new(backend))
}

fn execution(config: &HarnessConfig, workflow_id: String, run_id: String) -> WorkflowExecution {
    WorkflowExecution {
        domain: config.domain.clone(),
        workflow_id,
        run_id,
    }
}

fn file_name(path: &PathBuf) -> Result<String> {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))
}

fn print_description(description: &WorkflowDescription) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(description)?);
    Ok(())
}
