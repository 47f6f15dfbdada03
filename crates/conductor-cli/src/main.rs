mod executor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use conductor_core::impls::event_bus::DEFAULT_CAPACITY;
use conductor_core::impls::{EventBus, JsonFileTaskRepository, TracingEventSink};
use conductor_core::ports::TaskRepository;
use conductor_core::{QueueConfig, TaskId, TaskQueue, TaskRequest};
use tokio::time::{Duration, timeout};
use tracing::{info, warn};

use crate::executor::CommandExecutor;

#[derive(Parser)]
#[command(name = "conductor", version, about = "Run agent instructions through a durable task queue")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Restore unfinished tasks, submit new instructions and run until idle
    Run {
        /// Agent program; each instruction is passed as its last argument
        #[arg(long)]
        agent: PathBuf,
        /// Extra argument for the agent program (repeatable)
        #[arg(long = "agent-arg", allow_hyphen_values = true)]
        agent_args: Vec<String>,
        /// Queue configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
        /// Task state file
        #[arg(long, default_value = "conductor-tasks.json")]
        state: PathBuf,
        /// Priority of the submitted instructions
        #[arg(long, default_value_t = 0, allow_negative_numbers = true)]
        priority: i32,
        /// Working directory handed to the agent
        #[arg(long)]
        cwd: Option<PathBuf>,
        instructions: Vec<String>,
    },
    /// Print stored tasks
    Status {
        #[arg(long, default_value = "conductor-tasks.json")]
        state: PathBuf,
        /// Only this task (`task-<ULID>` or bare ULID)
        task_id: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("conductor=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run {
            agent,
            agent_args,
            config,
            state,
            priority,
            cwd,
            instructions,
        } => {
            let config = load_config(config.as_deref())?;
            run(RunArgs {
                executor: CommandExecutor::new(agent, agent_args),
                config,
                state,
                priority,
                cwd,
                instructions,
            })
            .await
        }
        Commands::Status { state, task_id } => status(&state, task_id.as_deref()).await,
    }
}

struct RunArgs {
    executor: CommandExecutor,
    config: QueueConfig,
    state: PathBuf,
    priority: i32,
    cwd: Option<PathBuf>,
    instructions: Vec<String>,
}

fn load_config(path: Option<&Path>) -> anyhow::Result<QueueConfig> {
    match path {
        Some(path) => QueueConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(QueueConfig::default()),
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let (events, fan_out) = EventBus::spawn(DEFAULT_CAPACITY);
    events.subscribe(Arc::new(TracingEventSink));

    let queue = TaskQueue::builder(Arc::new(args.executor))
        .config(args.config.with_auto_start(false))
        .repository(Arc::new(JsonFileTaskRepository::new(&args.state)))
        .event_sink(Arc::new(events))
        .build()
        .await
        .context("starting queue")?;

    let restored = queue.list().await.len();
    if restored > 0 {
        info!(restored, state = %args.state.display(), "resuming unfinished tasks");
    }

    let context = match &args.cwd {
        Some(cwd) => serde_json::json!({ "cwd": cwd }),
        None => serde_json::Value::Null,
    };
    for instruction in args.instructions {
        let request = TaskRequest::new(instruction).with_context(context.clone());
        let id = queue.add(request, args.priority).await?;
        info!(task_id = %id, "submitted");
    }

    queue.start();
    tokio::select! {
        _ = queue.wait_for_idle() => {}
        signal = tokio::signal::ctrl_c() => {
            signal.context("listening for ctrl-c")?;
            warn!("interrupted, waiting for running tasks; pending tasks stay queued");
        }
    }
    queue.shutdown().await;

    let tasks = queue.list().await;
    println!("{}", serde_json::to_string_pretty(&tasks)?);
    let stats = queue.stats().await;
    info!(
        completed = stats.completed,
        failed = stats.failed,
        cancelled = stats.cancelled,
        pending = stats.pending,
        "done"
    );

    // the bus drains once the last sender (held by the queue) is gone
    drop(queue);
    if timeout(Duration::from_secs(5), fan_out).await.is_err() {
        warn!("event delivery did not finish");
    }
    Ok(())
}

async fn status(state: &Path, task_id: Option<&str>) -> anyhow::Result<()> {
    let repository = JsonFileTaskRepository::new(state);
    match task_id {
        Some(raw) => {
            let id: TaskId = raw.parse()?;
            let Some(task) = repository.find_by_id(id).await? else {
                bail!("no task {id} in {}", state.display());
            };
            println!("{}", serde_json::to_string_pretty(&task)?);
        }
        None => {
            let tasks = repository.all().await?;
            println!("{}", serde_json::to_string_pretty(&tasks)?);
        }
    }
    Ok(())
}
