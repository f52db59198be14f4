use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use taskhive::config::{
    CoordinatorConfig, ExecConfig, PullMode, ReconnectPolicy, WorkerConfig,
};
use taskhive::coordinator::{Coordinator, LoggingSink};
use taskhive::protocol::Task;
use taskhive::shutdown::install_shutdown_handler;
use taskhive::worker::WorkerDriver;

#[derive(Parser, Debug)]
#[command(name = "taskhive")]
#[command(version)]
#[command(about = "Master/worker task distribution over persistent connections")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a coordinator
    Coordinator(CoordinatorArgs),

    /// Start a worker
    Worker(WorkerArgs),

    /// Task management commands against a running coordinator
    Task {
        #[command(flatten)]
        client: ClientArgs,

        #[command(subcommand)]
        command: TaskCommands,
    },
}

// =============================================================================
// Coordinator Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct CoordinatorArgs {
    /// Port for the WebSocket + HTTP listener
    #[arg(long, default_value = "7400")]
    port: u16,

    /// Service type announced to discovery queries
    #[arg(long, default_value = "taskhive")]
    service_type: String,

    /// UDP port for the discovery responder (omit to disable discovery)
    #[arg(long)]
    discovery_port: Option<u16>,

    /// Address advertised in discovery answers (host:port).
    /// Required when binding to 0.0.0.0 and serving remote workers.
    #[arg(long)]
    advertise: Option<String>,

    /// Re-queue installed tasks that have not reported back within this
    /// many seconds (omit to rely on disconnect detection only)
    #[arg(long)]
    reclaim_after_secs: Option<u64>,

    /// JSON file with a task array served through the batch protocol
    #[arg(long)]
    tasks_file: Option<PathBuf>,
}

// =============================================================================
// Worker Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct WorkerArgs {
    /// Coordinator WebSocket URL (e.g. ws://127.0.0.1:7400/ws).
    /// Omit to discover one on the local network.
    #[arg(long, short = 'a')]
    addr: Option<String>,

    /// Capabilities this worker announces (comma-separated)
    #[arg(long, default_value = "")]
    task_types: String,

    /// Root directory for task workspaces
    #[arg(long, default_value = "taskhive-work")]
    work_dir: PathBuf,

    /// Service type used for discovery queries
    #[arg(long, default_value = "taskhive")]
    service_type: String,

    /// UDP port discovery queries are broadcast to
    #[arg(long, default_value = "7401")]
    discovery_port: u16,

    /// Seconds to wait for a discovery answer
    #[arg(long, default_value = "5")]
    discovery_timeout_secs: u64,

    /// Milliseconds to wait after a noTask reply before asking again
    #[arg(long, default_value = "2000")]
    backoff_ms: u64,

    /// Retry lost connections forever instead of giving up
    #[arg(long)]
    retry_forever: bool,

    /// Consecutive connect failures before giving up (unless --retry-forever)
    #[arg(long, default_value = "5")]
    retry_attempts: u32,

    /// Delay between reconnect attempts in milliseconds
    #[arg(long, default_value = "1000")]
    retry_delay_ms: u64,

    /// Interpreter the task entry point is passed to
    #[arg(long, default_value = "sh")]
    interpreter: String,

    /// Default execution timeout in seconds for tasks without their own
    #[arg(long, default_value = "30")]
    default_timeout_secs: u64,

    /// Pull the whole batch via the basic protocol instead of one task at a time
    #[arg(long)]
    batch: bool,
}

// =============================================================================
// Client Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Coordinator HTTP address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:7400")]
    addr: String,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

#[derive(clap::Subcommand, Debug)]
enum TaskCommands {
    /// Submit tasks from a JSON file (one task object or an array)
    Submit {
        /// Path to the task JSON
        file: PathBuf,
    },
    /// Get status of a tracked task
    Status {
        /// The task id
        task_id: String,
    },
    /// List all tracked tasks
    List,
}

// =============================================================================
// Server Implementations
// =============================================================================

async fn run_coordinator(args: CoordinatorArgs) -> Result<(), Box<dyn std::error::Error>> {
    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = CoordinatorConfig {
        listen_addr,
        service_type: args.service_type,
        discovery_port: args.discovery_port,
        advertise_addr: args.advertise,
        reclaim_after: args.reclaim_after_secs.map(Duration::from_secs),
    };

    tracing::info!(
        listen_addr = %config.listen_addr,
        discovery_port = ?config.discovery_port,
        reclaim_after = ?config.reclaim_after,
        "Starting coordinator"
    );

    let coordinator = Coordinator::new(config, Arc::new(LoggingSink), None);

    if let Some(path) = args.tasks_file {
        let raw = tokio::fs::read_to_string(&path).await?;
        let tasks: Vec<Task> = serde_json::from_str(&raw)?;
        tracing::info!(count = tasks.len(), file = %path.display(), "Seeded task batch");
        coordinator.engine().seed_batch(tasks).await;
    }

    let shutdown = install_shutdown_handler();
    coordinator.run(shutdown).await?;
    Ok(())
}

async fn run_worker(args: WorkerArgs) -> Result<(), Box<dyn std::error::Error>> {
    let task_types: Vec<String> = args
        .task_types
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();

    let reconnect = if args.retry_forever {
        ReconnectPolicy::Fixed {
            delay: Duration::from_millis(args.retry_delay_ms),
        }
    } else {
        ReconnectPolicy::Bounded {
            attempts: args.retry_attempts,
            delay: Duration::from_millis(args.retry_delay_ms),
        }
    };

    let config = WorkerConfig {
        coordinator_url: args.addr,
        service_type: args.service_type,
        discovery_port: args.discovery_port,
        discovery_timeout: Duration::from_secs(args.discovery_timeout_secs),
        task_types,
        work_dir: args.work_dir,
        no_task_backoff: Duration::from_millis(args.backoff_ms),
        reconnect,
        pull_mode: if args.batch {
            PullMode::Batch
        } else {
            PullMode::Dynamic
        },
        exec: ExecConfig {
            interpreter: args.interpreter,
            default_timeout: Duration::from_secs(args.default_timeout_secs),
        },
    };

    tracing::info!(
        coordinator = ?config.coordinator_url,
        task_types = ?config.task_types,
        pull_mode = ?config.pull_mode,
        "Starting worker"
    );

    let driver = WorkerDriver::new(config);
    driver.run().await?;
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_task_submit(
    client: &ClientArgs,
    file: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
    let raw = tokio::fs::read_to_string(&file).await?;
    let parsed: serde_json::Value = serde_json::from_str(&raw)?;

    let http = reqwest::Client::new();
    let (url, body) = if parsed.is_array() {
        (format!("{}/api/tasks/batch", client.addr), parsed)
    } else {
        (format!("{}/api/tasks", client.addr), parsed)
    };

    let response = http.post(&url).json(&body).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if !status.is_success() {
        eprintln!("Error: {}", body["error"].as_str().unwrap_or("submission failed"));
        std::process::exit(1);
    }

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body)?),
        OutputFormat::Table => {
            if let Some(id) = body["taskId"].as_str() {
                println!("Task submitted: {}", id);
            } else {
                println!("Submitted {} tasks", body["queued"]);
            }
        }
    }
    Ok(())
}

async fn handle_task_status(
    client: &ClientArgs,
    task_id: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/tasks/{}", client.addr, task_id);
    let response = reqwest::Client::new().get(&url).send().await?;
    let status = response.status();
    let body: serde_json::Value = response.json().await?;

    if !status.is_success() {
        eprintln!("Error: {}", body["error"].as_str().unwrap_or("lookup failed"));
        std::process::exit(1);
    }

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&body)?),
        OutputFormat::Table => {
            println!("Task ID:   {}", body["taskId"].as_str().unwrap_or("-"));
            println!("Type:      {}", body["taskType"].as_str().unwrap_or("-"));
            println!("State:     {}", body["state"].as_str().unwrap_or("-"));
            if let Some(worker) = body["assignedTo"].as_str() {
                println!("Worker:    {}", worker);
            }
            if let Some(done) = body["completedAt"].as_str() {
                println!("Completed: {}", done);
            }
        }
    }
    Ok(())
}

async fn handle_task_list(client: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let url = format!("{}/api/tasks", client.addr);
    let tasks: Vec<serde_json::Value> = reqwest::Client::new()
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    match client.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&tasks)?),
        OutputFormat::Table => {
            if tasks.is_empty() {
                println!("No tracked tasks.");
            } else {
                println!("{:<24} {:<12} {:<10} WORKER", "TASK ID", "TYPE", "STATE");
                println!("{}", "-".repeat(70));
                for task in &tasks {
                    println!(
                        "{:<24} {:<12} {:<10} {}",
                        task["taskId"].as_str().unwrap_or("-"),
                        task["taskType"].as_str().unwrap_or("-"),
                        task["state"].as_str().unwrap_or("-"),
                        task["assignedTo"].as_str().unwrap_or("-"),
                    );
                }
            }
        }
    }
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Coordinator(coordinator_args) => {
            run_coordinator(coordinator_args).await?;
        }
        Commands::Worker(worker_args) => {
            run_worker(worker_args).await?;
        }
        Commands::Task { client, command } => match command {
            TaskCommands::Submit { file } => handle_task_submit(&client, file).await?,
            TaskCommands::Status { task_id } => handle_task_status(&client, task_id).await?,
            TaskCommands::List => handle_task_list(&client).await?,
        },
    }

    Ok(())
}
