use std::path::PathBuf;

use clap::{Parser, Subcommand};

mod commands;
mod daemon;
mod output;

use commands::CliError;

#[derive(Parser, Debug)]
#[command(name = "fuel")]
#[command(about = "Local task-execution orchestrator for AI coding agents", version)]
struct Cli {
    /// Project directory (defaults to the current working directory)
    #[arg(long, global = true)]
    cwd: Option<PathBuf>,
    /// Emit a machine-readable JSON payload on stdout
    #[arg(long, global = true)]
    json: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a task
    Add {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "type")]
        task_type: Option<String>,
        /// 0..=4, lower is more urgent
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long)]
        size: Option<String>,
        #[arg(long)]
        complexity: Option<String>,
        #[arg(long = "label")]
        labels: Vec<String>,
        #[arg(long = "blocked-by")]
        blocked_by: Vec<String>,
        #[arg(long)]
        epic: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Update task fields
    Update {
        id: String,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        description: Option<String>,
        #[arg(long = "type")]
        task_type: Option<String>,
        #[arg(long)]
        priority: Option<u8>,
        #[arg(long)]
        size: Option<String>,
        #[arg(long)]
        complexity: Option<String>,
        #[arg(long)]
        agent: Option<String>,
    },
    /// Mark a task done (alias: close)
    #[command(visible_alias = "close")]
    Done {
        id: String,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        commit: Option<String>,
    },
    /// Reopen a done task
    Reopen { id: String },
    /// Take a task in progress manually
    Start { id: String },
    /// Hold a task back from dispatch
    Pause { id: String },
    /// Return a paused task to the queue
    Unpause { id: String },
    /// Defer a task indefinitely
    Defer { id: String },
    /// Requeue a task and clear its failure reason
    Retry { id: String },
    /// Show one task with its runs
    Show { id: String },
    /// List tasks, optionally filtered by status
    Tasks {
        #[arg(long)]
        status: Option<String>,
    },
    /// The ordered ready queue
    Ready,
    /// Open tasks waiting on unmet blockers
    Blocked,
    /// List backlog items
    Backlog,
    /// Park an idea in the backlog
    #[command(name = "backlog:add")]
    BacklogAdd {
        title: String,
        #[arg(long)]
        description: Option<String>,
    },
    /// List epics
    Epics,
    /// Store counts and daemon liveness
    Status,
    /// Run history, newest first
    Runs {
        /// Restrict to one task
        id: Option<String>,
    },
    /// Review history
    Reviews,
    /// Create an epic
    #[command(name = "epic:add")]
    EpicAdd {
        title: String,
        #[arg(long)]
        description: Option<String>,
        #[arg(long)]
        self_guided: bool,
        /// Plan file under .fuel/plans/
        #[arg(long)]
        plan: Option<String>,
    },
    /// Approve an epic's plan; its tasks become dispatchable
    #[command(name = "epic:approve")]
    EpicApprove {
        id: String,
        #[arg(long, default_value = "human")]
        by: String,
    },
    /// Reject an epic and reopen its tasks
    #[command(name = "epic:reject")]
    EpicReject { id: String },
    /// Sign off on a completed epic (triggers the mirror merge)
    #[command(name = "epic:reviewed")]
    EpicReviewed { id: String },
    /// Block one task on another
    #[command(name = "dep:add")]
    DepAdd { task: String, blocker: String },
    /// Remove a dependency edge
    #[command(name = "dep:remove")]
    DepRemove { task: String, blocker: String },
    /// Clear agent failure counters and cool-downs in the running daemon
    #[command(name = "health:reset")]
    HealthReset,
    /// Run the consume daemon in the foreground
    Consume {
        /// Tick interval in milliseconds
        #[arg(long)]
        interval: Option<u64>,
        /// Max simultaneous agent runs
        #[arg(long)]
        concurrency: Option<usize>,
        /// Enable the reviewer pass on successful tasks
        #[arg(long)]
        review: bool,
        /// Run epic tasks in isolated working-copy mirrors
        #[arg(long)]
        mirrors: bool,
    },
    /// Start the consume daemon in the background
    #[command(name = "consume:runner")]
    ConsumeRunner {
        #[arg(long)]
        interval: Option<u64>,
        #[arg(long)]
        concurrency: Option<usize>,
        #[arg(long)]
        review: bool,
        #[arg(long)]
        mirrors: bool,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match commands::run(cli).await {
        Ok(()) => {}
        Err(e) => {
            eprintln!("error: {e}");
            std::process::exit(e.exit_code());
        }
    }
}

impl CliError {
    /// 2 for validation failures, 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Validation(_) => 2,
            CliError::Failure(_) => 1,
        }
    }
}
