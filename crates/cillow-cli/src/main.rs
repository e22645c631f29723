use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use cillow::{config, Environment, ServerConfig, WorkerOptions};

/// cillow: dispatch code to pooled interpreter workers and stream the output
/// back.
#[derive(Parser, Debug)]
#[command(name = "cillow", version, about = "Code-execution service")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the request broker.
    Serve(ServeArgs),
    /// Run one interpreter worker over stdio (spawned by the broker).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Interface to bind.
    #[arg(long, default_value = config::DEFAULT_HOST, env = "CILLOW_HOST")]
    host: String,

    /// Port to bind.
    #[arg(long, default_value_t = config::DEFAULT_PORT, env = "CILLOW_PORT")]
    port: u16,

    /// Global interpreter cap (default derived from the host CPU count).
    #[arg(long, env = "CILLOW_MAX_INTERPRETERS")]
    max_interpreters: Option<usize>,

    /// Interpreters one client may hold at once.
    #[arg(long, env = "CILLOW_INTERPRETERS_PER_CLIENT")]
    interpreters_per_client: Option<usize>,

    /// Broker worker tasks (default: 2x the interpreter cap).
    #[arg(long, env = "CILLOW_WORKER_TASKS")]
    worker_tasks: Option<usize>,

    /// Request queue bound (default: same as worker tasks).
    #[arg(long, env = "CILLOW_QUEUE_SIZE")]
    queue_size: Option<usize>,

    /// Executable spawned for interpreter workers (default: this binary).
    #[arg(long, env = "CILLOW_WORKER_PROGRAM")]
    worker_program: Option<PathBuf>,

    /// Capture hooks installed in every worker, in order.
    #[arg(long, value_delimiter = ',', env = "CILLOW_HOOKS")]
    hooks: Option<Vec<String>>,
}

#[derive(Args, Debug)]
struct WorkerArgs {
    /// Environment this worker is bound to ("$system" or a directory).
    #[arg(long)]
    env: String,

    /// Capture hooks to install, in order.
    #[arg(long, value_delimiter = ',')]
    hooks: Vec<String>,
}

fn main() -> anyhow::Result<()> {
    // Frames travel on worker stdout, so all logging goes to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    match Cli::parse().command {
        Command::Serve(args) => {
            let config = server_config(args);
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to start the async runtime")?;
            runtime.block_on(cillow::broker::run(config))
        }
        Command::Worker(args) => {
            let options = WorkerOptions {
                env: Environment::parse(&args.env),
                hooks: args.hooks,
            };
            cillow::worker::run(options).context("worker loop failed")
        }
    }
}

fn server_config(args: ServeArgs) -> ServerConfig {
    let defaults = ServerConfig::default();
    let max_interpreters = args
        .max_interpreters
        .unwrap_or(defaults.max_interpreters)
        .max(1);
    let worker_tasks = args
        .worker_tasks
        .unwrap_or_else(|| config::default_worker_tasks(max_interpreters))
        .max(1);
    ServerConfig {
        host: args.host,
        port: args.port,
        max_interpreters,
        interpreters_per_client: args
            .interpreters_per_client
            .unwrap_or(defaults.interpreters_per_client)
            .max(1),
        worker_tasks,
        queue_size: args.queue_size.unwrap_or(worker_tasks).max(1),
        worker_program: args.worker_program,
        hooks: args.hooks.unwrap_or_else(|| defaults.hooks.clone()),
        ..defaults
    }
}
