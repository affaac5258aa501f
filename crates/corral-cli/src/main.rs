mod config;
mod run_cmd;
mod serve_cmd;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "corral", version, about = "Coordinates external coding-agent workers against a claims backlog")]
struct Cli {
    /// Dashboard base URL (overrides DASHBOARD_URL env var)
    #[arg(long, global = true)]
    dashboard_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the orchestrator control loop against a dashboard service
    Run {
        /// Worker command to spawn per claim
        #[arg(long, default_value = "claude")]
        worker_command: String,
        /// Arguments passed to the worker command
        #[arg(long)]
        worker_args: Vec<String>,
        /// Resolve configuration and print it without starting the control loop
        #[arg(long)]
        dry_run: bool,
    },
    /// Run the dashboard service: claim CRUD plus the observer WebSocket hub
    Serve {
        /// Address to bind (overrides BIND_ADDR env var)
        #[arg(long)]
        bind: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            worker_command,
            worker_args,
            dry_run,
        } => run_cmd::run(cli.dashboard_url.as_deref(), worker_command, worker_args, dry_run).await,
        Commands::Serve { bind } => serve_cmd::run(bind).await,
    };

    if let Err(err) = result {
        eprintln!("{err:#}");
        std::process::exit(1);
    }
    Ok(())
}
