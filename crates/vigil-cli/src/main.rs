mod cmd;
mod output;
mod root;

use clap::{Parser, Subcommand};
use cmd::{
    alert::AlertSubcommand, config::ConfigSubcommand, control::ControlSubcommand,
    freshness::FreshnessSubcommand, task::TaskSubcommand,
};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "vigil",
    about = "Continuous monitoring: scheduled syncs, retries, circuit breakers, control health, and alerts",
    version,
    propagate_version = true
)]
struct Cli {
    /// Project root (default: auto-detect from .vigil/)
    #[arg(long, global = true, env = "VIGIL_ROOT")]
    root: Option<PathBuf>,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create .vigil/ with a default config and an empty store
    Init,

    /// Validate the configuration
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Manage scheduled sync and control-test tasks
    Task {
        #[command(subcommand)]
        subcommand: TaskSubcommand,
    },

    /// Show every attempt of a task, retries nested under their parent
    Attempts {
        /// Task id or unique prefix
        task: String,
    },

    /// Run the scheduler daemon until interrupted
    Run,

    /// Run one scheduler pass and wait for the attempts it dispatched
    Tick,

    /// Show integration health and breaker state
    Health {
        /// Limit to one integration
        integration: Option<String>,
    },

    /// Inspect and manage control monitoring
    Control {
        #[command(subcommand)]
        subcommand: ControlSubcommand,
    },

    /// List, acknowledge, and resolve alerts
    Alert {
        #[command(subcommand)]
        subcommand: AlertSubcommand,
    },

    /// Evidence freshness: SLAs, artifacts, and rescoring
    Freshness {
        #[command(subcommand)]
        subcommand: FreshnessSubcommand,
    },

    /// Classify a provider error the way the retry planner would
    Classify {
        /// HTTP-like status code
        #[arg(long)]
        code: Option<u16>,
        /// Error message text
        #[arg(long, default_value = "")]
        message: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = match &cli.command {
        Commands::Run => tracing::Level::INFO,
        _ => tracing::Level::WARN,
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_level.into()),
        )
        .with_target(false)
        .init();

    let root = root::resolve_root(cli.root.as_deref());

    let result = match cli.command {
        Commands::Init => cmd::init::run(&root, cli.json),
        Commands::Config { subcommand } => cmd::config::run(&root, subcommand, cli.json),
        Commands::Task { subcommand } => cmd::task::run(&root, subcommand, cli.json),
        Commands::Attempts { task } => cmd::attempts::run(&root, &task, cli.json),
        Commands::Run => cmd::run::run(&root),
        Commands::Tick => cmd::tick::run(&root, cli.json),
        Commands::Health { integration } => cmd::health::run(&root, integration.as_deref(), cli.json),
        Commands::Control { subcommand } => cmd::control::run(&root, subcommand, cli.json),
        Commands::Alert { subcommand } => cmd::alert::run(&root, subcommand, cli.json),
        Commands::Freshness { subcommand } => cmd::freshness::run(&root, subcommand, cli.json),
        Commands::Classify { code, message } => cmd::classify::run(code, &message, cli.json),
    };

    if let Err(e) = result {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
