//! pilot: run LLM-driven browser test sessions from the command line

mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "pilot")]
#[command(about = "Agent execution engine for LLM-driven browser tests", version)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one session from a prompt
    Run {
        /// What the agent should test
        prompt: Vec<String>,

        /// Unit under test; enables setup/teardown chains and saves proven steps
        #[arg(short, long)]
        unit: Option<String>,

        /// User the session runs for, stored on the session record
        #[arg(long)]
        user: Option<String>,

        /// Tenant the session runs for, stored on the session record
        #[arg(long)]
        tenant: Option<String>,

        /// Step budget (overrides config)
        #[arg(long)]
        max_steps: Option<u64>,

        /// Print events as JSON lines
        #[arg(long)]
        json: bool,
    },

    /// Show a unit's resolved setup and teardown chain
    Resolve {
        /// Unit id
        unit: String,
    },

    /// Replay a unit's proven steps without the LLM
    Replay {
        /// Unit id
        unit: String,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run several units and record the outcomes under one run id
    Batch {
        /// Unit ids
        #[arg(required = true)]
        units: Vec<String>,

        /// Run all units concurrently
        #[arg(long)]
        parallel: bool,

        /// Run id (generated when omitted)
        #[arg(long)]
        run_id: Option<String>,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Subcommand)]
enum ConfigAction {
    /// Write a default configuration file
    Init {
        /// Write ./pilot.toml instead of the user config
        #[arg(long)]
        local: bool,
    },
    /// Print the effective configuration
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if cli.verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::new("warn"),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Run {
            prompt,
            unit,
            user,
            tenant,
            max_steps,
            json,
        } => {
            let options = commands::RunOptions {
                unit,
                user,
                tenant,
                max_steps,
                json,
            };
            commands::run(&prompt.join(" "), options).await
        }
        Commands::Resolve { unit } => commands::resolve(&unit),
        Commands::Replay { unit, json } => commands::replay(&unit, json).await,
        Commands::Batch {
            units,
            parallel,
            run_id,
        } => commands::batch(units, parallel, run_id).await,
        Commands::Config { action } => match action {
            ConfigAction::Init { local } => commands::config_init(local),
            ConfigAction::Show => commands::config_show(),
        },
    }
}
