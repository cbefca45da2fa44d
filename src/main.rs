use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yeoul::commands;
use yeoul::config::Config;

#[derive(Parser)]
#[command(
    name = "yeoul",
    version,
    about = "Quota-aware content insight pipeline with tiered rate limiting",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to a TOML config file (environment variables otherwise)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json)
    #[arg(long, global = true, default_value = "text")]
    log_format: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until interrupted
    Run {
        /// Source ids to discover at startup
        #[arg(short, long)]
        source: Vec<String>,
    },

    /// Register source ids for the next run
    Discover {
        /// Source ids to register
        sources: Vec<String>,
    },

    /// Show content item statuses
    Status {
        /// Limit output to one content id
        content_id: Option<String>,
    },

    /// Show quota usage for the active tier
    Usage {
        /// Limit output to one model
        #[arg(short, long)]
        model: Option<String>,
    },

    /// Show recent quota violations
    Violations {
        /// Maximum records to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Reset an item to metadata_ready, purging its insight and research records
    Reset {
        /// Content id to reset
        content_id: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_tracing(&cli.log_format, cli.verbose)?;

    let config = match &cli.config {
        Some(path) => Config::from_file(std::path::Path::new(path))?,
        None => Config::from_env()?,
    };

    match cli.command {
        Commands::Run { source } => {
            tracing::info!(sources = source.len(), "starting pipeline");
            commands::run(config, source).await?;
        }

        Commands::Discover { sources } => {
            commands::discover(&config, &sources)?;
        }

        Commands::Status { content_id } => {
            commands::status(&config, content_id.as_deref())?;
        }

        Commands::Usage { model } => {
            commands::usage(&config, model.as_deref())?;
        }

        Commands::Violations { limit } => {
            commands::violations(&config, limit)?;
        }

        Commands::Reset { content_id } => {
            commands::reset(&config, &content_id)?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
        }
        _ => {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .try_init()
                .map_err(|e| anyhow::anyhow!("Failed to initialize tracing: {e}"))?;
        }
    }

    Ok(())
}
