//! yield-scout - multi-chain yield pool aggregator
//!
//! Ranks yield pools across chains by a risk-adjusted score and vets tokens
//! before they enter the pool universe.

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::error;

// Use the library crate
use yield_scout::cli::commands;
use yield_scout::config::Config;

/// Multi-chain yield pool aggregator
#[derive(Parser)]
#[command(name = "yield-scout")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "config.toml", env = "YIELD_SCOUT_CONFIG")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch, rank and publish pools
    Run {
        /// Repeat every N seconds until interrupted
        #[arg(long, value_name = "SECS")]
        interval: Option<u64>,

        /// Print the ranked list to stdout instead of the output file
        #[arg(long)]
        stdout: bool,
    },

    /// Vet a token against the liquidity, volume and holder thresholds
    Vet {
        /// Token contract address
        address: String,

        /// Chain the token lives on
        #[arg(long, default_value = "ethereum")]
        chain: String,

        /// Bypass the verdict cache
        #[arg(long)]
        no_cache: bool,
    },

    /// Look up a token address by symbol or name
    Discover {
        /// Symbol or name, e.g. "USDC"
        query: String,

        #[arg(long, default_value = "ethereum")]
        chain: String,

        /// Vet the discovered token
        #[arg(long)]
        vet: bool,
    },

    /// Show current configuration (secrets masked)
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    // Initialize tracing
    let default_directive = "yield_scout=info"
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid log directive: {}", e))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(default_directive),
        )
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = match Config::load(&cli.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    // Execute command
    let result = match cli.command {
        Commands::Run { interval, stdout } => commands::run(&config, interval, stdout).await,
        Commands::Vet {
            address,
            chain,
            no_cache,
        } => commands::vet(&config, &address, &chain, no_cache).await,
        Commands::Discover { query, chain, vet } => {
            commands::discover(&config, &query, &chain, vet).await
        }
        Commands::Config => commands::show_config(&config),
    };

    if let Err(e) = result {
        error!("Command failed: {:#}", e);
        std::process::exit(1);
    }

    Ok(())
}
