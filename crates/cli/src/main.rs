//! Vertical scaler CLI
//!
//! Schedules, cancels and inspects deferred resizes and triggers scale
//! checks through the scaling agent's HTTP API.

mod client;
mod commands;
mod config;
mod output;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use commands::{check, health, schedules};

/// Vertical scaler CLI
#[derive(Parser)]
#[command(name = "vscale")]
#[command(author, version, about = "CLI for the vertical scaling agent", long_about = None)]
pub struct Cli {
    /// Agent API URL (falls back to the config file, then http://localhost:8080)
    #[arg(long, env = "VSCALE_API_URL", global = true)]
    pub api_url: Option<String>,

    /// Bearer token for scheduling endpoints
    #[arg(long, env = "VSCALE_TOKEN", global = true, hide_env_values = true)]
    pub token: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table", global = true)]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Schedule a resize for an instance
    Schedule {
        /// Instance identifier
        #[arg(long)]
        instance: String,

        /// Target size class
        #[arg(long)]
        target: String,

        /// Execution time: RFC 3339, or local YYYY-MM-DDTHH:MM[:SS] read in --tz
        #[arg(long)]
        at: String,

        /// Fixed UTC offset for a local --at time (e.g. +08:00, UTC)
        #[arg(long)]
        tz: Option<String>,
    },

    /// Cancel the pending schedule of an instance
    Cancel {
        /// Instance identifier
        #[arg(long)]
        instance: String,
    },

    /// Show the current schedule of an instance
    Show {
        /// Instance identifier
        #[arg(long)]
        instance: String,

        /// Show terminal records instead of the current one
        #[arg(long)]
        history: bool,
    },

    /// Run a scale check for an instance now
    Check {
        /// Instance identifier
        #[arg(long)]
        instance: String,
    },

    /// Show agent health
    Health,
}

async fn run(cli: Cli) -> Result<()> {
    let config = config::Config::load()?;
    let client = client::ApiClient::new(
        &config.resolve_api_url(cli.api_url),
        config.resolve_token(cli.token),
    )
    .context("Failed to create API client")?;

    match cli.command {
        Commands::Schedule {
            instance,
            target,
            at,
            tz,
        } => {
            let request = client::ScheduleRequest {
                instance_id: instance,
                target_size_class: target,
                execution_time: at,
                time_zone: config.resolve_time_zone(tz),
            };
            schedules::schedule(&client, request, cli.format).await?;
        }
        Commands::Cancel { instance } => {
            schedules::cancel(&client, &instance, cli.format).await?;
        }
        Commands::Show { instance, history } => {
            schedules::show(&client, &instance, history, cli.format).await?;
        }
        Commands::Check { instance } => {
            check::run_check(&client, &instance, cli.format).await?;
        }
        Commands::Health => {
            health::show_health(&client, cli.format).await?;
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
