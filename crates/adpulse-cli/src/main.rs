use adpulse_core::ReportingPeriod;
use adpulse_sync::{build_scheduler, PipelineConfig, RunOptions, SyncPipeline};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adpulse-cli")]
#[command(about = "Daily ad performance summaries from shared spreadsheets")]
struct Cli {
    /// Capture messages in the log instead of posting them.
    #[arg(long, global = true)]
    dry_run: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// One pass over the registry for today or `--date`.
    Run {
        #[arg(long)]
        site: Option<String>,
        /// DD/MM or DD/MM/YYYY.
        #[arg(long)]
        date: Option<String>,
    },
    /// Replay every tab of a site, skipping days already delivered.
    Backfill {
        #[arg(long)]
        site: String,
    },
    /// Run on the configured cron schedule until interrupted.
    Schedule,
    /// Print the header row of a site's current tab next to its column mapping.
    Inspect {
        #[arg(long)]
        site_id: u32,
        #[arg(long, requires = "year")]
        month: Option<u32>,
        #[arg(long, requires = "month")]
        year: Option<i32>,
    },
    /// List the tabs of a site's spreadsheet.
    Tabs {
        #[arg(long)]
        site: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = PipelineConfig::from_env();
    config.dry_run |= cli.dry_run;

    match cli.command.unwrap_or(Commands::Run {
        site: None,
        date: None,
    }) {
        Commands::Run { site, date } => {
            let mut pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.run_once(&RunOptions { site, date }).await?;
            print_json(&summary)?;
        }
        Commands::Backfill { site } => {
            let mut pipeline = SyncPipeline::from_config(config).await?;
            let summary = pipeline.backfill(&site).await?;
            print_json(&summary)?;
        }
        Commands::Schedule => {
            let cron = config.schedule_cron.clone();
            let sched = build_scheduler(config).await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %cron, "scheduler running, ctrl-c to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for shutdown signal")?;
            info!("shutting down");
        }
        Commands::Inspect {
            site_id,
            month,
            year,
        } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            let period = month.zip(year).map(|(m, y)| ReportingPeriod::new(m, y));
            let report = pipeline.inspect(site_id, period).await?;
            print_json(&report)?;
        }
        Commands::Tabs { site } => {
            let pipeline = SyncPipeline::from_config(config).await?;
            for tab in pipeline.list_tabs(&site).await? {
                println!("{}\t{}", tab.id, tab.name);
            }
        }
    }

    Ok(())
}
