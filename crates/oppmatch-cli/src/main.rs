use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use oppmatch_core::Category;
use oppmatch_pipeline::{PipelineConfig, ReconcileOutcome};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "ctl")]
#[command(about = "Opportunity match pipeline control")]
struct Cli {
    /// YAML configuration file (defaults to $OPPMATCH_CONFIG).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Process one queue batch event and print the partial-failure response.
    ProcessBatch {
        /// Batch event JSON file, or `-` for stdin.
        #[arg(long, default_value = "-")]
        event: String,
    },
    /// Run one reconciler tick.
    Reconcile,
    /// Run the reconciler on its cron schedule until interrupted.
    Schedule,
    /// Validate configuration and print the effective values.
    CheckConfig,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("OPPMATCH_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        registry.with(fmt::layer().with_writer(std::io::stderr)).init();
    }
}

async fn read_event(source: &str) -> Result<String> {
    if source == "-" {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("reading batch event from stdin")?;
        Ok(raw)
    } else {
        tokio::fs::read_to_string(source)
            .await
            .with_context(|| format!("reading batch event {source}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command.unwrap_or(Commands::CheckConfig) {
        Commands::ProcessBatch { event } => {
            let raw = read_event(&event).await?;
            let response = oppmatch_pipeline::process_batch_json(config_path, &raw).await?;
            info!(failed = response.batch_item_failures.len(), "batch processed");
            println!("{}", serde_json::to_string_pretty(&response)?);
        }
        Commands::Reconcile => match oppmatch_pipeline::reconcile_once(config_path).await? {
            ReconcileOutcome::Completed(report) => {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            ReconcileOutcome::Skipped(reason) => {
                eprintln!("reconcile skipped: {reason:?}");
            }
        },
        Commands::Schedule => {
            oppmatch_pipeline::run_scheduler(config_path).await?;
        }
        Commands::CheckConfig => {
            let config = PipelineConfig::load(config_path).context("configuration invalid")?;
            let categories = Category::ALL.map(|c| c.as_str()).join(", ");
            eprintln!(
                "configuration ok: threshold={} budget={}s visibility={}s categories=[{}]",
                config.match_threshold,
                config.timeouts.processing_budget_secs,
                config.queue.visibility_timeout_secs,
                categories
            );
            println!("{}", serde_yaml::to_string(&config)?);
        }
    }

    Ok(())
}
