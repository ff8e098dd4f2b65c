use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::{path::PathBuf, process::ExitCode};
use stockscraper::{
    config::Config,
    fetch,
    pipeline::{ingest_with_config, RunSummary},
    store::CorruptArtifactPolicy,
};
use tokio::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Incrementally fold daily market-data files into one cumulative Parquet dataset.
#[derive(Parser, Debug)]
#[command(name = "stockscraper", version)]
struct Cli {
    /// YAML configuration file (default: ./stockscraper.yaml if present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest every raw file in the staging directory into the artifact.
    Ingest(IngestArgs),
    /// Download new raw files into the staging directory.
    Fetch {
        #[arg(long)]
        staging: Option<PathBuf>,
    },
    /// Fetch, then ingest.
    Sync(IngestArgs),
}

#[derive(Args, Debug, Default)]
struct IngestArgs {
    /// Directory holding the raw files.
    #[arg(long)]
    staging: Option<PathBuf>,
    /// Path of the cumulative dataset.
    #[arg(long)]
    artifact: Option<PathBuf>,
    /// Parse every file again, ignoring the ingested-files ledger.
    #[arg(long)]
    rescan: bool,
    /// What to do when the artifact cannot be read.
    #[arg(long, value_enum)]
    on_corrupt: Option<CorruptArtifactPolicy>,
    /// Number of parser threads.
    #[arg(long)]
    threads: Option<usize>,
}

impl IngestArgs {
    fn apply(self, cfg: &mut Config) -> bool {
        if let Some(dir) = self.staging {
            cfg.staging_dir = dir;
        }
        if let Some(artifact) = self.artifact {
            cfg.artifact = artifact;
        }
        if let Some(policy) = self.on_corrupt {
            cfg.store.on_corrupt = policy;
        }
        if self.threads.is_some() {
            cfg.ingest.parse_threads = self.threads;
        }
        self.rescan
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    // ─── 1) init logging; stdout is reserved for the summary ─────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut cfg = Config::load(cli.config.as_deref())?;

    // ─── 2) dispatch ─────────────────────────────────────────────────
    match cli.command {
        Command::Fetch { staging } => {
            if let Some(dir) = staging {
                cfg.staging_dir = dir;
            }
            let summary = run_fetch(&cfg).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(ExitCode::SUCCESS)
        }
        Command::Ingest(args) => {
            let rescan = args.apply(&mut cfg);
            run_ingest(cfg, rescan).await
        }
        Command::Sync(args) => {
            let rescan = args.apply(&mut cfg);
            // the staging directory may already hold files worth ingesting
            if let Err(e) = run_fetch(&cfg).await {
                error!(error = %format!("{:#}", e), "fetch failed; ingesting what is staged");
            }
            run_ingest(cfg, rescan).await
        }
    }
}

async fn run_fetch(cfg: &Config) -> Result<fetch::FetchSummary> {
    let start = Instant::now();
    let client = fetch::build_client(&cfg.fetch)?;
    let summary = fetch::fetch_all(&client, &cfg.fetch, &cfg.staging_dir).await?;
    info!(elapsed = ?start.elapsed(), "fetch done");
    Ok(summary)
}

async fn run_ingest(cfg: Config, rescan: bool) -> Result<ExitCode> {
    // parsing and parquet I/O are blocking work
    let summary: RunSummary =
        tokio::task::spawn_blocking(move || ingest_with_config(&cfg, rescan))
            .await
            .context("ingest task panicked")??;

    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(ExitCode::from(summary.status.exit_code()))
}
