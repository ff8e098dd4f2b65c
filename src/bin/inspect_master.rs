use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use stockscraper::{config::Config, history::Ledger, ingest::PROVENANCE_COLUMN};

/// Print what the cumulative artifact holds.
#[derive(Parser, Debug)]
#[command(name = "inspect_master")]
struct Args {
    /// Artifact to inspect (default: the configured artifact).
    artifact: Option<PathBuf>,
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let cfg = Config::load(args.config.as_deref())?;
    let artifact = args.artifact.unwrap_or_else(|| cfg.artifact.clone());

    // 1) load through the store so the corrupt-artifact policy applies
    let loaded = cfg.store.store(&artifact).load()?;
    let ds = loaded.dataset;

    println!("=== Artifact: {} ({:?}) ===", artifact.display(), loaded.origin);
    println!("Total rows:      {}", ds.len());
    println!("Columns:         {}", ds.columns().len());
    println!();

    // 2) schema
    println!("=== Columns ===");
    for col in ds.columns() {
        println!("- {:<30} | {}", col.name, col.kind.as_str());
    }
    println!();

    // 3) provenance
    println!("=== Rows per {} ===", PROVENANCE_COLUMN);
    for (file, rows) in ds.count_by(PROVENANCE_COLUMN) {
        println!("{:<40} {:>10}", file, rows);
    }
    println!();

    // 4) ledger
    let ledger = Ledger::load(Ledger::path_for(&artifact));
    println!("Ledger entries:  {}", ledger.len());
    Ok(())
}
