// src/pipeline.rs

use anyhow::{Context, Result};
use serde::Serialize;
use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::StoreError;
use crate::history::{file_name, FileStamp, Ledger};
use crate::ingest::{FileError, Ingestor};
use crate::store::{CorruptArtifactPolicy, LoadOrigin, Store};

/// Everything one "ingest now" run needs.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub staging_dir: PathBuf,
    pub artifact: PathBuf,
    pub ingestor: Ingestor,
    pub on_corrupt: CorruptArtifactPolicy,
    pub keep_backup: bool,
    /// Skip files the ledger says are already in the artifact.
    pub track_ingested: bool,
    /// Parse every file regardless of the ledger.
    pub rescan: bool,
}

impl IngestOptions {
    pub fn new(staging_dir: impl Into<PathBuf>, artifact: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            artifact: artifact.into(),
            ingestor: Ingestor::default(),
            on_corrupt: CorruptArtifactPolicy::default(),
            keep_backup: false,
            track_ingested: true,
            rescan: false,
        }
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        Ok(Self {
            staging_dir: cfg.staging_dir.clone(),
            artifact: cfg.artifact.clone(),
            ingestor: cfg.ingest.ingestor()?,
            on_corrupt: cfg.store.on_corrupt,
            keep_backup: cfg.store.keep_backup,
            track_ingested: cfg.ingest.track_ingested,
            rescan: false,
        })
    }

    fn store(&self) -> Store {
        Store::new(&self.artifact)
            .with_corrupt_policy(self.on_corrupt)
            .with_backup(self.keep_backup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Every discovered file was ingested and the artifact is up to date.
    Success,
    /// The artifact is up to date but some files were skipped.
    Partial,
    /// The artifact could not be read or written.
    Failed,
}

impl RunStatus {
    pub fn exit_code(self) -> u8 {
        match self {
            RunStatus::Success => 0,
            RunStatus::Failed => 1,
            RunStatus::Partial => 2,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Fatal {
    pub kind: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unpersisted_rows: Option<usize>,
}

impl Fatal {
    fn from_error(e: &anyhow::Error) -> Self {
        let store_err = e.downcast_ref::<StoreError>();
        Self {
            kind: store_err.map_or("ingest", StoreError::kind),
            message: format!("{:#}", e),
            unpersisted_rows: store_err.and_then(StoreError::unpersisted_rows),
        }
    }
}

/// Outcome of one run, printed for the caller.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub artifact: PathBuf,
    pub rows_read: usize,
    pub rows_added: usize,
    pub duplicates_removed: usize,
    pub total_rows: usize,
    pub files_discovered: usize,
    pub files_ingested: usize,
    pub files_unchanged: usize,
    pub errors: Vec<FileError>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovered_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fatal: Option<Fatal>,
}

impl RunSummary {
    fn new(artifact: &Path) -> Self {
        Self {
            status: RunStatus::Success,
            artifact: artifact.to_path_buf(),
            rows_read: 0,
            rows_added: 0,
            duplicates_removed: 0,
            total_rows: 0,
            files_discovered: 0,
            files_ingested: 0,
            files_unchanged: 0,
            errors: Vec::new(),
            recovered_from: None,
            fatal: None,
        }
    }
}

/// Fold the staging directory into the artifact: load, parse, merge, save.
///
/// Never panics on bad input; the returned summary carries the status and
/// every per-file error or the fatal error that stopped the run.
#[instrument(level = "info", skip(opts), fields(staging = %opts.staging_dir.display(), artifact = %opts.artifact.display()))]
pub fn ingest_now(opts: &IngestOptions) -> RunSummary {
    let start = Instant::now();
    let mut summary = RunSummary::new(&opts.artifact);

    match execute(opts, &mut summary) {
        Ok(()) => {
            summary.status = if summary.errors.is_empty() {
                RunStatus::Success
            } else {
                RunStatus::Partial
            };
            info!(
                status = ?summary.status,
                rows_read = summary.rows_read,
                rows_added = summary.rows_added,
                duplicates_removed = summary.duplicates_removed,
                total_rows = summary.total_rows,
                skipped_files = summary.errors.len(),
                elapsed = ?start.elapsed(),
                "ingest finished"
            );
        }
        Err(e) => {
            let fatal = Fatal::from_error(&e);
            error!(kind = fatal.kind, error = %fatal.message, "ingest failed");
            summary.status = RunStatus::Failed;
            summary.fatal = Some(fatal);
        }
    }
    summary
}

fn execute(opts: &IngestOptions, summary: &mut RunSummary) -> Result<()> {
    let store = opts.store();

    // ─── 1) prior state ──────────────────────────────────────────────
    let loaded = store.load()?;
    if let LoadOrigin::Recovered { reason, .. } = &loaded.origin {
        summary.recovered_from = Some(reason.clone());
    }

    // ─── 2) discover + skip files already folded in ──────────────────
    let paths = opts.ingestor.discover(&opts.staging_dir)?;
    summary.files_discovered = paths.len();

    let ledger_path = Ledger::path_for(&opts.artifact);
    let mut ledger = if opts.track_ingested && !opts.rescan && loaded.origin == LoadOrigin::Existing
    {
        Ledger::load(&ledger_path)
    } else {
        // without the prior rows the ledger cannot be trusted
        Ledger::empty(&ledger_path)
    };

    let mut stamps: HashMap<PathBuf, FileStamp> = HashMap::new();
    let mut pending = Vec::with_capacity(paths.len());
    for path in paths {
        match FileStamp::of(&path) {
            Ok(stamp) if ledger.is_unchanged(&stamp) => {
                debug!(file = %stamp.filename, "unchanged since last ingest");
                summary.files_unchanged += 1;
            }
            Ok(stamp) => {
                stamps.insert(path.clone(), stamp);
                pending.push(path);
            }
            Err(e) => {
                debug!(file = %file_name(&path), error = %e, "no file stamp; parsing anyway");
                pending.push(path);
            }
        }
    }

    // ─── 3) parse ────────────────────────────────────────────────────
    let ingested = opts.ingestor.ingest_files(&pending);
    summary.rows_read = ingested.dataset.len();
    summary.files_ingested = ingested.files.len();
    summary.errors = ingested.errors;

    // ─── 4) merge ────────────────────────────────────────────────────
    let rows_before = loaded.dataset.len();
    let columns_before = loaded.dataset.columns().to_vec();
    let merged = Store::merge(loaded.dataset, ingested.dataset);
    summary.duplicates_removed = merged.duplicates_removed;
    summary.total_rows = merged.dataset.len();
    summary.rows_added = summary.total_rows.saturating_sub(rows_before);

    // ─── 5) persist ──────────────────────────────────────────────────
    let unchanged = loaded.origin == LoadOrigin::Existing
        && summary.total_rows == rows_before
        && merged.dataset.columns() == columns_before.as_slice();
    if unchanged {
        info!(rows = summary.total_rows, "no new rows; artifact left as is");
    } else {
        store.save(&merged.dataset)?;
    }

    // ─── 6) ledger, only once the rows are safely on disk ────────────
    if opts.track_ingested && opts.artifact.is_file() {
        for report in &ingested.files {
            if let Some(stamp) = stamps.remove(&report.path) {
                ledger.record(stamp, report.rows as u64);
            }
        }
        if let Err(e) = ledger.save() {
            warn!(error = %format!("{:#}", e), "could not update ledger; files will be parsed again next run");
        }
    }

    Ok(())
}

/// Convenience wrapper used by the CLI: options from config, then run.
pub fn ingest_with_config(cfg: &Config, rescan: bool) -> Result<RunSummary> {
    let mut opts = IngestOptions::from_config(cfg).context("invalid ingest configuration")?;
    opts.rescan = rescan;
    Ok(ingest_now(&opts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::Value;
    use crate::ingest::PROVENANCE_COLUMN;
    use std::fs;
    use tempfile::{tempdir, TempDir};

    struct Fixture {
        _dir: TempDir,
        staging: PathBuf,
        artifact: PathBuf,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempdir().unwrap();
            let staging = dir.path().join("StockData");
            fs::create_dir(&staging).unwrap();
            let artifact = dir.path().join("stock_master.parquet");
            Self {
                _dir: dir,
                staging,
                artifact,
            }
        }

        fn write(&self, name: &str, body: &str) {
            fs::write(self.staging.join(name), body).unwrap();
        }

        fn opts(&self) -> IngestOptions {
            IngestOptions::new(&self.staging, &self.artifact)
        }

        fn stored_rows(&self) -> usize {
            Store::new(&self.artifact).load().unwrap().dataset.len()
        }
    }

    const DAY1: &str = "SYMBOL,CLOSE\nINFY,1523.45\nTCS,3890.1\n";
    const DAY2: &str = "SYMBOL,CLOSE\nINFY,1530\nTCS,3901.5\nWIPRO,455.2\n";

    #[test]
    fn test_first_run_then_rerun_keeps_five_rows() {
        let fx = Fixture::new();
        fx.write("2024-01-01.csv", DAY1);
        fx.write("2024-01-02.csv", DAY2);

        let first = ingest_now(&fx.opts());
        assert_eq!(first.status, RunStatus::Success);
        assert_eq!(first.rows_read, 5);
        assert_eq!(first.rows_added, 5);
        assert_eq!(first.duplicates_removed, 0);
        assert_eq!(fx.stored_rows(), 5);

        // ledger skips both files
        let second = ingest_now(&fx.opts());
        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(second.files_unchanged, 2);
        assert_eq!(second.rows_read, 0);
        assert_eq!(second.total_rows, 5);

        // full rescan collapses the whole batch into existing rows
        let mut opts = fx.opts();
        opts.rescan = true;
        let third = ingest_now(&opts);
        assert_eq!(third.rows_read, 5);
        assert_eq!(third.duplicates_removed, 5);
        assert_eq!(third.rows_added, 0);
        assert_eq!(fx.stored_rows(), 5);
    }

    #[test]
    fn test_idempotent_without_ledger() {
        let fx = Fixture::new();
        fx.write("2024-01-01.csv", DAY1);
        let mut opts = fx.opts();
        opts.track_ingested = false;

        ingest_now(&opts);
        let before = Store::new(&fx.artifact).load().unwrap().dataset;
        let again = ingest_now(&opts);
        let after = Store::new(&fx.artifact).load().unwrap().dataset;
        assert_eq!(again.duplicates_removed, 2);
        assert_eq!(before, after);
        assert!(!Ledger::path_for(&fx.artifact).exists());
    }

    #[test]
    fn test_same_content_under_two_names_is_kept_twice() {
        let fx = Fixture::new();
        fx.write("2024-01-01.csv", DAY1);
        fx.write("2024-01-01_copy.csv", DAY1);

        let summary = ingest_now(&fx.opts());
        assert_eq!(summary.total_rows, 4);
        assert_eq!(summary.duplicates_removed, 0);

        let ds = Store::new(&fx.artifact).load().unwrap().dataset;
        let per_file = ds.count_by(PROVENANCE_COLUMN);
        assert_eq!(
            per_file,
            vec![
                (Value::from("2024-01-01.csv"), 2),
                (Value::from("2024-01-01_copy.csv"), 2)
            ]
        );
    }

    #[test]
    fn test_rows_accumulate_after_raw_files_are_deleted() {
        let fx = Fixture::new();
        fx.write("2024-01-01.csv", DAY1);
        ingest_now(&fx.opts());
        let after_first = fx.stored_rows();

        fs::remove_file(fx.staging.join("2024-01-01.csv")).unwrap();
        fx.write("2024-01-02.csv", DAY2);
        let summary = ingest_now(&fx.opts());

        assert_eq!(summary.rows_added, 3);
        assert!(fx.stored_rows() >= after_first);
        assert_eq!(fx.stored_rows(), 5);
    }

    #[test]
    fn test_one_malformed_file_gives_partial_success() {
        let fx = Fixture::new();
        fx.write("a.csv", DAY1);
        fx.write("b.csv", DAY2);
        fx.write("c.csv", "SYMBOL,CLOSE\nINFY,1,extra\n");

        let summary = ingest_now(&fx.opts());
        assert_eq!(summary.status, RunStatus::Partial);
        assert_eq!(summary.status.exit_code(), 2);
        assert_eq!(summary.total_rows, 5);
        assert_eq!(summary.errors.len(), 1);
        assert_eq!(summary.errors[0].file, "c.csv");
        assert_eq!(fx.stored_rows(), 5);

        // the bad file is not in the ledger, so it is retried once fixed
        fx.write("c.csv", "SYMBOL,CLOSE\nHDFC,1650\n");
        let retry = ingest_now(&fx.opts());
        assert_eq!(retry.status, RunStatus::Success);
        assert_eq!(retry.files_unchanged, 2);
        assert_eq!(retry.rows_added, 1);
    }

    #[test]
    fn test_changed_file_is_parsed_again() {
        let fx = Fixture::new();
        fx.write("2024-01-01.csv", DAY1);
        ingest_now(&fx.opts());

        // republished with an extra row; size changes so the ledger misses
        fx.write("2024-01-01.csv", "SYMBOL,CLOSE\nINFY,1523.45\nTCS,3890.1\nHDFC,1650\n");
        let summary = ingest_now(&fx.opts());
        assert_eq!(summary.files_unchanged, 0);
        assert_eq!(summary.duplicates_removed, 2);
        assert_eq!(summary.rows_added, 1);
    }

    #[test]
    fn test_empty_staging_dir() {
        let fx = Fixture::new();
        let summary = ingest_now(&fx.opts());
        assert_eq!(summary.status, RunStatus::Success);
        assert_eq!(summary.total_rows, 0);
        assert!(!fx.artifact.exists());
        assert!(!Ledger::path_for(&fx.artifact).exists());

        // unparsable files alone leave nothing behind either
        fx.write("bad.csv", "");
        let summary = ingest_now(&fx.opts());
        assert_eq!(summary.status, RunStatus::Partial);
        assert!(!fx.artifact.exists());
        assert!(!Ledger::path_for(&fx.artifact).exists());
    }

    #[test]
    fn test_large_ints_survive_a_later_decimal() {
        let fx = Fixture::new();
        fx.write("a.csv", "K,V\nX,9007199254740993\nX,9007199254740992\n");
        assert_eq!(ingest_now(&fx.opts()).total_rows, 2);

        fx.write("b.csv", "K,V\nY,1.5\n");
        let second = ingest_now(&fx.opts());
        assert_eq!(second.status, RunStatus::Success);
        assert_eq!(second.total_rows, 3);
        assert_eq!(second.rows_added, 1);
        assert_eq!(second.duplicates_removed, 0);
        assert_eq!(fx.stored_rows(), 3);
    }

    #[test]
    fn test_whitespace_distinct_rows_are_both_kept() {
        let fx = Fixture::new();
        fx.write("a.csv", "SYMBOL,SERIES\nINFY,EQ\nINFY, EQ\n");
        let summary = ingest_now(&fx.opts());
        assert_eq!(summary.rows_read, 2);
        assert_eq!(summary.duplicates_removed, 0);
        assert_eq!(fx.stored_rows(), 2);
    }

    #[test]
    fn test_corrupt_artifact_fails_run_and_is_kept() {
        let fx = Fixture::new();
        fx.write("a.csv", DAY1);
        fs::write(&fx.artifact, b"not parquet").unwrap();

        let summary = ingest_now(&fx.opts());
        assert_eq!(summary.status, RunStatus::Failed);
        assert_eq!(summary.status.exit_code(), 1);
        assert_eq!(summary.fatal.as_ref().map(|f| f.kind), Some("artifact_read"));
        assert_eq!(fs::read(&fx.artifact).unwrap(), b"not parquet");
    }

    #[test]
    fn test_corrupt_artifact_start_empty_rebuilds_from_staging() {
        let fx = Fixture::new();
        fx.write("a.csv", DAY1);
        ingest_now(&fx.opts());
        fs::write(&fx.artifact, b"not parquet").unwrap();

        let mut opts = fx.opts();
        opts.on_corrupt = CorruptArtifactPolicy::StartEmpty;
        let summary = ingest_now(&opts);
        assert_eq!(summary.status, RunStatus::Success);
        assert!(summary.recovered_from.is_some());
        // ledger ignored: the file is parsed again and its rows restored
        assert_eq!(summary.files_unchanged, 0);
        assert_eq!(fx.stored_rows(), 2);
    }

    #[test]
    fn test_write_failure_maps_to_fatal() {
        let err = anyhow::Error::new(StoreError::ArtifactWrite {
            path: PathBuf::from("master.parquet"),
            unpersisted_rows: 7,
            source: "disk full".into(),
        });
        let fatal = Fatal::from_error(&err);
        assert_eq!(fatal.kind, "artifact_write");
        assert_eq!(fatal.unpersisted_rows, Some(7));
        assert!(fatal.message.contains("disk full"));

        let other = Fatal::from_error(&anyhow::anyhow!("bad glob"));
        assert_eq!(other.kind, "ingest");
        assert_eq!(other.unpersisted_rows, None);
    }

    #[test]
    fn test_schema_drift_across_days() {
        let fx = Fixture::new();
        fx.write("2024-01-01.csv", "SYMBOL,CLOSE\nINFY,1523.45\n");
        fx.write("2024-01-02.csv", "SYMBOL,CLOSE,DELIV_QTY\nINFY,1530,120\n");

        let summary = ingest_now(&fx.opts());
        assert_eq!(summary.status, RunStatus::Success);
        let ds = Store::new(&fx.artifact).load().unwrap().dataset;
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.row(0).unwrap().get("DELIV_QTY"), Some(&Value::Null));
        assert_eq!(ds.row(1).unwrap().get("CLOSE"), Some(&Value::Float(1530.0)));
    }

    #[test]
    fn test_summary_serializes_for_the_cli() {
        let fx = Fixture::new();
        fx.write("a.csv", "x\n1\n");
        fx.write("b.csv", "");
        let summary = ingest_now(&fx.opts());
        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["status"], "partial");
        assert_eq!(json["errors"][0]["file"], "b.csv");
        assert!(json.get("fatal").is_none());
    }
}
