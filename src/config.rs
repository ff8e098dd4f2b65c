// src/config.rs

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
};
use tracing::info;

use crate::fetch::FetchConfig;
use crate::ingest::Ingestor;
use crate::store::{CorruptArtifactPolicy, Store};

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "stockscraper.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Where raw files are dropped by the fetch step.
    pub staging_dir: PathBuf,
    /// The cumulative dataset.
    pub artifact: PathBuf,
    pub ingest: IngestConfig,
    pub store: StoreConfig,
    pub fetch: FetchConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            staging_dir: PathBuf::from("StockData"),
            artifact: PathBuf::from("stock_master.parquet"),
            ingest: IngestConfig::default(),
            store: StoreConfig::default(),
            fetch: FetchConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    pub extension: String,
    pub delimiter: char,
    /// Parser threads; rayon's global pool when unset.
    pub parse_threads: Option<usize>,
    /// Keep a ledger of ingested files so unchanged files are not parsed again.
    pub track_ingested: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            extension: "csv".to_string(),
            delimiter: ',',
            parse_threads: None,
            track_ingested: true,
        }
    }
}

impl IngestConfig {
    pub fn ingestor(&self) -> Result<Ingestor> {
        if !self.delimiter.is_ascii() {
            bail!("delimiter {:?} must be a single ASCII character", self.delimiter);
        }
        Ok(Ingestor::new()
            .with_extension(self.extension.as_str())
            .with_delimiter(self.delimiter as u8)
            .with_threads(self.parse_threads))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub on_corrupt: CorruptArtifactPolicy,
    /// Copy the previous artifact to `<artifact>.bak` before replacing it.
    pub keep_backup: bool,
}

impl StoreConfig {
    pub fn store(&self, artifact: impl Into<PathBuf>) -> Store {
        Store::new(artifact)
            .with_corrupt_policy(self.on_corrupt)
            .with_backup(self.keep_backup)
    }
}

impl Config {
    pub fn from_yaml(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing configuration")
    }

    /// Read `path`, or `stockscraper.yaml` if it exists, or fall back to defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.is_file() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let text = fs::read_to_string(&path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg = Self::from_yaml(&text).with_context(|| format!("in {}", path.display()))?;
        info!(config = %path.display(), "loaded configuration");
        Ok(cfg)
    }
}
