// src/store/mod.rs

pub mod atomic;
pub mod codec;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use tracing::{debug, error, info, instrument, warn};

use crate::dataset::Dataset;
use crate::error::StoreError;

/// What to do when the artifact exists but cannot be decoded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum CorruptArtifactPolicy {
    /// Abort the run with [`StoreError::ArtifactRead`], leaving the file alone.
    #[default]
    Fail,
    /// Move the unreadable file aside and continue from an empty dataset.
    StartEmpty,
}

/// Where a loaded dataset came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOrigin {
    Missing,
    Existing,
    Recovered {
        reason: String,
        quarantined: Option<PathBuf>,
    },
}

#[derive(Debug)]
pub struct Loaded {
    pub dataset: Dataset,
    pub origin: LoadOrigin,
}

#[derive(Debug)]
pub struct Merged {
    pub dataset: Dataset,
    pub duplicates_removed: usize,
}

/// Owner of the single persisted cumulative dataset.
#[derive(Debug, Clone)]
pub struct Store {
    path: PathBuf,
    on_corrupt: CorruptArtifactPolicy,
    keep_backup: bool,
}

impl Store {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            on_corrupt: CorruptArtifactPolicy::default(),
            keep_backup: false,
        }
    }

    pub fn with_corrupt_policy(mut self, policy: CorruptArtifactPolicy) -> Self {
        self.on_corrupt = policy;
        self
    }

    pub fn with_backup(mut self, keep_backup: bool) -> Self {
        self.keep_backup = keep_backup;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the artifact, or start from an empty dataset if there is none yet.
    #[instrument(level = "info", skip(self), fields(artifact = %self.path.display()))]
    pub fn load(&self) -> Result<Loaded, StoreError> {
        match fs::metadata(&self.path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                info!("no existing artifact; starting empty");
                return Ok(Loaded {
                    dataset: Dataset::new(),
                    origin: LoadOrigin::Missing,
                });
            }
            _ => {}
        }

        match codec::read_dataset(&self.path) {
            Ok(dataset) => {
                info!(
                    rows = dataset.len(),
                    columns = dataset.columns().len(),
                    "loaded artifact"
                );
                Ok(Loaded {
                    dataset,
                    origin: LoadOrigin::Existing,
                })
            }
            Err(e) => match self.on_corrupt {
                CorruptArtifactPolicy::Fail => {
                    error!(error = %format!("{:#}", e), "artifact unreadable; refusing to continue");
                    Err(StoreError::ArtifactRead {
                        path: self.path.clone(),
                        source: e.into(),
                    })
                }
                CorruptArtifactPolicy::StartEmpty => {
                    let reason = format!("{:#}", e);
                    warn!(error = %reason, "artifact unreadable; starting from an empty dataset");
                    let quarantined = self.quarantine();
                    Ok(Loaded {
                        dataset: Dataset::new(),
                        origin: LoadOrigin::Recovered {
                            reason,
                            quarantined,
                        },
                    })
                }
            },
        }
    }

    /// Append `incoming` after `existing` and drop repeated rows, first occurrence wins.
    pub fn merge(existing: Dataset, incoming: Dataset) -> Merged {
        let mut dataset = Dataset::concat(vec![existing, incoming]);
        let duplicates_removed = dataset.dedup();
        debug!(rows = dataset.len(), duplicates_removed, "merged");
        Merged {
            dataset,
            duplicates_removed,
        }
    }

    /// Atomically replace the artifact with `dataset`.
    #[instrument(level = "info", skip(self, dataset), fields(artifact = %self.path.display(), rows = dataset.len()))]
    pub fn save(&self, dataset: &Dataset) -> Result<(), StoreError> {
        if dataset.columns().is_empty() {
            debug!("dataset has no columns; nothing to persist");
            return Ok(());
        }

        atomic::write_atomic(&self.path, self.keep_backup, |file| {
            codec::write_dataset(dataset, file)
        })
        .map_err(|e| {
            error!(error = %format!("{:#}", e), "artifact write failed");
            StoreError::ArtifactWrite {
                path: self.path.clone(),
                unpersisted_rows: dataset.len(),
                source: e.into(),
            }
        })?;

        info!("saved artifact");
        Ok(())
    }

    fn quarantine(&self) -> Option<PathBuf> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ").to_string();
        let target = atomic::with_suffix(&self.path, &format!(".corrupt-{}", stamp));
        match fs::rename(&self.path, &target) {
            Ok(()) => {
                warn!(moved_to = %target.display(), "quarantined unreadable artifact");
                Some(target)
            }
            Err(e) => {
                warn!(error = %e, "could not move unreadable artifact aside; it will be overwritten");
                None
            }
        }
    }
}
