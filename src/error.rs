//! Error types for the store and the ingestor.

use std::path::PathBuf;
use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reading or writing the cumulative artifact.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The artifact exists but could not be read or decoded.
    #[error("cannot read artifact {path}: {source}")]
    ArtifactRead {
        path: PathBuf,
        #[source]
        source: BoxError,
    },

    /// The merged dataset could not be persisted; the previous artifact is untouched.
    #[error("cannot write artifact {path} ({unpersisted_rows} merged rows not persisted): {source}")]
    ArtifactWrite {
        path: PathBuf,
        unpersisted_rows: usize,
        #[source]
        source: BoxError,
    },
}

impl StoreError {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreError::ArtifactRead { .. } => "artifact_read",
            StoreError::ArtifactWrite { .. } => "artifact_write",
        }
    }

    pub fn unpersisted_rows(&self) -> Option<usize> {
        match self {
            StoreError::ArtifactWrite {
                unpersisted_rows, ..
            } => Some(*unpersisted_rows),
            StoreError::ArtifactRead { .. } => None,
        }
    }
}

/// A single raw file that could not be turned into rows.
#[derive(Error, Debug)]
pub enum IngestError {
    #[error("cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed delimited data in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("{path} has no header row")]
    MissingHeader { path: PathBuf },

    #[error("cannot build rows from {path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}
