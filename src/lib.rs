pub mod config;
pub mod dataset;
pub mod error;
pub mod fetch;
pub mod history;
pub mod ingest;
pub mod pipeline;
pub mod store;

pub use config::Config;
pub use dataset::{Column, ColumnKind, Dataset, Value};
pub use error::{IngestError, StoreError};
pub use ingest::Ingestor;
pub use pipeline::{ingest_now, IngestOptions, RunStatus, RunSummary};
pub use store::{CorruptArtifactPolicy, Store};
