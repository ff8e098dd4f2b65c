// src/history/mod.rs

use anyhow::{Context, Result};
use arrow::{
    array::{Array, ArrayRef, StringArray, TimestampMicrosecondArray, UInt64Array},
    datatypes::{DataType as ArrowDataType, Field, Schema as ArrowSchema, TimeUnit},
    record_batch::RecordBatch,
};
use chrono::{DateTime, Utc};
use parquet::arrow::{arrow_reader::ParquetRecordBatchReaderBuilder, ArrowWriter};
use std::{
    collections::BTreeMap,
    fs::{self, File},
    io::{self, BufWriter},
    path::{Path, PathBuf},
    sync::Arc,
};
use tracing::{debug, warn};

use crate::store::atomic::{with_suffix, write_atomic};

/// Identity of a raw file on disk at the time it was looked at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub filename: String,
    pub size_bytes: u64,
    pub modified: DateTime<Utc>,
}

impl FileStamp {
    pub fn of(path: &Path) -> Result<Self> {
        let meta =
            fs::metadata(path).with_context(|| format!("reading metadata of {}", path.display()))?;
        let modified = meta
            .modified()
            .with_context(|| format!("reading mtime of {}", path.display()))?;
        // the ledger stores microseconds, so compare at that precision
        Ok(Self {
            filename: file_name(path),
            size_bytes: meta.len(),
            modified: micros(DateTime::<Utc>::from(modified).timestamp_micros())?,
        })
    }
}

/// Base name of `path`, lossily converted to UTF-8.
pub fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// One ledger row: a raw file that has been folded into the artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestedFile {
    pub stamp: FileStamp,
    pub rows: u64,
    pub ingested_at: DateTime<Utc>,
}

/// Index of raw files already merged into the artifact, persisted beside it.
///
/// Only an optimisation: forgetting an entry just means the file gets parsed
/// again and its rows collapse into the existing ones during merge.
pub struct Ledger {
    path: PathBuf,
    entries: BTreeMap<String, IngestedFile>,
}

impl Ledger {
    /// Ledger location for a given artifact path.
    pub fn path_for(artifact: &Path) -> PathBuf {
        with_suffix(artifact, ".ingested.parquet")
    }

    pub fn empty(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Load the ledger at `path`. Missing or unreadable ledgers come back empty.
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match read_entries(&path) {
            Ok(entries) => {
                debug!(ledger = %path.display(), files = entries.len(), "loaded ledger");
                Self { path, entries }
            }
            Err(e)
                if e.downcast_ref::<io::Error>()
                    .is_some_and(|io| io.kind() == io::ErrorKind::NotFound) =>
            {
                Self::empty(path)
            }
            Err(e) => {
                warn!(ledger = %path.display(), error = %format!("{:#}", e), "ignoring unreadable ledger");
                Self::empty(path)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, filename: &str) -> Option<&IngestedFile> {
        self.entries.get(filename)
    }

    /// True when this exact file (name, size, mtime) was already ingested.
    pub fn is_unchanged(&self, stamp: &FileStamp) -> bool {
        self.entries
            .get(&stamp.filename)
            .is_some_and(|e| e.stamp == *stamp)
    }

    pub fn record(&mut self, stamp: FileStamp, rows: u64) {
        let entry = IngestedFile {
            stamp,
            rows,
            ingested_at: Utc::now(),
        };
        self.entries.insert(entry.stamp.filename.clone(), entry);
    }

    pub fn save(&self) -> Result<()> {
        let schema = Arc::new(schema());
        let batch = RecordBatch::try_new(schema.clone(), self.to_arrays())
            .context("building ledger record batch")?;
        write_atomic(&self.path, false, |file| {
            let mut writer = ArrowWriter::try_new(BufWriter::new(file), schema.clone(), None)
                .context("creating ArrowWriter for ledger")?;
            writer.write(&batch).context("writing ledger batch")?;
            writer.close().context("closing ledger writer")?;
            Ok(())
        })
        .with_context(|| format!("saving ledger {}", self.path.display()))
    }

    fn to_arrays(&self) -> Vec<ArrayRef> {
        let files = self.entries.values();
        vec![
            Arc::new(StringArray::from_iter_values(
                files.clone().map(|f| f.stamp.filename.as_str()),
            )),
            Arc::new(UInt64Array::from_iter_values(
                files.clone().map(|f| f.stamp.size_bytes),
            )),
            Arc::new(TimestampMicrosecondArray::from_iter_values(
                files.clone().map(|f| f.stamp.modified.timestamp_micros()),
            )),
            Arc::new(UInt64Array::from_iter_values(files.clone().map(|f| f.rows))),
            Arc::new(TimestampMicrosecondArray::from_iter_values(
                files.map(|f| f.ingested_at.timestamp_micros()),
            )),
        ]
    }
}

fn schema() -> ArrowSchema {
    ArrowSchema::new(vec![
        Field::new("filename", ArrowDataType::Utf8, false),
        Field::new("size_bytes", ArrowDataType::UInt64, false),
        Field::new(
            "modified",
            ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
        Field::new("rows", ArrowDataType::UInt64, false),
        Field::new(
            "ingested_at",
            ArrowDataType::Timestamp(TimeUnit::Microsecond, None),
            false,
        ),
    ])
}

fn read_entries(path: &Path) -> Result<BTreeMap<String, IngestedFile>> {
    let file = File::open(path)?;
    let mut reader = ParquetRecordBatchReaderBuilder::try_new(file)?
        .with_batch_size(1024)
        .build()?;

    let mut entries = BTreeMap::new();
    while let Some(batch) = reader.next().transpose()? {
        let names = column::<StringArray>(&batch, 0)?;
        let sizes = column::<UInt64Array>(&batch, 1)?;
        let modified = column::<TimestampMicrosecondArray>(&batch, 2)?;
        let rows = column::<UInt64Array>(&batch, 3)?;
        let ingested = column::<TimestampMicrosecondArray>(&batch, 4)?;

        for i in 0..batch.num_rows() {
            let entry = IngestedFile {
                stamp: FileStamp {
                    filename: names.value(i).to_string(),
                    size_bytes: sizes.value(i),
                    modified: micros(modified.value(i))?,
                },
                rows: rows.value(i),
                ingested_at: micros(ingested.value(i))?,
            };
            entries.insert(entry.stamp.filename.clone(), entry);
        }
    }
    Ok(entries)
}

fn column<T: Array + 'static>(batch: &RecordBatch, idx: usize) -> Result<&T> {
    anyhow::ensure!(idx < batch.num_columns(), "ledger is missing column {}", idx);
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<T>()
        .with_context(|| format!("ledger column {} has an unexpected type", idx))
}

fn micros(ts: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_micros(ts).with_context(|| format!("invalid timestamp {}", ts))
}
