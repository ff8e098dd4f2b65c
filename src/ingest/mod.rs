// src/ingest/mod.rs

use anyhow::{Context, Result};
use csv::{ReaderBuilder, StringRecord, Trim};
use glob::{glob_with, MatchOptions, Pattern};
use rayon::prelude::*;
use serde::Serialize;
use std::{
    collections::HashSet,
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
    time::Instant,
};
use tracing::{debug, info, instrument, warn};

use crate::dataset::{ColumnKind, Dataset, Value};
use crate::error::IngestError;
use crate::history::file_name;

/// Column stamped on every ingested row with the raw file's base name.
pub const PROVENANCE_COLUMN: &str = "source_file";

/// A raw file that was parsed successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileReport {
    pub path: PathBuf,
    pub file: String,
    pub rows: usize,
}

/// A raw file that was skipped, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileError {
    pub file: String,
    pub reason: String,
}

/// Rows gathered from a batch of raw files, in discovery order.
#[derive(Debug, Default)]
pub struct Ingested {
    pub dataset: Dataset,
    pub files: Vec<FileReport>,
    pub errors: Vec<FileError>,
}

/// Turns a staging directory of delimited files into rows ready for merging.
#[derive(Debug, Clone)]
pub struct Ingestor {
    extension: String,
    delimiter: u8,
    threads: Option<usize>,
}

impl Default for Ingestor {
    fn default() -> Self {
        Self {
            extension: "csv".to_string(),
            delimiter: b',',
            threads: None,
        }
    }
}

impl Ingestor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = extension.into().trim_start_matches('.').to_string();
        self
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    /// Parse on a dedicated pool of `threads` workers instead of rayon's global pool.
    pub fn with_threads(mut self, threads: Option<usize>) -> Self {
        self.threads = threads.filter(|&n| n > 0);
        self
    }

    /// Raw files in `dir` with the configured extension, sorted by file name.
    /// A missing directory yields nothing.
    pub fn discover(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "staging directory does not exist; nothing to ingest");
            return Ok(Vec::new());
        }

        let pattern = format!(
            "{}/*.{}",
            Pattern::escape(&dir.to_string_lossy()),
            Pattern::escape(&self.extension)
        );
        let options = MatchOptions {
            case_sensitive: false,
            ..MatchOptions::default()
        };

        let mut paths = Vec::new();
        for entry in glob_with(&pattern, options)
            .with_context(|| format!("invalid discovery pattern {}", pattern))?
        {
            match entry {
                Ok(path) if path.is_file() => paths.push(path),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "cannot read staging entry"),
            }
        }
        paths.sort_by_key(|p| p.file_name().map(|n| n.to_os_string()));
        debug!(dir = %dir.display(), files = paths.len(), "discovered raw files");
        Ok(paths)
    }

    /// Parse one delimited file into rows, each stamped with its provenance.
    pub fn parse_one(&self, path: &Path) -> Result<Dataset, IngestError> {
        let file = File::open(path).map_err(|source| IngestError::Open {
            path: path.to_path_buf(),
            source,
        })?;
        let csv_err = |source| IngestError::Csv {
            path: path.to_path_buf(),
            source,
        };

        let mut rdr = ReaderBuilder::new()
            .delimiter(self.delimiter)
            .has_headers(true)
            .flexible(false)
            .trim(Trim::Headers)
            .from_reader(BufReader::new(file));

        let headers = rdr.headers().map_err(csv_err)?.clone();
        if headers.iter().all(str::is_empty) {
            return Err(IngestError::MissingHeader {
                path: path.to_path_buf(),
            });
        }

        let records = rdr
            .records()
            .collect::<Result<Vec<StringRecord>, csv::Error>>()
            .map_err(csv_err)?;

        let mut names = column_names(&headers);
        let kinds: Vec<ColumnKind> = (0..names.len())
            .map(|c| ColumnKind::infer(records.iter().map(|r| r.get(c).unwrap_or(""))))
            .collect();

        let source = file_name(path);
        let provenance = names.iter().position(|n| n == PROVENANCE_COLUMN);
        if provenance.is_none() {
            names.push(PROVENANCE_COLUMN.to_string());
        }

        let rows: Vec<Vec<Value>> = records
            .iter()
            .map(|record| {
                let mut row: Vec<Value> = record
                    .iter()
                    .zip(&kinds)
                    .map(|(field, &kind)| Value::parse_as(field, kind))
                    .collect();
                let stamp = Value::Text(source.clone());
                match provenance {
                    Some(idx) => row[idx] = stamp,
                    None => row.push(stamp),
                }
                row
            })
            .collect();

        Dataset::from_rows(names, rows).map_err(|e| IngestError::Invalid {
            path: path.to_path_buf(),
            reason: format!("{:#}", e),
        })
    }

    /// Discover and parse every raw file in `dir`.
    #[instrument(level = "info", skip(self, dir), fields(staging = %dir.display()))]
    pub fn ingest_all(&self, dir: &Path) -> Result<Ingested> {
        let paths = self.discover(dir)?;
        Ok(self.ingest_files(&paths))
    }

    /// Parse `paths` in parallel and concatenate the results in the given order.
    /// Files that fail to parse are logged, reported and left out.
    pub fn ingest_files(&self, paths: &[PathBuf]) -> Ingested {
        let start = Instant::now();
        let parse_all = || {
            paths
                .par_iter()
                .map(|p| self.parse_one(p))
                .collect::<Vec<_>>()
        };
        let results = match self.threads {
            Some(n) => match rayon::ThreadPoolBuilder::new().num_threads(n).build() {
                Ok(pool) => pool.install(parse_all),
                Err(e) => {
                    warn!(error = %e, "could not build parse pool; using the global pool");
                    parse_all()
                }
            },
            None => parse_all(),
        };

        let mut out = Ingested::default();
        let mut parts = Vec::with_capacity(paths.len());
        for (path, result) in paths.iter().zip(results) {
            let name = file_name(path);
            match result {
                Ok(dataset) => {
                    info!(file = %name, rows = dataset.len(), "parsed");
                    out.files.push(FileReport {
                        path: path.clone(),
                        file: name,
                        rows: dataset.len(),
                    });
                    parts.push(dataset);
                }
                Err(e) => {
                    warn!(file = %name, error = %e, "skipping unparsable file");
                    out.errors.push(FileError {
                        file: name,
                        reason: e.to_string(),
                    });
                }
            }
        }
        out.dataset = Dataset::concat(parts);

        info!(
            files = out.files.len(),
            skipped = out.errors.len(),
            rows = out.dataset.len(),
            elapsed = ?start.elapsed(),
            "ingested raw files"
        );
        out
    }
}

/// Header names made unique: blanks become `unnamed_<idx>`, repeats get `.1`, `.2`, ...
fn column_names(headers: &StringRecord) -> Vec<String> {
    let mut seen = HashSet::new();
    headers
        .iter()
        .enumerate()
        .map(|(idx, h)| {
            let base = if h.is_empty() {
                format!("unnamed_{}", idx)
            } else {
                h.to_string()
            };
            let mut name = base.clone();
            let mut n = 0;
            while seen.contains(&name) {
                n += 1;
                name = format!("{}.{}", base, n);
            }
            seen.insert(name.clone());
            name
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const DAY1: &str = "SYMBOL, SERIES, CLOSE_PRICE, TTL_TRD_QNTY\n\
                        INFY, EQ, 1523.45, 900\n\
                        TCS, EQ, 3890.10, 1200\n";

    #[test]
    fn test_discover_is_sorted_and_filtered() -> Result<()> {
        let dir = tempdir()?;
        for name in ["2024-01-02.csv", "2024-01-01.CSV", "notes.txt", "2024-01-03.csv.part"] {
            fs::write(dir.path().join(name), "a\n1\n")?;
        }
        fs::create_dir(dir.path().join("old.csv"))?;

        let found: Vec<String> = Ingestor::new()
            .discover(dir.path())?
            .iter()
            .map(|p| file_name(p))
            .collect();
        assert_eq!(found, vec!["2024-01-01.CSV", "2024-01-02.csv"]);
        Ok(())
    }

    #[test]
    fn test_discover_missing_dir_is_empty() -> Result<()> {
        let dir = tempdir()?;
        assert!(Ingestor::new().discover(&dir.path().join("nope"))?.is_empty());
        Ok(())
    }

    #[test]
    fn test_parse_one_stamps_provenance_and_types() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("sec_bhavdata_full_01012024.csv");
        fs::write(&path, DAY1)?;

        let ds = Ingestor::new().parse_one(&path)?;
        assert_eq!(ds.len(), 2);
        let names: Vec<&str> = ds.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["SYMBOL", "SERIES", "CLOSE_PRICE", "TTL_TRD_QNTY", "source_file"]
        );

        let row = ds.row(1).unwrap();
        assert_eq!(row.get("SYMBOL"), Some(&Value::from("TCS")));
        assert_eq!(row.get("CLOSE_PRICE"), Some(&Value::Float(3890.10)));
        assert_eq!(row.get("TTL_TRD_QNTY"), Some(&Value::Int(1200)));
        assert_eq!(
            row.get(PROVENANCE_COLUMN),
            Some(&Value::from("sec_bhavdata_full_01012024.csv"))
        );
        Ok(())
    }

    #[test]
    fn test_whitespace_in_text_fields_is_kept() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("spaced.csv");
        fs::write(&path, "SYMBOL, SERIES, CLOSE\nINFY,EQ,1523.45\nINFY, EQ, 1523.45\n")?;

        let mut ds = Ingestor::new().parse_one(&path)?;
        let names: Vec<&str> = ds.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["SYMBOL", "SERIES", "CLOSE", "source_file"]);
        assert_eq!(ds.row(0).unwrap().get("SERIES"), Some(&Value::from("EQ")));
        assert_eq!(ds.row(1).unwrap().get("SERIES"), Some(&Value::from(" EQ")));
        // padded numbers still read as numbers
        assert_eq!(ds.row(1).unwrap().get("CLOSE"), Some(&Value::Float(1523.45)));
        assert_eq!(ds.dedup(), 0);
        Ok(())
    }

    #[test]
    fn test_existing_provenance_column_is_overwritten() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("b.csv");
        fs::write(&path, "x,source_file\n1,elsewhere.csv\n")?;

        let ds = Ingestor::new().parse_one(&path)?;
        assert_eq!(ds.columns().len(), 2);
        assert_eq!(ds.row(0).unwrap().get(PROVENANCE_COLUMN), Some(&Value::from("b.csv")));
        Ok(())
    }

    #[test]
    fn test_duplicate_and_blank_headers() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("c.csv");
        fs::write(&path, "A,A,\n1,2,\n")?;

        let ds = Ingestor::new().parse_one(&path)?;
        let names: Vec<&str> = ds.columns().iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["A", "A.1", "unnamed_2", "source_file"]);
        assert_eq!(ds.row(0).unwrap().get("unnamed_2"), Some(&Value::Null));
        Ok(())
    }

    #[test]
    fn test_parse_errors() -> Result<()> {
        let dir = tempdir()?;
        let ragged = dir.path().join("ragged.csv");
        fs::write(&ragged, "a,b\n1,2\n3\n")?;
        let empty = dir.path().join("empty.csv");
        fs::write(&empty, "")?;
        let binary = dir.path().join("binary.csv");
        fs::write(&binary, [b'a', b'\n', 0xff, 0xfe, b'\n'])?;

        let ingestor = Ingestor::new();
        assert!(matches!(ingestor.parse_one(&ragged), Err(IngestError::Csv { .. })));
        assert!(matches!(
            ingestor.parse_one(&empty),
            Err(IngestError::MissingHeader { .. })
        ));
        assert!(matches!(ingestor.parse_one(&binary), Err(IngestError::Csv { .. })));
        assert!(matches!(
            ingestor.parse_one(&dir.path().join("gone.csv")),
            Err(IngestError::Open { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_ingest_all_skips_malformed_file() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("2024-01-01.csv"), "SYMBOL,CLOSE\nINFY,1\nTCS,2\n")?;
        fs::write(dir.path().join("2024-01-02.csv"), "SYMBOL,CLOSE\nINFY,3\nTCS,4\nWIPRO,5\n")?;
        fs::write(dir.path().join("2024-01-03.csv"), "SYMBOL,CLOSE\nINFY\n")?;

        let ingested = Ingestor::new().with_threads(Some(2)).ingest_all(dir.path())?;
        assert_eq!(ingested.dataset.len(), 5);
        assert_eq!(ingested.files.len(), 2);
        assert_eq!(ingested.errors.len(), 1);
        assert_eq!(ingested.errors[0].file, "2024-01-03.csv");

        // rows keep discovery order
        let sources: Vec<String> = ingested
            .dataset
            .rows()
            .map(|r| r.get(PROVENANCE_COLUMN).unwrap().to_string())
            .collect();
        assert_eq!(sources[..2], ["2024-01-01.csv", "2024-01-01.csv"]);
        assert_eq!(sources[4], "2024-01-02.csv");
        Ok(())
    }

    #[test]
    fn test_ingest_all_only_bad_files_is_ok() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("a.csv"), "")?;
        fs::write(dir.path().join("b.csv"), "x,y\n1\n")?;

        let ingested = Ingestor::new().ingest_all(dir.path())?;
        assert!(ingested.dataset.is_empty());
        assert_eq!(ingested.errors.len(), 2);
        Ok(())
    }

    #[test]
    fn test_ingest_all_empty_dir() -> Result<()> {
        let dir = tempdir()?;
        let ingested = Ingestor::new().ingest_all(dir.path())?;
        assert!(ingested.dataset.is_empty());
        assert!(ingested.errors.is_empty());
        Ok(())
    }

    #[test]
    fn test_custom_delimiter_and_extension() -> Result<()> {
        let dir = tempdir()?;
        fs::write(dir.path().join("d.txt"), "a|b\n1|x\n")?;

        let ingestor = Ingestor::new().with_extension(".txt").with_delimiter(b'|');
        let ingested = ingestor.ingest_all(dir.path())?;
        assert_eq!(ingested.dataset.len(), 1);
        assert_eq!(ingested.dataset.row(0).unwrap().get("b"), Some(&Value::from("x")));
        Ok(())
    }
}
