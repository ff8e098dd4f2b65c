// src/store/atomic.rs

use anyhow::{Context, Result};
use std::{
    ffi::OsString,
    fs::{self, File},
    path::{Path, PathBuf},
};

/// `path` with `suffix` appended to its file name (`master.parquet` → `master.parquet.bak`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

/// Replace `path` with whatever `write` produces, all or nothing.
///
/// The content is written to a temporary file in the same directory, synced,
/// and renamed over `path`. If `write` or any later step fails the temporary
/// file is removed and `path` is left exactly as it was. With `keep_backup`
/// the previous content is first copied to `<path>.bak`.
pub fn write_atomic<F>(path: &Path, keep_backup: bool, write: F) -> Result<()>
where
    F: FnOnce(&mut File) -> Result<()>,
{
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).with_context(|| format!("creating directory {}", dir.display()))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".stockscraper-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .with_context(|| format!("creating temporary file in {}", dir.display()))?;

    write(tmp.as_file_mut())?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("syncing {}", tmp.path().display()))?;

    if keep_backup && path.is_file() {
        let backup = with_suffix(path, ".bak");
        fs::copy(path, &backup).with_context(|| {
            format!("backing up {} to {}", path.display(), backup.display())
        })?;
    }

    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("renaming temporary file over {}", path.display()))?;
    Ok(())
}
