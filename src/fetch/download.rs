// src/fetch/download.rs

use anyhow::{Context, Result};
use reqwest::Client;
use std::path::{Path, PathBuf};
use tokio::fs;
use url::Url;

/// Download `url` into `dir/filename`. The body lands in `<filename>.part`
/// first and is renamed once complete, so readers of `dir` never see a
/// partial file.
pub async fn download_to(client: &Client, url: &Url, dir: &Path, filename: &str) -> Result<PathBuf> {
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;
    let dest = dir.join(filename);
    let part = dir.join(format!("{}.part", filename));

    let bytes = client
        .get(url.as_str())
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await
        .with_context(|| format!("reading body of {}", url))?;

    fs::write(&part, &bytes)
        .await
        .with_context(|| format!("writing {}", part.display()))?;
    if let Err(e) = fs::rename(&part, &dest).await {
        let _ = fs::remove_file(&part).await;
        return Err(e).with_context(|| format!("renaming {} into place", part.display()));
    }
    Ok(dest)
}
