// src/fetch/mod.rs

use anyhow::{Context, Result};
use chrono::{Datelike, Duration, Local, NaiveDate};
use regex::Regex;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio::{sync::Semaphore, time::Instant};
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use crate::ingest::FileError;

pub mod download;
pub mod links;

pub use links::{extract_links, target_filename, Link};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Method {
    #[default]
    Get,
    Post,
}

/// Where a downloaded file's name comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FilenameSource {
    /// Last path segment of the link URL.
    #[default]
    Url,
    /// The anchor text, with a `.csv` extension.
    AnchorText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    pub page_url: String,
    pub method: Method,
    /// Form fields for `post`; `{week_start}` and `{week_end}` are filled in.
    pub form: BTreeMap<String, String>,
    pub link_selector: String,
    /// Only anchors whose text matches are downloaded.
    pub link_text_pattern: Option<String>,
    pub filename_from: FilenameSource,
    pub user_agent: String,
    pub max_concurrent: usize,
    /// Download files again even if they are already in the staging
    /// directory, picking up republished copies. Off by default, so a file
    /// once staged is never fetched twice.
    pub refresh_existing: bool,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_url: "https://www.samco.in/bhavcopy-nse-bse-mcx".to_string(),
            method: Method::Get,
            form: BTreeMap::new(),
            link_selector: "table.bhavcopy-table td a[href]".to_string(),
            link_text_pattern: None,
            filename_from: FilenameSource::Url,
            user_agent: concat!("stockscraper/", env!("CARGO_PKG_VERSION")).to_string(),
            max_concurrent: 3,
            refresh_existing: false,
        }
    }
}

/// Outcome of one fetch pass.
#[derive(Debug, Default, Serialize)]
pub struct FetchSummary {
    pub found: usize,
    pub downloaded: usize,
    pub skipped_existing: usize,
    pub failed: Vec<FileError>,
}

pub fn build_client(cfg: &FetchConfig) -> Result<Client> {
    Client::builder()
        .user_agent(cfg.user_agent.as_str())
        .cookie_store(true)
        .build()
        .context("building HTTP client")
}

/// Sunday and Saturday of the week containing `today`.
pub fn week_bounds(today: NaiveDate) -> (NaiveDate, NaiveDate) {
    let start = today - Duration::days(i64::from(today.weekday().num_days_from_sunday()));
    (start, start + Duration::days(6))
}

/// Form fields with the week placeholders replaced.
pub fn render_form(form: &BTreeMap<String, String>, today: NaiveDate) -> BTreeMap<String, String> {
    let (start, end) = week_bounds(today);
    let start = start.format("%Y-%m-%d").to_string();
    let end = end.format("%Y-%m-%d").to_string();
    form.iter()
        .map(|(k, v)| {
            (
                k.clone(),
                v.replace("{week_start}", &start).replace("{week_end}", &end),
            )
        })
        .collect()
}

/// Links worth downloading, with the name each is saved under.
fn plan_downloads(
    links: Vec<Link>,
    cfg: &FetchConfig,
    staging: &Path,
    summary: &mut FetchSummary,
) -> Vec<(Link, String)> {
    let mut todo = Vec::new();
    for link in links {
        match target_filename(&link, cfg.filename_from) {
            Some(name) if !cfg.refresh_existing && staging.join(&name).exists() => {
                debug!(name = %name, "already staged");
                summary.skipped_existing += 1;
            }
            Some(name) => todo.push((link, name)),
            None => {
                warn!(url = %link.url, "no usable filename");
                summary.failed.push(FileError {
                    file: link.url.to_string(),
                    reason: "no usable filename".to_string(),
                });
            }
        }
    }
    todo
}

/// Request the listing page and return its HTML.
pub async fn fetch_listing(client: &Client, cfg: &FetchConfig) -> Result<String> {
    let req = match cfg.method {
        Method::Get => client.get(&cfg.page_url),
        Method::Post => {
            let form = render_form(&cfg.form, Local::now().date_naive());
            debug!(?form, "posting listing form");
            client.post(&cfg.page_url).form(&form)
        }
    };
    let html = req
        .send()
        .await?
        .error_for_status()?
        .text()
        .await
        .with_context(|| format!("reading listing {}", cfg.page_url))?;
    Ok(html)
}

/// Scrape the listing page and download every new file into `staging`.
/// Files already in `staging` are left alone unless `refresh_existing` is set;
/// per-file failures are reported, not returned.
#[instrument(level = "info", skip(client, cfg, staging), fields(page = %cfg.page_url))]
pub async fn fetch_all(client: &Client, cfg: &FetchConfig, staging: &Path) -> Result<FetchSummary> {
    let base = Url::parse(&cfg.page_url).with_context(|| format!("invalid page_url {}", cfg.page_url))?;
    let pattern = cfg
        .link_text_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .context("invalid link_text_pattern")?;

    let html = fetch_listing(client, cfg).await?;
    let links = extract_links(&html, &base, &cfg.link_selector, pattern.as_ref())?;

    let mut summary = FetchSummary {
        found: links.len(),
        ..FetchSummary::default()
    };
    info!(found = links.len(), "listing scraped");

    let todo = plan_downloads(links, cfg, staging, &mut summary);

    let sem = Arc::new(Semaphore::new(cfg.max_concurrent.max(1)));
    let handles: Vec<_> = todo
        .into_iter()
        .map(|(link, name)| {
            let client = client.clone();
            let staging: PathBuf = staging.to_path_buf();
            let sem = sem.clone();
            tokio::spawn(async move {
                let _permit = sem.acquire_owned().await?;
                info!(name = %name, "downloading");
                let start = Instant::now();
                let res = download::download_to(&client, &link.url, &staging, &name).await;
                if res.is_ok() {
                    info!(name = %name, elapsed = ?start.elapsed(), "downloaded");
                }
                Ok::<_, anyhow::Error>((name, res))
            })
        })
        .collect();

    for joined in futures::future::join_all(handles).await {
        match joined {
            Ok(Ok((_, Ok(_)))) => summary.downloaded += 1,
            Ok(Ok((name, Err(e)))) => {
                error!(name = %name, error = %format!("{:#}", e), "download failed");
                summary.failed.push(FileError {
                    file: name,
                    reason: format!("{:#}", e),
                });
            }
            Ok(Err(e)) => error!(error = %e, "download task aborted"),
            Err(e) => error!(error = %e, "download task panicked"),
        }
    }

    info!(
        downloaded = summary.downloaded,
        skipped = summary.skipped_existing,
        failed = summary.failed.len(),
        "fetch finished"
    );
    Ok(summary)
}
