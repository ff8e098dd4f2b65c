// src/fetch/links.rs

use anyhow::{anyhow, Result};
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashSet;
use url::Url;

use super::FilenameSource;

/// A downloadable link found on the listing page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub url: Url,
    /// Anchor text, whitespace-trimmed.
    pub text: String,
}

/// All anchors matching `selector` whose text matches `text_pattern` (if any),
/// with hrefs resolved against `base`. First occurrence of each URL wins.
pub fn extract_links(
    html: &str,
    base: &Url,
    selector: &str,
    text_pattern: Option<&Regex>,
) -> Result<Vec<Link>> {
    let selector = Selector::parse(selector)
        .map_err(|e| anyhow!("invalid link selector {:?}: {:?}", selector, e))?;
    let doc = Html::parse_document(html);

    let mut seen = HashSet::new();
    let mut links = Vec::new();
    for el in doc.select(&selector) {
        let Some(href) = el.value().attr("href") else {
            continue;
        };
        let text = el.text().collect::<String>().trim().to_string();
        if let Some(re) = text_pattern {
            if !re.is_match(&text) {
                continue;
            }
        }
        let Ok(url) = base.join(href.trim()) else {
            continue;
        };
        if seen.insert(url.clone()) {
            links.push(Link { url, text });
        }
    }
    Ok(links)
}

/// Name to save `link` under in the staging directory.
pub fn target_filename(link: &Link, source: FilenameSource) -> Option<String> {
    match source {
        FilenameSource::Url => link
            .url
            .path_segments()
            .and_then(|mut segs| segs.next_back())
            .map(sanitize)
            .filter(|n| !n.is_empty()),
        FilenameSource::AnchorText => {
            let name = sanitize(&link.text);
            if name.is_empty() {
                return None;
            }
            if name.to_ascii_lowercase().ends_with(".csv") {
                Some(name)
            } else {
                Some(format!("{}.csv", name))
            }
        }
    }
}

/// Keep `[A-Za-z0-9._-]`, map everything else to `_`, no leading dots.
fn sanitize(raw: &str) -> String {
    raw.trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect::<String>()
        .trim_start_matches('.')
        .to_string()
}
