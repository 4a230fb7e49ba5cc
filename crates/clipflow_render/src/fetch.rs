//! Per-job asset acquisition into the workspace.

use crate::error::{RenderError, Result};
use crate::probe::MediaInfo;
use clipflow_core::config::ServiceConfig;
use clipflow_core::types::Scene;
use futures_util::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// A clip source resolved to a local file in the job workspace.
#[derive(Debug, Clone)]
pub struct Asset {
    pub url: String,
    pub path: PathBuf,
    /// Filled in by probing after the fetch; `None` until then.
    pub info: Option<MediaInfo>,
}

/// Fetch every distinct clip source of the scene into `dir`, keyed by URL.
///
/// URLs are deduplicated by content hash of the URL string, so a source
/// referenced by several clips is fetched once per job. Fetches run
/// concurrently up to `cfg.fetch_concurrency`; any asset that fails after
/// the retry budget aborts the whole resolution.
pub async fn resolve(
    client: &reqwest::Client,
    scene: &Scene,
    dir: &Path,
    cfg: &ServiceConfig,
) -> Result<HashMap<String, Asset>> {
    tokio::fs::create_dir_all(dir).await?;

    let urls = collect_sources(scene);
    let fetched: Vec<Asset> = stream::iter(urls.into_iter().map(|url| fetch_one(client, url, dir, cfg)))
        .buffer_unordered(cfg.fetch_concurrency.max(1))
        .try_collect()
        .await?;

    Ok(fetched.into_iter().map(|a| (a.url.clone(), a)).collect())
}

/// Distinct clip source URLs in first-reference order.
pub fn collect_sources(scene: &Scene) -> Vec<String> {
    let mut seen = std::collections::HashSet::new();
    let mut urls = Vec::new();
    for (_, clip) in scene.clips() {
        if seen.insert(clip.src().to_string()) {
            urls.push(clip.src().to_string());
        }
    }
    urls
}

/// Content-hash key for an asset URL (first 16 hex chars of sha256).
pub fn asset_key(url: &str) -> String {
    let hash = hex::encode(Sha256::digest(url.as_bytes()));
    hash[..16].to_string()
}

/// Workspace file name for a URL: hash key plus the source extension.
pub fn asset_filename(url: &str) -> String {
    let ext = url::Url::parse(url)
        .ok()
        .and_then(|u| {
            u.path_segments()
                .and_then(|mut s| s.next_back().map(|x| x.to_string()))
        })
        .and_then(|name| {
            name.rsplit_once('.')
                .map(|(_, ext)| format!(".{}", ext.to_lowercase()))
        })
        .unwrap_or_default();
    format!("{}{}", asset_key(url), ext)
}

fn backoff_delay(attempt: u32) -> Duration {
    Duration::from_millis(250 * 2u64.pow(attempt.min(6)))
}

enum FetchFailure {
    /// Worth another attempt: connection reset, timeout, 5xx.
    Transient(String),
    /// 4xx or local write failure; retrying cannot help.
    Permanent(String),
}

async fn fetch_one(
    client: &reqwest::Client,
    url: String,
    dir: &Path,
    cfg: &ServiceConfig,
) -> Result<Asset> {
    let mut attempt = 0u32;
    loop {
        match try_fetch(client, &url, dir, cfg).await {
            Ok(asset) => return Ok(asset),
            Err(FetchFailure::Transient(reason)) if attempt < cfg.fetch_retries => {
                let delay = backoff_delay(attempt);
                warn!(%url, attempt, %reason, ?delay, "transient fetch failure; retrying");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(FetchFailure::Transient(reason)) | Err(FetchFailure::Permanent(reason)) => {
                return Err(RenderError::AssetFetch { url, reason });
            }
        }
    }
}

async fn try_fetch(
    client: &reqwest::Client,
    url: &str,
    dir: &Path,
    cfg: &ServiceConfig,
) -> std::result::Result<Asset, FetchFailure> {
    let attempt_timeout = Duration::from_secs(cfg.fetch_timeout_secs);

    let resp = tokio::time::timeout(attempt_timeout, client.get(url).send())
        .await
        .map_err(|_| FetchFailure::Transient("attempt timed out".into()))?
        .map_err(|e| {
            if e.is_connect() || e.is_timeout() {
                FetchFailure::Transient(e.to_string())
            } else {
                FetchFailure::Permanent(e.to_string())
            }
        })?;

    let status = resp.status();
    if status.is_server_error() {
        return Err(FetchFailure::Transient(format!("status {status}")));
    }
    if !status.is_success() {
        return Err(FetchFailure::Permanent(format!("status {status}")));
    }

    let path = dir.join(asset_filename(url));
    match write_body(resp, &path, attempt_timeout).await {
        Ok(()) => {
            debug!(%url, path = %path.display(), "asset fetched");
            Ok(Asset {
                url: url.to_string(),
                path,
                info: None,
            })
        }
        Err(failure) => {
            let _ = tokio::fs::remove_file(&path).await;
            Err(failure)
        }
    }
}

async fn write_body(
    resp: reqwest::Response,
    path: &Path,
    chunk_timeout: Duration,
) -> std::result::Result<(), FetchFailure> {
    let mut file = tokio::fs::File::create(path)
        .await
        .map_err(|e| FetchFailure::Permanent(format!("cannot create {}: {e}", path.display())))?;

    let stream = resp.bytes_stream();
    futures_util::pin_mut!(stream);
    loop {
        let chunk = match tokio::time::timeout(chunk_timeout, stream.next()).await {
            Ok(Some(Ok(bytes))) => bytes,
            Ok(Some(Err(e))) => return Err(FetchFailure::Transient(e.to_string())),
            Ok(None) => break,
            Err(_) => return Err(FetchFailure::Transient("body read timed out".into())),
        };
        file.write_all(&chunk)
            .await
            .map_err(|e| FetchFailure::Permanent(e.to_string()))?;
    }
    file.flush()
        .await
        .map_err(|e| FetchFailure::Permanent(e.to_string()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
