//! Local asset storage: where files go, how directories are prepared, and
//! how remote files are fetched.
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::model::AssetKind;

/// Maps `(page_id, kind, filename)` to a file on disk and to the public URL
/// the host serves it under. Both trees share the shape `<base>/<page_id>/<dir>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetLayout {
    base_path: PathBuf,
    base_url: String,
}

impl AssetLayout {
    pub fn new(base_path: PathBuf, base_url: &str) -> Self {
        Self {
            base_path,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn dir_for(&self, page_id: i64, kind: AssetKind) -> PathBuf {
        self.base_path
            .join(page_id.to_string())
            .join(kind.dir_name())
    }

    pub fn url_for(&self, page_id: i64, kind: AssetKind, name: &str) -> String {
        format!("{}/{}/{}/{}", self.base_url, page_id, kind.dir_name(), name)
    }
}

/// Create `dir` (with parents) if missing; otherwise delete every regular
/// file already in it. Subdirectories are left alone.
pub async fn prepare_dir(dir: &Path) -> std::io::Result<()> {
    if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
        return tokio::fs::create_dir_all(dir).await;
    }
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_file() {
            tokio::fs::remove_file(entry.path()).await?;
        }
    }
    Ok(())
}

/// Copies one remote file to a local path.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    /// Returns the number of bytes written.
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64>;
}

/// `AssetFetcher` over plain HTTP GET.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    http: Client,
}

impl HttpFetcher {
    pub fn new() -> Result<Self> {
        let http = Client::builder()
            .user_agent(concat!("tilda-mirror/", env!("CARGO_PKG_VERSION")))
            .no_proxy()
            .build()
            .context("failed to build http client")?;
        Ok(Self { http })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> Result<u64> {
        let start = std::time::Instant::now();
        let res = self
            .http
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        if !res.status().is_success() {
            return Err(anyhow!("download error {} for {}", res.status(), url));
        }
        let bytes = res.bytes().await.with_context(|| format!("failed to read {}", url))?;

        // Write beside the destination, then rename, so a failed write never
        // leaves a truncated asset under the final name.
        let tmp = dest.with_file_name(format!(".{}.part", uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        if let Err(err) = tokio::fs::rename(&tmp, dest).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err).with_context(|| format!("failed to move into {}", dest.display()));
        }

        debug!(url, dest = %dest.display(), bytes = bytes.len(), elapsed_ms = start.elapsed().as_millis() as u64, "downloaded asset");
        Ok(bytes.len() as u64)
    }
}

/// Fetch and log instead of propagating; the caller records the outcome.
pub async fn fetch_logged(fetcher: &dyn AssetFetcher, url: &str, dest: &Path) -> Result<u64> {
    let res = fetcher.fetch(url, dest).await;
    if let Err(err) = &res {
        warn!(url, dest = %dest.display(), ?err, "asset download failed");
    }
    res
}
