//! Fetching plugin artifacts to local files.

use async_trait::async_trait;
use reqwest::Client;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::error::{ClientError, Result};

/// Default download timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Copies an artifact from a path or URL to a local file.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactFetcher: Send + Sync {
    /// Writes the artifact at `source` to `dest`.
    async fn fetch(&self, source: &str, dest: &Path) -> Result<()>;
}

/// Fetches `http(s)://` sources over HTTP and everything else from disk.
///
/// Relative paths are resolved against the file server root.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    base_dir: Option<PathBuf>,
}

impl HttpFetcher {
    /// Creates a fetcher.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(base_dir: Option<PathBuf>) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ClientError::network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self { client, base_dir })
    }

    fn resolve(&self, source: &str) -> PathBuf {
        let path = Path::new(source.strip_prefix("file://").unwrap_or(source));
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ClientError::network(format!("GET {url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::api_error(status.as_u16(), format!("GET {url}")).into());
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ClientError::network(format!("Reading {url}: {e}")))?;
        tokio::fs::write(dest, &body).await?;
        Ok(())
    }
}

#[async_trait]
impl ArtifactFetcher for HttpFetcher {
    async fn fetch(&self, source: &str, dest: &Path) -> Result<()> {
        if source.starts_with("http://") || source.starts_with("https://") {
            debug!("Downloading {source} to {}", dest.display());
            self.download(source, dest).await
        } else {
            let path = self.resolve(source);
            debug!("Copying {} to {}", path.display(), dest.display());
            tokio::fs::copy(&path, dest).await?;
            Ok(())
        }
    }
}
