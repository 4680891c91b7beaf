use std::path::Path;
use std::time::Duration;
use async_trait::async_trait;
use log::{debug, info};
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use crate::error::{PipelineError, PipelineResult};

/// Connect timeout, and the longest gap allowed between two body reads
const FETCH_TIMEOUT: Duration = Duration::from_secs(120);

/// Downloads a job's source to local disk
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Write the source at `url` to `dest`, returning the byte count
    async fn fetch(&self, url: &str, dest: &Path) -> PipelineResult<u64>;
}

/// `url` uses a scheme the fetcher will download from
pub fn is_remote_url(url: &str) -> bool {
    let lower = url.trim_start().to_ascii_lowercase();
    lower.starts_with("http://") || lower.starts_with("https://")
}

/// Plain HTTP(S) download
pub struct HttpFetcher {
    client: reqwest::Client,
    read_timeout: Duration,
}

impl HttpFetcher {
    pub fn new() -> PipelineResult<Self> {
        Self::with_read_timeout(FETCH_TIMEOUT)
    }

    /// Slow sources are fine as long as bytes keep arriving within `read_timeout`
    pub fn with_read_timeout(read_timeout: Duration) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| PipelineError::SourceFetch(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, read_timeout })
    }

    fn stalled(&self, url: &str) -> PipelineError {
        PipelineError::SourceFetch(format!(
            "{} stalled: no data for {}s",
            url,
            self.read_timeout.as_secs_f64()
        ))
    }
}

/// Shared links default to a preview page; `dl=1` asks for the raw file
pub fn direct_download_url(url: &str) -> String {
    if !url.contains("dropbox.com") {
        return url.to_string();
    }
    if url.contains("dl=0") {
        return url.replace("dl=0", "dl=1");
    }
    if url.contains("dl=1") {
        return url.to_string();
    }
    let sep = if url.contains('?') { '&' } else { '?' };
    format!("{}{}dl=1", url, sep)
}

#[async_trait]
impl SourceFetcher for HttpFetcher {
    async fn fetch(&self, url: &str, dest: &Path) -> PipelineResult<u64> {
        if !is_remote_url(url) {
            return Err(PipelineError::SourceFetch(format!("unsupported url scheme: {}", url)));
        }
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let url = direct_download_url(url);
        debug!("Downloading {}", url);
        let fetch_err = |e: reqwest::Error| PipelineError::SourceFetch(e.to_string());

        let mut response = timeout(self.read_timeout, self.client.get(&url).send())
            .await
            .map_err(|_| self.stalled(&url))?
            .map_err(fetch_err)?;
        let status = response.status();
        if !status.is_success() {
            return Err(PipelineError::SourceFetch(format!("{} returned {}", url, status)));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        loop {
            let next = timeout(self.read_timeout, response.chunk())
                .await
                .map_err(|_| self.stalled(&url))?
                .map_err(fetch_err)?;
            let Some(chunk) = next else { break };
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        if written == 0 {
            return Err(PipelineError::SourceFetch(format!("{} returned an empty body", url)));
        }
        info!("Downloaded {} bytes from {}", written, url);
        Ok(written)
    }
}
