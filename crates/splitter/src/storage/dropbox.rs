use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use log::debug;
use serde::Deserialize;
use serde_json::json;
use crate::error::StorageError;
use super::{file_name, CredentialProvider, ObjectStore};

const API_URL: &str = "https://api.dropboxapi.com";
const CONTENT_URL: &str = "https://content.dropboxapi.com";
const API_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// Upload allowance on top of the time the body needs at the slowest accepted rate
const UPLOAD_BASE_TIMEOUT: Duration = Duration::from_secs(300);
const UPLOAD_MIN_BYTES_PER_SEC: u64 = 64 * 1024;
const SEARCH_PAGE_SIZE: u32 = 100;

/// Dropbox HTTP API backend
pub struct DropboxStore {
    client: reqwest::Client,
    credentials: Arc<dyn CredentialProvider>,
    api_url: String,
    content_url: String,
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<Metadata>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct Metadata {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    path_display: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    matches: Vec<SearchMatch>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    cursor: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchMatch {
    metadata: SearchMatchMetadata,
}

#[derive(Debug, Deserialize)]
struct SearchMatchMetadata {
    metadata: Metadata,
}

impl DropboxStore {
    pub fn new(credentials: Arc<dyn CredentialProvider>) -> Result<Self, StorageError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StorageError::fatal(None, format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            credentials,
            api_url: API_URL.to_string(),
            content_url: CONTENT_URL.to_string(),
        })
    }

    /// Override the RPC and content hosts
    pub fn with_base_urls(mut self, api_url: impl Into<String>, content_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self.content_url = content_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Time allowed for one upload of `size` bytes
    fn upload_timeout(size: u64) -> Duration {
        UPLOAD_BASE_TIMEOUT + Duration::from_secs(size / UPLOAD_MIN_BYTES_PER_SEC)
    }

    /// Dropbox spells the root folder as the empty string
    fn api_path(path: &str) -> &str {
        if path == "/" { "" } else { path.trim_end_matches('/') }
    }

    async fn rpc(&self, endpoint: &str, body: serde_json::Value) -> Result<reqwest::Response, StorageError> {
        let token = self.credentials.access_token().await?;
        let response = self
            .client
            .post(format!("{}/2/{}", self.api_url, endpoint))
            .bearer_auth(token)
            .timeout(API_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        Ok(response)
    }

    async fn error_from(response: reqwest::Response, context: &str) -> StorageError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        StorageError::from_status(status.as_u16(), format!("{} ({}): {}", context, status, body))
    }
}

#[async_trait]
impl ObjectStore for DropboxStore {
    async fn put(&self, local_path: &Path, dest_path: &str) -> Result<u64, StorageError> {
        let bytes = tokio::fs::read(local_path).await.map_err(|e| {
            StorageError::fatal(None, format!("failed to read {}: {}", local_path.display(), e))
        })?;
        let size = bytes.len() as u64;

        let arg = json!({
            "path": dest_path,
            "mode": "overwrite",
            "autorename": false,
            "mute": true,
        });

        let token = self.credentials.access_token().await?;
        debug!("Uploading {} bytes to {}", size, dest_path);
        let response = self
            .client
            .post(format!("{}/2/files/upload", self.content_url))
            .bearer_auth(token)
            .header("Content-Type", "application/octet-stream")
            .header("Dropbox-API-Arg", arg.to_string())
            .timeout(Self::upload_timeout(size))
            .body(bytes)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_from(response, &format!("upload to {} failed", dest_path)).await);
        }
        Ok(size)
    }

    async fn list(&self, dir_path: &str) -> Result<Vec<String>, StorageError> {
        let mut names = Vec::new();
        let mut response = self
            .rpc(
                "files/list_folder",
                json!({ "path": Self::api_path(dir_path), "recursive": false }),
            )
            .await?;

        loop {
            let status = response.status();
            if status.as_u16() == 409 {
                let body = response.text().await.unwrap_or_default();
                if body.contains("not_found") {
                    return Ok(Vec::new());
                }
                return Err(StorageError::fatal(
                    Some(409),
                    format!("list of {} failed: {}", dir_path, body),
                ));
            }
            if !status.is_success() {
                return Err(Self::error_from(response, &format!("list of {} failed", dir_path)).await);
            }

            let page: ListFolderResponse = response.json().await?;
            names.extend(
                page.entries
                    .into_iter()
                    .filter(|e| e.tag == "file")
                    .map(|e| e.name),
            );
            if !page.has_more {
                break;
            }
            response = self
                .rpc("files/list_folder/continue", json!({ "cursor": page.cursor }))
                .await?;
        }

        Ok(names)
    }

    async fn search(&self, prefix: &str, root: &str) -> Result<Vec<String>, StorageError> {
        let mut paths = Vec::new();
        let mut response = self
            .rpc(
                "files/search_v2",
                json!({
                    "query": prefix,
                    "options": {
                        "path": Self::api_path(root),
                        "filename_only": true,
                        "max_results": SEARCH_PAGE_SIZE,
                    },
                }),
            )
            .await?;

        loop {
            if !response.status().is_success() {
                return Err(Self::error_from(response, &format!("search for {} failed", prefix)).await);
            }
            let page: SearchResponse = response.json().await?;

            // search is fuzzy; keep real prefix matches only
            for m in page.matches {
                let meta = m.metadata.metadata;
                if meta.tag != "file" || !meta.name.starts_with(prefix) {
                    continue;
                }
                if let Some(path) = meta.path_display {
                    debug!("Search hit {} ({})", path, file_name(&path));
                    paths.push(path);
                }
            }

            match (page.has_more, page.cursor) {
                (true, Some(cursor)) => {
                    response = self
                        .rpc("files/search/continue_v2", json!({ "cursor": cursor }))
                        .await?;
                }
                _ => break,
            }
        }

        Ok(paths)
    }
}
