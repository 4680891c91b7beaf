use std::path::Path;
use std::sync::Arc;
use async_trait::async_trait;
use crate::config::StorageConfig;
use crate::error::StorageError;

pub mod credentials;
pub mod dropbox;
pub mod local;

pub use credentials::{provider_from_credentials, CredentialProvider, RefreshingToken, StaticToken};
pub use dropbox::DropboxStore;
pub use local::LocalStore;

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload a local file to `dest_path`, replacing anything already there.
    /// Returns the number of bytes stored.
    async fn put(&self, local_path: &Path, dest_path: &str) -> Result<u64, StorageError>;

    /// File names directly inside `dir_path`; a missing directory lists as empty
    async fn list(&self, dir_path: &str) -> Result<Vec<String>, StorageError>;

    /// Full paths of files under `root` whose name starts with `prefix`
    async fn search(&self, prefix: &str, root: &str) -> Result<Vec<String>, StorageError>;
}

/// Build the configured backend
pub fn store_from_config(config: &StorageConfig) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match config {
        StorageConfig::Dropbox(creds) => {
            let provider: Arc<dyn CredentialProvider> = Arc::from(provider_from_credentials(creds)?);
            Ok(Arc::new(DropboxStore::new(provider)?))
        }
        StorageConfig::Local { root } => Ok(Arc::new(LocalStore::new(root.clone()))),
    }
}

/// Join a store directory and a child name with exactly one `/`
pub fn join_path(dir: &str, name: &str) -> String {
    let name = name.trim_start_matches('/');
    if dir.ends_with('/') {
        format!("{}{}", dir, name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last component of a store path
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Everything before the last `/` (`/` for top-level entries)
pub fn parent_dir(path: &str) -> &str {
    match path.trim_end_matches('/').rfind('/') {
        Some(0) => "/",
        Some(pos) => &path[..pos],
        None => "",
    }
}
