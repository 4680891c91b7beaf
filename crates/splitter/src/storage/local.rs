use std::path::{Path, PathBuf};
use async_trait::async_trait;
use log::debug;
use walkdir::WalkDir;
use crate::error::StorageError;
use super::ObjectStore;

/// Object store backed by a plain directory tree.
///
/// Store paths (`/test/WAV/01/a.wav`) map onto `root` joined with the path.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, store_path: &str) -> Result<PathBuf, StorageError> {
        let relative = store_path.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            return Err(StorageError::fatal(None, format!("path escapes store root: {}", store_path)));
        }
        Ok(self.root.join(relative))
    }

    fn to_store_path(&self, path: &Path) -> Option<String> {
        let relative = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<_> = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        Some(format!("/{}", parts.join("/")))
    }
}

fn io_error(context: &str, path: &Path, err: std::io::Error) -> StorageError {
    StorageError::fatal(None, format!("{} {}: {}", context, path.display(), err))
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn put(&self, local_path: &Path, dest_path: &str) -> Result<u64, StorageError> {
        let target = self.resolve(dest_path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("failed to create", parent, e))?;
        }
        let size = tokio::fs::copy(local_path, &target)
            .await
            .map_err(|e| io_error("failed to copy into", &target, e))?;
        debug!("Stored {} ({} bytes)", target.display(), size);
        Ok(size)
    }

    async fn list(&self, dir_path: &str) -> Result<Vec<String>, StorageError> {
        let dir = self.resolve(dir_path)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error("failed to list", &dir, e)),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| io_error("failed to list", &dir, e))?
        {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn search(&self, prefix: &str, root: &str) -> Result<Vec<String>, StorageError> {
        let base = self.resolve(root)?;
        let prefix = prefix.to_string();
        let store = self.clone();

        tokio::task::spawn_blocking(move || {
            let mut hits: Vec<String> = WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .filter(|e| e.file_name().to_string_lossy().starts_with(&prefix))
                .filter_map(|e| store.to_store_path(e.path()))
                .collect();
            hits.sort();
            hits
        })
        .await
        .map_err(|e| StorageError::fatal(None, format!("search task failed: {}", e)))
    }
}
