use log::debug;
use crate::allocator::BinsConfig;
use crate::error::StorageError;
use crate::storage::{file_name, parent_dir, ObjectStore};

/// Reason recorded on jobs skipped by the guard
pub const ALREADY_PROCESSED: &str = "already_processed";

/// Whether a group's first segment already sits in one of its bins.
///
/// Only `{group_prefix}-001.{format}` is looked for; a group interrupted after
/// segment 1 is considered processed.
pub async fn already_processed(
    store: &dyn ObjectStore,
    group_prefix: &str,
    format: &str,
    dest_root: &str,
    bins: BinsConfig,
) -> Result<bool, StorageError> {
    let expected = format!("{}-001.{}", group_prefix, format);
    let bin_dirs = bins.bin_dirs(dest_root);

    let hits = store.search(&expected, dest_root).await?;
    let found = hits.iter().find(|path| {
        file_name(path) == expected && bin_dirs.iter().any(|dir| dir == parent_dir(path))
    });

    match found {
        Some(path) => {
            debug!("Found existing first segment at {}", path);
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStore;
    use tempfile::tempdir;

    const BINS: BinsConfig = BinsConfig { dir_count: 5, capacity_per_dir: 5 };

    fn touch(root: &std::path::Path, rel: &str) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[tokio::test]
    async fn test_detects_first_segment_in_a_bin() {
        let root = tempdir().unwrap();
        touch(root.path(), "test/WAV/02/meeting-001.wav");
        let store = LocalStore::new(root.path());

        assert!(already_processed(&store, "meeting", "wav", "/test/WAV", BINS).await.unwrap());
        assert!(!already_processed(&store, "meeting", "m4a", "/test/WAV", BINS).await.unwrap());
        assert!(!already_processed(&store, "standup", "wav", "/test/WAV", BINS).await.unwrap());
    }

    #[tokio::test]
    async fn test_ignores_near_misses() {
        let root = tempdir().unwrap();
        // later segment only, wrong directory, longer name
        touch(root.path(), "test/WAV/01/meeting-002.wav");
        touch(root.path(), "test/WAV/archive/meeting-001.wav");
        touch(root.path(), "test/WAV/07/meeting-001.wav");
        touch(root.path(), "test/WAV/01/meeting-001.wav.bak");
        let store = LocalStore::new(root.path());

        assert!(!already_processed(&store, "meeting", "wav", "/test/WAV", BINS).await.unwrap());
    }

    #[tokio::test]
    async fn test_empty_store() {
        let root = tempdir().unwrap();
        let store = LocalStore::new(root.path());
        assert!(!already_processed(&store, "meeting", "wav", "/test/WAV", BINS).await.unwrap());
    }
}
