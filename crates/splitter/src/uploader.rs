use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use log::{info, warn};
use crate::error::StorageError;
use crate::storage::ObjectStore;

/// Retrying upload front for an [`ObjectStore`]
pub struct UploadGateway {
    store: Arc<dyn ObjectStore>,
    max_attempts: u32,
    base_delay: Duration,
}

impl UploadGateway {
    pub fn new(store: Arc<dyn ObjectStore>, max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
            base_delay,
        }
    }

    /// Upload with overwrite semantics.
    ///
    /// Transient failures are retried up to `max_attempts` in total, sleeping
    /// `base_delay * attempt` between tries. Fatal failures return at once.
    pub async fn upload(&self, artifact: &Path, destination: &str) -> Result<u64, StorageError> {
        let mut attempt = 1;
        loop {
            match self.store.put(artifact, destination).await {
                Ok(size) => {
                    if attempt > 1 {
                        info!("Upload of {} succeeded on attempt {}", destination, attempt);
                    }
                    return Ok(size);
                }
                Err(e) if e.is_transient() && attempt < self.max_attempts => {
                    let delay = self.base_delay * attempt;
                    warn!(
                        "Upload of {} failed (attempt {}/{}), retrying in {:?}: {}",
                        destination, attempt, self.max_attempts, delay, e
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}
