use std::time::Duration;
use chrono::Utc;
use log::{info, warn};
use crate::error::PipelineResult;
use crate::job::JobStore;

/// Mark `queued`/`running` jobs whose heartbeat is older than `timeout` as
/// `error`. Returns how many records were changed.
///
/// A job only stops refreshing `updated_at` when its worker is gone (process
/// restart or crash), so a stale record will never finish on its own.
pub async fn recover_stale_jobs(store: &dyn JobStore, timeout: Duration) -> PipelineResult<usize> {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
    let now = Utc::now();
    let mut recovered = 0;

    for mut job in store.list().await? {
        if job.is_terminal() {
            continue;
        }
        let silent_for = now - job.updated_at;
        if silent_for <= timeout {
            continue;
        }

        warn!(
            "Job {}: no heartbeat for {}s while {}, marking as error",
            job.id,
            silent_for.num_seconds(),
            job.status.as_str()
        );
        job.mark_error(format!("stale: no heartbeat for {}s", silent_for.num_seconds()));
        store.write(&job).await?;
        recovered += 1;
    }

    if recovered > 0 {
        info!("Recovered {} stale job(s)", recovered);
    }
    Ok(recovered)
}
