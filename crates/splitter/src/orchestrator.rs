use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use log::{debug, error, info, warn};
use crate::allocator::{BinsConfig, DirectoryAllocator};
use crate::config::SplitterConfig;
use crate::encoder::{EncodeContext, SegmentEncoder, SegmentOutcome, SegmentTarget};
use crate::error::PipelineResult;
use crate::fetch::{HttpFetcher, SourceFetcher};
use crate::ffmpeg::{EncodeBackend, FfmpegBackend};
use crate::ffprobe::{DurationProbe, FfprobeDurationProbe};
use crate::guard::{already_processed, ALREADY_PROCESSED};
use crate::job::{Job, JobParams, JobStore, UploadedSegment};
use crate::planner::{plan_for, PlannedSegment};
use crate::storage::ObjectStore;
use crate::uploader::UploadGateway;

/// Name of the downloaded source inside a job's work dir
const SOURCE_FILE: &str = "source";

/// Pluggable collaborators of the pipeline
pub struct Components {
    pub jobs: Arc<dyn JobStore>,
    pub store: Arc<dyn ObjectStore>,
    pub fetcher: Arc<dyn SourceFetcher>,
    pub probe: Arc<dyn DurationProbe>,
    pub encode_backend: Arc<dyn EncodeBackend>,
}

/// How a run that did not fail ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunEnd {
    Done,
    Skipped,
}

#[derive(Clone)]
pub struct Orchestrator {
    jobs: Arc<dyn JobStore>,
    store: Arc<dyn ObjectStore>,
    fetcher: Arc<dyn SourceFetcher>,
    probe: Arc<dyn DurationProbe>,
    encoder: Arc<SegmentEncoder>,
    uploader: Arc<UploadGateway>,
    work_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(config: &SplitterConfig, components: Components) -> Self {
        let encoder = SegmentEncoder::new(
            components.encode_backend,
            config.min_segment_bytes,
            config.aac_bitrate.clone(),
        );
        let uploader = UploadGateway::new(
            components.store.clone(),
            config.upload_max_attempts,
            Duration::from_millis(config.upload_base_delay_ms),
        );

        Self {
            jobs: components.jobs,
            store: components.store,
            fetcher: components.fetcher,
            probe: components.probe,
            encoder: Arc::new(encoder),
            uploader: Arc::new(uploader),
            work_dir: config.work_dir.clone(),
        }
    }

    /// Wire the production engines (HTTP fetch, ffprobe, ffmpeg) around the
    /// given job and object stores
    pub fn with_native_engines(
        config: &SplitterConfig,
        jobs: Arc<dyn JobStore>,
        store: Arc<dyn ObjectStore>,
    ) -> PipelineResult<Self> {
        let components = Components {
            jobs,
            store,
            fetcher: Arc::new(HttpFetcher::new()?),
            probe: Arc::new(FfprobeDurationProbe::new(&config.ffprobe_bin)),
            encode_backend: Arc::new(FfmpegBackend::new(
                &config.ffmpeg_bin,
                Some(config.encode_timeout_secs),
            )),
        };
        Ok(Self::new(config, components))
    }

    /// Validate, persist as `queued` and start the run in the background.
    ///
    /// Returns the queued snapshot; everything after this point is only
    /// visible through [`Orchestrator::status`].
    pub async fn submit(&self, params: JobParams) -> PipelineResult<Job> {
        params.validate()?;

        let job = Job::new(params);
        self.jobs.write(&job).await?;
        info!(
            "Job {}: queued ({} -> {} as {}-NNN.{})",
            job.id, job.params.url, job.params.dest_root, job.group_prefix, job.params.format
        );

        let runner = self.clone();
        let queued = job.clone();
        tokio::spawn(async move {
            runner.run(job).await;
        });

        Ok(queued)
    }

    pub async fn status(&self, job_id: &str) -> PipelineResult<Option<Job>> {
        self.jobs.read(job_id).await
    }

    /// Stored segment paths of a group under `dest_root`
    pub async fn slices(&self, group_prefix: &str, dest_root: &str) -> PipelineResult<Vec<String>> {
        let prefix = format!("{}-", group_prefix);
        let mut paths = self.store.search(&prefix, dest_root).await?;
        paths.sort();
        Ok(paths)
    }

    /// Drive a job to a terminal state and return the final record
    pub async fn run(&self, mut job: Job) -> Job {
        let job_dir = self.work_dir.join(&job.id);

        match self.execute(&mut job, &job_dir).await {
            Ok(RunEnd::Done) => {
                job.mark_done();
                info!("Job {}: done ({} segment(s) uploaded)", job.id, job.uploaded.len());
            }
            Ok(RunEnd::Skipped) => {
                job.mark_skipped(ALREADY_PROCESSED);
                info!("Job {}: skipped, {}-001.{} already stored", job.id, job.group_prefix, job.params.format);
            }
            Err(e) => {
                error!("Job {}: failed after {} upload(s): {}", job.id, job.uploaded.len(), e);
                job.mark_error(e.to_string());
            }
        }

        if let Err(e) = self.jobs.write(&job).await {
            error!("Job {}: could not persist final state: {}", job.id, e);
        }
        if let Err(e) = tokio::fs::remove_dir_all(&job_dir).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Job {}: failed to clean up {}: {}", job.id, job_dir.display(), e);
            }
        }
        job
    }

    async fn execute(&self, job: &mut Job, job_dir: &Path) -> PipelineResult<RunEnd> {
        job.mark_running();
        self.jobs.write(job).await?;

        let params = job.params.clone();
        let dest_root = params.dest_root_trimmed();
        let bins = BinsConfig::from_params(&params);

        if already_processed(self.store.as_ref(), &params.group_prefix, &params.format, dest_root, bins).await? {
            return Ok(RunEnd::Skipped);
        }

        tokio::fs::create_dir_all(job_dir).await?;
        let source = job_dir.join(SOURCE_FILE);
        let bytes = self.fetcher.fetch(&params.url, &source).await?;
        debug!("Job {}: source fetched ({} bytes)", job.id, bytes);

        let duration = self.probe.probe(&source).await;
        let plan = plan_for(&params, duration);
        job.duration_secs = duration;
        job.planned_segments = duration.and_then(|_| plan.len_hint());
        match (duration, job.planned_segments) {
            (Some(d), Some(n)) => info!("Job {}: {:.1}s source, {} segment(s) planned", job.id, d, n),
            _ => info!("Job {}: duration unknown, splitting until the source runs out", job.id),
        }
        self.jobs.write(job).await?;

        let target = SegmentTarget {
            dir: job_dir,
            group_prefix: &params.group_prefix,
            format: &params.format,
        };
        let slot_cap = progress_cap(&params);
        let mut allocator = DirectoryAllocator::new(bins);

        for planned in plan {
            let ctx = EncodeContext {
                is_first: planned.index == 1,
                duration_known: duration.is_some(),
            };

            let artifact = match self.encoder.encode(&source, &planned, &target, ctx).await {
                SegmentOutcome::Segment(artifact) => artifact,
                SegmentOutcome::EndOfSource => {
                    info!("Job {}: source ended after segment {}", job.id, planned.index - 1);
                    break;
                }
                SegmentOutcome::Fatal(failure) => return Err(failure.into()),
            };

            let slot = allocator.allocate()?;
            let file_name = params.segment_file_name(planned.index);
            let destination = slot.path(dest_root, &file_name);

            let size = self.uploader.upload(&artifact.path, &destination).await?;
            if let Err(e) = tokio::fs::remove_file(&artifact.path).await {
                debug!("Job {}: could not remove {}: {}", job.id, artifact.path.display(), e);
            }

            let uploaded_count = job.uploaded.len() + 1;
            let progress = progress_for(&planned, duration, uploaded_count, slot_cap);
            job.record_upload(UploadedSegment { path: destination.clone(), size }, progress);
            info!("Job {}: uploaded {} ({} bytes, {}%)", job.id, destination, size, job.progress);
            self.jobs.write(job).await?;
        }

        Ok(RunEnd::Done)
    }
}

/// Segment count that stands for 100% when the duration is unknown
fn progress_cap(params: &JobParams) -> u64 {
    let capacity = params.capacity();
    match params.max_segments {
        Some(max) => capacity.min(max as u64),
        None => capacity,
    }
}

/// Percentage after uploading `planned`; stays below 100 until the job is done
pub(crate) fn progress_for(planned: &PlannedSegment, duration: Option<f64>, uploaded: usize, cap: u64) -> u8 {
    let pct = match duration {
        Some(total) if total > 0.0 => (planned.end() / total * 100.0).floor(),
        _ if cap > 0 => (uploaded as f64 / cap as f64 * 100.0).floor(),
        _ => 0.0,
    };
    pct.clamp(0.0, 99.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::tests::ScriptedBackend;
    use crate::error::{PipelineError, StorageError};
    use crate::job::{FileJobStore, JobStatus};
    use crate::storage::LocalStore;
    use crate::uploader::tests::FlakyStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::{tempdir, TempDir};

    struct FakeFetcher {
        calls: AtomicUsize,
        fail: bool,
    }

    impl FakeFetcher {
        fn new(fail: bool) -> Self {
            Self { calls: AtomicUsize::new(0), fail }
        }
    }

    #[async_trait]
    impl SourceFetcher for FakeFetcher {
        async fn fetch(&self, url: &str, dest: &Path) -> PipelineResult<u64> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(PipelineError::SourceFetch(format!("{} returned 404 Not Found", url)));
            }
            tokio::fs::write(dest, vec![1u8; 10_000]).await?;
            Ok(10_000)
        }
    }

    struct FixedProbe(Option<f64>);

    #[async_trait]
    impl DurationProbe for FixedProbe {
        async fn probe(&self, _path: &Path) -> Option<f64> {
            self.0
        }
    }

    struct Harness {
        orchestrator: Orchestrator,
        fetcher: Arc<FakeFetcher>,
        backend: Arc<ScriptedBackend>,
        remote: TempDir,
        work: TempDir,
        _state: TempDir,
    }

    fn harness_with(
        duration: Option<f64>,
        backend: ScriptedBackend,
        fetch_fails: bool,
        store: Option<Arc<dyn ObjectStore>>,
    ) -> Harness {
        let remote = tempdir().unwrap();
        let work = tempdir().unwrap();
        let state = tempdir().unwrap();

        let mut config = SplitterConfig::default_config();
        config.work_dir = work.path().to_path_buf();
        config.upload_base_delay_ms = 1;

        let fetcher = Arc::new(FakeFetcher::new(fetch_fails));
        let backend = Arc::new(backend);
        let store: Arc<dyn ObjectStore> = match store {
            Some(store) => store,
            None => Arc::new(LocalStore::new(remote.path())),
        };
        let orchestrator = Orchestrator::new(
            &config,
            Components {
                jobs: Arc::new(FileJobStore::new(state.path())),
                store,
                fetcher: fetcher.clone(),
                probe: Arc::new(FixedProbe(duration)),
                encode_backend: backend.clone(),
            },
        );

        Harness { orchestrator, fetcher, backend, remote, work, _state: state }
    }

    fn harness(duration: Option<f64>, backend: ScriptedBackend) -> Harness {
        harness_with(duration, backend, false, None)
    }

    fn params() -> JobParams {
        crate::job::test_params()
    }

    fn uploaded_paths(job: &Job) -> Vec<&str> {
        job.uploaded.iter().map(|u| u.path.as_str()).collect()
    }

    #[tokio::test]
    async fn test_known_duration_uploads_every_segment() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let job = h.orchestrator.run(Job::new(params())).await;

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
        assert_eq!(job.planned_segments, Some(3));
        assert_eq!(
            uploaded_paths(&job),
            vec!["/test/WAV/01/meeting-001.wav", "/test/WAV/01/meeting-002.wav", "/test/WAV/01/meeting-003.wav"]
        );
        assert!(job.uploaded.iter().all(|u| u.size == 4096));
        assert!(h.remote.path().join("test/WAV/01/meeting-003.wav").exists());

        let calls = h.backend.calls.lock().unwrap();
        let starts: Vec<_> = calls.iter().map(|c| c.start).collect();
        assert_eq!(starts, vec![0.0, 390.0, 780.0]);
        assert_eq!(calls[2].length, 220.0);
        drop(calls);

        // scratch space is gone and the persisted record matches
        assert!(!h.work.path().join(&job.id).exists());
        let stored = h.orchestrator.status(&job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Done);
        assert_eq!(stored.uploaded, job.uploaded);
    }

    #[tokio::test]
    async fn test_segments_spill_into_next_bin() {
        let h = harness(Some(3000.0), ScriptedBackend::new(vec![], Some(4096)));
        let mut p = params();
        p.max_dirs = 3;
        p.max_files_per_dir = 5;
        let job = h.orchestrator.run(Job::new(p)).await;

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.uploaded.len(), 8);
        assert_eq!(job.uploaded[4].path, "/test/WAV/01/meeting-005.wav");
        assert_eq!(job.uploaded[5].path, "/test/WAV/02/meeting-006.wav");
    }

    #[tokio::test]
    async fn test_existing_first_segment_skips_without_work() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let existing = h.remote.path().join("test/WAV/03/meeting-001.wav");
        std::fs::create_dir_all(existing.parent().unwrap()).unwrap();
        std::fs::write(&existing, b"old").unwrap();

        let job = h.orchestrator.run(Job::new(params())).await;
        assert_eq!(job.status, JobStatus::Skipped);
        assert_eq!(job.reason.as_deref(), Some("already_processed"));
        assert!(job.uploaded.is_empty());
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_second_run_of_same_group_is_skipped() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let first = h.orchestrator.run(Job::new(params())).await;
        assert_eq!(first.status, JobStatus::Done);
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.call_count(), 3);

        let second = h.orchestrator.run(Job::new(params())).await;
        assert_ne!(second.id, first.id);
        assert_eq!(second.status, JobStatus::Skipped);
        assert_eq!(second.reason.as_deref(), Some("already_processed"));
        assert!(second.uploaded.is_empty());
        assert_eq!(h.fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.backend.call_count(), 3);

        let stored = std::fs::read_dir(h.remote.path().join("test/WAV/01")).unwrap().count();
        assert_eq!(stored, 3);
    }

    #[tokio::test]
    async fn test_zero_dirs_fails_before_any_upload() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let mut p = params();
        p.max_dirs = 0;
        let job = h.orchestrator.run(Job::new(p)).await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.uploaded.is_empty());
        assert!(job.error.as_deref().unwrap().contains("destination directories are full"));
    }

    #[tokio::test]
    async fn test_zero_capacity_fails_before_any_upload() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let mut p = params();
        p.max_dirs = 1;
        p.max_files_per_dir = 0;
        let job = h.orchestrator.run(Job::new(p)).await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.uploaded.is_empty());
        assert!(job.error.as_deref().unwrap().contains("destination directories are full"));
    }

    #[tokio::test]
    async fn test_exhaustion_mid_job_keeps_partial_uploads() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let mut p = params();
        p.max_dirs = 1;
        p.max_files_per_dir = 2;
        let job = h.orchestrator.run(Job::new(p)).await;

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(
            uploaded_paths(&job),
            vec!["/test/WAV/01/meeting-001.wav", "/test/WAV/01/meeting-002.wav"]
        );
        assert!(job.progress < 100);
    }

    #[tokio::test]
    async fn test_unknown_duration_stops_at_end_of_source() {
        // segments 1 and 2 stream-copy fine, segment 3 fails both tiers
        let h = harness(None, ScriptedBackend::new(vec![Some(4096), Some(4096)], None));
        let job = h.orchestrator.run(Job::new(params())).await;

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.uploaded.len(), 2);
        assert_eq!(job.duration_secs, None);
        assert_eq!(job.planned_segments, None);
        assert_eq!(job.progress, 100);
        assert_eq!(h.backend.call_count(), 4);
    }

    #[tokio::test]
    async fn test_unknown_duration_respects_max_segments() {
        let h = harness(None, ScriptedBackend::new(vec![], Some(4096)));
        let mut p = params();
        p.max_segments = Some(4);
        let job = h.orchestrator.run(Job::new(p)).await;

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.uploaded.len(), 4);
    }

    #[tokio::test]
    async fn test_first_segment_failure_is_fatal() {
        let h = harness(None, ScriptedBackend::new(vec![], None));
        let job = h.orchestrator.run(Job::new(params())).await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.uploaded.is_empty());
        assert!(job.error.as_deref().unwrap().starts_with("encode failed: segment 1"));
    }

    #[tokio::test]
    async fn test_later_failure_with_known_duration_is_fatal() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![Some(4096)], None));
        let job = h.orchestrator.run(Job::new(params())).await;

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.uploaded.len(), 1);
        assert!(job.error.as_deref().unwrap().contains("segment 2"));
    }

    #[tokio::test]
    async fn test_fetch_failure_is_an_error() {
        let h = harness_with(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)), true, None);
        let job = h.orchestrator.run(Job::new(params())).await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.error.as_deref().unwrap().starts_with("failed to download source"));
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_rate_limited_upload_recovers() {
        let store = Arc::new(FlakyStore::new(vec![
            StorageError::from_status(429, "too_many_requests"),
            StorageError::from_status(429, "too_many_requests"),
        ]));
        let h = harness_with(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)), false, Some(store.clone() as Arc<dyn ObjectStore>));
        let job = h.orchestrator.run(Job::new(params())).await;

        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.uploaded.len(), 3);
        assert_eq!(job.uploaded[0].path, "/test/WAV/01/meeting-001.wav");
        let puts = store.puts.lock().unwrap();
        // segment 1 took three attempts, the rest one each
        assert_eq!(puts.len(), 5);
        assert!(puts[..3].iter().all(|p| p == "/test/WAV/01/meeting-001.wav"));
    }

    #[tokio::test]
    async fn test_persistent_rate_limit_fails_job() {
        let store = Arc::new(FlakyStore::new(vec![
            StorageError::from_status(429, "too_many_requests"),
            StorageError::from_status(429, "too_many_requests"),
            StorageError::from_status(429, "too_many_requests"),
        ]));
        let h = harness_with(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)), false, Some(store.clone() as Arc<dyn ObjectStore>));
        let job = h.orchestrator.run(Job::new(params())).await;

        assert_eq!(job.status, JobStatus::Error);
        assert!(job.uploaded.is_empty());
        assert!(job.error.as_deref().unwrap().starts_with("storage temporarily unavailable"));
        assert_eq!(store.puts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_empty_plan_finishes_done() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let mut p = params();
        p.segment_time = 0.0;
        let job = h.orchestrator.run(Job::new(p)).await;

        assert_eq!(job.status, JobStatus::Done);
        assert!(job.uploaded.is_empty());
        assert_eq!(h.backend.call_count(), 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_invalid_params() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let mut p = params();
        p.format = "flac".into();
        let err = h.orchestrator.submit(p).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_submit_runs_in_background() {
        let h = harness(Some(1000.0), ScriptedBackend::new(vec![], Some(4096)));
        let queued = h.orchestrator.submit(params()).await.unwrap();
        assert_eq!(queued.status, JobStatus::Queued);

        let mut last = None;
        for _ in 0..200 {
            let job = h.orchestrator.status(&queued.id).await.unwrap().unwrap();
            if job.is_terminal() {
                last = Some(job);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let job = last.expect("job did not finish");
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.uploaded.len(), 3);

        let slices = h.orchestrator.slices("meeting", "/test/WAV").await.unwrap();
        assert_eq!(slices.len(), 3);
    }

    #[test]
    fn test_progress_is_held_below_full() {
        let seg = |index, start, length| PlannedSegment { index, start, length };
        assert_eq!(progress_for(&seg(1, 0.0, 400.0), Some(1000.0), 1, 25), 40);
        assert_eq!(progress_for(&seg(2, 390.0, 400.0), Some(1000.0), 2, 25), 79);
        assert_eq!(progress_for(&seg(3, 780.0, 220.0), Some(1000.0), 3, 25), 99);
        assert_eq!(progress_for(&seg(5, 0.0, 400.0), None, 5, 25), 20);
        assert_eq!(progress_for(&seg(30, 0.0, 400.0), None, 30, 25), 99);
        assert_eq!(progress_for(&seg(1, 0.0, 400.0), None, 1, 0), 0);
    }

    #[test]
    fn test_progress_cap_prefers_smaller_limit() {
        let mut p = params();
        assert_eq!(progress_cap(&p), 25);
        p.max_segments = Some(4);
        assert_eq!(progress_cap(&p), 4);
        p.max_segments = Some(100);
        assert_eq!(progress_cap(&p), 25);
    }
}
