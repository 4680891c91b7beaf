use std::fs;
use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use crate::error::{PipelineError, PipelineResult};
use crate::fetch::is_remote_url;

/// Output containers accepted by the encoder
pub const SUPPORTED_FORMATS: &[&str] = &["wav", "m4a", "aac", "mp4", "mka"];

/// Lifecycle state of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Skipped,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Skipped | JobStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Done => "done",
            JobStatus::Skipped => "skipped",
            JobStatus::Error => "error",
        }
    }
}

/// Immutable snapshot of the parameters a job was planned with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub url: String,
    pub segment_time: f64,
    pub overlap_seconds: f64,
    pub format: String,
    pub dest_root: String,
    pub group_prefix: String,
    pub max_dirs: u32,
    pub max_files_per_dir: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_segments: Option<u32>,
}

impl JobParams {
    /// Reject submissions that could never produce a sane output set
    pub fn validate(&self) -> PipelineResult<()> {
        let invalid = |msg: String| Err(PipelineError::Validation(msg));

        if self.url.trim().is_empty() {
            return invalid("url is required".to_string());
        }
        if !is_remote_url(&self.url) {
            return invalid(format!("url must be http(s): {:?}", self.url));
        }
        if self.group_prefix.is_empty() || self.group_prefix.contains('/') {
            return invalid(format!("invalid group_prefix: {:?}", self.group_prefix));
        }
        if !SUPPORTED_FORMATS.contains(&self.format.as_str()) {
            return invalid(format!(
                "unsupported format {:?} (expected one of {})",
                self.format,
                SUPPORTED_FORMATS.join(", ")
            ));
        }
        if !self.dest_root.starts_with('/') {
            return invalid(format!("dest_root must be absolute: {:?}", self.dest_root));
        }
        if !self.segment_time.is_finite() || !self.overlap_seconds.is_finite() {
            return invalid("segment_time and overlap_seconds must be finite".to_string());
        }
        if self.overlap_seconds < 0.0 {
            return invalid("overlap_seconds must not be negative".to_string());
        }
        Ok(())
    }

    /// `dest_root` without a trailing slash
    pub fn dest_root_trimmed(&self) -> &str {
        let trimmed = self.dest_root.trim_end_matches('/');
        if trimmed.is_empty() { "/" } else { trimmed }
    }

    /// Name of segment `index` (1-based), e.g. `meeting-003.wav`
    pub fn segment_file_name(&self, index: u32) -> String {
        format!("{}-{:03}.{}", self.group_prefix, index, self.format)
    }

    /// Total slots across all bins
    pub fn capacity(&self) -> u64 {
        self.max_dirs as u64 * self.max_files_per_dir as u64
    }
}

/// One stored segment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadedSegment {
    pub path: String,
    pub size: u64,
}

/// Durable record of one split-and-upload job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "state")]
    pub status: JobStatus,
    pub progress: u8,
    pub uploaded: Vec<UploadedSegment>,
    pub group_prefix: String,
    pub params: JobParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub planned_segments: Option<u32>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    /// Refreshed on every persist; stale values mean the worker is gone
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Create a queued job with a fresh id
    pub fn new(params: JobParams) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            status: JobStatus::Queued,
            progress: 0,
            uploaded: Vec::new(),
            group_prefix: params.group_prefix.clone(),
            params,
            error: None,
            reason: None,
            duration_secs: None,
            planned_segments: None,
            created_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn mark_running(&mut self) {
        if self.status != JobStatus::Queued {
            return;
        }
        self.status = JobStatus::Running;
        self.started_at = Some(Utc::now());
    }

    /// Append an uploaded segment and raise progress; progress never goes down
    pub fn record_upload(&mut self, segment: UploadedSegment, progress: u8) {
        if self.status != JobStatus::Running {
            return;
        }
        self.uploaded.push(segment);
        self.progress = self.progress.max(progress.min(100));
    }

    pub fn mark_done(&mut self) {
        if self.finish(JobStatus::Done) {
            self.progress = 100;
        }
    }

    pub fn mark_skipped(&mut self, reason: impl Into<String>) {
        if self.finish(JobStatus::Skipped) {
            self.reason = Some(reason.into());
        }
    }

    pub fn mark_error(&mut self, cause: impl Into<String>) {
        if self.finish(JobStatus::Error) {
            self.error = Some(cause.into());
        }
    }

    fn finish(&mut self, status: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = status;
        self.finished_at = Some(Utc::now());
        true
    }
}

/// Path of a job's state file
pub fn job_file_path(job_id: &str, job_state_dir: &Path) -> PathBuf {
    job_state_dir.join(format!("{}.json", job_id))
}

/// Persist a job as a whole-record replacement (write temp file, then rename)
pub fn save_job(job: &Job, job_state_dir: &Path) -> Result<()> {
    fs::create_dir_all(job_state_dir)
        .with_context(|| format!("Failed to create job state directory: {}", job_state_dir.display()))?;

    let final_path = job_file_path(&job.id, job_state_dir);
    let tmp_path = job_state_dir.join(format!(".{}.json.tmp", job.id));

    let json = serde_json::to_vec_pretty(job)
        .with_context(|| format!("Failed to serialize job {}", job.id))?;
    fs::write(&tmp_path, json)
        .with_context(|| format!("Failed to write job file: {}", tmp_path.display()))?;
    fs::rename(&tmp_path, &final_path)
        .with_context(|| format!("Failed to move job file into place: {}", final_path.display()))?;

    Ok(())
}

/// Load one job, `None` if no record exists
pub fn load_job(job_id: &str, job_state_dir: &Path) -> Result<Option<Job>> {
    let path = job_file_path(job_id, job_state_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;
    let job = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))?;
    Ok(Some(job))
}

/// Load every job record in the directory, skipping unreadable files
pub fn load_all_jobs(job_state_dir: &Path) -> Result<Vec<Job>> {
    let mut jobs = Vec::new();
    if !job_state_dir.exists() {
        return Ok(jobs);
    }

    let entries = fs::read_dir(job_state_dir)
        .with_context(|| format!("Failed to read job state directory: {}", job_state_dir.display()))?;

    for entry in entries {
        let path = entry?.path();
        let is_record = path.extension().and_then(|s| s.to_str()) == Some("json")
            && !path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with('.'))
                .unwrap_or(true);
        if !is_record {
            continue;
        }

        match fs::read_to_string(&path)
            .map_err(anyhow::Error::from)
            .and_then(|c| serde_json::from_str::<Job>(&c).map_err(anyhow::Error::from))
        {
            Ok(job) => jobs.push(job),
            Err(e) => log::warn!("Skipping unreadable job file {}: {}", path.display(), e),
        }
    }

    Ok(jobs)
}

/// Durable key-value surface for job records
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn write(&self, job: &Job) -> PipelineResult<()>;
    async fn read(&self, job_id: &str) -> PipelineResult<Option<Job>>;
    async fn list(&self) -> PipelineResult<Vec<Job>>;
}

/// One JSON file per job under a state directory
#[derive(Debug, Clone)]
pub struct FileJobStore {
    dir: PathBuf,
}

impl FileJobStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl JobStore for FileJobStore {
    async fn write(&self, job: &Job) -> PipelineResult<()> {
        let mut job = job.clone();
        job.updated_at = Utc::now();
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || save_job(&job, &dir))
            .await
            .map_err(|e| PipelineError::JobStore(e.to_string()))?
            .map_err(|e| PipelineError::JobStore(format!("{:#}", e)))
    }

    async fn read(&self, job_id: &str) -> PipelineResult<Option<Job>> {
        // ids are uuids; refuse anything that could escape the directory
        if job_id.is_empty() || job_id.contains(['/', '\\', '.']) {
            return Ok(None);
        }
        let dir = self.dir.clone();
        let job_id = job_id.to_string();
        tokio::task::spawn_blocking(move || load_job(&job_id, &dir))
            .await
            .map_err(|e| PipelineError::JobStore(e.to_string()))?
            .map_err(|e| PipelineError::JobStore(format!("{:#}", e)))
    }

    async fn list(&self) -> PipelineResult<Vec<Job>> {
        let dir = self.dir.clone();
        tokio::task::spawn_blocking(move || load_all_jobs(&dir))
            .await
            .map_err(|e| PipelineError::JobStore(e.to_string()))?
            .map_err(|e| PipelineError::JobStore(format!("{:#}", e)))
    }
}

#[cfg(test)]
pub(crate) fn test_params() -> JobParams {
    JobParams {
        url: "https://www.dropbox.com/s/abc/meeting.m4a?dl=0".to_string(),
        segment_time: 400.0,
        overlap_seconds: 10.0,
        format: "wav".to_string(),
        dest_root: "/test/WAV".to_string(),
        group_prefix: "meeting".to_string(),
        max_dirs: 5,
        max_files_per_dir: 5,
        max_segments: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_lifecycle_transitions() {
        let mut job = Job::new(test_params());
        assert_eq!(job.status, JobStatus::Queued);
        assert_eq!(job.group_prefix, "meeting");

        job.mark_running();
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.started_at.is_some());

        job.record_upload(UploadedSegment { path: "/test/WAV/01/meeting-001.wav".into(), size: 10 }, 40);
        job.record_upload(UploadedSegment { path: "/test/WAV/01/meeting-002.wav".into(), size: 10 }, 30);
        assert_eq!(job.uploaded.len(), 2);
        assert_eq!(job.progress, 40, "progress must not decrease");

        job.mark_done();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.progress, 100);
    }

    #[test]
    fn test_terminal_jobs_are_immutable() {
        let mut job = Job::new(test_params());
        job.mark_running();
        job.mark_error("boom");
        job.mark_done();
        job.mark_skipped("already_processed");
        job.record_upload(UploadedSegment { path: "/x".into(), size: 1 }, 100);

        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.reason.is_none());
        assert!(job.uploaded.is_empty());
    }

    #[test]
    fn test_serialized_shape() {
        let mut job = Job::new(test_params());
        job.mark_running();
        job.mark_skipped("already_processed");
        let value = serde_json::to_value(&job).unwrap();
        assert_eq!(value["state"], "skipped");
        assert_eq!(value["reason"], "already_processed");
        assert!(value.get("error").is_none());
        assert_eq!(value["params"]["segment_time"], 400.0);
    }

    #[test]
    fn test_validation() {
        assert!(test_params().validate().is_ok());

        let mut p = test_params();
        p.url = " ".into();
        assert!(matches!(p.validate(), Err(PipelineError::Validation(_))));

        let mut p = test_params();
        p.format = "exe".into();
        assert!(p.validate().is_err());

        let mut p = test_params();
        p.group_prefix = "a/b".into();
        assert!(p.validate().is_err());

        let mut p = test_params();
        p.dest_root = "relative".into();
        assert!(p.validate().is_err());

        // zero-length segments are accepted; the plan is simply empty
        let mut p = test_params();
        p.segment_time = 0.0;
        assert!(p.validate().is_ok());

        // zero capacity either way is accepted; the first allocation fails the job
        let mut p = test_params();
        p.max_dirs = 1;
        p.max_files_per_dir = 0;
        assert!(p.validate().is_ok());
        let mut p = test_params();
        p.max_dirs = 0;
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_only_http_sources_are_accepted() {
        for url in ["file:///etc/passwd", "FILE:///etc/passwd", "/etc/passwd", "ftp://host/a.wav"] {
            let mut p = test_params();
            p.url = url.into();
            assert!(matches!(p.validate(), Err(PipelineError::Validation(_))), "{}", url);
        }
        let mut p = test_params();
        p.url = "http://example.com/a.m4a".into();
        assert!(p.validate().is_ok());
    }

    #[test]
    fn test_segment_naming() {
        let p = test_params();
        assert_eq!(p.segment_file_name(1), "meeting-001.wav");
        assert_eq!(p.segment_file_name(42), "meeting-042.wav");

        let mut p = test_params();
        p.dest_root = "/test/WAV/".into();
        assert_eq!(p.dest_root_trimmed(), "/test/WAV");
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempdir().unwrap();
        let mut job = Job::new(test_params());
        save_job(&job, dir.path()).unwrap();

        job.mark_running();
        save_job(&job, dir.path()).unwrap();

        let loaded = load_job(&job.id, dir.path()).unwrap().unwrap();
        assert_eq!(loaded.status, JobStatus::Running);
        assert_eq!(loaded.params, job.params);

        // no temp files left behind
        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        assert_eq!(names, vec![format!("{}.json", job.id)]);
    }

    #[test]
    fn test_load_all_skips_garbage() {
        let dir = tempdir().unwrap();
        save_job(&Job::new(test_params()), dir.path()).unwrap();
        save_job(&Job::new(test_params()), dir.path()).unwrap();
        fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        fs::write(dir.path().join("notes.txt"), "hello").unwrap();

        let jobs = load_all_jobs(dir.path()).unwrap();
        assert_eq!(jobs.len(), 2);
    }

    #[tokio::test]
    async fn test_file_store_refreshes_heartbeat() {
        let dir = tempdir().unwrap();
        let store = FileJobStore::new(dir.path());
        let mut job = Job::new(test_params());
        job.updated_at = Utc::now() - chrono::Duration::hours(1);

        store.write(&job).await.unwrap();
        let loaded = store.read(&job.id).await.unwrap().unwrap();
        assert!(loaded.updated_at > job.updated_at);

        assert!(store.read("missing").await.unwrap().is_none());
        assert!(store.read("../etc/passwd").await.unwrap().is_none());
        assert_eq!(store.list().await.unwrap().len(), 1);
    }
}
