use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for the segment splitting service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SplitterConfig {
    /// Directory where job state JSON files are stored
    pub job_state_dir: PathBuf,
    /// Scratch directory for downloaded sources and encoded segments
    pub work_dir: PathBuf,
    /// HTTP bind address
    pub bind_addr: String,
    /// HTTP port
    pub port: u16,
    /// Expected value of the `x-api-key` header; no check when unset
    pub api_key: Option<String>,
    /// Path to the ffmpeg binary
    pub ffmpeg_bin: PathBuf,
    /// Path to the ffprobe binary
    pub ffprobe_bin: PathBuf,
    /// Kill an ffmpeg invocation after this many seconds
    pub encode_timeout_secs: u64,
    /// Artifacts at or below this size are treated as failed output
    pub min_segment_bytes: u64,
    /// Bitrate for the AAC transcode fallback
    pub aac_bitrate: String,
    /// Upload attempts for transient storage failures
    pub upload_max_attempts: u32,
    /// Base delay for linear upload backoff (delay = base * attempt)
    pub upload_base_delay_ms: u64,
    /// Queued/running jobs without a heartbeat for this long are marked as error
    pub stale_job_timeout_secs: u64,
    /// Interval between stale job sweeps
    pub reaper_interval_secs: u64,
    /// Where segments go
    pub storage: StorageConfig,
    /// Values used for any field missing from a submission
    pub defaults: JobDefaults,
}

/// Object store backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Dropbox HTTP API
    Dropbox(DropboxCredentials),
    /// Plain directory tree standing in for the remote store
    Local { root: PathBuf },
}

/// Dropbox credentials; refresh-token grant wins over a static access token
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DropboxCredentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
}

impl DropboxCredentials {
    pub fn has_refresh_grant(&self) -> bool {
        self.refresh_token.is_some() && self.client_id.is_some() && self.client_secret.is_some()
    }

    /// Overlay any non-empty values from `other`
    pub fn merge(&mut self, other: DropboxCredentials) {
        fn pick(slot: &mut Option<String>, value: Option<String>) {
            if let Some(v) = value.filter(|v| !v.is_empty()) {
                *slot = Some(v);
            }
        }
        pick(&mut self.access_token, other.access_token);
        pick(&mut self.refresh_token, other.refresh_token);
        pick(&mut self.client_id, other.client_id);
        pick(&mut self.client_secret, other.client_secret);
    }
}

/// Defaults applied to submissions
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobDefaults {
    pub segment_time: f64,
    pub overlap_seconds: f64,
    pub format: String,
    pub dest_root: String,
    pub group_prefix: String,
    pub max_dirs: u32,
    pub max_files_per_dir: u32,
    pub max_segments: Option<u32>,
}

impl Default for JobDefaults {
    fn default() -> Self {
        Self {
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
}

impl Default for SplitterConfig {
    fn default() -> Self {
        Self::default_config()
    }
}

impl SplitterConfig {
    /// Create a default configuration with sensible values
    pub fn default_config() -> Self {
        Self {
            job_state_dir: PathBuf::from("/tmp/splitd-jobs"),
            work_dir: std::env::temp_dir().join("splitd-work"),
            bind_addr: "0.0.0.0".to_string(),
            port: 8080,
            api_key: None,
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            ffprobe_bin: PathBuf::from("ffprobe"),
            encode_timeout_secs: 1800,
            min_segment_bytes: 1024,
            aac_bitrate: "128k".to_string(),
            upload_max_attempts: 3,
            upload_base_delay_ms: 2000,
            stale_job_timeout_secs: 6 * 3600,
            reaper_interval_secs: 300,
            storage: StorageConfig::Dropbox(DropboxCredentials::default()),
            defaults: JobDefaults::default(),
        }
    }

    /// Load configuration from a file, or return defaults if path is None or file doesn't exist
    pub fn load_config(path: Option<&Path>) -> Result<Self> {
        let mut config = Self::default_config();

        if let Some(config_path) = path {
            if config_path.exists() {
                let content = std::fs::read_to_string(config_path)
                    .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

                if config_path.extension().and_then(|s| s.to_str()) == Some("toml") {
                    config = toml::from_str(&content)
                        .with_context(|| format!("Failed to parse TOML config: {}", config_path.display()))?;
                } else {
                    config = serde_json::from_str(&content)
                        .with_context(|| format!("Failed to parse JSON config: {}", config_path.display()))?;
                }
            }
        }

        Ok(config)
    }
}
