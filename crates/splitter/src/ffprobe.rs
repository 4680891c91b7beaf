use std::path::{Path, PathBuf};
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, warn};
use serde::Deserialize;
use tokio::process::Command;

/// The parts of `ffprobe -show_format` output we read
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeData {
    pub format: FFProbeFormat,
}

/// Format-level metadata from ffprobe
#[derive(Debug, Clone, Deserialize)]
pub struct FFProbeFormat {
    #[serde(default)]
    pub format_name: Option<String>,
    /// Seconds as a decimal string, absent or "N/A" for unseekable inputs
    #[serde(default)]
    pub duration: Option<String>,
    #[serde(default)]
    pub bit_rate: Option<String>,
}

impl FFProbeData {
    /// Positive, finite duration in seconds
    pub fn duration_secs(&self) -> Option<f64> {
        self.format
            .duration
            .as_deref()
            .and_then(|d| d.trim().parse::<f64>().ok())
            .filter(|d| d.is_finite() && *d > 0.0)
    }
}

/// Determines a source's duration, if it can
#[async_trait]
pub trait DurationProbe: Send + Sync {
    /// `None` means unknown; the job then runs in streaming mode
    async fn probe(&self, path: &Path) -> Option<f64>;
}

/// Native ffprobe invocation
#[derive(Debug, Clone)]
pub struct FfprobeDurationProbe {
    ffprobe_bin: PathBuf,
}

impl FfprobeDurationProbe {
    pub fn new(ffprobe_bin: impl Into<PathBuf>) -> Self {
        Self { ffprobe_bin: ffprobe_bin.into() }
    }

    /// Run ffprobe and parse its JSON output
    pub async fn probe_file(&self, file_path: &Path) -> Result<FFProbeData> {
        if !file_path.exists() {
            anyhow::bail!("File does not exist: {}", file_path.display());
        }

        debug!("Executing ffprobe for: {}", file_path.display());
        let output = Command::new(&self.ffprobe_bin)
            .arg("-v")
            .arg("error")
            .arg("-print_format")
            .arg("json")
            .arg("-show_format")
            .arg(file_path)
            .output()
            .await
            .with_context(|| format!(
                "Failed to execute ffprobe at {} for: {}",
                self.ffprobe_bin.display(),
                file_path.display()
            ))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            anyhow::bail!(
                "ffprobe failed (exit code {}) for {}: {}",
                output.status.code().unwrap_or(-1),
                file_path.display(),
                stderr.trim()
            );
        }

        let json_str = String::from_utf8(output.stdout).context("ffprobe output is not valid UTF-8")?;
        parse_probe_output(&json_str)
            .with_context(|| format!("Failed to parse ffprobe JSON for: {}", file_path.display()))
    }
}

pub fn parse_probe_output(json_str: &str) -> Result<FFProbeData> {
    Ok(serde_json::from_str(json_str)?)
}

#[async_trait]
impl DurationProbe for FfprobeDurationProbe {
    async fn probe(&self, path: &Path) -> Option<f64> {
        match self.probe_file(path).await {
            Ok(data) => data.duration_secs(),
            Err(e) => {
                warn!("Duration probe failed, continuing without it: {:#}", e);
                None
            }
        }
    }
}
