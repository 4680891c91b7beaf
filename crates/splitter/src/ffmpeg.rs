use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::Stdio;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::debug;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::{timeout, Duration};

/// Lines of ffmpeg stderr kept for failure reasons
const STDERR_TAIL_LINES: usize = 12;

/// How the audio stream is written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecPolicy {
    /// `-c copy`, no re-encode
    StreamCopy,
    /// Re-encode with the given codec, optionally at a bitrate
    Transcode {
        codec: &'static str,
        bitrate: Option<String>,
    },
}

impl CodecPolicy {
    /// Fallback transcode for a target container: AAC for compressed
    /// containers, 16-bit PCM for the rest
    pub fn transcode_for(format: &str, aac_bitrate: &str) -> Self {
        match format {
            "m4a" | "aac" | "mp4" => CodecPolicy::Transcode {
                codec: "aac",
                bitrate: Some(aac_bitrate.to_string()),
            },
            _ => CodecPolicy::Transcode {
                codec: "pcm_s16le",
                bitrate: None,
            },
        }
    }

    pub fn label(&self) -> &str {
        match self {
            CodecPolicy::StreamCopy => "stream copy",
            CodecPolicy::Transcode { codec, .. } => codec,
        }
    }
}

/// One ffmpeg cut
#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub input: PathBuf,
    pub output: PathBuf,
    pub start: f64,
    pub length: f64,
    pub policy: CodecPolicy,
}

/// Result of running the engine once
#[derive(Debug, Clone, Default)]
pub struct EncodeRun {
    pub success: bool,
    pub exit_code: Option<i32>,
    /// Last lines of stderr
    pub stderr_tail: String,
}

/// Executes encode requests
#[async_trait]
pub trait EncodeBackend: Send + Sync {
    /// `Err` only when the engine could not run at all (spawn failure, timeout)
    async fn run(&self, request: &EncodeRequest) -> Result<EncodeRun>;
}

/// Command builder for generating FFmpeg command lines
pub struct CommandBuilder;

impl CommandBuilder {
    pub fn new() -> Self {
        CommandBuilder
    }

    /// Build the argument list for one segment cut.
    ///
    /// Seeks on the input side (`-ss` before `-i`), keeps only audio
    /// (`-vn -map 0:a:0`) and overwrites the output.
    pub fn build_segment_command(&self, request: &EncodeRequest) -> Vec<String> {
        let mut args: Vec<String> = vec![
            "-hide_banner".into(),
            "-nostdin".into(),
            "-y".into(),
            "-ss".into(),
            format_seconds(request.start),
            "-t".into(),
            format_seconds(request.length),
            "-i".into(),
            request.input.to_string_lossy().to_string(),
            "-vn".into(),
            "-map".into(),
            "0:a:0".into(),
        ];

        match &request.policy {
            CodecPolicy::StreamCopy => {
                args.push("-c".into());
                args.push("copy".into());
            }
            CodecPolicy::Transcode { codec, bitrate } => {
                args.push("-c:a".into());
                args.push((*codec).to_string());
                if let Some(bitrate) = bitrate {
                    args.push("-b:a".into());
                    args.push(bitrate.clone());
                }
            }
        }

        args.push(request.output.to_string_lossy().to_string());
        args
    }
}

impl Default for CommandBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn format_seconds(secs: f64) -> String {
    format!("{:.3}", secs.max(0.0))
}

/// Runs the native ffmpeg binary
#[derive(Debug, Clone)]
pub struct FfmpegBackend {
    ffmpeg_bin: PathBuf,
    timeout_secs: Option<u64>,
}

impl FfmpegBackend {
    pub fn new(ffmpeg_bin: impl Into<PathBuf>, timeout_secs: Option<u64>) -> Self {
        Self {
            ffmpeg_bin: ffmpeg_bin.into(),
            timeout_secs,
        }
    }

    /// Execute ffmpeg, collecting the stderr tail and killing it on timeout
    pub async fn execute_ffmpeg(&self, args: Vec<String>) -> Result<EncodeRun> {
        let cmd_str = format!("{} {}", self.ffmpeg_bin.display(), args.join(" "));
        debug!("Executing FFmpeg: {}", cmd_str);

        let mut child = Command::new(&self.ffmpeg_bin)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!(
                "Failed to spawn FFmpeg process at: {}. Ensure FFmpeg is installed and accessible.",
                self.ffmpeg_bin.display()
            ))?;

        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("Failed to capture FFmpeg stderr"))?;

        let stderr_handle = tokio::spawn(async move {
            let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            tail.into_iter().collect::<Vec<_>>().join("\n")
        });

        let status = match self.timeout_secs {
            Some(secs) => match timeout(Duration::from_secs(secs), child.wait()).await {
                Ok(result) => result.context("Failed to wait for FFmpeg process")?,
                Err(_) => {
                    child.kill().await.context("Failed to kill stuck FFmpeg process")?;
                    return Err(anyhow!("FFmpeg process timed out after {} seconds", secs));
                }
            },
            None => child.wait().await.context("Failed to wait for FFmpeg process")?,
        };

        let stderr_tail = stderr_handle.await.context("Failed to read FFmpeg stderr")?;
        if !status.success() {
            debug!("FFmpeg exited with {:?}: {}", status.code(), stderr_tail);
        }

        Ok(EncodeRun {
            success: status.success(),
            exit_code: status.code(),
            stderr_tail,
        })
    }
}

#[async_trait]
impl EncodeBackend for FfmpegBackend {
    async fn run(&self, request: &EncodeRequest) -> Result<EncodeRun> {
        let args = CommandBuilder::new().build_segment_command(request);
        self.execute_ffmpeg(args).await
    }
}
