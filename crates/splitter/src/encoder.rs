use std::path::{Path, PathBuf};
use std::sync::Arc;
use log::{debug, warn};
use crate::error::EncodeFailure;
use crate::ffmpeg::{CodecPolicy, EncodeBackend, EncodeRequest};
use crate::planner::PlannedSegment;

/// An encoded segment on local disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub index: u32,
    pub path: PathBuf,
    pub size: u64,
    /// Which tier produced it
    pub codec: String,
}

/// What one encode step produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOutcome {
    Segment(Artifact),
    /// Nothing left to read; stop planning and finish the job
    EndOfSource,
    Fatal(EncodeFailure),
}

/// Where a segment sits in the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncodeContext {
    pub is_first: bool,
    pub duration_known: bool,
}

/// Output naming for a job's segments
#[derive(Debug, Clone)]
pub struct SegmentTarget<'a> {
    pub dir: &'a Path,
    pub group_prefix: &'a str,
    pub format: &'a str,
}

impl SegmentTarget<'_> {
    /// `{dir}/{group_prefix}-{index:03}.{format}`
    pub fn path_for(&self, index: u32) -> PathBuf {
        self.dir
            .join(format!("{}-{:03}.{}", self.group_prefix, index, self.format))
    }
}

pub struct SegmentEncoder {
    backend: Arc<dyn EncodeBackend>,
    min_bytes: u64,
    aac_bitrate: String,
}

impl SegmentEncoder {
    pub fn new(backend: Arc<dyn EncodeBackend>, min_bytes: u64, aac_bitrate: impl Into<String>) -> Self {
        Self {
            backend,
            min_bytes,
            aac_bitrate: aac_bitrate.into(),
        }
    }

    pub async fn encode(
        &self,
        source: &Path,
        planned: &PlannedSegment,
        target: &SegmentTarget<'_>,
        ctx: EncodeContext,
    ) -> SegmentOutcome {
        let output = target.path_for(planned.index);
        let tiers = [
            CodecPolicy::StreamCopy,
            CodecPolicy::transcode_for(target.format, &self.aac_bitrate),
        ];

        let mut reasons = Vec::with_capacity(tiers.len());
        for policy in tiers {
            let label = policy.label().to_string();
            let request = EncodeRequest {
                input: source.to_path_buf(),
                output: output.clone(),
                start: planned.start,
                length: planned.length,
                policy,
            };

            match self.attempt(&request).await {
                Ok(size) => {
                    debug!(
                        "Segment {} encoded with {} ({} bytes)",
                        planned.index, label, size
                    );
                    return SegmentOutcome::Segment(Artifact {
                        index: planned.index,
                        path: output,
                        size,
                        codec: label,
                    });
                }
                Err(reason) => {
                    debug!("Segment {} {} failed: {}", planned.index, label, reason);
                    reasons.push(format!("{}: {}", label, reason));
                }
            }
        }

        let _ = tokio::fs::remove_file(&output).await;
        let failure = EncodeFailure {
            index: planned.index,
            reason: reasons.join("; "),
        };

        if !ctx.is_first && !ctx.duration_known {
            debug!("Segment {} produced nothing; treating as end of source", planned.index);
            return SegmentOutcome::EndOfSource;
        }
        warn!("Segment {} could not be encoded: {}", planned.index, failure.reason);
        SegmentOutcome::Fatal(failure)
    }

    /// Run one tier and check the artifact; `Err` carries a short reason
    async fn attempt(&self, request: &EncodeRequest) -> Result<u64, String> {
        let _ = tokio::fs::remove_file(&request.output).await;

        let run = self
            .backend
            .run(request)
            .await
            .map_err(|e| format!("{:#}", e))?;
        if !run.success {
            let tail = run.stderr_tail.lines().last().unwrap_or("").trim().to_string();
            return Err(format!("exit code {}: {}", run.exit_code.unwrap_or(-1), tail));
        }

        let size = tokio::fs::metadata(&request.output)
            .await
            .map(|m| m.len())
            .map_err(|_| "no output file".to_string())?;
        if size <= self.min_bytes {
            return Err(format!("output too small ({} bytes)", size));
        }
        Ok(size)
    }
}
