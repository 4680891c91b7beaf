pub mod allocator;
pub mod config;
pub mod encoder;
pub mod error;
pub mod fetch;
pub mod ffmpeg;
pub mod ffprobe;
pub mod guard;
pub mod job;
pub mod orchestrator;
pub mod planner;
pub mod reaper;
pub mod storage;
pub mod uploader;

pub use config::{SplitterConfig, StorageConfig};
pub use error::{PipelineError, PipelineResult, StorageError};
pub use job::{FileJobStore, Job, JobParams, JobStatus, JobStore};
pub use orchestrator::{Components, Orchestrator};
pub use reaper::recover_stale_jobs;
pub use storage::{store_from_config, ObjectStore};
