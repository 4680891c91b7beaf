use thiserror::Error;

/// Failure class reported by an object store call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageErrorClass {
    /// Rate limiting or a server-side failure; retrying may succeed
    Transient,
    /// Bad request, missing parent path, auth failure; retrying will not help
    Fatal,
}

/// Error returned by [`crate::storage::ObjectStore`] and credential providers
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct StorageError {
    pub class: StorageErrorClass,
    /// HTTP status when the failure came from a response
    pub status: Option<u16>,
    pub message: String,
}

impl StorageError {
    pub fn transient(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            class: StorageErrorClass::Transient,
            status,
            message: message.into(),
        }
    }

    pub fn fatal(status: Option<u16>, message: impl Into<String>) -> Self {
        Self {
            class: StorageErrorClass::Fatal,
            status,
            message: message.into(),
        }
    }

    /// Classify an HTTP status: 429 and 5xx are transient, everything else fatal
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        if status == 429 || (500..600).contains(&status) {
            Self::transient(Some(status), message)
        } else {
            Self::fatal(Some(status), message)
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class == StorageErrorClass::Transient
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        if let Some(status) = err.status() {
            return Self::from_status(status.as_u16(), err.to_string());
        }
        if err.is_timeout() || err.is_connect() {
            Self::transient(None, err.to_string())
        } else {
            Self::fatal(None, err.to_string())
        }
    }
}

/// No destination directory has capacity left
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("all {dir_count} destination directories are full ({capacity_per_dir} files each)")]
pub struct AllocationExhausted {
    pub dir_count: u32,
    pub capacity_per_dir: u32,
}

/// Both codec tiers failed or produced an undersized artifact
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("segment {index}: {reason}")]
pub struct EncodeFailure {
    pub index: u32,
    pub reason: String,
}

/// Everything that can end a job in `error` or reject a submission
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("storage temporarily unavailable: {0}")]
    TransientStorage(StorageError),

    #[error("storage error: {0}")]
    FatalStorage(StorageError),

    #[error("encode failed: {0}")]
    Encode(#[from] EncodeFailure),

    #[error(transparent)]
    AllocationExhausted(#[from] AllocationExhausted),

    #[error("failed to download source: {0}")]
    SourceFetch(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("job store error: {0}")]
    JobStore(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for PipelineError {
    fn from(err: StorageError) -> Self {
        match err.class {
            StorageErrorClass::Transient => PipelineError::TransientStorage(err),
            StorageErrorClass::Fatal => PipelineError::FatalStorage(err),
        }
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;
