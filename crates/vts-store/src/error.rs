//! Error types for the artifact store
//!
//! Provides the error taxonomy for:
//! - Rejected submissions (invalid images)
//! - Comparison failures (size mismatches)
//! - Reference pointer precondition violations
//! - Consistency violations found while loading or verifying
//! - Artifact retrieval

use std::path::PathBuf;
use vts_artifact::{CompareError, TripleError};

/// Main store error type
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Wrong dimensions or undecodable bytes; rejected before any write
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// Comparator invoked on images of unequal or non-canonical size
    #[error("image size mismatch: expected {expected_width}x{expected_height}, got {actual_width}x{actual_height}")]
    SizeMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    /// Ingestion aborted because the candidate could not be compared
    #[error("could not compare images for {triple}: {reason}")]
    ComparisonFailed { triple: String, reason: String },

    /// No reference pointer exists for the triple
    #[error("no reference image found for {0}")]
    ReferenceNotFound(String),

    /// A reference pointer already exists for the triple
    #[error("reference pointer already exists for {0}")]
    ReferenceExists(String),

    /// A run with this timestamp is already stored for the triple
    #[error("test run already exists: {0}")]
    RunExists(String),

    /// On-disk state contradicts itself
    #[error("consistency violation: {0}")]
    ConsistencyViolation(String),

    /// The triple has no test runs
    #[error("no test found for {0}")]
    NoRuns(String),

    /// Requested run or file does not exist
    #[error("artifact not found: {}", path.display())]
    ArtifactNotFound { path: PathBuf },

    /// The image exists but its thumbnail does not
    #[error("thumbnail missing: {}", path.display())]
    ThumbnailMissing { path: PathBuf },

    /// Threshold outside `[0, 1]`
    #[error("comparison threshold must be between 0 and 1, got {0}")]
    InvalidThreshold(f64),

    /// Group, name or hardware unusable as a path segment
    #[error(transparent)]
    InvalidTriple(#[from] TripleError),

    /// Configuration file is malformed or out of range
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error on a store path
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Data record could not be (de)serialized
    #[error("json error in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Image encoding error
    #[error("image error: {0}")]
    Image(CompareError),

    /// Blocking task panicked or was cancelled
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl StoreError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create JSON error for path
    pub fn json_error(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }

    /// Create consistency violation
    pub fn inconsistent(message: impl Into<String>) -> Self {
        Self::ConsistencyViolation(message.into())
    }

    /// Whether the store must not keep serving after this error
    #[inline]
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::ConsistencyViolation(_))
    }

    /// Whether the caller can fix this by sending different input
    #[inline]
    #[must_use]
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidImage(_)
                | Self::InvalidThreshold(_)
                | Self::InvalidTriple(_)
                | Self::NoRuns(_)
                | Self::ReferenceNotFound(_)
                | Self::RunExists(_)
                | Self::ComparisonFailed { .. }
        )
    }
}

impl From<CompareError> for StoreError {
    fn from(err: CompareError) -> Self {
        match err {
            CompareError::InvalidImage(msg) => Self::InvalidImage(msg),
            CompareError::SizeMismatch {
                expected_width,
                expected_height,
                actual_width,
                actual_height,
            } => Self::SizeMismatch {
                expected_width,
                expected_height,
                actual_width,
                actual_height,
            },
            CompareError::Io { path, source } => Self::Io { path, source },
            other @ CompareError::Encode { .. } => Self::Image(other),
        }
    }
}

/// Result type alias for store operations
pub type StoreResult<T> = Result<T, StoreError>;
