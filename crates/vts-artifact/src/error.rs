//! Error types for image comparison
//!
//! Covers decoding, dimension checks and writing result bitmaps.

use std::path::PathBuf;

/// Errors raised by the [`ImageComparator`](crate::ImageComparator)
#[derive(Debug, thiserror::Error)]
pub enum CompareError {
    /// Bytes are not a decodable image, or decode to the wrong size
    #[error("invalid image: {0}")]
    InvalidImage(String),

    /// The two inputs (or an input and the canonical size) disagree
    #[error("image size mismatch: expected {expected_width}x{expected_height}, got {actual_width}x{actual_height}")]
    SizeMismatch {
        expected_width: u32,
        expected_height: u32,
        actual_width: u32,
        actual_height: u32,
    },

    /// IO error while reading or writing an image file
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// PNG encoding failed
    #[error("failed to encode {path}: {source}")]
    Encode {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

impl CompareError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create size mismatch from expected and actual dimensions
    #[must_use]
    pub const fn size_mismatch(expected: (u32, u32), actual: (u32, u32)) -> Self {
        Self::SizeMismatch {
            expected_width: expected.0,
            expected_height: expected.1,
            actual_width: actual.0,
            actual_height: actual.1,
        }
    }
}

/// Result type alias for comparison operations
pub type CompareResult<T> = Result<T, CompareError>;
