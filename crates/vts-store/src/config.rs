//! Configuration
//!
//! [`ServerConfig`] mirrors the `config.json` file read by the server and the
//! CLI. [`StoreConfig`] is the slice of it the store itself needs; it is
//! passed in at construction and replaced when the threshold changes.

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use vts_artifact::ComparatorSettings;

/// Canonical image dimensions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// How duplicate candidate/difference images are recognised
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupStrategy {
    /// Compare against every prior run's image
    #[default]
    Scan,
    /// Look up a Blake3 hash of the decoded pixels
    Hash,
}

/// Slack notification target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SlackConfig {
    pub token: String,
    pub channel: String,
}

/// Contents of `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ServerConfig {
    /// Port the HTTP server listens on
    pub port: u16,
    /// Slack notification target
    pub slack: SlackConfig,
    /// Threshold used by the image comparison to detect changed pixels
    pub comparison_threshold: f64,
    /// Size every stored image must have
    pub image_size: ImageSize,
    /// Factor by which thumbnails are reduced
    pub thumbnail_scale: u32,
    /// Token required for reference invalidation and threshold changes
    pub admin_token: String,
    /// Directory holding test results and images
    pub data: PathBuf,
    /// Runner ids allowed to submit tests
    pub runners: Vec<String>,
    /// Duplicate detection strategy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup: Option<DedupStrategy>,
}

impl ServerConfig {
    /// Load and validate a configuration file
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] if the file is malformed or a value is
    /// out of range
    pub fn load(path: &Path) -> StoreResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| StoreError::io_error(path, e))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| StoreError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration back as pretty JSON
    ///
    /// # Errors
    /// Returns error if the file cannot be written
    pub fn save(&self, path: &Path) -> StoreResult<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| StoreError::json_error(path, e))?;
        std::fs::write(path, json).map_err(|e| StoreError::io_error(path, e))
    }

    /// Check value ranges
    ///
    /// # Errors
    /// Returns [`StoreError::Config`] naming the first offending field
    pub fn validate(&self) -> StoreResult<()> {
        let fail = |msg: &str| Err(StoreError::Config(msg.to_string()));

        if self.port < 1000 {
            return fail("port must be between 1000 and 65535");
        }
        if !(0.0..=1.0).contains(&self.comparison_threshold) {
            return fail("comparisonThreshold must be between 0 and 1");
        }
        if self.image_size.width < 1 || self.image_size.height < 1 {
            return fail("imageSize width and height must be at least 1");
        }
        if self.thumbnail_scale < 1 {
            return fail("thumbnailScale must be at least 1");
        }
        if self.admin_token.is_empty() {
            return fail("adminToken must not be empty");
        }
        if self.data.as_os_str().is_empty() {
            return fail("data must not be empty");
        }
        if self.runners.iter().any(String::is_empty) {
            return fail("runners must not contain empty ids");
        }
        Ok(())
    }

    /// Whether `runner` may submit results
    #[must_use]
    pub fn is_runner(&self, runner: &str) -> bool {
        self.runners.iter().any(|r| r == runner)
    }

    /// Whether `token` grants admin operations
    #[must_use]
    pub fn is_admin(&self, token: &str) -> bool {
        !token.is_empty() && token == self.admin_token
    }

    /// Store-facing part of the configuration
    #[must_use]
    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            data: self.data.clone(),
            comparison_threshold: self.comparison_threshold,
            image_size: self.image_size,
            thumbnail_scale: self.thumbnail_scale,
            dedup: self.dedup.unwrap_or_default(),
            detect_antialiasing: true,
        }
    }
}

/// Values the store needs, already validated
#[derive(Debug, Clone, PartialEq)]
pub struct StoreConfig {
    /// Root of the on-disk layout
    pub data: PathBuf,
    /// Current comparison threshold in `[0, 1]`
    pub comparison_threshold: f64,
    /// Canonical image size
    pub image_size: ImageSize,
    /// Thumbnail downsampling factor
    pub thumbnail_scale: u32,
    /// Duplicate detection strategy
    pub dedup: DedupStrategy,
    /// Ignore anti-aliased edges when counting differences
    pub detect_antialiasing: bool,
}

impl StoreConfig {
    /// Config for `data` with the canonical size and defaults elsewhere
    #[must_use]
    pub fn new(data: impl Into<PathBuf>, width: u32, height: u32) -> Self {
        Self {
            data: data.into(),
            comparison_threshold: 0.1,
            image_size: ImageSize { width, height },
            thumbnail_scale: 4,
            dedup: DedupStrategy::default(),
            detect_antialiasing: true,
        }
    }

    /// Builder: set threshold
    #[must_use]
    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.comparison_threshold = threshold;
        self
    }

    /// Builder: set thumbnail scale
    #[must_use]
    pub fn with_thumbnail_scale(mut self, scale: u32) -> Self {
        self.thumbnail_scale = scale;
        self
    }

    /// Builder: set dedup strategy
    #[must_use]
    pub fn with_dedup(mut self, dedup: DedupStrategy) -> Self {
        self.dedup = dedup;
        self
    }

    /// Comparator settings derived from this config
    #[must_use]
    pub fn comparator_settings(&self) -> ComparatorSettings {
        ComparatorSettings::new(self.image_size.width, self.image_size.height)
            .with_threshold(self.comparison_threshold)
            .with_thumbnail_scale(self.thumbnail_scale)
            .with_antialiasing_detection(self.detect_antialiasing)
    }
}

/// Reject thresholds outside `[0, 1]` (and NaN)
///
/// # Errors
/// Returns [`StoreError::InvalidThreshold`]
pub fn validate_threshold(value: f64) -> StoreResult<f64> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(StoreError::InvalidThreshold(value))
    }
}
