//! Artifact store facade
//!
//! [`ArtifactStore`] owns the configuration, the storage backends and the
//! record index, and exposes the operations external callers (HTTP layer,
//! CLI) use. Submission and promotion live in [`crate::ingestion`].

use crate::config::{validate_threshold, DedupStrategy, StoreConfig};
use crate::dedup::{HashIndexMatcher, ImageMatcher, ImageRole, ScanMatcher};
use crate::error::{StoreError, StoreResult};
use crate::paths::StorePaths;
use crate::records::{TestRecord, TestRecordStore};
use crate::reference::{FsReferenceStore, ReferenceStore};
use crate::repository::{FsRunRepository, RunRepository};
use parking_lot::RwLock;
use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use vts_artifact::{
    encode_png, open_png, thumbnail_path, CompareError, ImageComparator, RunTimestamp, TestTriple,
};

/// Retrievable file of a test
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Reference,
    ReferenceThumbnail,
    Candidate,
    CandidateThumbnail,
    Difference,
    DifferenceThumbnail,
    Log,
}

impl ArtifactKind {
    /// All kinds, in display order
    pub const ALL: [Self; 7] = [
        Self::Reference,
        Self::ReferenceThumbnail,
        Self::Candidate,
        Self::CandidateThumbnail,
        Self::Difference,
        Self::DifferenceThumbnail,
        Self::Log,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reference => "reference",
            Self::ReferenceThumbnail => "reference-thumbnail",
            Self::Candidate => "candidate",
            Self::CandidateThumbnail => "candidate-thumbnail",
            Self::Difference => "difference",
            Self::DifferenceThumbnail => "difference-thumbnail",
            Self::Log => "log",
        }
    }

    /// Whether this kind names a thumbnail
    #[must_use]
    pub const fn is_thumbnail(self) -> bool {
        matches!(
            self,
            Self::ReferenceThumbnail | Self::CandidateThumbnail | Self::DifferenceThumbnail
        )
    }
}

impl Display for ArtifactKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unrecognised artifact kind name
#[derive(Debug, thiserror::Error)]
#[error("unknown artifact kind '{0}'")]
pub struct UnknownArtifactKind(pub String);

impl FromStr for ArtifactKind {
    type Err = UnknownArtifactKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| UnknownArtifactKind(s.to_string()))
    }
}

/// Which image of each hardware a cross-hardware comparison uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComparisonSource {
    /// Current reference images
    Reference,
    /// Latest candidate images
    Candidate,
}

/// Result of a comparison that is not persisted
#[derive(Debug, Clone)]
pub struct AdHocComparison {
    /// Difference bitmap encoded as PNG
    pub difference_png: Vec<u8>,
    /// Fraction of flagged pixels
    pub error_ratio: f64,
}

/// The test artifact store over one data directory
///
/// Assumes a single writer process. Regeneration must not overlap with
/// submissions for the same triples; callers serialize those.
#[derive(Debug)]
pub struct ArtifactStore {
    pub(crate) config: RwLock<StoreConfig>,
    pub(crate) paths: StorePaths,
    pub(crate) references: Arc<dyn ReferenceStore>,
    pub(crate) repository: Arc<dyn RunRepository>,
    pub(crate) matcher: Arc<dyn ImageMatcher>,
    pub(crate) records: TestRecordStore,
}

impl ArtifactStore {
    /// Open the store with filesystem backends
    ///
    /// Creates the `tests`, `reference` and `temporary` directories if missing
    /// and loads all runs.
    ///
    /// # Errors
    /// Returns error if the directories cannot be created or loading fails
    pub fn open(config: StoreConfig) -> StoreResult<Self> {
        let paths = StorePaths::new(&config.data);
        let comparator = ImageComparator::new(config.comparator_settings());
        let matcher: Arc<dyn ImageMatcher> = match config.dedup {
            DedupStrategy::Scan => Arc::new(ScanMatcher::new(paths.clone(), comparator)),
            DedupStrategy::Hash => Arc::new(HashIndexMatcher::new(paths.clone(), comparator)),
        };
        Self::with_backends(
            config,
            Arc::new(FsReferenceStore::new(paths.clone())),
            Arc::new(FsRunRepository::new(paths)),
            matcher,
        )
    }

    /// Open the store with explicit backends
    ///
    /// # Errors
    /// Same as [`Self::open`]
    pub fn with_backends(
        config: StoreConfig,
        references: Arc<dyn ReferenceStore>,
        repository: Arc<dyn RunRepository>,
        matcher: Arc<dyn ImageMatcher>,
    ) -> StoreResult<Self> {
        validate_threshold(config.comparison_threshold)?;
        let paths = StorePaths::new(&config.data);
        for dir in [paths.tests_dir(), paths.reference_root(), paths.temporary_dir()] {
            std::fs::create_dir_all(&dir).map_err(|e| StoreError::io_error(&dir, e))?;
        }
        tracing::info!("Opening artifact store at {}", paths.root().display());

        let records = TestRecordStore::new(paths.clone(), repository.clone(), references.clone());
        records.load()?;
        Ok(Self {
            config: RwLock::new(config),
            paths,
            references,
            repository,
            matcher,
            records,
        })
    }

    /// Copy of the current configuration
    #[must_use]
    pub fn config(&self) -> StoreConfig {
        self.config.read().clone()
    }

    #[inline]
    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Comparator for the current configuration
    #[must_use]
    pub fn comparator(&self) -> ImageComparator {
        ImageComparator::new(self.config.read().comparator_settings())
    }

    /// Current comparison threshold
    #[must_use]
    pub fn comparison_threshold(&self) -> f64 {
        self.config.read().comparison_threshold
    }

    /// Change the comparison threshold and regenerate every run
    ///
    /// Blocks until regeneration and the reload finish.
    ///
    /// # Errors
    /// [`StoreError::InvalidThreshold`] outside `[0, 1]`, otherwise any
    /// regeneration error
    pub fn set_comparison_threshold(&self, value: f64) -> StoreResult<()> {
        let value = validate_threshold(value)?;
        let previous = {
            let mut config = self.config.write();
            std::mem::replace(&mut config.comparison_threshold, value)
        };
        tracing::info!("Changing comparison threshold from {previous} to {value}");

        let result = self.records.regenerate_all(&self.comparator());
        self.matcher.reset();
        result
    }

    /// Snapshot of all records
    #[must_use]
    pub fn all_records(&self) -> Vec<TestRecord> {
        self.records.snapshot()
    }

    /// Snapshot of one record
    #[must_use]
    pub fn record(&self, triple: &TestTriple) -> Option<TestRecord> {
        self.records.record(triple)
    }

    /// Run the consistency checks
    ///
    /// # Errors
    /// The first [`StoreError::ConsistencyViolation`] found
    pub fn verify(&self) -> StoreResult<()> {
        self.records.verify(&self.comparator())
    }

    /// Rebuild the index from disk
    ///
    /// # Errors
    /// Same as [`TestRecordStore::load`]
    pub fn reload(&self) -> StoreResult<()> {
        let result = self.records.reload();
        self.matcher.reset();
        result
    }

    /// Compare two PNG images of canonical size without storing anything
    ///
    /// # Errors
    /// [`StoreError::InvalidImage`] if either image does not decode to the
    /// canonical size
    pub fn compare_ad_hoc(&self, a: &[u8], b: &[u8]) -> StoreResult<AdHocComparison> {
        let comparator = self.comparator();
        let a = comparator.decode_canonical(a)?;
        let b = comparator.decode_canonical(b)?;
        let comparison = comparator.compare(&a, &b)?;
        Ok(AdHocComparison {
            difference_png: encode_png(&comparison.difference)?,
            error_ratio: comparison.error_ratio,
        })
    }

    /// Compare a candidate against the triple's current reference without
    /// storing anything
    ///
    /// # Errors
    /// [`StoreError::InvalidImage`] for a non-canonical candidate,
    /// [`StoreError::ReferenceNotFound`] without a reference,
    /// [`StoreError::ComparisonFailed`] if the reference has another size
    pub fn compare_with_reference(
        &self,
        triple: &TestTriple,
        candidate: &[u8],
    ) -> StoreResult<AdHocComparison> {
        let comparator = self.comparator();
        let candidate = comparator.decode_canonical(candidate)?;
        let reference = open_png(&self.references.resolve(triple)?)?;
        let comparison = comparator
            .compare(&reference, &candidate)
            .map_err(|e| comparison_failed(triple, e))?;
        Ok(AdHocComparison {
            difference_png: encode_png(&comparison.difference)?,
            error_ratio: comparison.error_ratio,
        })
    }

    /// Compare one test across two hardwares
    ///
    /// The difference image is written to the scratch area; its path and the
    /// error ratio are returned.
    ///
    /// # Errors
    /// [`StoreError::ReferenceNotFound`] or [`StoreError::NoRuns`] if either
    /// side has no image of the requested source
    pub fn compare_hardware(
        &self,
        source: ComparisonSource,
        group: &str,
        name: &str,
        first_hardware: &str,
        second_hardware: &str,
    ) -> StoreResult<(PathBuf, f64)> {
        let first = TestTriple::new(group, name, first_hardware)?;
        let second = first.with_hardware(second_hardware)?;
        let first_image = self.source_image(source, &first)?;
        let second_image = self.source_image(source, &second)?;

        let out = self
            .paths
            .compare_scratch_path(group, name, first_hardware, second_hardware);
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io_error(parent, e))?;
        }
        let ratio = self
            .comparator()
            .save_comparison(&first_image, &second_image, &out)
            .map_err(|e| comparison_failed(&first, e))?;
        tracing::info!(
            "Compared {group}/{name} between {first_hardware} and {second_hardware}: {ratio}"
        );
        Ok((out, ratio))
    }

    fn source_image(&self, source: ComparisonSource, triple: &TestTriple) -> StoreResult<PathBuf> {
        match source {
            ComparisonSource::Reference => self.references.resolve(triple),
            ComparisonSource::Candidate => {
                let run = self
                    .records
                    .record(triple)
                    .and_then(|r| r.latest().cloned())
                    .ok_or_else(|| StoreError::NoRuns(triple.to_string()))?;
                Ok(self.paths.candidate_image_path(triple, run.candidate_image_ref))
            }
        }
    }

    /// Path of a stored artifact
    ///
    /// Without `timestamp` the latest run is used. Candidate and difference
    /// images are resolved through the run's dedup references.
    ///
    /// # Errors
    /// [`StoreError::NoRuns`] if the triple has no runs,
    /// [`StoreError::ArtifactNotFound`] for an unknown run or missing file,
    /// [`StoreError::ThumbnailMissing`] if only the thumbnail is absent
    pub fn artifact_path(
        &self,
        triple: &TestTriple,
        kind: ArtifactKind,
        timestamp: Option<RunTimestamp>,
    ) -> StoreResult<PathBuf> {
        let image = match kind {
            ArtifactKind::Reference | ArtifactKind::ReferenceThumbnail => {
                self.references.resolve(triple)?
            }
            ArtifactKind::Candidate
            | ArtifactKind::CandidateThumbnail
            | ArtifactKind::Difference
            | ArtifactKind::DifferenceThumbnail
            | ArtifactKind::Log => {
                let ts = match timestamp {
                    Some(ts) => ts,
                    None => self.latest_timestamp(triple)?,
                };
                let role = match kind {
                    ArtifactKind::Candidate | ArtifactKind::CandidateThumbnail => {
                        Some(ImageRole::Candidate)
                    }
                    ArtifactKind::Difference | ArtifactKind::DifferenceThumbnail => {
                        Some(ImageRole::Difference)
                    }
                    _ => None,
                };
                match role {
                    Some(role) => {
                        let run = self.repository.load_run(triple, ts)?;
                        let owner = match role {
                            ImageRole::Candidate => run.candidate_image_ref,
                            ImageRole::Difference => run.difference_image_ref,
                        };
                        role.path(&self.paths, triple, owner)
                    }
                    None => self.paths.log_file_path(triple, ts),
                }
            }
        };

        if !image.is_file() {
            return Err(StoreError::ArtifactNotFound { path: image });
        }
        if !kind.is_thumbnail() {
            return Ok(image);
        }
        let thumbnail = thumbnail_path(&image);
        if thumbnail.is_file() {
            Ok(thumbnail)
        } else {
            tracing::warn!("Thumbnail missing for {}", image.display());
            Err(StoreError::ThumbnailMissing { path: thumbnail })
        }
    }

    pub(crate) fn latest_timestamp(&self, triple: &TestTriple) -> StoreResult<RunTimestamp> {
        let latest = self
            .paths
            .latest_test_path(triple)
            .ok_or_else(|| StoreError::NoRuns(triple.to_string()))?;
        let name = latest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        RunTimestamp::from_path_component(&name).map_err(|_| {
            StoreError::inconsistent(format!(
                "run directory {} is not a timestamp",
                latest.display()
            ))
        })
    }
}

/// Map a comparator failure during a store operation
///
/// Size and decode problems of stored images abort the operation as a failed
/// comparison; I/O errors keep their own variant.
pub(crate) fn comparison_failed(triple: &TestTriple, err: CompareError) -> StoreError {
    match err {
        CompareError::SizeMismatch { .. } | CompareError::InvalidImage(_) => {
            StoreError::ComparisonFailed {
                triple: triple.to_string(),
                reason: err.to_string(),
            }
        }
        other => other.into(),
    }
}
