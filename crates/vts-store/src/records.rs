//! In-memory index of test runs
//!
//! The filesystem is the durable state; [`TestRecordStore`] rebuilds its
//! [`RecordIndex`] from disk at startup and after any out-of-band rewrite, and
//! [`TestRecordStore::add`] is the only incremental mutation.
//!
//! # Consistency
//!
//! [`TestRecordStore::load`] refuses run directories whose data record or
//! resolved candidate/difference image is missing. [`TestRecordStore::verify`]
//! additionally checks reference pointers, thumbnails and image sizes. Both
//! report a [`StoreError::ConsistencyViolation`], which is fatal.

use crate::dedup::ImageRole;
use crate::error::{StoreError, StoreResult};
use crate::paths::StorePaths;
use crate::reference::ReferenceStore;
use crate::repository::{RunRepository, TestRun};
use image::RgbaImage;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use vts_artifact::{
    png_dimensions, save_png, thumbnail_path, ImageComparator, RunTimestamp, TestTriple,
};

/// All runs of one triple, ascending by timestamp
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRecord {
    pub group: String,
    pub name: String,
    pub hardware: String,
    pub runs: Vec<TestRun>,
}

impl TestRecord {
    fn empty(triple: &TestTriple) -> Self {
        Self {
            group: triple.group.clone(),
            name: triple.name.clone(),
            hardware: triple.hardware.clone(),
            runs: Vec::new(),
        }
    }

    /// Key of this record
    #[must_use]
    pub fn triple(&self) -> TestTriple {
        TestTriple {
            group: self.group.clone(),
            name: self.name.clone(),
            hardware: self.hardware.clone(),
        }
    }

    /// Most recent run
    #[must_use]
    pub fn latest(&self) -> Option<&TestRun> {
        self.runs.last()
    }

    /// Run with timestamp `ts`
    #[must_use]
    pub fn run(&self, ts: RunTimestamp) -> Option<&TestRun> {
        self.runs
            .binary_search_by_key(&ts, |r| r.timestamp)
            .ok()
            .map(|i| &self.runs[i])
    }

    /// Insert in chronological position, replacing a run with the same
    /// timestamp
    fn insert(&mut self, run: TestRun) {
        match self.runs.binary_search_by_key(&run.timestamp, |r| r.timestamp) {
            Ok(i) => self.runs[i] = run,
            Err(i) => self.runs.insert(i, run),
        }
    }
}

/// Triple → record map
#[derive(Debug, Clone, Default)]
pub struct RecordIndex {
    records: BTreeMap<TestTriple, TestRecord>,
}

impl RecordIndex {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a run, creating the triple's record if needed
    pub fn add(&mut self, triple: &TestTriple, run: TestRun) {
        self.records
            .entry(triple.clone())
            .or_insert_with(|| TestRecord::empty(triple))
            .insert(run);
    }

    #[must_use]
    pub fn get(&self, triple: &TestTriple) -> Option<&TestRecord> {
        self.records.get(triple)
    }

    /// Records in triple order
    pub fn records(&self) -> impl Iterator<Item = &TestRecord> {
        self.records.values()
    }

    /// Number of records
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Total number of runs
    #[must_use]
    pub fn run_count(&self) -> usize {
        self.records.values().map(|r| r.runs.len()).sum()
    }
}

/// The authoritative run index over a data directory
#[derive(Debug)]
pub struct TestRecordStore {
    paths: StorePaths,
    repository: Arc<dyn RunRepository>,
    references: Arc<dyn ReferenceStore>,
    index: RwLock<RecordIndex>,
}

impl TestRecordStore {
    /// Create an empty store; call [`Self::load`] to populate it
    #[must_use]
    pub fn new(
        paths: StorePaths,
        repository: Arc<dyn RunRepository>,
        references: Arc<dyn ReferenceStore>,
    ) -> Self {
        Self {
            paths,
            repository,
            references,
            index: RwLock::new(RecordIndex::new()),
        }
    }

    /// Rebuild the index from disk
    ///
    /// The index is replaced only if every run loads.
    ///
    /// # Errors
    /// [`StoreError::ConsistencyViolation`] if a run directory lacks its data
    /// record or a resolved candidate/difference image
    pub fn load(&self) -> StoreResult<()> {
        tracing::info!("Loading test results");
        let mut index = RecordIndex::new();
        for triple in self.repository.list_triples()? {
            for ts in self.repository.list_runs(&triple)? {
                let run = self.load_checked(&triple, ts)?;
                index.add(&triple, run);
            }
        }
        tracing::info!(
            "Loaded {} runs across {} tests",
            index.run_count(),
            index.len()
        );
        *self.index.write() = index;
        Ok(())
    }

    /// Load again, keeping the current index if loading fails
    ///
    /// # Errors
    /// Same as [`Self::load`]
    pub fn reload(&self) -> StoreResult<()> {
        tracing::info!("Reloading test results");
        self.load()
    }

    fn load_checked(&self, triple: &TestTriple, ts: RunTimestamp) -> StoreResult<TestRun> {
        let run = match self.repository.load_run(triple, ts) {
            Ok(run) => run,
            Err(StoreError::ArtifactNotFound { path }) => {
                return Err(StoreError::inconsistent(format!(
                    "'data.json' missing in {}",
                    path.parent().unwrap_or(&path).display()
                )));
            }
            Err(e) => return Err(e),
        };
        for (role, owner) in [
            (ImageRole::Candidate, run.candidate_image_ref),
            (ImageRole::Difference, run.difference_image_ref),
        ] {
            let image = role.path(&self.paths, triple, owner);
            if !image.is_file() {
                return Err(StoreError::inconsistent(format!(
                    "{role} image of run {ts} of {triple} missing: {}",
                    image.display()
                )));
            }
        }
        Ok(run)
    }

    /// Insert a run into the index
    pub fn add(&self, triple: &TestTriple, run: TestRun) {
        tracing::debug!("Adding run {} to record {triple}", run.timestamp);
        self.index.write().add(triple, run);
    }

    /// Copy of all records
    #[must_use]
    pub fn snapshot(&self) -> Vec<TestRecord> {
        self.index.read().records().cloned().collect()
    }

    /// Copy of one record
    #[must_use]
    pub fn record(&self, triple: &TestTriple) -> Option<TestRecord> {
        self.index.read().get(triple).cloned()
    }

    /// Check the on-disk state behind the index
    ///
    /// - every reference pointer names an existing image with a thumbnail
    /// - every run's reference image exists
    /// - every run's resolved candidate and difference exist with thumbnails
    /// - every one of those images has the canonical size
    ///
    /// # Errors
    /// The first [`StoreError::ConsistencyViolation`] found
    pub fn verify(&self, comparator: &ImageComparator) -> StoreResult<()> {
        tracing::info!("Verifying data files");
        let canonical = comparator.canonical_size();

        tracing::info!("  Reference pointers");
        for (triple, file) in self.references.list()? {
            let image = self.paths.reference_image_path(&triple, &file);
            check_image(&image, canonical, &format!("reference pointer of {triple}"))?;
        }

        tracing::info!("  Data file references");
        let index = self.index.read();
        for record in index.records() {
            let triple = record.triple();
            for run in &record.runs {
                let context = format!("run {} of {triple}", run.timestamp);
                let reference = self.paths.reference_image_path(&triple, &run.reference_image);
                check_image(&reference, canonical, &context)?;
                for (role, owner) in [
                    (ImageRole::Candidate, run.candidate_image_ref),
                    (ImageRole::Difference, run.difference_image_ref),
                ] {
                    let image = role.path(&self.paths, &triple, owner);
                    check_image(&image, canonical, &context)?;
                }
            }
        }
        tracing::info!("Verified {} runs", index.run_count());
        Ok(())
    }

    /// Recompute every run's difference image and pixel error with
    /// `comparator`, then reload
    ///
    /// Records are processed in parallel, runs within a record in
    /// chronological order. Each run is compared against the reference it
    /// recorded and its difference image is overwritten in place. Identical
    /// difference images within a record are stored once; the copies that
    /// became redundant are deleted only after every run of the record is
    /// saved. Must not run concurrently with ingestion for the same triples.
    ///
    /// # Errors
    /// The first error of any record; the index is reloaded regardless
    pub fn regenerate_all(&self, comparator: &ImageComparator) -> StoreResult<()> {
        tracing::info!(
            "Regenerating all difference images (threshold {})",
            comparator.settings().threshold
        );
        let records = self.snapshot();
        let outcome = records
            .par_iter()
            .map(|record| self.regenerate_record(record, comparator))
            .collect::<Vec<_>>()
            .into_iter()
            .collect::<StoreResult<Vec<()>>>();

        let reloaded = self.reload();
        outcome?;
        reloaded?;
        tracing::info!("Regeneration finished");
        Ok(())
    }

    fn regenerate_record(
        &self,
        record: &TestRecord,
        comparator: &ImageComparator,
    ) -> StoreResult<()> {
        let triple = record.triple();
        let mut kept: Vec<(RunTimestamp, RgbaImage)> = Vec::new();
        let mut redundant: Vec<PathBuf> = Vec::new();

        for run in &record.runs {
            let mut run = run.clone();
            let reference = self.paths.reference_image_path(&triple, &run.reference_image);
            let candidate = self.paths.candidate_image_path(&triple, run.candidate_image_ref);
            let own = self.paths.difference_image_path(&triple, run.timestamp);

            let comparison = comparator.compare_files(&reference, &candidate)?;
            let previous = run.pixel_error;
            run.pixel_error = comparison.error_ratio;

            let owner = kept
                .iter()
                .find(|(_, diff)| comparator.are_identical(diff, &comparison.difference))
                .map(|(ts, _)| *ts);
            match owner {
                Some(owner) => {
                    // later runs may still point here until they are rewritten
                    redundant.push(own);
                    run.difference_image_ref = owner;
                }
                None => {
                    save_png(&comparison.difference, &own)?;
                    comparator.make_thumbnail(&own)?;
                    run.difference_image_ref = run.timestamp;
                    kept.push((run.timestamp, comparison.difference));
                }
            }

            tracing::debug!(
                "Regenerated {triple} run {}: {previous} -> {}",
                run.timestamp,
                run.pixel_error
            );
            self.repository.save_run(&triple, &run)?;
        }

        for own in redundant {
            remove_if_exists(&thumbnail_path(&own))?;
            remove_if_exists(&own)?;
        }
        Ok(())
    }
}

/// Existence, thumbnail and size check of one stored image
fn check_image(path: &Path, canonical: (u32, u32), context: &str) -> StoreResult<()> {
    if !path.is_file() {
        return Err(StoreError::inconsistent(format!(
            "{context}: image {} does not exist",
            path.display()
        )));
    }
    let thumbnail = thumbnail_path(path);
    if !thumbnail.is_file() {
        return Err(StoreError::inconsistent(format!(
            "{context}: thumbnail {} does not exist",
            thumbnail.display()
        )));
    }
    let (width, height) = png_dimensions(path)
        .map_err(|e| StoreError::inconsistent(format!("{context}: {e}")))?;
    if (width, height) != canonical {
        return Err(StoreError::inconsistent(format!(
            "{context}: image {} has wrong size ({width}, {height})",
            path.display()
        )));
    }
    Ok(())
}

/// Delete `path`, treating absence as success
pub(crate) fn remove_if_exists(path: &Path) -> StoreResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(StoreError::io_error(path, e)),
    }
}
