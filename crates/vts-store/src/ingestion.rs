//! Submission pipeline and reference promotion
//!
//! Both operations write every file of a run before the index learns about
//! it. A failed submission removes the run directory it created, so the next
//! load does not trip over a half-written run. An existing run is never
//! overwritten.

use crate::dedup::ImageRole;
use crate::error::{StoreError, StoreResult};
use crate::paths::StorePaths;
use crate::records::remove_if_exists;
use crate::repository::TestRun;
use crate::store::{comparison_failed, ArtifactStore};
use std::io::ErrorKind;
use std::path::Path;
use vts_artifact::{thumbnail_path, ImageComparator, RunTimestamp, TestTriple};

/// A new candidate image and its metadata
#[derive(Debug, Clone)]
pub struct Submission {
    pub triple: TestTriple,
    /// PNG bytes of the rendered candidate
    pub candidate: Vec<u8>,
    /// Log produced while rendering
    pub log: String,
    /// Seconds taken to render
    pub timing: f64,
    pub commit_hash: String,
    pub timestamp: RunTimestamp,
}

/// Drop blank lines; returns the kept text and its line count
///
/// Lines are split on `\n` only, so a CRLF log keeps its `\r` endings.
#[must_use]
pub fn filter_log(log: &str) -> (String, u64) {
    let lines: Vec<&str> = log.split('\n').filter(|l| !l.trim().is_empty()).collect();
    (lines.join("\n"), lines.len() as u64)
}

impl ArtifactStore {
    /// Ingest a candidate
    ///
    /// 1. reject images that are not canonical PNGs
    /// 2. write the filtered log
    /// 3. bootstrap the reference if the triple has none
    /// 4. store the candidate unless another run already stores the same pixels
    /// 5. compare against the reference and store the difference
    /// 6. deduplicate the difference the same way
    /// 7. persist `data.json` and add the run to the index
    ///
    /// # Errors
    /// [`StoreError::InvalidImage`] or [`StoreError::RunExists`] before
    /// anything is written, [`StoreError::ComparisonFailed`] if the reference
    /// has another size
    pub fn submit(&self, submission: Submission) -> StoreResult<TestRun> {
        let comparator = self.comparator();
        comparator.decode_canonical(&submission.candidate)?;

        let triple = &submission.triple;
        let ts = submission.timestamp;
        tracing::info!("Submitting result for ({triple}/{ts})");

        let run_dir = self.paths.test_path(triple, ts);
        create_parent(&run_dir)?;
        match std::fs::create_dir(&run_dir) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::RunExists(format!("{triple}/{ts}")));
            }
            Err(e) => return Err(StoreError::io_error(&run_dir, e)),
        }

        match self.ingest(&submission, &comparator) {
            Ok(run) => Ok(run),
            Err(err) => {
                tracing::warn!("Submission for ({triple}/{ts}) failed: {err}");
                self.matcher.forget(triple, ImageRole::Candidate, ts);
                self.matcher.forget(triple, ImageRole::Difference, ts);
                if let Err(e) = std::fs::remove_dir_all(&run_dir) {
                    tracing::error!("Could not remove {}: {e}", run_dir.display());
                }
                Err(err)
            }
        }
    }

    fn ingest(
        &self,
        submission: &Submission,
        comparator: &ImageComparator,
    ) -> StoreResult<TestRun> {
        let triple = &submission.triple;
        let ts = submission.timestamp;

        let (log, n_errors) = filter_log(&submission.log);
        let log_path = self.paths.log_file_path(triple, ts);
        std::fs::write(&log_path, log).map_err(|e| StoreError::io_error(&log_path, e))?;

        if !self.references.has_reference(triple) {
            self.bootstrap_reference(triple, ts, &submission.candidate, comparator)?;
        }
        let reference = self.references.resolve(triple)?;

        let own_candidate = self.paths.candidate_image_path(triple, ts);
        std::fs::write(&own_candidate, &submission.candidate)
            .map_err(|e| StoreError::io_error(&own_candidate, e))?;
        let candidate_ref =
            self.keep_or_share(triple, ImageRole::Candidate, ts, comparator, false)?;
        let candidate = self.paths.candidate_image_path(triple, candidate_ref);

        let own_difference = self.paths.difference_image_path(triple, ts);
        let pixel_error = comparator
            .save_comparison(&reference, &candidate, &own_difference)
            .map_err(|e| comparison_failed(triple, e))?;
        let difference_ref =
            self.keep_or_share(triple, ImageRole::Difference, ts, comparator, true)?;

        let run = TestRun {
            pixel_error,
            timestamp: ts,
            timing: submission.timing,
            n_errors,
            commit_hash: submission.commit_hash.clone(),
            reference_image: file_name(&reference),
            candidate_image_ref: candidate_ref,
            difference_image_ref: difference_ref,
        };
        self.repository.save_run(triple, &run)?;
        self.records.add(triple, run.clone());
        tracing::info!("Stored run ({triple}/{ts}) with pixel error {pixel_error}");
        Ok(run)
    }

    /// Make the candidate the triple's first reference
    ///
    /// The pointer is created last, so a failure leaves no pointer naming a
    /// missing image.
    fn bootstrap_reference(
        &self,
        triple: &TestTriple,
        ts: RunTimestamp,
        candidate: &[u8],
        comparator: &ImageComparator,
    ) -> StoreResult<()> {
        tracing::info!("  No reference image found for {triple}, using candidate");
        let image = self
            .paths
            .reference_image_path(triple, &StorePaths::reference_file_name(ts));
        create_parent(&image)?;
        std::fs::write(&image, candidate).map_err(|e| StoreError::io_error(&image, e))?;
        comparator.make_thumbnail(&image)?;
        self.references.create(triple, ts)?;
        Ok(())
    }

    /// Drop run `ts`'s freshly written `role` image if another run stores the
    /// same pixels; returns the run that stores it
    ///
    /// A kept image gets a thumbnail unless `has_thumbnail` says one was
    /// already written alongside it.
    fn keep_or_share(
        &self,
        triple: &TestTriple,
        role: ImageRole,
        ts: RunTimestamp,
        comparator: &ImageComparator,
        has_thumbnail: bool,
    ) -> StoreResult<RunTimestamp> {
        let own = role.path(&self.paths, triple, ts);
        if let Some(owner) = self.matcher.find_matching_image(triple, role, &own, ts)? {
            tracing::info!("  {role} image matches run {owner}, reusing it");
            remove_if_exists(&own)?;
            remove_if_exists(&thumbnail_path(&own))?;
            return Ok(owner);
        }
        if !has_thumbnail {
            comparator.make_thumbnail(&own)?;
        }
        self.matcher.record(triple, role, ts, &own)?;
        Ok(ts)
    }

    /// Make the latest run's candidate the triple's reference
    ///
    /// The candidate is copied into the reference directory, the pointer is
    /// replaced, and the run is compared again (now with zero error) before
    /// the index is reloaded.
    ///
    /// # Errors
    /// [`StoreError::NoRuns`] if the triple has no runs
    pub fn promote_latest_to_reference(&self, triple: &TestTriple) -> StoreResult<TestRun> {
        let comparator = self.comparator();
        let ts = self.latest_timestamp(triple)?;
        let mut run = self.repository.load_run(triple, ts)?;
        tracing::info!("Promoting candidate of ({triple}/{ts}) to reference");

        let candidate = self.paths.candidate_image_path(triple, run.candidate_image_ref);
        let file = StorePaths::reference_file_name(ts);
        let reference = self.paths.reference_image_path(triple, &file);
        create_parent(&reference)?;
        std::fs::copy(&candidate, &reference).map_err(|e| StoreError::io_error(&reference, e))?;
        comparator.make_thumbnail(&reference)?;

        if run.owns_difference() {
            self.relocate_shared_difference(triple, ts)?;
        }
        self.matcher.reset();

        if self.references.has_reference(triple) {
            self.references.clear(triple)?;
        }
        self.references.create(triple, ts)?;

        let own_difference = self.paths.difference_image_path(triple, ts);
        run.pixel_error = comparator
            .save_comparison(&reference, &candidate, &own_difference)
            .map_err(|e| comparison_failed(triple, e))?;
        run.difference_image_ref =
            self.keep_or_share(triple, ImageRole::Difference, ts, &comparator, true)?;
        run.reference_image = file;
        self.repository.save_run(triple, &run)?;

        let reloaded = self.records.reload();
        self.matcher.reset();
        reloaded?;
        tracing::info!("Reference of {triple} is now {}", run.reference_image);
        Ok(run)
    }

    /// Before run `ts`'s own difference image is overwritten, hand it to the
    /// earliest other run that references it
    fn relocate_shared_difference(&self, triple: &TestTriple, ts: RunTimestamp) -> StoreResult<()> {
        let mut dependants: Vec<TestRun> = self
            .repository
            .list_runs(triple)?
            .into_iter()
            .filter(|other| *other != ts)
            .map(|other| self.repository.load_run(triple, other))
            .collect::<StoreResult<Vec<_>>>()?
            .into_iter()
            .filter(|other| other.difference_image_ref == ts)
            .collect();
        let Some(heir) = dependants.first().map(|r| r.timestamp) else {
            return Ok(());
        };

        let from = self.paths.difference_image_path(triple, ts);
        let to = self.paths.difference_image_path(triple, heir);
        rename(&from, &to)?;
        let from_thumb = thumbnail_path(&from);
        if from_thumb.is_file() {
            rename(&from_thumb, &thumbnail_path(&to))?;
        }
        for dependant in &mut dependants {
            dependant.difference_image_ref = heir;
            self.repository.save_run(triple, dependant)?;
        }
        tracing::info!(
            "  Moved shared difference image of ({triple}/{ts}) to run {heir} ({} runs)",
            dependants.len()
        );
        Ok(())
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn create_parent(path: &Path) -> StoreResult<()> {
    match path.parent() {
        Some(parent) => {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::io_error(parent, e))
        }
        None => Ok(()),
    }
}

fn rename(from: &Path, to: &Path) -> StoreResult<()> {
    std::fs::rename(from, to).map_err(|e| StoreError::io_error(from, e))
}
