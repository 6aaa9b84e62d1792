//! Test runs and their persistence
//!
//! A [`TestRun`] is the `data.json` record of one submission. The
//! [`RunRepository`] trait is the seam between the record index and the
//! directory walk that finds runs on disk.

use crate::error::{StoreError, StoreResult};
use crate::paths::{subdirectories, StorePaths};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::io::ErrorKind;
use vts_artifact::{RunTimestamp, TestTriple};

/// One submitted result for a triple
///
/// Field order matches the `data.json` layout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", from = "RawTestRun")]
pub struct TestRun {
    /// Fraction of pixels flagged under the current threshold
    pub pixel_error: f64,
    /// Creation instant; also the storage key
    #[serde(rename = "timeStamp")]
    pub timestamp: RunTimestamp,
    /// Seconds taken to render the candidate
    pub timing: f64,
    /// Non-blank lines in the submitted log
    pub n_errors: u64,
    /// Build that produced the candidate
    pub commit_hash: String,
    /// File name of the reference this run was compared against
    pub reference_image: String,
    /// Run whose `candidate.png` holds this run's candidate
    #[serde(rename = "candidateImage")]
    pub candidate_image_ref: RunTimestamp,
    /// Run whose `difference.png` holds this run's difference
    #[serde(rename = "differenceImage")]
    pub difference_image_ref: RunTimestamp,
}

impl TestRun {
    /// Whether the candidate image is stored in this run's own directory
    #[inline]
    #[must_use]
    pub fn owns_candidate(&self) -> bool {
        self.candidate_image_ref == self.timestamp
    }

    /// Whether the difference image is stored in this run's own directory
    #[inline]
    #[must_use]
    pub fn owns_difference(&self) -> bool {
        self.difference_image_ref == self.timestamp
    }
}

/// On-disk shape; older records lack the error count and dedup references
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawTestRun {
    pixel_error: f64,
    time_stamp: RunTimestamp,
    timing: f64,
    #[serde(default)]
    n_errors: u64,
    commit_hash: String,
    reference_image: String,
    #[serde(default)]
    candidate_image: Option<RunTimestamp>,
    #[serde(default)]
    difference_image: Option<RunTimestamp>,
}

impl From<RawTestRun> for TestRun {
    fn from(raw: RawTestRun) -> Self {
        Self {
            pixel_error: raw.pixel_error,
            timestamp: raw.time_stamp,
            timing: raw.timing,
            n_errors: raw.n_errors,
            commit_hash: raw.commit_hash,
            reference_image: raw.reference_image,
            candidate_image_ref: raw.candidate_image.unwrap_or(raw.time_stamp),
            difference_image_ref: raw.difference_image.unwrap_or(raw.time_stamp),
        }
    }
}

/// Storage of per-run data records
pub trait RunRepository: Send + Sync + Debug {
    /// Every triple with at least a directory on disk, sorted
    ///
    /// # Errors
    /// Returns error if the storage cannot be enumerated
    fn list_triples(&self) -> StoreResult<Vec<TestTriple>>;

    /// Timestamps of all runs of `triple`, ascending
    ///
    /// # Errors
    /// [`StoreError::ConsistencyViolation`] if a run key is not a timestamp
    fn list_runs(&self, triple: &TestTriple) -> StoreResult<Vec<RunTimestamp>>;

    /// Read one run's data record
    ///
    /// # Errors
    /// [`StoreError::ArtifactNotFound`] if the record does not exist,
    /// [`StoreError::ConsistencyViolation`] if it names a different timestamp
    fn load_run(&self, triple: &TestTriple, ts: RunTimestamp) -> StoreResult<TestRun>;

    /// Write one run's data record, replacing any previous one
    ///
    /// # Errors
    /// Returns error if the record cannot be written
    fn save_run(&self, triple: &TestTriple, run: &TestRun) -> StoreResult<()>;
}

/// `data.json` files under `<data>/tests`
#[derive(Debug, Clone)]
pub struct FsRunRepository {
    paths: StorePaths,
}

impl FsRunRepository {
    #[must_use]
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }
}

impl RunRepository for FsRunRepository {
    fn list_triples(&self) -> StoreResult<Vec<TestTriple>> {
        self.paths.walk_triples()
    }

    fn list_runs(&self, triple: &TestTriple) -> StoreResult<Vec<RunTimestamp>> {
        let dir = self.paths.triple_dir(triple);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut runs = subdirectories(&dir)?
            .iter()
            .map(|name| {
                RunTimestamp::from_path_component(name).map_err(|_| {
                    StoreError::inconsistent(format!(
                        "run directory '{}' of {triple} is not a timestamp",
                        dir.join(name).display()
                    ))
                })
            })
            .collect::<StoreResult<Vec<_>>>()?;
        runs.sort();
        Ok(runs)
    }

    fn load_run(&self, triple: &TestTriple, ts: RunTimestamp) -> StoreResult<TestRun> {
        let path = self.paths.test_data_path(triple, ts);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(StoreError::ArtifactNotFound { path });
            }
            Err(e) => return Err(StoreError::io_error(path, e)),
        };
        let run: TestRun =
            serde_json::from_str(&raw).map_err(|e| StoreError::json_error(&path, e))?;
        if run.timestamp != ts {
            return Err(StoreError::inconsistent(format!(
                "{} records timestamp {} but is stored under {}",
                path.display(),
                run.timestamp,
                ts.to_path_component()
            )));
        }
        Ok(run)
    }

    fn save_run(&self, triple: &TestTriple, run: &TestRun) -> StoreResult<()> {
        let path = self.paths.test_data_path(triple, run.timestamp);
        let json =
            serde_json::to_string_pretty(run).map_err(|e| StoreError::json_error(&path, e))?;
        std::fs::write(&path, json).map_err(|e| StoreError::io_error(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn triple() -> TestTriple {
        TestTriple::new("default", "earth", "linux-nvidia").unwrap()
    }

    fn ts(s: &str) -> RunTimestamp {
        s.parse().unwrap()
    }

    fn run(at: RunTimestamp) -> TestRun {
        TestRun {
            pixel_error: 0.25,
            timestamp: at,
            timing: 12.5,
            n_errors: 2,
            commit_hash: "abc123".to_string(),
            reference_image: "20240101T000000000Z.png".to_string(),
            candidate_image_ref: at,
            difference_image_ref: ts("2024-01-01T00:00:00Z"),
        }
    }

    #[test]
    fn serializes_in_data_json_layout() {
        let json = serde_json::to_string(&run(ts("2024-01-02T00:00:00Z"))).unwrap();
        assert_eq!(
            json,
            concat!(
                r#"{"pixelError":0.25,"timeStamp":"2024-01-02T00:00:00.000Z","timing":12.5,"#,
                r#""nErrors":2,"commitHash":"abc123","referenceImage":"20240101T000000000Z.png","#,
                r#""candidateImage":"2024-01-02T00:00:00.000Z","#,
                r#""differenceImage":"2024-01-01T00:00:00.000Z"}"#
            )
        );
    }

    #[test]
    fn legacy_records_reference_themselves() {
        let json = r#"{
            "pixelError": 0,
            "timeStamp": "2024-01-02T00:00:00.000Z",
            "timing": 1,
            "commitHash": "abc",
            "referenceImage": "20240101T000000000Z.png"
        }"#;
        let run: TestRun = serde_json::from_str(json).unwrap();
        assert_eq!(run.n_errors, 0);
        assert!(run.owns_candidate());
        assert!(run.owns_difference());
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let repo = FsRunRepository::new(paths.clone());
        let at = ts("2024-01-02T00:00:00Z");
        std::fs::create_dir_all(paths.test_path(&triple(), at)).unwrap();

        repo.save_run(&triple(), &run(at)).unwrap();
        assert_eq!(repo.load_run(&triple(), at).unwrap(), run(at));
        assert_eq!(repo.list_runs(&triple()).unwrap(), vec![at]);
        assert_eq!(repo.list_triples().unwrap(), vec![triple()]);
    }

    #[test]
    fn missing_record_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let repo = FsRunRepository::new(StorePaths::new(dir.path()));
        let err = repo.load_run(&triple(), ts("2024-01-02T00:00:00Z")).unwrap_err();
        assert!(matches!(err, StoreError::ArtifactNotFound { .. }));
    }

    #[test]
    fn record_under_wrong_directory_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let repo = FsRunRepository::new(paths.clone());
        let at = ts("2024-01-02T00:00:00Z");
        let elsewhere = ts("2024-01-03T00:00:00Z");
        std::fs::create_dir_all(paths.test_path(&triple(), elsewhere)).unwrap();
        let json = serde_json::to_string(&run(at)).unwrap();
        std::fs::write(paths.test_data_path(&triple(), elsewhere), json).unwrap();

        let err = repo.load_run(&triple(), elsewhere).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn non_timestamp_run_directory_is_inconsistent() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let repo = FsRunRepository::new(paths.clone());
        std::fs::create_dir_all(paths.triple_dir(&triple()).join("latest")).unwrap();

        assert!(repo.list_runs(&triple()).unwrap_err().is_fatal());
    }
}
