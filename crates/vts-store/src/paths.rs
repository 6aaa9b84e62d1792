//! Storage layout
//!
//! Pure mapping from `(group, name, hardware, timestamp)` to paths under the
//! data root. The only I/O here is [`StorePaths::latest_test_path`] and
//! [`StorePaths::walk_triples`], which list directories.
//!
//! ```text
//! <data>/tests/<hardware>/<group>/<name>/<TIMESTAMP>/
//!     candidate.png, difference.png, data.json, log.txt
//! <data>/reference/<hardware>/<group>/<name>/
//!     ref.txt, <TIMESTAMP>.png
//! <data>/temporary/
//! ```

use crate::error::{StoreError, StoreResult};
use std::path::{Path, PathBuf};
use vts_artifact::{RunTimestamp, TestTriple};

const TESTS_DIR: &str = "tests";
const REFERENCE_DIR: &str = "reference";
const TEMPORARY_DIR: &str = "temporary";
const AUDIT_FILE: &str = "audit.txt";

const CANDIDATE_FILE: &str = "candidate.png";
const DIFFERENCE_FILE: &str = "difference.png";
const DATA_FILE: &str = "data.json";
const LOG_FILE: &str = "log.txt";
const POINTER_FILE: &str = "ref.txt";

/// Path builder rooted at the data directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    root: PathBuf,
}

impl StorePaths {
    #[inline]
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[inline]
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<data>/tests`
    #[must_use]
    pub fn tests_dir(&self) -> PathBuf {
        self.root.join(TESTS_DIR)
    }

    /// `<data>/reference`
    #[must_use]
    pub fn reference_root(&self) -> PathBuf {
        self.root.join(REFERENCE_DIR)
    }

    /// `<data>/temporary`
    #[must_use]
    pub fn temporary_dir(&self) -> PathBuf {
        self.root.join(TEMPORARY_DIR)
    }

    /// `<data>/audit.txt`
    #[must_use]
    pub fn audit_log(&self) -> PathBuf {
        self.root.join(AUDIT_FILE)
    }

    /// Directory holding all runs of a triple
    #[must_use]
    pub fn triple_dir(&self, triple: &TestTriple) -> PathBuf {
        self.tests_dir()
            .join(&triple.hardware)
            .join(&triple.group)
            .join(&triple.name)
    }

    /// Directory of one run
    #[must_use]
    pub fn test_path(&self, triple: &TestTriple, ts: RunTimestamp) -> PathBuf {
        self.triple_dir(triple).join(ts.to_path_component())
    }

    /// Most recent run directory of a triple
    ///
    /// Run directories are named by timestamp, so the last entry in
    /// lexicographic order is the latest run. Returns `None` if the triple has
    /// no runs or its directory does not exist.
    #[must_use]
    pub fn latest_test_path(&self, triple: &TestTriple) -> Option<PathBuf> {
        let dir = self.triple_dir(triple);
        let entries = std::fs::read_dir(&dir).ok()?;
        entries
            .filter_map(Result::ok)
            .filter(|e| e.file_type().is_ok_and(|t| t.is_dir()))
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|name| !name.starts_with('.'))
            .max()
            .map(|name| dir.join(name))
    }

    /// Directory holding the pointer and reference images of a triple
    #[must_use]
    pub fn reference_dir(&self, triple: &TestTriple) -> PathBuf {
        self.reference_root()
            .join(&triple.hardware)
            .join(&triple.group)
            .join(&triple.name)
    }

    /// Pointer file naming the current reference image
    #[must_use]
    pub fn reference_pointer_path(&self, triple: &TestTriple) -> PathBuf {
        self.reference_dir(triple).join(POINTER_FILE)
    }

    /// Reference image with the given file name
    #[must_use]
    pub fn reference_image_path(&self, triple: &TestTriple, file_name: &str) -> PathBuf {
        self.reference_dir(triple).join(file_name)
    }

    /// File name a reference created from run `ts` is stored under
    #[must_use]
    pub fn reference_file_name(ts: RunTimestamp) -> String {
        format!("{}.png", ts.to_path_component())
    }

    #[must_use]
    pub fn candidate_image_path(&self, triple: &TestTriple, ts: RunTimestamp) -> PathBuf {
        self.test_path(triple, ts).join(CANDIDATE_FILE)
    }

    #[must_use]
    pub fn difference_image_path(&self, triple: &TestTriple, ts: RunTimestamp) -> PathBuf {
        self.test_path(triple, ts).join(DIFFERENCE_FILE)
    }

    #[must_use]
    pub fn test_data_path(&self, triple: &TestTriple, ts: RunTimestamp) -> PathBuf {
        self.test_path(triple, ts).join(DATA_FILE)
    }

    #[must_use]
    pub fn log_file_path(&self, triple: &TestTriple, ts: RunTimestamp) -> PathBuf {
        self.test_path(triple, ts).join(LOG_FILE)
    }

    /// Scratch file for a cross-hardware comparison
    #[must_use]
    pub fn compare_scratch_path(&self, group: &str, name: &str, hw1: &str, hw2: &str) -> PathBuf {
        self.temporary_dir()
            .join("compare")
            .join(format!("{group}-{name}-{hw1}-{hw2}.png"))
    }

    /// All triples that have a directory under `tests/`
    ///
    /// Hidden entries and plain files are skipped. The result is sorted.
    ///
    /// # Errors
    /// Returns error if a directory cannot be listed or a segment is not a
    /// valid triple component
    pub fn walk_triples(&self) -> StoreResult<Vec<TestTriple>> {
        let mut triples = Vec::new();
        let tests = self.tests_dir();
        if !tests.exists() {
            return Ok(triples);
        }
        for hardware in subdirectories(&tests)? {
            let hw_dir = tests.join(&hardware);
            for group in subdirectories(&hw_dir)? {
                let group_dir = hw_dir.join(&group);
                for name in subdirectories(&group_dir)? {
                    triples.push(TestTriple::new(group.clone(), name, hardware.clone())?);
                }
            }
        }
        triples.sort();
        Ok(triples)
    }
}

/// Names of the visible subdirectories of `dir`, sorted
///
/// # Errors
/// Returns error if `dir` cannot be listed
pub(crate) fn subdirectories(dir: &Path) -> StoreResult<Vec<String>> {
    let entries = std::fs::read_dir(dir).map_err(|e| StoreError::io_error(dir, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::io_error(dir, e))?;
        let is_dir = entry
            .file_type()
            .map_err(|e| StoreError::io_error(entry.path(), e))?
            .is_dir();
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_dir && !name.starts_with('.') {
            names.push(name);
        }
    }
    names.sort();
    Ok(names)
}
