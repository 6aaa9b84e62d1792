//! Reference pointers
//!
//! Each triple has at most one pointer naming the image currently treated as
//! ground truth. [`ReferenceStore`] is the key-value contract
//! (triple → reference file name); [`FsReferenceStore`] keeps each pointer as a
//! `ref.txt` file next to the reference images.

use crate::error::{StoreError, StoreResult};
use crate::paths::{subdirectories, StorePaths};
use std::fmt::Debug;
use std::io::{ErrorKind, Write};
use std::path::PathBuf;
use vts_artifact::{RunTimestamp, TestTriple};

/// Triple → reference file name mapping
///
/// Replacing a pointer always goes through [`Self::clear`] followed by
/// [`Self::create`]; `create` never overwrites.
pub trait ReferenceStore: Send + Sync + Debug {
    /// Whether a pointer exists for `triple`
    fn has_reference(&self, triple: &TestTriple) -> bool;

    /// File name of the current reference image
    ///
    /// # Errors
    /// [`StoreError::ReferenceNotFound`] if no pointer exists
    fn read(&self, triple: &TestTriple) -> StoreResult<String>;

    /// Point `triple` at the reference stored for run `ts`
    ///
    /// Returns the path of the image the pointer now names.
    ///
    /// # Errors
    /// [`StoreError::ReferenceExists`] if a pointer is already present
    fn create(&self, triple: &TestTriple, ts: RunTimestamp) -> StoreResult<PathBuf>;

    /// Remove the pointer
    ///
    /// # Errors
    /// [`StoreError::ReferenceNotFound`] if no pointer exists
    fn clear(&self, triple: &TestTriple) -> StoreResult<()>;

    /// All pointers as `(triple, file name)` pairs
    ///
    /// # Errors
    /// Returns error if the backing storage cannot be enumerated
    fn list(&self) -> StoreResult<Vec<(TestTriple, String)>>;

    /// Absolute path of the current reference image
    ///
    /// # Errors
    /// Same as [`Self::read`]
    fn resolve(&self, triple: &TestTriple) -> StoreResult<PathBuf>;
}

/// Pointer files under `<data>/reference`
#[derive(Debug, Clone)]
pub struct FsReferenceStore {
    paths: StorePaths,
}

impl FsReferenceStore {
    #[must_use]
    pub fn new(paths: StorePaths) -> Self {
        Self { paths }
    }
}

impl ReferenceStore for FsReferenceStore {
    fn has_reference(&self, triple: &TestTriple) -> bool {
        self.paths.reference_pointer_path(triple).is_file()
    }

    fn read(&self, triple: &TestTriple) -> StoreResult<String> {
        let path = self.paths.reference_pointer_path(triple);
        match std::fs::read_to_string(&path) {
            Ok(content) => Ok(content.trim().to_string()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::ReferenceNotFound(triple.to_string()))
            }
            Err(e) => Err(StoreError::io_error(path, e)),
        }
    }

    fn create(&self, triple: &TestTriple, ts: RunTimestamp) -> StoreResult<PathBuf> {
        let dir = self.paths.reference_dir(triple);
        std::fs::create_dir_all(&dir).map_err(|e| StoreError::io_error(&dir, e))?;

        let pointer = self.paths.reference_pointer_path(triple);
        let file_name = StorePaths::reference_file_name(ts);
        let mut file = match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&pointer)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(StoreError::ReferenceExists(triple.to_string()));
            }
            Err(e) => return Err(StoreError::io_error(pointer, e)),
        };
        file.write_all(file_name.as_bytes())
            .map_err(|e| StoreError::io_error(&pointer, e))?;

        tracing::info!("Created reference pointer for {triple}: {file_name}");
        Ok(self.paths.reference_image_path(triple, &file_name))
    }

    fn clear(&self, triple: &TestTriple) -> StoreResult<()> {
        let pointer = self.paths.reference_pointer_path(triple);
        match std::fs::remove_file(&pointer) {
            Ok(()) => {
                tracing::info!("Cleared reference pointer for {triple}");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::ReferenceNotFound(triple.to_string()))
            }
            Err(e) => Err(StoreError::io_error(pointer, e)),
        }
    }

    fn list(&self) -> StoreResult<Vec<(TestTriple, String)>> {
        let root = self.paths.reference_root();
        let mut pointers = Vec::new();
        if !root.exists() {
            return Ok(pointers);
        }
        for hardware in subdirectories(&root)? {
            for group in subdirectories(&root.join(&hardware))? {
                for name in subdirectories(&root.join(&hardware).join(&group))? {
                    let triple = TestTriple::new(group.clone(), name, hardware.clone())?;
                    if self.has_reference(&triple) {
                        let file = self.read(&triple)?;
                        pointers.push((triple, file));
                    }
                }
            }
        }
        pointers.sort();
        Ok(pointers)
    }

    fn resolve(&self, triple: &TestTriple) -> StoreResult<PathBuf> {
        let file = self.read(triple)?;
        Ok(self.paths.reference_image_path(triple, &file))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> (tempfile::TempDir, StorePaths, FsReferenceStore) {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let store = FsReferenceStore::new(paths.clone());
        (dir, paths, store)
    }

    fn triple() -> TestTriple {
        TestTriple::new("default", "earth", "linux-nvidia").unwrap()
    }

    fn ts() -> RunTimestamp {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn create_then_read() {
        let (_dir, paths, store) = setup();
        assert!(!store.has_reference(&triple()));

        let image = store.create(&triple(), ts()).unwrap();
        assert!(store.has_reference(&triple()));
        assert_eq!(store.read(&triple()).unwrap(), "20240101T000000000Z.png");
        assert_eq!(image, paths.reference_image_path(&triple(), "20240101T000000000Z.png"));
        assert_eq!(store.resolve(&triple()).unwrap(), image);

        let raw = std::fs::read_to_string(paths.reference_pointer_path(&triple())).unwrap();
        assert_eq!(raw, "20240101T000000000Z.png");
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let (_dir, _paths, store) = setup();
        store.create(&triple(), ts()).unwrap();
        let later: RunTimestamp = "2024-02-01T00:00:00Z".parse().unwrap();
        let err = store.create(&triple(), later).unwrap_err();
        assert!(matches!(err, StoreError::ReferenceExists(_)));
        assert_eq!(store.read(&triple()).unwrap(), "20240101T000000000Z.png");
    }

    #[test]
    fn missing_pointer_is_not_found() {
        let (_dir, _paths, store) = setup();
        assert!(matches!(
            store.read(&triple()),
            Err(StoreError::ReferenceNotFound(_))
        ));
        assert!(matches!(
            store.clear(&triple()),
            Err(StoreError::ReferenceNotFound(_))
        ));
    }

    #[test]
    fn clear_then_create_replaces() {
        let (_dir, _paths, store) = setup();
        store.create(&triple(), ts()).unwrap();
        store.clear(&triple()).unwrap();
        assert!(!store.has_reference(&triple()));

        let later: RunTimestamp = "2024-02-01T00:00:00Z".parse().unwrap();
        store.create(&triple(), later).unwrap();
        assert_eq!(store.read(&triple()).unwrap(), "20240201T000000000Z.png");
    }

    #[test]
    fn list_skips_directories_without_pointer() {
        let (_dir, paths, store) = setup();
        let other = triple().with_hardware("windows").unwrap();
        store.create(&triple(), ts()).unwrap();
        std::fs::create_dir_all(paths.reference_dir(&other)).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![(triple(), "20240101T000000000Z.png".to_string())]);
    }
}
