//! Duplicate image lookup
//!
//! Consecutive runs often render pixel-identical output. Before keeping a
//! freshly written candidate or difference image, ingestion asks an
//! [`ImageMatcher`] whether another run of the same triple already stores the
//! same pixels; on a hit the new file is dropped and the run references the
//! owner's timestamp instead.
//!
//! Two strategies:
//! - [`ScanMatcher`] compares against every stored file of the triple,
//!   O(runs) decodes per lookup
//! - [`HashIndexMatcher`] keeps a Blake3 hash of each stored image's pixels,
//!   one decode per lookup

use crate::error::StoreResult;
use crate::paths::{subdirectories, StorePaths};
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt::{self, Debug, Display, Formatter};
use std::path::{Path, PathBuf};
use vts_artifact::{open_png, ContentHash, ImageComparator, RunTimestamp, TestTriple};

/// Which per-run image a lookup concerns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ImageRole {
    Candidate,
    Difference,
}

impl ImageRole {
    /// Where run `ts` stores its own image of this role
    #[must_use]
    pub fn path(self, paths: &StorePaths, triple: &TestTriple, ts: RunTimestamp) -> PathBuf {
        match self {
            Self::Candidate => paths.candidate_image_path(triple, ts),
            Self::Difference => paths.difference_image_path(triple, ts),
        }
    }
}

impl Display for ImageRole {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Candidate => f.write_str("candidate"),
            Self::Difference => f.write_str("difference"),
        }
    }
}

/// Lookup of an existing run storing the same pixels
pub trait ImageMatcher: Send + Sync + Debug {
    /// Earliest other run of `triple` whose stored `role` image is
    /// pixel-identical to `image`
    ///
    /// Run `exclude` (usually the run being ingested) is never returned.
    ///
    /// # Errors
    /// Returns error if a stored image cannot be read
    fn find_matching_image(
        &self,
        triple: &TestTriple,
        role: ImageRole,
        image: &Path,
        exclude: RunTimestamp,
    ) -> StoreResult<Option<RunTimestamp>>;

    /// Note that run `owner` now stores `image` for `role`
    ///
    /// # Errors
    /// Returns error if the image cannot be read
    fn record(
        &self,
        triple: &TestTriple,
        role: ImageRole,
        owner: RunTimestamp,
        image: &Path,
    ) -> StoreResult<()>;

    /// Drop anything known about run `owner`'s `role` image
    fn forget(&self, triple: &TestTriple, role: ImageRole, owner: RunTimestamp);

    /// Drop all cached state; called after on-disk images are rewritten
    fn reset(&self);
}

/// Timestamps of the runs of `triple` that physically store a `role` image,
/// ascending
fn stored_images(
    paths: &StorePaths,
    triple: &TestTriple,
    role: ImageRole,
) -> StoreResult<Vec<(RunTimestamp, PathBuf)>> {
    let dir = paths.triple_dir(triple);
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut found: Vec<_> = subdirectories(&dir)?
        .iter()
        .filter_map(|name| RunTimestamp::from_path_component(name).ok())
        .map(|ts| (ts, role.path(paths, triple, ts)))
        .filter(|(_, path)| path.is_file())
        .collect();
    found.sort_by_key(|(ts, _)| *ts);
    Ok(found)
}

/// Pixel comparison against every stored image of the triple
#[derive(Debug, Clone)]
pub struct ScanMatcher {
    paths: StorePaths,
    comparator: ImageComparator,
}

impl ScanMatcher {
    #[must_use]
    pub fn new(paths: StorePaths, comparator: ImageComparator) -> Self {
        Self { paths, comparator }
    }
}

impl ImageMatcher for ScanMatcher {
    fn find_matching_image(
        &self,
        triple: &TestTriple,
        role: ImageRole,
        image: &Path,
        exclude: RunTimestamp,
    ) -> StoreResult<Option<RunTimestamp>> {
        let incoming = open_png(image)?;
        for (ts, path) in stored_images(&self.paths, triple, role)? {
            if ts == exclude {
                continue;
            }
            if self.comparator.are_identical(&incoming, &open_png(&path)?) {
                tracing::debug!("{role} image of {triple} matches run {ts}");
                return Ok(Some(ts));
            }
        }
        Ok(None)
    }

    fn record(&self, _: &TestTriple, _: ImageRole, _: RunTimestamp, _: &Path) -> StoreResult<()> {
        Ok(())
    }

    fn forget(&self, _: &TestTriple, _: ImageRole, _: RunTimestamp) {}

    fn reset(&self) {}
}

type IndexKey = (TestTriple, ImageRole);

/// Content-hash index of stored images, built lazily per triple and role
///
/// Every run storing a given hash is kept, in ascending order, so a stale
/// entry does not hide a later owner of the same pixels.
#[derive(Debug)]
pub struct HashIndexMatcher {
    paths: StorePaths,
    comparator: ImageComparator,
    index: DashMap<IndexKey, HashMap<ContentHash, Vec<RunTimestamp>>>,
}

impl HashIndexMatcher {
    #[must_use]
    pub fn new(paths: StorePaths, comparator: ImageComparator) -> Self {
        Self {
            paths,
            comparator,
            index: DashMap::new(),
        }
    }

    /// Number of indexed images across all triples
    #[must_use]
    pub fn len(&self) -> usize {
        self.index
            .iter()
            .map(|entry| entry.value().values().map(Vec::len).sum::<usize>())
            .sum()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn warm(&self, triple: &TestTriple, role: ImageRole, exclude: RunTimestamp) -> StoreResult<()> {
        let key = (triple.clone(), role);
        if self.index.contains_key(&key) {
            return Ok(());
        }
        let mut hashes: HashMap<ContentHash, Vec<RunTimestamp>> = HashMap::new();
        for (ts, path) in stored_images(&self.paths, triple, role)? {
            if ts == exclude {
                continue;
            }
            let hash = ContentHash::of_image(&open_png(&path)?);
            hashes.entry(hash).or_default().push(ts);
        }
        tracing::debug!("Indexed {} {role} images of {triple}", hashes.len());
        self.index.entry(key).or_insert(hashes);
        Ok(())
    }

    fn owners(&self, triple: &TestTriple, role: ImageRole, hash: ContentHash) -> Vec<RunTimestamp> {
        self.index
            .get(&(triple.clone(), role))
            .and_then(|entry| entry.get(&hash).cloned())
            .unwrap_or_default()
    }

    fn insert(&self, triple: &TestTriple, role: ImageRole, owner: RunTimestamp, hash: ContentHash) {
        let mut entry = self.index.entry((triple.clone(), role)).or_default();
        let owners = entry.entry(hash).or_default();
        if let Err(at) = owners.binary_search(&owner) {
            owners.insert(at, owner);
        }
    }
}

impl ImageMatcher for HashIndexMatcher {
    fn find_matching_image(
        &self,
        triple: &TestTriple,
        role: ImageRole,
        image: &Path,
        exclude: RunTimestamp,
    ) -> StoreResult<Option<RunTimestamp>> {
        self.warm(triple, role, exclude)?;
        let incoming = open_png(image)?;
        let hash = ContentHash::of_image(&incoming);

        for owner in self.owners(triple, role, hash) {
            if owner == exclude {
                continue;
            }
            let stored = role.path(&self.paths, triple, owner);
            if !stored.is_file() {
                self.forget(triple, role, owner);
                continue;
            }
            let stored_image = open_png(&stored)?;
            if self.comparator.are_identical(&incoming, &stored_image) {
                tracing::debug!("{role} image of {triple} matches run {owner} ({})", hash.short());
                return Ok(Some(owner));
            }
            // rewritten since it was indexed
            self.forget(triple, role, owner);
            self.insert(triple, role, owner, ContentHash::of_image(&stored_image));
        }
        Ok(None)
    }

    fn record(
        &self,
        triple: &TestTriple,
        role: ImageRole,
        owner: RunTimestamp,
        image: &Path,
    ) -> StoreResult<()> {
        let hash = ContentHash::of_image(&open_png(image)?);
        self.insert(triple, role, owner, hash);
        Ok(())
    }

    fn forget(&self, triple: &TestTriple, role: ImageRole, owner: RunTimestamp) {
        if let Some(mut entry) = self.index.get_mut(&(triple.clone(), role)) {
            for owners in entry.values_mut() {
                owners.retain(|ts| *ts != owner);
            }
            entry.retain(|_, owners| !owners.is_empty());
        }
    }

    fn reset(&self) {
        self.index.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};
    use vts_artifact::{save_png, ComparatorSettings};

    fn triple() -> TestTriple {
        TestTriple::new("default", "earth", "linux-nvidia").unwrap()
    }

    fn ts(day: u32) -> RunTimestamp {
        format!("2024-01-{day:02}T00:00:00Z").parse().unwrap()
    }

    fn store_candidate(paths: &StorePaths, at: RunTimestamp, shade: u8) -> PathBuf {
        let path = paths.candidate_image_path(&triple(), at);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        save_png(&RgbaImage::from_pixel(4, 4, Rgba([shade, shade, shade, 255])), &path).unwrap();
        path
    }

    fn matchers(paths: &StorePaths) -> Vec<Box<dyn ImageMatcher>> {
        let cmp = ImageComparator::new(ComparatorSettings::new(4, 4));
        vec![
            Box::new(ScanMatcher::new(paths.clone(), cmp)),
            Box::new(HashIndexMatcher::new(paths.clone(), cmp)),
        ]
    }

    #[test]
    fn finds_earliest_identical_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        store_candidate(&paths, ts(1), 10);
        store_candidate(&paths, ts(2), 20);
        store_candidate(&paths, ts(3), 20);
        let incoming = store_candidate(&paths, ts(4), 20);

        for matcher in matchers(&paths) {
            let hit = matcher
                .find_matching_image(&triple(), ImageRole::Candidate, &incoming, ts(4))
                .unwrap();
            assert_eq!(hit, Some(ts(2)), "{matcher:?}");
        }
    }

    #[test]
    fn never_matches_excluded_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let incoming = store_candidate(&paths, ts(1), 10);

        for matcher in matchers(&paths) {
            let hit = matcher
                .find_matching_image(&triple(), ImageRole::Candidate, &incoming, ts(1))
                .unwrap();
            assert_eq!(hit, None);
        }
    }

    #[test]
    fn older_late_arrival_matches_newer_owner() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        store_candidate(&paths, ts(5), 30);
        let incoming = store_candidate(&paths, ts(2), 30);

        for matcher in matchers(&paths) {
            let hit = matcher
                .find_matching_image(&triple(), ImageRole::Candidate, &incoming, ts(2))
                .unwrap();
            assert_eq!(hit, Some(ts(5)));
        }
    }

    #[test]
    fn hash_index_tracks_records_and_forgets() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let cmp = ImageComparator::new(ComparatorSettings::new(4, 4));
        let matcher = HashIndexMatcher::new(paths.clone(), cmp);

        let first = store_candidate(&paths, ts(1), 40);
        assert_eq!(
            matcher
                .find_matching_image(&triple(), ImageRole::Candidate, &first, ts(1))
                .unwrap(),
            None
        );
        matcher
            .record(&triple(), ImageRole::Candidate, ts(1), &first)
            .unwrap();
        assert_eq!(matcher.len(), 1);

        let second = store_candidate(&paths, ts(2), 40);
        assert_eq!(
            matcher
                .find_matching_image(&triple(), ImageRole::Candidate, &second, ts(2))
                .unwrap(),
            Some(ts(1))
        );

        matcher.forget(&triple(), ImageRole::Candidate, ts(1));
        assert!(matcher.is_empty());
        matcher.reset();
    }

    #[test]
    fn hash_index_drops_stale_entries() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let cmp = ImageComparator::new(ComparatorSettings::new(4, 4));
        let matcher = HashIndexMatcher::new(paths.clone(), cmp);

        let first = store_candidate(&paths, ts(1), 50);
        matcher
            .find_matching_image(&triple(), ImageRole::Candidate, &first, ts(9))
            .unwrap();
        std::fs::remove_file(&first).unwrap();

        let incoming = store_candidate(&paths, ts(2), 50);
        let hit = matcher
            .find_matching_image(&triple(), ImageRole::Candidate, &incoming, ts(2))
            .unwrap();
        assert_eq!(hit, None);
    }

    #[test]
    fn missing_owner_falls_through_to_next_identical_run() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let first = store_candidate(&paths, ts(1), 60);
        store_candidate(&paths, ts(2), 60);
        let incoming = store_candidate(&paths, ts(3), 60);
        let matchers = matchers(&paths);

        for matcher in &matchers {
            let hit = matcher
                .find_matching_image(&triple(), ImageRole::Candidate, &incoming, ts(3))
                .unwrap();
            assert_eq!(hit, Some(ts(1)), "{matcher:?}");
        }

        std::fs::remove_file(&first).unwrap();
        for matcher in &matchers {
            let hit = matcher
                .find_matching_image(&triple(), ImageRole::Candidate, &incoming, ts(3))
                .unwrap();
            assert_eq!(hit, Some(ts(2)), "{matcher:?}");
        }
    }

    #[test]
    fn transparent_pixels_match_regardless_of_color() {
        let dir = tempfile::tempdir().unwrap();
        let paths = StorePaths::new(dir.path());
        let stored = paths.candidate_image_path(&triple(), ts(1));
        std::fs::create_dir_all(stored.parent().unwrap()).unwrap();
        save_png(&RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 0])), &stored).unwrap();
        let incoming = paths.candidate_image_path(&triple(), ts(2));
        std::fs::create_dir_all(incoming.parent().unwrap()).unwrap();
        save_png(&RgbaImage::from_pixel(4, 4, Rgba([90, 180, 20, 0])), &incoming).unwrap();

        for matcher in matchers(&paths) {
            let hit = matcher
                .find_matching_image(&triple(), ImageRole::Candidate, &incoming, ts(2))
                .unwrap();
            assert_eq!(hit, Some(ts(1)), "{matcher:?}");
        }
    }

    #[test]
    fn roles_map_to_run_files() {
        let paths = StorePaths::new("/d");
        assert!(ImageRole::Candidate
            .path(&paths, &triple(), ts(1))
            .ends_with("candidate.png"));
        assert!(ImageRole::Difference
            .path(&paths, &triple(), ts(1))
            .ends_with("difference.png"));
        assert_eq!(ImageRole::Difference.to_string(), "difference");
    }
}
