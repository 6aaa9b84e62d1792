//! VTS Artifact Store
//!
//! Filesystem store for visual regression test runs: reference lifecycle,
//! candidate/difference deduplication, per-run data records and bulk
//! regeneration after threshold changes.
//!
//! # Core Concepts
//!
//! - [`StorePaths`]: canonical layout under the data directory
//! - [`ReferenceStore`]: triple → current reference image pointer
//! - [`RunRepository`]: per-run `data.json` records
//! - [`ImageMatcher`]: lookup of a run already storing the same pixels
//! - [`TestRecordStore`]: in-memory index with load, verify and regeneration
//! - [`ArtifactStore`]: submission, promotion and retrieval over all of the above
//!
//! # Example
//!
//! ```rust,ignore
//! use vts_store::{ArtifactStore, StoreConfig, Submission};
//!
//! let store = ArtifactStore::open(StoreConfig::new("data", 1280, 720))?;
//! store.verify()?;
//! let run = store.submit(Submission {
//!     triple: TestTriple::new("default", "earth", "linux-nvidia")?,
//!     candidate: png_bytes,
//!     log: String::new(),
//!     timing: 12.0,
//!     commit_hash: "abc123".into(),
//!     timestamp: RunTimestamp::now(),
//! })?;
//! println!("pixel error: {}", run.pixel_error);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod config;
mod dedup;
mod error;
mod handle;
mod ingestion;
mod paths;
mod records;
mod reference;
mod repository;
mod store;

pub use config::{
    validate_threshold, DedupStrategy, ImageSize, ServerConfig, SlackConfig, StoreConfig,
};
pub use dedup::{HashIndexMatcher, ImageMatcher, ImageRole, ScanMatcher};
pub use error::{StoreError, StoreResult};
pub use handle::StoreHandle;
pub use ingestion::{filter_log, Submission};
pub use paths::StorePaths;
pub use records::{RecordIndex, TestRecord, TestRecordStore};
pub use reference::{FsReferenceStore, ReferenceStore};
pub use repository::{FsRunRepository, RunRepository, TestRun};
pub use store::{
    AdHocComparison, ArtifactKind, ArtifactStore, ComparisonSource, UnknownArtifactKind,
};

pub use vts_artifact::{RunTimestamp, TestTriple};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
