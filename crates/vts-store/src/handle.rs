//! Async access to the store
//!
//! Decoding, comparison and thumbnailing block on CPU and disk. [`StoreHandle`]
//! runs them on tokio's blocking pool so request handlers stay responsive
//! and submissions for different triples do not queue behind each other.

use crate::error::{StoreError, StoreResult};
use crate::ingestion::Submission;
use crate::records::TestRecord;
use crate::repository::TestRun;
use crate::store::{AdHocComparison, ArtifactStore};
use std::sync::Arc;
use vts_artifact::TestTriple;

/// Cloneable async handle to a shared [`ArtifactStore`]
#[derive(Debug, Clone)]
pub struct StoreHandle {
    store: Arc<ArtifactStore>,
}

impl StoreHandle {
    #[must_use]
    pub fn new(store: ArtifactStore) -> Self {
        Self {
            store: Arc::new(store),
        }
    }

    /// The underlying store, for synchronous callers
    #[inline]
    #[must_use]
    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    async fn run_blocking<T, F>(&self, what: &'static str, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&ArtifactStore) -> StoreResult<T> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || f(&store))
            .await
            .map_err(|err| StoreError::TaskFailed(format!("{what} join failed: {err}")))?
    }

    /// See [`ArtifactStore::submit`]
    ///
    /// # Errors
    /// Same as the synchronous call, plus [`StoreError::TaskFailed`]
    pub async fn submit(&self, submission: Submission) -> StoreResult<TestRun> {
        self.run_blocking("submit", move |store| store.submit(submission))
            .await
    }

    /// See [`ArtifactStore::promote_latest_to_reference`]
    ///
    /// # Errors
    /// Same as the synchronous call, plus [`StoreError::TaskFailed`]
    pub async fn promote_latest_to_reference(&self, triple: TestTriple) -> StoreResult<TestRun> {
        self.run_blocking("promote", move |store| {
            store.promote_latest_to_reference(&triple)
        })
        .await
    }

    /// See [`ArtifactStore::set_comparison_threshold`]
    ///
    /// # Errors
    /// Same as the synchronous call, plus [`StoreError::TaskFailed`]
    pub async fn set_comparison_threshold(&self, value: f64) -> StoreResult<()> {
        self.run_blocking("threshold change", move |store| {
            store.set_comparison_threshold(value)
        })
        .await
    }

    /// See [`ArtifactStore::compare_ad_hoc`]
    ///
    /// # Errors
    /// Same as the synchronous call, plus [`StoreError::TaskFailed`]
    pub async fn compare_ad_hoc(&self, a: Vec<u8>, b: Vec<u8>) -> StoreResult<AdHocComparison> {
        self.run_blocking("compare", move |store| store.compare_ad_hoc(&a, &b))
            .await
    }

    /// See [`ArtifactStore::verify`]
    ///
    /// # Errors
    /// Same as the synchronous call, plus [`StoreError::TaskFailed`]
    pub async fn verify(&self) -> StoreResult<()> {
        self.run_blocking("verify", ArtifactStore::verify).await
    }

    /// Snapshot of all records; cheap, does not block
    #[must_use]
    pub fn all_records(&self) -> Vec<TestRecord> {
        self.store.all_records()
    }
}
