//! Submission Tests
//!
//! End-to-end ingestion against a temporary data directory at the 500x500
//! canonical size.
//!
use pretty_assertions::assert_eq;
use vts_store::{ArtifactStore, StoreConfig, StoreError, Submission, TestTriple};
use vts_test_utils::*;

fn open_store(dir: &std::path::Path) -> ArtifactStore {
    ArtifactStore::open(StoreConfig::new(dir, CANONICAL.0, CANONICAL.1)).unwrap()
}

fn submission(triple: &TestTriple, at: &str, candidate: Vec<u8>) -> Submission {
    Submission {
        triple: triple.clone(),
        candidate,
        log: "Loading scene\n\nERROR: missing asset\n".to_string(),
        timing: 42.0,
        commit_hash: "0123abcd".to_string(),
        timestamp: timestamp(at),
    }
}

#[test]
fn test_first_submission_bootstraps_reference() {
    let dir = temp_data_dir();
    let store = open_store(dir.path());
    let candidate = canonical_png();

    let run = store
        .submit(submission(&earth(), "2024-01-01T00:00:00Z", candidate.clone()))
        .unwrap();

    assert_eq!(run.pixel_error, 0.0);
    assert_eq!(run.n_errors, 2);
    assert_eq!(run.commit_hash, "0123abcd");
    assert!(run.owns_candidate());
    assert!(run.owns_difference());

    let paths = store.paths();
    let pointer = std::fs::read_to_string(paths.reference_pointer_path(&earth())).unwrap();
    assert_eq!(pointer, "20240101T000000000Z.png");
    let reference = paths.reference_image_path(&earth(), &pointer);
    assert_eq!(std::fs::read(reference).unwrap(), candidate);
    store.verify().unwrap();
}

#[test]
fn test_scenario_ten_percent_change() {
    let dir = temp_data_dir();
    let store = open_store(dir.path());

    let first = store
        .submit(submission(&earth(), "2024-01-01T00:00:00Z", canonical_png()))
        .unwrap();
    assert_eq!(first.pixel_error, 0.0);

    let second = store
        .submit(submission(
            &earth(),
            "2024-01-02T00:00:00Z",
            canonical_png_with_changes(0.10),
        ))
        .unwrap();
    assert!((second.pixel_error - 0.10).abs() < 1e-3, "{}", second.pixel_error);
    assert_eq!(second.reference_image, "20240101T000000000Z.png");
    assert!(second.owns_difference());

    let paths = store.paths();
    let first_diff = std::fs::read(paths.difference_image_path(&earth(), first.timestamp)).unwrap();
    let second_diff =
        std::fs::read(paths.difference_image_path(&earth(), second.timestamp)).unwrap();
    assert!(first_diff != second_diff);
    assert_eq!(
        std::fs::read_to_string(paths.reference_pointer_path(&earth())).unwrap(),
        "20240101T000000000Z.png"
    );
}

#[test]
fn test_wrong_size_rejected_without_writes() {
    let dir = temp_data_dir();
    let store = open_store(dir.path());
    let small = png_bytes(&solid_image(400, 400, BACKGROUND));

    let err = store
        .submit(submission(&earth(), "2024-01-01T00:00:00Z", small))
        .unwrap_err();

    assert!(matches!(err, StoreError::InvalidImage(_)), "{err}");
    assert!(err.is_client_error());
    let entries = std::fs::read_dir(store.paths().tests_dir()).unwrap().count();
    assert_eq!(entries, 0);
    assert!(store.all_records().is_empty());
}

#[test]
fn test_undecodable_bytes_rejected() {
    let dir = temp_data_dir();
    let store = open_store(dir.path());

    let err = store
        .submit(submission(&earth(), "2024-01-01T00:00:00Z", b"not a png".to_vec()))
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidImage(_)));
}

#[test]
fn test_identical_candidates_share_one_file() {
    let dir = temp_data_dir();
    let store = open_store(dir.path());
    let bytes = canonical_png_with_changes(0.05);

    store
        .submit(submission(&earth(), "2024-01-01T00:00:00Z", canonical_png()))
        .unwrap();
    let a = store
        .submit(submission(&earth(), "2024-01-02T00:00:00Z", bytes.clone()))
        .unwrap();
    let b = store
        .submit(submission(&earth(), "2024-01-03T00:00:00Z", bytes))
        .unwrap();

    assert_eq!(a.candidate_image_ref, day(2));
    assert_eq!(b.candidate_image_ref, day(2));
    assert_eq!(b.difference_image_ref, day(2));
    assert_eq!(count_files_named(&store.paths().tests_dir(), "candidate.png"), 2);
    assert_eq!(count_files_named(&store.paths().tests_dir(), "difference.png"), 2);

    store.reload().unwrap();
    store.verify().unwrap();
}

#[test]
fn test_out_of_order_submissions_sorted() {
    let dir = temp_data_dir();
    let store = open_store(dir.path());

    for (at, seed) in [
        ("2024-01-02T00:00:00Z", 2),
        ("2024-01-01T00:00:00Z", 1),
        ("2024-01-03T00:00:00Z", 3),
    ] {
        let image = png_bytes(&stamped_image(CANONICAL.0, CANONICAL.1, seed));
        store.submit(submission(&earth(), at, image)).unwrap();
    }

    assert_eq!(
        store.paths().latest_test_path(&earth()),
        Some(store.paths().test_path(&earth(), day(3)))
    );
    let record = store.record(&earth()).unwrap();
    let order: Vec<_> = record.runs.iter().map(|r| r.timestamp).collect();
    assert_eq!(order, vec![day(1), day(2), day(3)]);
    assert_eq!(store.all_records().len(), 1);

    // the first submission (day 2) became the reference
    assert_eq!(record.runs[1].pixel_error, 0.0);
    assert_eq!(record.runs[0].reference_image, "20240102T000000000Z.png");
}

#[test]
fn test_index_survives_reopen() {
    let dir = temp_data_dir();
    let before = {
        let store = open_store(dir.path());
        store
            .submit(submission(&earth(), "2024-01-01T00:00:00Z", canonical_png()))
            .unwrap();
        store
            .submit(submission(
                &earth(),
                "2024-01-02T00:00:00Z",
                canonical_png_with_changes(0.2),
            ))
            .unwrap();
        store.all_records()
    };

    let reopened = open_store(dir.path());
    reopened.verify().unwrap();
    assert_eq!(reopened.all_records(), before);
}

#[test]
fn test_separate_hardware_gets_own_reference() {
    let dir = temp_data_dir();
    let store = open_store(dir.path());
    let windows = earth().with_hardware("windows-amd").unwrap();

    store
        .submit(submission(&earth(), "2024-01-01T00:00:00Z", canonical_png()))
        .unwrap();
    let run = store
        .submit(submission(
            &windows,
            "2024-01-02T00:00:00Z",
            canonical_png_with_changes(0.5),
        ))
        .unwrap();

    assert_eq!(run.pixel_error, 0.0);
    assert_eq!(store.all_records().len(), 2);
}

#[test]
fn test_resubmitted_timestamp_is_rejected() {
    let dir = temp_data_dir();
    let store = open_store(dir.path());
    let x = canonical_png();
    let y = canonical_png_with_changes(0.3);

    store
        .submit(submission(&earth(), "2024-01-01T00:00:00Z", x.clone()))
        .unwrap();
    store
        .submit(submission(&earth(), "2024-01-02T00:00:00Z", y.clone()))
        .unwrap();
    let third = store
        .submit(submission(&earth(), "2024-01-03T00:00:00Z", x))
        .unwrap();
    assert_eq!(third.candidate_image_ref, day(1));
    let before = store.all_records();

    let err = store
        .submit(submission(&earth(), "2024-01-01T00:00:00Z", y))
        .unwrap_err();
    assert!(matches!(err, StoreError::RunExists(_)), "{err}");
    assert!(err.is_client_error());

    // the shared candidate of day 1 is untouched
    assert!(store.paths().candidate_image_path(&earth(), day(1)).is_file());
    assert_eq!(store.all_records(), before);
    store.verify().unwrap();

    let reopened = open_store(dir.path());
    assert_eq!(reopened.all_records(), before);
}
