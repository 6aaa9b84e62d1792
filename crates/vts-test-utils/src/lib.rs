//! Testing utilities for the VTS workspace
//!
//! Image fixtures, timestamps and triples shared by the store's tests.

#![allow(missing_docs)]

use image::{Rgba, RgbaImage};
use std::path::Path;
use tempfile::TempDir;
use vts_artifact::{encode_png, RunTimestamp, TestTriple};

/// Canonical size used by the store scenarios
pub const CANONICAL: (u32, u32) = (500, 500);

pub const BACKGROUND: Rgba<u8> = Rgba([20, 40, 90, 255]);
pub const HIGHLIGHT: Rgba<u8> = Rgba([250, 220, 30, 255]);

pub fn solid_image(width: u32, height: u32, color: Rgba<u8>) -> RgbaImage {
    RgbaImage::from_pixel(width, height, color)
}

/// Background with a highlighted horizontal band covering `fraction` of the
/// rows, starting at the top
///
/// The band spans whole rows, so every changed pixel has unchanged-colour
/// siblings and none of them is taken for anti-aliasing.
pub fn banded_image(width: u32, height: u32, fraction: f64) -> RgbaImage {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rows = (f64::from(height) * fraction).round() as u32;
    let mut image = solid_image(width, height, BACKGROUND);
    for y in 0..rows.min(height) {
        for x in 0..width {
            image.put_pixel(x, y, HIGHLIGHT);
        }
    }
    image
}

/// Image with a distinct colour per row, for dedup tests that need many
/// mutually different images
pub fn stamped_image(width: u32, height: u32, seed: u8) -> RgbaImage {
    let mut image = solid_image(width, height, BACKGROUND);
    let y = u32::from(seed) % height;
    for x in 0..width {
        image.put_pixel(x, y, Rgba([seed, 255 - seed, 128, 255]));
    }
    image
}

pub fn png_bytes(image: &RgbaImage) -> Vec<u8> {
    encode_png(image).unwrap()
}

/// PNG of the canonical background
pub fn canonical_png() -> Vec<u8> {
    png_bytes(&solid_image(CANONICAL.0, CANONICAL.1, BACKGROUND))
}

/// PNG of the canonical background with `fraction` of its pixels changed
pub fn canonical_png_with_changes(fraction: f64) -> Vec<u8> {
    png_bytes(&banded_image(CANONICAL.0, CANONICAL.1, fraction))
}

pub fn timestamp(iso: &str) -> RunTimestamp {
    iso.parse().unwrap()
}

/// Midnight UTC on the given day of January 2024
pub fn day(day: u32) -> RunTimestamp {
    timestamp(&format!("2024-01-{day:02}T00:00:00Z"))
}

pub fn triple(group: &str, name: &str, hardware: &str) -> TestTriple {
    TestTriple::new(group, name, hardware).unwrap()
}

/// `default/earth/linux-nvidia`
pub fn earth() -> TestTriple {
    triple("default", "earth", "linux-nvidia")
}

pub fn temp_data_dir() -> TempDir {
    tempfile::tempdir().unwrap()
}

/// Count regular files named `file_name` anywhere under `root`
pub fn count_files_named(root: &Path, file_name: &str) -> usize {
    let Ok(entries) = std::fs::read_dir(root) else {
        return 0;
    };
    entries
        .filter_map(Result::ok)
        .map(|e| e.path())
        .map(|path| {
            if path.is_dir() {
                count_files_named(&path, file_name)
            } else {
                usize::from(path.file_name().is_some_and(|n| n == file_name))
            }
        })
        .sum()
}
