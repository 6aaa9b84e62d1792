//! VTS Artifact Primitives
//!
//! Image artifacts of the visual testing store and the operations on them
//! that need no knowledge of the on-disk layout.
//!
//! # Core Concepts
//!
//! - [`TestTriple`]: `(group, name, hardware)` key of one logical test
//! - [`RunTimestamp`]: identity and storage key of one test run
//! - [`ImageComparator`]: fixed-size pixel diff, exact-identity check, thumbnails
//! - [`ContentHash`]: 32-byte Blake3 hash of decoded pixels for deduplication
//!
//! # Example
//!
//! ```rust,ignore
//! use vts_artifact::{ComparatorSettings, ImageComparator};
//!
//! let comparator = ImageComparator::new(ComparatorSettings::new(500, 500));
//! let reference = comparator.decode_canonical(&reference_bytes)?;
//! let candidate = comparator.decode_canonical(&candidate_bytes)?;
//! let comparison = comparator.compare(&reference, &candidate)?;
//! println!("error: {}", comparison.error_ratio);
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

mod compare;
mod error;
mod hash;
mod thumbnail;
mod timestamp;
mod triple;

pub use compare::{
    decode_png, encode_png, open_png, png_dimensions, save_png, ComparatorSettings, Comparison,
    ImageComparator,
};
pub use error::{CompareError, CompareResult};
pub use hash::ContentHash;
pub use thumbnail::thumbnail_path;
pub use timestamp::{RunTimestamp, TimestampError};
pub use triple::{TestTriple, TripleError};

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod integration_tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn hash_agrees_with_exact_identity() {
        let cmp = ImageComparator::new(ComparatorSettings::new(8, 8));
        let a = RgbaImage::from_pixel(8, 8, Rgba([9, 9, 9, 255]));
        let b = decode_png(&encode_png(&a).unwrap()).unwrap();

        assert!(cmp.are_identical(&a, &b));
        assert_eq!(ContentHash::of_image(&a), ContentHash::of_image(&b));
    }

    #[test]
    fn timestamp_names_thumbnail_of_reference() {
        let ts: RunTimestamp = "2024-01-01T00:00:00Z".parse().unwrap();
        let file = format!("{}.png", ts.to_path_component());
        let thumb = thumbnail_path(std::path::Path::new(&file));
        assert_eq!(thumb.to_string_lossy(), "20240101T000000000Z-thumbnail.png");
    }
}
