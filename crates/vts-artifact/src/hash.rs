//! Pixel fingerprints
//!
//! [`ContentHash`] identifies a decoded bitmap, so a dedup index can find a
//! pixel-identical earlier image without decoding every stored file again.

use crate::compare::blended;
use image::RgbaImage;
use std::fmt::{self, Display, Formatter};

/// Blake3 digest of an image's dimensions and white-blended pixels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    /// Fingerprint a decoded bitmap
    ///
    /// Pixels are hashed as the comparison sees them, blended onto white, so
    /// two images hash equally exactly when
    /// [`ImageComparator::are_identical`](crate::ImageComparator::are_identical)
    /// holds. Different PNG encodings of the same pixels, or different colours
    /// under fully transparent pixels, do not change the hash. Images with the
    /// same pixel count but another shape do.
    #[must_use]
    pub fn of_image(image: &RgbaImage) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(&image.width().to_le_bytes());
        hasher.update(&image.height().to_le_bytes());
        let raw = image.as_raw();
        for k in (0..raw.len()).step_by(4) {
            let (r, g, b) = blended(raw, k);
            let mut pixel = [0u8; 24];
            pixel[..8].copy_from_slice(&r.to_bits().to_le_bytes());
            pixel[8..16].copy_from_slice(&g.to_bits().to_le_bytes());
            pixel[16..].copy_from_slice(&b.to_bits().to_le_bytes());
            hasher.update(&pixel);
        }
        Self(*hasher.finalize().as_bytes())
    }

    /// First 16 hex digits, for log lines
    #[inline]
    #[must_use]
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl Display for ContentHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn image_hash_covers_pixels_and_dimensions() {
        let a = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        let b = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        let mut c = b.clone();
        c.put_pixel(3, 3, Rgba([11, 20, 30, 255]));
        // same sample count, different shape
        let d = RgbaImage::from_pixel(2, 8, Rgba([10, 20, 30, 255]));

        assert_eq!(ContentHash::of_image(&a), ContentHash::of_image(&b));
        assert_ne!(ContentHash::of_image(&a), ContentHash::of_image(&c));
        assert_ne!(ContentHash::of_image(&a), ContentHash::of_image(&d));
    }

    #[test]
    fn transparent_pixels_hash_by_appearance() {
        let mut a = RgbaImage::from_pixel(4, 4, Rgba([10, 20, 30, 255]));
        let mut b = a.clone();
        a.put_pixel(1, 1, Rgba([255, 0, 0, 0]));
        b.put_pixel(1, 1, Rgba([0, 0, 255, 0]));
        assert_eq!(ContentHash::of_image(&a), ContentHash::of_image(&b));

        // fully transparent looks like opaque white
        let mut c = a.clone();
        c.put_pixel(1, 1, Rgba([255, 255, 255, 255]));
        assert_eq!(ContentHash::of_image(&a), ContentHash::of_image(&c));

        let mut d = a.clone();
        d.put_pixel(1, 1, Rgba([255, 0, 0, 255]));
        assert_ne!(ContentHash::of_image(&a), ContentHash::of_image(&d));
    }

    #[test]
    fn short_form_prefixes_full_digest() {
        let hash = ContentHash::of_image(&RgbaImage::from_pixel(3, 3, Rgba([1, 2, 3, 4])));
        let full = hash.to_string();
        assert_eq!(full.len(), 64);
        assert_eq!(hash.short().len(), 16);
        assert!(full.starts_with(&hash.short()));
    }
}
