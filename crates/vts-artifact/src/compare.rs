//! Pixel comparison
//!
//! [`ImageComparator`] compares two bitmaps of the canonical size and
//! produces a difference bitmap plus the fraction of pixels that differ.
//!
//! The per-pixel metric is the squared distance in YIQ space, with alpha
//! blended against white. A pixel is flagged when that distance exceeds
//! `35215 * threshold^2`, where 35215 is the largest possible distance. With
//! anti-alias detection on, pixels that look like anti-aliased edges in either
//! image are drawn yellow but not counted.
//!
//! The difference bitmap shows unchanged pixels as faded grayscale and
//! flagged pixels in red.

use crate::error::{CompareError, CompareResult};
use crate::thumbnail::thumbnail_path;
use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbaImage};
use std::path::{Path, PathBuf};

/// Largest possible YIQ distance between two pixels
const MAX_YIQ_DELTA: f64 = 35215.0;

/// Opacity of unchanged pixels in the difference bitmap
const FADE_ALPHA: f64 = 0.1;

const DIFF_COLOR: [u8; 3] = [255, 0, 0];
const AA_COLOR: [u8; 3] = [255, 255, 0];

/// Configuration for an [`ImageComparator`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComparatorSettings {
    /// Canonical image width in pixels
    pub width: u32,
    /// Canonical image height in pixels
    pub height: u32,
    /// Colour distance threshold in `[0, 1]`; smaller is more sensitive
    pub threshold: f64,
    /// Integer factor by which thumbnails are downsampled
    pub thumbnail_scale: u32,
    /// Ignore differences on anti-aliased edges
    pub detect_antialiasing: bool,
}

impl ComparatorSettings {
    /// Settings for a canonical size with default threshold and scale
    #[inline]
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            threshold: 0.1,
            thumbnail_scale: 4,
            detect_antialiasing: true,
        }
    }

    /// Builder: set threshold
    #[inline]
    #[must_use]
    pub const fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Builder: set thumbnail scale
    #[inline]
    #[must_use]
    pub const fn with_thumbnail_scale(mut self, scale: u32) -> Self {
        self.thumbnail_scale = scale;
        self
    }

    /// Builder: toggle anti-alias detection
    #[inline]
    #[must_use]
    pub const fn with_antialiasing_detection(mut self, enabled: bool) -> Self {
        self.detect_antialiasing = enabled;
        self
    }
}

/// Outcome of comparing two images
#[derive(Debug, Clone)]
pub struct Comparison {
    /// Difference bitmap at the canonical size
    pub difference: RgbaImage,
    /// Number of flagged pixels
    pub flagged_pixels: u64,
    /// `flagged_pixels / (width * height)` of the canonical size
    pub error_ratio: f64,
}

/// Compares fixed-size images and manages thumbnails
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ImageComparator {
    settings: ComparatorSettings,
}

impl ImageComparator {
    /// Create comparator
    #[inline]
    #[must_use]
    pub const fn new(settings: ComparatorSettings) -> Self {
        Self { settings }
    }

    /// Current settings
    #[inline]
    #[must_use]
    pub const fn settings(&self) -> &ComparatorSettings {
        &self.settings
    }

    /// Same comparator with a different threshold
    #[inline]
    #[must_use]
    pub const fn with_threshold(&self, threshold: f64) -> Self {
        Self::new(self.settings.with_threshold(threshold))
    }

    /// Canonical `(width, height)`
    #[inline]
    #[must_use]
    pub const fn canonical_size(&self) -> (u32, u32) {
        (self.settings.width, self.settings.height)
    }

    /// Decode PNG bytes and require the canonical size
    ///
    /// # Errors
    /// Returns [`CompareError::InvalidImage`] if the bytes do not decode or the
    /// image has the wrong dimensions
    pub fn decode_canonical(&self, bytes: &[u8]) -> CompareResult<RgbaImage> {
        let image = decode_png(bytes)?;
        if image.dimensions() != self.canonical_size() {
            let (w, h) = self.canonical_size();
            return Err(CompareError::InvalidImage(format!(
                "image has the wrong size ({}, {}), expected ({w}, {h})",
                image.width(),
                image.height()
            )));
        }
        Ok(image)
    }

    /// Compare two decoded images
    ///
    /// # Errors
    /// Returns [`CompareError::SizeMismatch`] if either image is not of the
    /// canonical size
    pub fn compare(&self, a: &RgbaImage, b: &RgbaImage) -> CompareResult<Comparison> {
        self.require_canonical(a)?;
        self.require_canonical(b)?;

        let (width, height) = self.canonical_size();
        let mut difference = RgbaImage::new(width, height);
        let flagged = PixelMatch {
            width,
            height,
            max_delta: MAX_YIQ_DELTA * self.settings.threshold * self.settings.threshold,
            detect_antialiasing: self.settings.detect_antialiasing,
        }
        .run(a.as_raw(), b.as_raw(), Some(&mut difference), false);

        let total = u64::from(width) * u64::from(height);
        #[allow(clippy::cast_precision_loss)]
        let error_ratio = flagged as f64 / total as f64;

        Ok(Comparison {
            difference,
            flagged_pixels: flagged,
            error_ratio,
        })
    }

    /// Whether two images are pixel-identical at zero tolerance
    ///
    /// Independent of the configured threshold. Images of different
    /// dimensions are never identical.
    #[must_use]
    pub fn are_identical(&self, a: &RgbaImage, b: &RgbaImage) -> bool {
        if a.dimensions() != b.dimensions() {
            return false;
        }
        let (width, height) = a.dimensions();
        PixelMatch {
            width,
            height,
            max_delta: 0.0,
            detect_antialiasing: false,
        }
        .run(a.as_raw(), b.as_raw(), None, true)
            == 0
    }

    /// Compare two image files
    ///
    /// # Errors
    /// Returns error if a file cannot be read or decoded, or
    /// [`CompareError::SizeMismatch`] if the sizes are not canonical
    pub fn compare_files(&self, reference: &Path, candidate: &Path) -> CompareResult<Comparison> {
        tracing::debug!(
            "Creating comparison: \"{}\" & \"{}\"",
            reference.display(),
            candidate.display()
        );
        let reference = open_png(reference)?;
        let candidate = open_png(candidate)?;
        self.compare(&reference, &candidate)
    }

    /// Compare two files, write the difference bitmap to `out` and create its
    /// thumbnail
    ///
    /// Any existing file at `out` is overwritten.
    ///
    /// # Errors
    /// Same as [`Self::compare_files`], plus write failures
    pub fn save_comparison(
        &self,
        reference: &Path,
        candidate: &Path,
        out: &Path,
    ) -> CompareResult<f64> {
        let comparison = self.compare_files(reference, candidate)?;
        save_png(&comparison.difference, out)?;
        self.make_thumbnail(out)?;
        tracing::debug!(
            "Wrote difference \"{}\" ({} flagged pixels)",
            out.display(),
            comparison.flagged_pixels
        );
        Ok(comparison.error_ratio)
    }

    /// Downsample the image at `path` by the configured scale and write it to
    /// the sibling `-thumbnail` path
    ///
    /// # Errors
    /// Returns error if the image cannot be read or the thumbnail not written
    pub fn make_thumbnail(&self, path: &Path) -> CompareResult<PathBuf> {
        let image = open_png(path)?;
        let scale = self.settings.thumbnail_scale.max(1);
        let width = (self.settings.width / scale).max(1);
        let height = (self.settings.height / scale).max(1);
        let thumbnail = imageops::resize(&image, width, height, FilterType::Triangle);

        let target = thumbnail_path(path);
        save_png(&thumbnail, &target)?;
        Ok(target)
    }

    fn require_canonical(&self, image: &RgbaImage) -> CompareResult<()> {
        if image.dimensions() == self.canonical_size() {
            Ok(())
        } else {
            Err(CompareError::size_mismatch(
                self.canonical_size(),
                image.dimensions(),
            ))
        }
    }
}

/// Decode PNG bytes into RGBA
///
/// # Errors
/// Returns [`CompareError::InvalidImage`] if the bytes are not a PNG
pub fn decode_png(bytes: &[u8]) -> CompareResult<RgbaImage> {
    image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .map(|img| img.to_rgba8())
        .map_err(|e| CompareError::InvalidImage(format!("error loading image: {e}")))
}

/// Read and decode a PNG file
///
/// # Errors
/// Returns error if the file cannot be read or is not a PNG
pub fn open_png(path: &Path) -> CompareResult<RgbaImage> {
    let bytes = std::fs::read(path).map_err(|e| CompareError::io_error(path, e))?;
    decode_png(&bytes)
}

/// Dimensions of a PNG file, read from its header only
///
/// # Errors
/// Returns error if the file cannot be read or is not a PNG
pub fn png_dimensions(path: &Path) -> CompareResult<(u32, u32)> {
    image::image_dimensions(path).map_err(|e| match e {
        image::ImageError::IoError(source) => CompareError::io_error(path, source),
        other => CompareError::InvalidImage(format!("{}: {other}", path.display())),
    })
}

/// Encode a bitmap as PNG bytes
///
/// # Errors
/// Returns error if encoding fails
pub fn encode_png(image: &RgbaImage) -> CompareResult<Vec<u8>> {
    let mut out = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .map_err(|source| CompareError::Encode {
            path: PathBuf::from("<memory>"),
            source,
        })?;
    Ok(out.into_inner())
}

/// Write a bitmap as a PNG file
///
/// # Errors
/// Returns error if encoding or writing fails
pub fn save_png(image: &RgbaImage, path: &Path) -> CompareResult<()> {
    image
        .save_with_format(path, ImageFormat::Png)
        .map_err(|source| CompareError::Encode {
            path: path.to_path_buf(),
            source,
        })
}

/// One pass of the YIQ pixel comparison over raw RGBA buffers
struct PixelMatch {
    width: u32,
    height: u32,
    max_delta: f64,
    detect_antialiasing: bool,
}

impl PixelMatch {
    fn run(
        &self,
        a: &[u8],
        b: &[u8],
        mut output: Option<&mut RgbaImage>,
        stop_at_first: bool,
    ) -> u64 {
        if a == b {
            if let Some(out) = output.as_deref_mut() {
                for (pos, px) in out.pixels_mut().enumerate() {
                    px.0 = gray_pixel(a, pos * 4);
                }
            }
            return 0;
        }

        let mut flagged = 0u64;
        for y in 0..self.height {
            for x in 0..self.width {
                let pos = self.offset(x, y);
                let delta = color_delta(a, b, pos, pos, false);

                let pixel = if delta.abs() > self.max_delta {
                    let antialiased = self.detect_antialiasing
                        && (self.antialiased(a, b, x, y) || self.antialiased(b, a, x, y));
                    if antialiased {
                        opaque(AA_COLOR)
                    } else {
                        flagged += 1;
                        if stop_at_first {
                            return flagged;
                        }
                        opaque(DIFF_COLOR)
                    }
                } else {
                    gray_pixel(a, pos)
                };

                if let Some(out) = output.as_deref_mut() {
                    out.put_pixel(x, y, image::Rgba(pixel));
                }
            }
        }
        flagged
    }

    #[inline]
    fn offset(&self, x: u32, y: u32) -> usize {
        (y as usize * self.width as usize + x as usize) * 4
    }

    fn neighbourhood(&self, x: u32, y: u32) -> (u32, u32, u32, u32) {
        (
            x.saturating_sub(1),
            y.saturating_sub(1),
            (x + 1).min(self.width - 1),
            (y + 1).min(self.height - 1),
        )
    }

    /// Whether the pixel at `(x, y)` of `img` sits on an anti-aliased edge
    ///
    /// An edge pixel has both a darker and a brighter neighbour, and one of
    /// those extremes lies in a flat region in both images.
    fn antialiased(&self, img: &[u8], other: &[u8], x: u32, y: u32) -> bool {
        let (x0, y0, x2, y2) = self.neighbourhood(x, y);
        let pos = self.offset(x, y);
        let mut zeroes = u32::from(x == x0 || x == x2 || y == y0 || y == y2);
        let mut min = 0.0;
        let mut max = 0.0;
        let mut min_at = (0, 0);
        let mut max_at = (0, 0);

        for nx in x0..=x2 {
            for ny in y0..=y2 {
                if nx == x && ny == y {
                    continue;
                }
                let delta = color_delta(img, img, pos, self.offset(nx, ny), true);
                if delta == 0.0 {
                    zeroes += 1;
                    if zeroes > 2 {
                        return false;
                    }
                } else if delta < min {
                    min = delta;
                    min_at = (nx, ny);
                } else if delta > max {
                    max = delta;
                    max_at = (nx, ny);
                }
            }
        }

        if min == 0.0 || max == 0.0 {
            return false;
        }

        (self.has_many_siblings(img, min_at) && self.has_many_siblings(other, min_at))
            || (self.has_many_siblings(img, max_at) && self.has_many_siblings(other, max_at))
    }

    /// Whether at least three neighbours share the exact colour at `(x, y)`
    fn has_many_siblings(&self, img: &[u8], (x, y): (u32, u32)) -> bool {
        let (x0, y0, x2, y2) = self.neighbourhood(x, y);
        let pos = self.offset(x, y);
        let mut zeroes = u32::from(x == x0 || x == x2 || y == y0 || y == y2);

        for nx in x0..=x2 {
            for ny in y0..=y2 {
                if nx == x && ny == y {
                    continue;
                }
                let other = self.offset(nx, ny);
                if img[pos..pos + 4] == img[other..other + 4] {
                    zeroes += 1;
                }
                if zeroes > 2 {
                    return true;
                }
            }
        }
        false
    }
}

#[inline]
fn opaque([r, g, b]: [u8; 3]) -> [u8; 4] {
    [r, g, b, 255]
}

#[inline]
fn blend(c: f64, alpha: f64) -> f64 {
    255.0 + (c - 255.0) * alpha
}

#[inline]
fn rgb2y(r: f64, g: f64, b: f64) -> f64 {
    r * 0.298_895_31 + g * 0.586_622_47 + b * 0.114_482_23
}

#[inline]
fn rgb2i(r: f64, g: f64, b: f64) -> f64 {
    r * 0.595_977_99 - g * 0.274_176_10 - b * 0.321_801_89
}

#[inline]
fn rgb2q(r: f64, g: f64, b: f64) -> f64 {
    r * 0.211_470_17 - g * 0.522_617_11 + b * 0.311_146_94
}

/// Pixel at `k`, alpha-blended onto white
pub(crate) fn blended(img: &[u8], k: usize) -> (f64, f64, f64) {
    let r = f64::from(img[k]);
    let g = f64::from(img[k + 1]);
    let b = f64::from(img[k + 2]);
    let a = img[k + 3];
    if a < 255 {
        let a = f64::from(a) / 255.0;
        (blend(r, a), blend(g, a), blend(b, a))
    } else {
        (r, g, b)
    }
}

/// Signed squared YIQ distance between pixel `k` of `a` and pixel `m` of `b`
///
/// Negative when the first pixel is brighter. With `y_only` only the
/// brightness difference is returned.
fn color_delta(a: &[u8], b: &[u8], k: usize, m: usize, y_only: bool) -> f64 {
    if a[k..k + 4] == b[m..m + 4] {
        return 0.0;
    }
    let (r1, g1, b1) = blended(a, k);
    let (r2, g2, b2) = blended(b, m);

    let y1 = rgb2y(r1, g1, b1);
    let y2 = rgb2y(r2, g2, b2);
    let y = y1 - y2;
    if y_only {
        return y;
    }

    let i = rgb2i(r1, g1, b1) - rgb2i(r2, g2, b2);
    let q = rgb2q(r1, g1, b1) - rgb2q(r2, g2, b2);
    let delta = 0.5053 * y * y + 0.299 * i * i + 0.1957 * q * q;
    if y1 > y2 {
        -delta
    } else {
        delta
    }
}

/// Faded grayscale rendering of pixel `k`
fn gray_pixel(img: &[u8], k: usize) -> [u8; 4] {
    let y = rgb2y(f64::from(img[k]), f64::from(img[k + 1]), f64::from(img[k + 2]));
    let value = blend(y, FADE_ALPHA * f64::from(img[k + 3]) / 255.0);
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let v = value.round().clamp(0.0, 255.0) as u8;
    [v, v, v, 255]
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;
    use proptest::prelude::*;

    fn comparator(threshold: f64) -> ImageComparator {
        ImageComparator::new(ComparatorSettings::new(20, 10).with_threshold(threshold))
    }

    fn solid(color: [u8; 4]) -> RgbaImage {
        RgbaImage::from_pixel(20, 10, Rgba(color))
    }

    #[test]
    fn identical_images_have_zero_error() {
        let img = solid([40, 80, 120, 255]);
        let c = comparator(0.1).compare(&img, &img).unwrap();
        assert_eq!(c.flagged_pixels, 0);
        assert!(c.error_ratio.abs() < f64::EPSILON);
        assert!(comparator(0.1).are_identical(&img, &img));
    }

    #[test]
    fn ratio_uses_canonical_pixel_count() {
        let a = solid([0, 0, 0, 255]);
        let mut b = a.clone();
        // Column 0 rows 0..5 changed: 5 of 200 pixels
        for y in 0..5 {
            b.put_pixel(0, y, Rgba([255, 255, 255, 255]));
        }
        let c = comparator(0.1).compare(&a, &b).unwrap();
        assert_eq!(c.flagged_pixels, 5);
        assert!((c.error_ratio - 0.025).abs() < 1e-12);
    }

    #[test]
    fn difference_bitmap_marks_flagged_pixels_red() {
        let a = solid([0, 0, 0, 255]);
        let mut b = a.clone();
        b.put_pixel(10, 5, Rgba([255, 255, 255, 255]));
        let c = comparator(0.1).compare(&a, &b).unwrap();
        assert_eq!(c.difference.get_pixel(10, 5), &Rgba([255, 0, 0, 255]));
        // Unchanged black fades to near white
        let faded = c.difference.get_pixel(0, 0);
        assert_eq!(faded.0[3], 255);
        assert!(faded.0[0] > 200);
    }

    #[test]
    fn threshold_controls_sensitivity() {
        let a = solid([100, 100, 100, 255]);
        let b = solid([104, 104, 104, 255]);
        assert_eq!(comparator(0.1).compare(&a, &b).unwrap().flagged_pixels, 0);
        assert_eq!(comparator(0.0).compare(&a, &b).unwrap().flagged_pixels, 200);
        assert!(!comparator(0.9).are_identical(&a, &b));
    }

    #[test]
    fn wrong_size_is_size_mismatch() {
        let a = solid([0, 0, 0, 255]);
        let b = RgbaImage::from_pixel(10, 10, Rgba([0, 0, 0, 255]));
        let err = comparator(0.1).compare(&a, &b).unwrap_err();
        assert!(matches!(err, CompareError::SizeMismatch { actual_width: 10, .. }));
    }

    #[test]
    fn different_dimensions_are_never_identical() {
        let a = RgbaImage::from_pixel(2, 8, Rgba([0, 0, 0, 255]));
        let b = RgbaImage::from_pixel(8, 2, Rgba([0, 0, 0, 255]));
        assert!(!comparator(0.1).are_identical(&a, &b));
    }

    #[test]
    fn decode_canonical_rejects_garbage_and_wrong_size() {
        let cmp = comparator(0.1);
        assert!(matches!(
            cmp.decode_canonical(b"not a png"),
            Err(CompareError::InvalidImage(_))
        ));
        let small = encode_png(&RgbaImage::from_pixel(4, 4, Rgba([0, 0, 0, 255]))).unwrap();
        assert!(matches!(
            cmp.decode_canonical(&small),
            Err(CompareError::InvalidImage(_))
        ));
        let ok = encode_png(&solid([1, 2, 3, 255])).unwrap();
        assert_eq!(cmp.decode_canonical(&ok).unwrap().dimensions(), (20, 10));
    }

    #[test]
    fn antialiased_edge_is_not_counted() {
        // Left half black, right half white, with a gray column in between
        // in the candidate only: a softened edge
        let mut a = solid([255, 255, 255, 255]);
        for x in 0..10 {
            for y in 0..10 {
                a.put_pixel(x, y, Rgba([0, 0, 0, 255]));
            }
        }
        let mut b = a.clone();
        for y in 0..10 {
            b.put_pixel(10, y, Rgba([128, 128, 128, 255]));
        }

        let with_aa = comparator(0.1).compare(&a, &b).unwrap();
        assert_eq!(with_aa.flagged_pixels, 0);
        assert_eq!(with_aa.difference.get_pixel(10, 5), &Rgba([255, 255, 0, 255]));

        let strict = ImageComparator::new(
            ComparatorSettings::new(20, 10)
                .with_threshold(0.1)
                .with_antialiasing_detection(false),
        );
        assert_eq!(strict.compare(&a, &b).unwrap().flagged_pixels, 10);
    }

    #[test]
    fn save_comparison_writes_difference_and_thumbnail() {
        let dir = tempfile::tempdir().unwrap();
        let cmp = ImageComparator::new(
            ComparatorSettings::new(20, 10).with_thumbnail_scale(2),
        );
        let reference = dir.path().join("ref.png");
        let candidate = dir.path().join("candidate.png");
        let out = dir.path().join("difference.png");
        save_png(&solid([0, 0, 0, 255]), &reference).unwrap();
        save_png(&solid([0, 0, 0, 255]), &candidate).unwrap();

        let ratio = cmp.save_comparison(&reference, &candidate, &out).unwrap();
        assert!(ratio.abs() < f64::EPSILON);
        assert_eq!(open_png(&out).unwrap().dimensions(), (20, 10));
        let thumb = open_png(&dir.path().join("difference-thumbnail.png")).unwrap();
        assert_eq!(thumb.dimensions(), (10, 5));
    }

    proptest! {
        #[test]
        fn self_comparison_is_always_clean(
            seed in proptest::collection::vec(any::<u8>(), 20 * 10 * 4)
        ) {
            let img = RgbaImage::from_raw(20, 10, seed).unwrap();
            let cmp = comparator(0.1);
            prop_assert_eq!(cmp.compare(&img, &img).unwrap().flagged_pixels, 0);
            prop_assert!(cmp.are_identical(&img, &img));
        }

        #[test]
        fn error_ratio_is_a_fraction(
            a in proptest::collection::vec(any::<u8>(), 20 * 10 * 4),
            b in proptest::collection::vec(any::<u8>(), 20 * 10 * 4),
            threshold in 0.0f64..=1.0,
        ) {
            let a = RgbaImage::from_raw(20, 10, a).unwrap();
            let b = RgbaImage::from_raw(20, 10, b).unwrap();
            let c = comparator(threshold).compare(&a, &b).unwrap();
            prop_assert!((0.0..=1.0).contains(&c.error_ratio));
        }
    }
}
