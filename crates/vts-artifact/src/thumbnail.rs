//! Thumbnail naming

use std::path::{Path, PathBuf};

/// Suffix appended to the file stem of a thumbnail
const THUMBNAIL_SUFFIX: &str = "-thumbnail";

/// Sibling path holding the thumbnail of `image`
///
/// `dir/candidate.png` becomes `dir/candidate-thumbnail.png`.
#[must_use]
pub fn thumbnail_path(image: &Path) -> PathBuf {
    let stem = image
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match image.extension() {
        Some(ext) => format!("{stem}{THUMBNAIL_SUFFIX}.{}", ext.to_string_lossy()),
        None => format!("{stem}{THUMBNAIL_SUFFIX}"),
    };
    image.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_suffix_before_extension() {
        assert_eq!(
            thumbnail_path(Path::new("/d/tests/x/candidate.png")),
            PathBuf::from("/d/tests/x/candidate-thumbnail.png")
        );
        assert_eq!(
            thumbnail_path(Path::new("ref/20240101T000000000Z.png")),
            PathBuf::from("ref/20240101T000000000Z-thumbnail.png")
        );
    }

    #[test]
    fn extensionless_images_get_bare_suffix() {
        assert_eq!(
            thumbnail_path(Path::new("a/difference")),
            PathBuf::from("a/difference-thumbnail")
        );
    }
}
