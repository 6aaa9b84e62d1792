//! Test identity
//!
//! A [`TestTriple`] names one logical test: which group it belongs to, what it
//! is called and on which hardware it was rendered.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

/// Composite key `(group, name, hardware)`
///
/// All three parts become path segments on disk, so they must be non-empty
/// and must not contain path separators or start with a dot.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TestTriple {
    /// Test group, e.g. `default`
    pub group: String,
    /// Test name within the group, e.g. `earth`
    pub name: String,
    /// Rendering environment, e.g. `linux-nvidia`
    pub hardware: String,
}

impl TestTriple {
    /// Create a triple
    ///
    /// # Errors
    /// Returns error if any part is not a safe path segment
    pub fn new(
        group: impl Into<String>,
        name: impl Into<String>,
        hardware: impl Into<String>,
    ) -> Result<Self, TripleError> {
        let triple = Self {
            group: group.into(),
            name: name.into(),
            hardware: hardware.into(),
        };
        validate_segment("group", &triple.group)?;
        validate_segment("name", &triple.name)?;
        validate_segment("hardware", &triple.hardware)?;
        Ok(triple)
    }

    /// Same group and name on a different hardware
    ///
    /// # Errors
    /// Returns error if `hardware` is not a safe path segment
    pub fn with_hardware(&self, hardware: impl Into<String>) -> Result<Self, TripleError> {
        Self::new(self.group.clone(), self.name.clone(), hardware)
    }
}

impl Display for TestTriple {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.name, self.hardware)
    }
}

fn validate_segment(field: &'static str, value: &str) -> Result<(), TripleError> {
    let bad = value.is_empty()
        || value.starts_with('.')
        || value.chars().any(|c| matches!(c, '/' | '\\' | '\0') || c.is_control());
    if bad {
        return Err(TripleError::UnsafeSegment {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

/// Invalid triple component
#[derive(Debug, thiserror::Error)]
pub enum TripleError {
    /// Component cannot be used as a path segment
    #[error("{field} '{value}' is not a valid path segment")]
    UnsafeSegment { field: &'static str, value: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_plain_names() {
        let t = TestTriple::new("default", "earth", "linux-nvidia").unwrap();
        assert_eq!(t.to_string(), "default/earth/linux-nvidia");
    }

    #[test]
    fn rejects_traversal_and_separators() {
        assert!(TestTriple::new("..", "earth", "linux").is_err());
        assert!(TestTriple::new("default", "a/b", "linux").is_err());
        assert!(TestTriple::new("default", "earth", "").is_err());
        assert!(TestTriple::new("default", "earth", "win\\64").is_err());
    }

    #[test]
    fn with_hardware_keeps_group_and_name() {
        let t = TestTriple::new("default", "earth", "linux").unwrap();
        let w = t.with_hardware("windows").unwrap();
        assert_eq!(w.group, "default");
        assert_eq!(w.name, "earth");
        assert_eq!(w.hardware, "windows");
    }
}
