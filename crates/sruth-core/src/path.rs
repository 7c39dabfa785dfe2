use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A relative path naming a file in the archive, stored as its component
/// sequence so prefix containment (used by [`crate::filter::Filter`]) is a
/// cheap slice comparison rather than a string operation.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArchivePath(Vec<String>);

impl ArchivePath {
    pub fn new(components: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(components.into_iter().map(Into::into).collect())
    }

    /// Parses a `/`-separated relative path. Empty components (leading,
    /// trailing or repeated slashes) are dropped.
    pub fn parse(s: &str) -> Self {
        Self(
            s.split('/')
                .filter(|c| !c.is_empty())
                .map(str::to_owned)
                .collect(),
        )
    }

    pub fn components(&self) -> &[String] {
        &self.0
    }

    pub fn join(&self, child: impl Into<String>) -> Self {
        let mut components = self.0.clone();
        components.push(child.into());
        Self(components)
    }

    /// True if this path lives under the `admin` subtree, which is never
    /// served as data (see §6 on-disk layout).
    pub fn is_admin(&self) -> bool {
        self.0.first().is_some_and(|c| c == "admin")
    }

    pub fn to_relative_path(&self) -> PathBuf {
        self.0.iter().collect()
    }
}

impl fmt::Display for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.0.join("/"))
    }
}

impl fmt::Debug for ArchivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArchivePath({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_strips_empty_components() {
        assert_eq!(
            ArchivePath::parse("/a//b/c/").components(),
            &["a".to_string(), "b".to_string(), "c".to_string()]
        );
    }

    #[test]
    fn admin_detection_is_first_component_only() {
        assert!(ArchivePath::parse("admin/tracker/state").is_admin());
        assert!(!ArchivePath::parse("data/admin/state").is_admin());
    }

    #[test]
    fn ordering_is_lexicographic_by_component() {
        assert!(ArchivePath::parse("a/b") < ArchivePath::parse("a/c"));
        assert!(ArchivePath::parse("a") < ArchivePath::parse("a/b"));
    }
}
