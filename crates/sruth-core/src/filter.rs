use std::cmp::Ordering;
use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::file::FileInfo;
use crate::path::ArchivePath;

/// A path-component prefix pattern. `Filter::everything()` (the empty
/// prefix) matches every path and is the top element of [`Filter`]'s total
/// order; every other filter is "smaller" the more specific (longer) it
/// is, so that [`crate::topology::Topology::get_best_server`] can pick the
/// narrowest includer by taking a minimum.
#[derive(Clone, Eq, PartialEq, Hash, Serialize, Deserialize, Debug)]
pub struct Filter {
    components: Vec<String>,
}

impl Filter {
    pub fn everything() -> Self {
        Self { components: Vec::new() }
    }

    pub fn parse(s: &str) -> Self {
        ArchivePath::parse(s).components().iter().collect()
    }

    pub fn from_components(components: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            components: components.into_iter().map(Into::into).collect(),
        }
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }

    pub fn is_everything(&self) -> bool {
        self.components.is_empty()
    }

    /// True if every path matching `other` also matches `self`, i.e. `self
    /// ⊇ other` in the notation of §3/§4.3.
    pub fn includes(&self, other: &Filter) -> bool {
        other.components.starts_with(&self.components)
    }

    pub fn matches(&self, path: &ArchivePath) -> bool {
        path.components().starts_with(&self.components)
    }

    pub fn matches_file(&self, file: &FileInfo) -> bool {
        self.matches(&file.id.path)
    }
}

impl FromIterator<String> for Filter {
    fn from_iter<T: IntoIterator<Item = String>>(iter: T) -> Self {
        Self {
            components: iter.into_iter().collect(),
        }
    }
}

impl<'a> FromIterator<&'a String> for Filter {
    fn from_iter<T: IntoIterator<Item = &'a String>>(iter: T) -> Self {
        Self {
            components: iter.into_iter().cloned().collect(),
        }
    }
}

impl PartialOrd for Filter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Filter {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .components
            .len()
            .cmp(&self.components.len())
            .then_with(|| self.components.cmp(&other.components))
    }
}

/// A disjunction of [`Filter`]s: a node's data interest.
#[derive(Clone, Default, Serialize, Deserialize, Debug)]
pub struct Predicate {
    filters: BTreeSet<Filter>,
}

impl Predicate {
    pub fn everything() -> Self {
        Self {
            filters: [Filter::everything()].into_iter().collect(),
        }
    }

    pub fn nothing() -> Self {
        Self::default()
    }

    pub fn of(filters: impl IntoIterator<Item = Filter>) -> Self {
        Self {
            filters: filters.into_iter().collect(),
        }
    }

    pub fn filters(&self) -> impl Iterator<Item = &Filter> {
        self.filters.iter()
    }

    pub fn satisfied_by(&self, file: &FileInfo) -> bool {
        self.filters.iter().any(|f| f.matches_file(file))
    }

    pub fn matches(&self, path: &ArchivePath) -> bool {
        self.filters.iter().any(|f| f.matches(path))
    }

    /// `self` is at least as inclusive as `other`: every filter of `other`
    /// has some includer in `self`.
    pub fn is_more_inclusive_than(&self, other: &Predicate) -> bool {
        other
            .filters
            .iter()
            .all(|g| self.filters.iter().any(|f| f.includes(g)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::{ArchiveTime, FileId};

    #[test]
    fn everything_is_the_order_maximum() {
        let a = Filter::parse("a");
        let ab = Filter::parse("a/b");
        let everything = Filter::everything();
        assert!(everything > a);
        assert!(a > ab);
    }

    #[test]
    fn includes_is_prefix_containment() {
        let a = Filter::parse("a");
        let ab = Filter::parse("a/b");
        assert!(a.includes(&ab));
        assert!(!ab.includes(&a));
        assert!(Filter::everything().includes(&ab));
    }

    #[test]
    fn predicate_satisfied_by_any_filter() {
        let pred = Predicate::of([Filter::parse("a"), Filter::parse("c")]);
        let file_in_a = FileInfo::new(
            FileId::new(ArchivePath::parse("a/x"), ArchiveTime::from_millis(0)),
            1,
            1,
        );
        let file_in_b = FileInfo::new(
            FileId::new(ArchivePath::parse("b/x"), ArchiveTime::from_millis(0)),
            1,
            1,
        );
        assert!(pred.satisfied_by(&file_in_a));
        assert!(!pred.satisfied_by(&file_in_b));
    }

    #[test]
    fn nothing_matches_nothing_everything_matches_all() {
        let file = FileInfo::new(
            FileId::new(ArchivePath::parse("x/y"), ArchiveTime::from_millis(0)),
            1,
            1,
        );
        assert!(!Predicate::nothing().satisfied_by(&file));
        assert!(Predicate::everything().satisfied_by(&file));
    }
}
