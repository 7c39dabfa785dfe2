use std::collections::BTreeMap;
use std::sync::Arc;

use crate::bitset::FiniteBitSet;
use crate::file::{FileId, FileInfo, PieceSpec};

/// All pieces of a single file that are present in a set, i.e. (FileInfo,
/// bitset of piece indexes) from §3.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OneFileSet {
    pub file: Arc<FileInfo>,
    pub bits: FiniteBitSet,
}

impl OneFileSet {
    pub fn single(file: Arc<FileInfo>, index: u32) -> Self {
        let mut bits = FiniteBitSet::empty(file.piece_count());
        bits.set_bit(index);
        Self { file, bits }
    }

    pub fn full(file: Arc<FileInfo>) -> Self {
        let bits = FiniteBitSet::complete(file.piece_count());
        Self { file, bits }
    }

    pub fn contains(&self, index: u32) -> bool {
        self.bits.is_set(index)
    }

    pub fn remove(&mut self, index: u32) {
        self.bits.clear_bit(index);
    }

    pub fn merge(&mut self, other: &OneFileSet) {
        debug_assert_eq!(self.file.id, other.file.id, "merging OneFileSets of different files");
        self.bits.merge(&other.bits);
    }

    pub fn is_empty(&self) -> bool {
        self.bits.set_count() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = PieceSpec> + '_ {
        let mut next = self.bits.next_set_bit(0);
        std::iter::from_fn(move || {
            let index = next?;
            next = self.bits.next_set_bit(index + 1);
            Some(PieceSpec {
                file: self.file.clone(),
                index,
            })
        })
    }
}

/// The polymorphic piece-specification-set algebra from §4.2: `empty` is
/// the identity element, `single` a lone spec, `one-file` all wanted
/// pieces of one file, `multi-file` a map from [`FileId`] to `one-file`
/// entries. Iteration order is always ascending `FileId` then ascending
/// piece index (the `BTreeMap` in the multi-file case already provides
/// ascending `FileId` order; see [`crate::file::FileId`]'s derived `Ord`).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PieceSpecSet {
    #[default]
    Empty,
    Single(PieceSpec),
    OneFile(OneFileSet),
    MultiFile(BTreeMap<FileId, OneFileSet>),
}

impl PieceSpecSet {
    pub fn empty() -> Self {
        PieceSpecSet::Empty
    }

    pub fn single(spec: PieceSpec) -> Self {
        PieceSpecSet::Single(spec)
    }

    pub fn one_file(set: OneFileSet) -> Self {
        if set.is_empty() {
            PieceSpecSet::Empty
        } else {
            PieceSpecSet::OneFile(set)
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            PieceSpecSet::Empty => true,
            PieceSpecSet::Single(_) => false,
            PieceSpecSet::OneFile(s) => s.is_empty(),
            PieceSpecSet::MultiFile(m) => m.values().all(OneFileSet::is_empty),
        }
    }

    pub fn contains(&self, spec: &PieceSpec) -> bool {
        match self {
            PieceSpecSet::Empty => false,
            PieceSpecSet::Single(s) => s == spec,
            PieceSpecSet::OneFile(s) => s.file.id == spec.file.id && s.contains(spec.index),
            PieceSpecSet::MultiFile(m) => m
                .get(&spec.file.id)
                .is_some_and(|s| s.contains(spec.index)),
        }
    }

    /// Returns a new set with `spec` removed. Garbage-collects any
    /// multi-file entry that becomes empty.
    pub fn remove(self, spec: &PieceSpec) -> Self {
        match self {
            PieceSpecSet::Empty => PieceSpecSet::Empty,
            PieceSpecSet::Single(s) => {
                if &s == spec {
                    PieceSpecSet::Empty
                } else {
                    PieceSpecSet::Single(s)
                }
            }
            PieceSpecSet::OneFile(mut s) => {
                if s.file.id == spec.file.id {
                    s.remove(spec.index);
                    PieceSpecSet::one_file(s)
                } else {
                    PieceSpecSet::OneFile(s)
                }
            }
            PieceSpecSet::MultiFile(mut m) => {
                if let Some(s) = m.get_mut(&spec.file.id) {
                    s.remove(spec.index);
                    if s.is_empty() {
                        m.remove(&spec.file.id);
                    }
                }
                PieceSpecSet::MultiFile(m)
            }
        }
    }

    fn into_map(self) -> BTreeMap<FileId, OneFileSet> {
        match self {
            PieceSpecSet::Empty => BTreeMap::new(),
            PieceSpecSet::Single(s) => {
                let mut m = BTreeMap::new();
                m.insert(s.file.id.clone(), OneFileSet::single(s.file.clone(), s.index));
                m
            }
            PieceSpecSet::OneFile(s) => {
                let mut m = BTreeMap::new();
                m.insert(s.file.id.clone(), s);
                m
            }
            PieceSpecSet::MultiFile(m) => m,
        }
    }

    /// Commutative, associative union. Single/one-file representations are
    /// preserved when both operands stay within one file; anything
    /// touching more than one file widens to `multi-file`.
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (PieceSpecSet::Empty, x) | (x, PieceSpecSet::Empty) => x,
            (PieceSpecSet::Single(a), PieceSpecSet::Single(b)) if a == b => PieceSpecSet::Single(a),
            (PieceSpecSet::Single(a), PieceSpecSet::Single(b)) if a.file.id == b.file.id => {
                let mut s = OneFileSet::single(a.file.clone(), a.index);
                s.merge(&OneFileSet::single(b.file, b.index));
                PieceSpecSet::one_file(s)
            }
            (a, b) => {
                let mut map = a.into_map();
                for (id, other_set) in b.into_map() {
                    map.entry(id)
                        .and_modify(|s| s.merge(&other_set))
                        .or_insert(other_set);
                }
                if map.len() == 1 {
                    let (_, only) = map.into_iter().next().expect("checked len == 1");
                    PieceSpecSet::one_file(only)
                } else {
                    PieceSpecSet::MultiFile(map)
                }
            }
        }
    }

    pub fn iter(&self) -> Box<dyn Iterator<Item = PieceSpec> + '_> {
        match self {
            PieceSpecSet::Empty => Box::new(std::iter::empty()),
            PieceSpecSet::Single(s) => Box::new(std::iter::once(s.clone())),
            PieceSpecSet::OneFile(s) => Box::new(s.iter()),
            PieceSpecSet::MultiFile(m) => Box::new(m.values().flat_map(OneFileSet::iter)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file::ArchiveTime;
    use crate::path::ArchivePath;

    fn file(name: &str, piece_count: u32) -> Arc<FileInfo> {
        Arc::new(FileInfo::new(
            FileId::new(ArchivePath::parse(name), ArchiveTime::from_millis(0)),
            piece_count as u64 * 4,
            4,
        ))
    }

    fn spec(file: &Arc<FileInfo>, index: u32) -> PieceSpec {
        PieceSpec::new(file.clone(), index).unwrap()
    }

    #[test]
    fn neutral_element() {
        let f = file("a", 2);
        let s = PieceSpecSet::single(spec(&f, 0));
        assert_eq!(s.clone().merge(PieceSpecSet::empty()), s);
    }

    #[test]
    fn idempotence() {
        let f = file("a", 2);
        let s = PieceSpecSet::single(spec(&f, 0));
        let merged = s.clone().merge(s.clone());
        assert_eq!(merged.iter().collect::<Vec<_>>(), s.iter().collect::<Vec<_>>());
    }

    #[test]
    fn commutativity_across_files() {
        let f1 = file("a", 2);
        let f2 = file("b", 2);
        let x = PieceSpecSet::single(spec(&f1, 0));
        let y = PieceSpecSet::single(spec(&f2, 0));
        let xy: Vec<_> = x.clone().merge(y.clone()).iter().collect();
        let yx: Vec<_> = y.merge(x).iter().collect();
        assert_eq!(xy, yx);
        assert_eq!(xy.len(), 2);
    }

    #[test]
    fn merge_with_saturated_one_file_stays_saturated() {
        let f = file("a", 2);
        let full = PieceSpecSet::one_file(OneFileSet::full(f.clone()));
        let merged = full.clone().merge(PieceSpecSet::single(spec(&f, 0)));
        assert_eq!(merged, full);
    }

    #[test]
    fn remove_then_contains() {
        let f = file("a", 2);
        let s = spec(&f, 0);
        let set = PieceSpecSet::single(s.clone()).merge(PieceSpecSet::single(spec(&f, 1)));
        assert!(set.contains(&s));
        let removed = set.remove(&s);
        assert!(!removed.contains(&s));
        assert!(removed.contains(&spec(&f, 1)));
    }

    #[test]
    fn iteration_order_is_ascending_fileid_then_index() {
        let f1 = file("a", 2);
        let f2 = file("b", 2);
        let set = PieceSpecSet::single(spec(&f2, 1))
            .merge(PieceSpecSet::single(spec(&f1, 1)))
            .merge(PieceSpecSet::single(spec(&f1, 0)));
        let paths: Vec<_> = set
            .iter()
            .map(|s| (s.file.id.path.to_string(), s.index))
            .collect();
        assert_eq!(
            paths,
            vec![
                ("/a".to_string(), 0),
                ("/a".to_string(), 1),
                ("/b".to_string(), 1),
            ]
        );
    }
}
