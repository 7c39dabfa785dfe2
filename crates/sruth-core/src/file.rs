use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::path::ArchivePath;

/// A filesystem mtime rounded to whole seconds (§6, "Filesystem timestamp
/// contract"). Equality after rounding is exactly millisecond equality of
/// two `ArchiveTime`s, since both are already second-aligned.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ArchiveTime(i64);

impl ArchiveTime {
    pub fn from_system_time(t: SystemTime) -> Self {
        let millis = t
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self::round_to_seconds(millis)
    }

    pub fn from_millis(millis: i64) -> Self {
        Self::round_to_seconds(millis)
    }

    fn round_to_seconds(millis: i64) -> Self {
        Self(millis.div_euclid(1000) * 1000)
    }

    pub fn as_millis(&self) -> i64 {
        self.0
    }

    pub fn to_system_time(&self) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(self.0.max(0) as u64)
    }
}

impl std::fmt::Debug for ArchiveTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ArchiveTime({}ms)", self.0)
    }
}

/// Identifies one logical file: its archive path plus the timestamp it was
/// announced with. Immutable once a [`FileInfo`] carrying it has been
/// constructed.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Debug)]
pub struct FileId {
    pub path: ArchivePath,
    pub timestamp: ArchiveTime,
}

impl FileId {
    pub fn new(path: ArchivePath, timestamp: ArchiveTime) -> Self {
        Self { path, timestamp }
    }
}

/// Immutable metadata for a file. Two `FileInfo`s sharing a [`FileId`] must
/// agree on `size` and `piece_size`, checked by [`FileInfo::check_consistent_with`].
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct FileInfo {
    pub id: FileId,
    pub size: u64,
    pub piece_size: u32,
}

impl FileInfo {
    pub fn new(id: FileId, size: u64, piece_size: u32) -> Self {
        Self {
            id,
            size,
            piece_size,
        }
    }

    pub fn piece_count(&self) -> u32 {
        if self.size == 0 {
            return 0;
        }
        ((self.size + self.piece_size as u64 - 1) / self.piece_size as u64) as u32
    }

    /// Length of the piece at `index`, accounting for the (possibly
    /// shorter) final piece.
    pub fn piece_len(&self, index: u32) -> Result<u32> {
        let piece_count = self.piece_count();
        if index >= piece_count {
            return Err(Error::PieceIndexOutOfRange {
                id: self.id.clone(),
                index,
                piece_count,
            });
        }
        if index + 1 == piece_count {
            let consumed = self.piece_size as u64 * (piece_count - 1) as u64;
            Ok((self.size - consumed) as u32)
        } else {
            Ok(self.piece_size)
        }
    }

    pub fn check_consistent_with(&self, other: &FileInfo) -> Result<()> {
        if self.size == other.size && self.piece_size == other.piece_size {
            return Ok(());
        }
        Err(Error::InconsistentFileInfo {
            id: self.id.clone(),
            existing_size: self.size,
            existing_piece_size: self.piece_size,
            got_size: other.size,
            got_piece_size: other.piece_size,
        })
    }
}

/// Identifies one piece of one file.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
pub struct PieceSpec {
    pub file: Arc<FileInfo>,
    pub index: u32,
}

impl PieceSpec {
    pub fn new(file: Arc<FileInfo>, index: u32) -> Result<Self> {
        file.piece_len(index)?;
        Ok(Self { file, index })
    }

    pub fn offset(&self) -> u64 {
        self.file.piece_size as u64 * self.index as u64
    }

    pub fn len(&self) -> u32 {
        self.file
            .piece_len(self.index)
            .expect("PieceSpec constructed with out-of-range index")
    }
}

/// A piece's bytes alongside the spec identifying it. Length must equal
/// `spec.len()`; this is checked wherever a `Piece` is constructed from
/// untrusted (wire) input, not here.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Piece {
    pub spec: PieceSpec,
    pub bytes: bytes::Bytes,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(size: u64, piece_size: u32) -> Arc<FileInfo> {
        Arc::new(FileInfo::new(
            FileId::new(ArchivePath::parse("a/b"), ArchiveTime::from_millis(0)),
            size,
            piece_size,
        ))
    }

    #[test]
    fn piece_count_rounds_up() {
        assert_eq!(file(10, 4).piece_count(), 3);
        assert_eq!(file(8, 4).piece_count(), 2);
        assert_eq!(file(0, 4).piece_count(), 0);
    }

    #[test]
    fn last_piece_is_short() {
        let f = file(10, 4);
        assert_eq!(f.piece_len(0).unwrap(), 4);
        assert_eq!(f.piece_len(1).unwrap(), 4);
        assert_eq!(f.piece_len(2).unwrap(), 2);
        assert!(f.piece_len(3).is_err());
    }

    #[test]
    fn timestamp_rounds_to_whole_seconds() {
        let t = ArchiveTime::from_millis(1_700_000_000_999);
        assert_eq!(t.as_millis(), 1_700_000_000_000);
    }

    #[test]
    fn consistency_check_catches_size_mismatch() {
        let a = file(10, 4);
        let b = FileInfo::new(a.id.clone(), 11, 4);
        assert!(a.check_consistent_with(&b).is_err());
    }
}
