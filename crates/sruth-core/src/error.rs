use crate::file::FileId;
use crate::path::ArchivePath;

/// Matchable protocol and invariant violations. Anything below this line is
/// handled by closing the offending connection (transport errors and
/// protocol violations are not fatal to the node, see §7); arbitrary I/O
/// failures are instead carried as `anyhow::Error` by callers.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(
        "inconsistent FileInfo for {id:?}: have size={existing_size} piece_size={existing_piece_size}, got size={got_size} piece_size={got_piece_size}"
    )]
    InconsistentFileInfo {
        id: FileId,
        existing_size: u64,
        existing_piece_size: u32,
        got_size: u64,
        got_piece_size: u32,
    },

    #[error("piece index {index} out of range for {id:?} (piece count {piece_count})")]
    PieceIndexOutOfRange {
        id: FileId,
        index: u32,
        piece_count: u32,
    },

    #[error("piece {id:?}#{index} declared length {declared} does not match expected {expected}")]
    PieceLengthMismatch {
        id: FileId,
        index: u32,
        declared: u32,
        expected: u32,
    },

    #[error("path {0} falls under the admin subtree and cannot be served as data")]
    AdminPathForbidden(ArchivePath),

    #[error("malformed piece bitset on disk: {0}")]
    MalformedBitset(String),

    #[error("malformed deletion-queue header: {0}")]
    MalformedHeap(String),

    #[error("no FileInfo known for {0}")]
    UnknownFile(ArchivePath),
}

pub type Result<T> = std::result::Result<T, Error>;
