// Core data model for the sruth overlay: archive paths, piece identity,
// the piece-completeness bitset, the piece-specification-set algebra, and
// the filter/predicate/topology algebra used to pick peers.
//
// Shared by every other sruth crate; contains no I/O.

pub mod address;
pub mod bitset;
pub mod error;
pub mod file;
pub mod filter;
pub mod path;
pub mod piecespec;
pub mod topology;

pub use address::ServerAddress;
pub use bitset::FiniteBitSet;
pub use error::{Error, Result};
pub use file::{ArchiveTime, FileId, FileInfo, Piece, PieceSpec};
pub use filter::{Filter, Predicate};
pub use path::ArchivePath;
pub use piecespec::{OneFileSet, PieceSpecSet};
pub use topology::Topology;
