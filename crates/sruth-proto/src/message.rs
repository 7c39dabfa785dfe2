use serde::{Deserialize, Serialize};
use sruth_core::{FileInfo, PieceSpec, PieceSpecSet, Predicate, ServerAddress};

/// Exchanged once at the start of every connection (§4.5 "Handshake").
/// Until both sides have seen the peer's predicate, no notices or
/// requests may flow.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct NodeInfo {
    pub server_address: ServerAddress,
    pub predicate: Predicate,
}

/// Sent first on every socket of a logical [`crate::connection::Connection`]
/// so the server side can coalesce independently-accepted sockets into one
/// connection (§4.4). Generated by the client side and replayed on each
/// socket.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub local_server: ServerAddress,
    pub nonce: u64,
}

impl ConnectionId {
    pub fn new(local_server: ServerAddress) -> Self {
        Self {
            local_server,
            nonce: rand::random(),
        }
    }
}

/// A wire-serialisable `PieceSpec`, since `PieceSpec` itself embeds an
/// `Arc<FileInfo>` that carries no useful wire representation beyond its
/// fields.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct WirePieceSpec {
    pub file: FileInfo,
    pub index: u32,
}

impl From<&PieceSpec> for WirePieceSpec {
    fn from(spec: &PieceSpec) -> Self {
        Self {
            file: (*spec.file).clone(),
            index: spec.index,
        }
    }
}

impl WirePieceSpec {
    pub fn into_piece_spec(self) -> anyhow::Result<PieceSpec> {
        Ok(PieceSpec::new(std::sync::Arc::new(self.file), self.index)?)
    }
}

/// Messages flowing on the *notice* stream (either direction): piece and
/// file advertisements, removals, and end-of-notices.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum Notice {
    AddedFile(FileInfo),
    AddedPiece(WirePieceSpec),
    /// Batched form of repeated `AddedPiece`s, for one or more files.
    NoticesOfPieces(Vec<WirePieceSpec>),
    /// The authoritative removal notice (§9 design notes: supersedes the
    /// older archive-path-set shape, which this implementation does not
    /// carry).
    RemovedFiles(Vec<FileInfo>),
    Done,
}

/// The single message type on the *request* stream: sink → source.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct RequestOfPieces {
    pub specs: Vec<WirePieceSpec>,
}

impl RequestOfPieces {
    pub fn from_set(set: &PieceSpecSet) -> Self {
        Self {
            specs: set.iter().map(|s| WirePieceSpec::from(&s)).collect(),
        }
    }
}

/// A piece's bytes, flowing on the *data* stream in response to a request.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub struct WirePiece {
    pub spec: WirePieceSpec,
    pub bytes: Vec<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use sruth_core::{ArchivePath, ArchiveTime, FileId};
    use std::sync::Arc;

    #[test]
    fn wire_piece_spec_roundtrips() {
        let file = Arc::new(FileInfo::new(
            FileId::new(ArchivePath::parse("a/b"), ArchiveTime::from_millis(0)),
            16,
            4,
        ));
        let spec = PieceSpec::new(file, 1).unwrap();
        let wire = WirePieceSpec::from(&spec);
        let back = wire.into_piece_spec().unwrap();
        assert_eq!(back.index, spec.index);
        assert_eq!(back.file.id, spec.file.id);
    }
}
