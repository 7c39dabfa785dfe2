use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sruth_archive::PutOutcome;
use sruth_core::{PieceSpec, Predicate};
use sruth_proto::{ConnectionId, Notice, WirePieceSpec};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::options::PeerOptions;

struct RegisteredPeer {
    predicate: Predicate,
    notice_tx: mpsc::Sender<Notice>,
}

/// Node-local arbiter between connected peers and the [`Archive`] (§4.6).
/// Peers hold a strong handle to their `ClearingHouse`; the clearing-house
/// itself holds only the bookkeeping needed to fan notices out to them,
/// dropping a peer's entry the moment it disconnects (§9, cyclic
/// references resolved via ownership direction rather than `Weak`, since
/// this implementation never hands a `ClearingHouse` reference back out to
/// a `Peer` in a way that would keep it alive past its own task).
///
/// File-completion data products are not re-announced here: [`Archive::put`]
/// already emits that event exactly once on its own completion channel
/// (§4.1), so a node's top-level wiring reads that channel directly rather
/// than through a second, duplicate path.
pub struct ClearingHouse {
    peers: DashMap<ConnectionId, RegisteredPeer>,
    issued: DashMap<PieceSpec, ConnectionId>,
}

impl ClearingHouse {
    pub fn new() -> Self {
        Self {
            peers: DashMap::new(),
            issued: DashMap::new(),
        }
    }

    /// Registers a freshly handshaked peer, returning the receive half of
    /// its bounded outbound-notice queue (§5 back-pressure).
    pub fn register_peer(
        &self,
        id: ConnectionId,
        predicate: Predicate,
        options: &PeerOptions,
    ) -> mpsc::Receiver<Notice> {
        let (notice_tx, notice_rx) = mpsc::channel(options.notice_queue_capacity);
        self.peers.insert(id, RegisteredPeer { predicate, notice_tx });
        notice_rx
    }

    /// Releases everything held by a disconnecting peer: its claims return
    /// to the unissued pool and may be re-requested from whoever next
    /// announces them (§4.5 "Peer P disconnects").
    pub fn unregister_peer(&self, id: &ConnectionId) {
        self.peers.remove(id);
        let released = self.release_all_for_peer(id);
        if !released.is_empty() {
            debug!(peer = ?id, count = released.len(), "released claims held by disconnecting peer");
        }
    }

    /// Attempts to claim `spec` for `peer`, enforcing the single-issuer
    /// invariant (§4.6): at most one peer may hold an outstanding request
    /// for a given spec at a time.
    pub fn try_claim(&self, peer: ConnectionId, spec: PieceSpec) -> bool {
        match self.issued.entry(spec) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(peer);
                true
            }
        }
    }

    fn release_all_for_peer(&self, peer: &ConnectionId) -> Vec<PieceSpec> {
        let mut released = Vec::new();
        self.issued.retain(|spec, owner| {
            if owner == peer {
                released.push(spec.clone());
                false
            } else {
                true
            }
        });
        released
    }

    /// Called by the peer task that just stored a piece (§4.5(d)). Releases
    /// the claim — which is this implementation's form of "retract any
    /// in-flight request for that spec at other peers": once unclaimed, no
    /// peer's notice handler will ever try to request an already-complete
    /// piece again, so there is nothing to actively cancel on the wire —
    /// then fans the piece out to every other connected peer whose
    /// predicate includes its file (§4.6 "announce fan-out"). `outcome` is
    /// accepted for symmetry with [`Archive::put`]'s return value and to
    /// let callers skip the fan-out of a duplicate, already-seen piece.
    pub async fn on_piece_stored(&self, from: &ConnectionId, spec: PieceSpec, outcome: PutOutcome) {
        self.issued.remove(&spec);
        if outcome == PutOutcome::Duplicate {
            return;
        }
        let targets: Vec<(ConnectionId, mpsc::Sender<Notice>)> = self
            .peers
            .iter()
            .filter(|e| e.key() != from && e.value().predicate.satisfied_by(&spec.file))
            .map(|e| (e.key().clone(), e.value().notice_tx.clone()))
            .collect();
        let notice = Notice::AddedPiece(WirePieceSpec::from(&spec));
        for (peer_id, tx) in targets {
            if tx.send(notice.clone()).await.is_err() {
                warn!(peer = ?peer_id, "dropped outbound notice: peer task gone");
            }
        }
    }
}

impl Default for ClearingHouse {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sruth_core::{ArchivePath, ArchiveTime, FileId, FileInfo, Filter};
    use std::sync::Arc as StdArc;

    fn file(path: &str) -> StdArc<FileInfo> {
        StdArc::new(FileInfo::new(
            FileId::new(ArchivePath::parse(path), ArchiveTime::from_millis(0)),
            8,
            4,
        ))
    }

    fn connection_id(port: u16) -> ConnectionId {
        ConnectionId::new(sruth_core::ServerAddress::new("127.0.0.1", port))
    }

    #[test]
    fn try_claim_enforces_single_issuer() {
        let house = ClearingHouse::new();
        let spec = PieceSpec::new(file("a/b"), 0).unwrap();
        assert!(house.try_claim(connection_id(1), spec.clone()));
        assert!(!house.try_claim(connection_id(2), spec));
    }

    #[tokio::test]
    async fn disconnect_releases_claims() {
        let house = ClearingHouse::new();
        let spec = PieceSpec::new(file("a/b"), 0).unwrap();
        let peer = connection_id(1);
        house.try_claim(peer.clone(), spec.clone());
        house.unregister_peer(&peer);
        assert!(house.try_claim(connection_id(2), spec));
    }

    #[tokio::test]
    async fn piece_stored_fans_out_to_interested_peers_only() {
        let house = ClearingHouse::new();
        let options = PeerOptions::default();

        let interested = connection_id(1);
        let mut interested_rx = house.register_peer(interested.clone(), Predicate::everything(), &options);
        let uninterested = connection_id(2);
        let mut uninterested_rx =
            house.register_peer(uninterested.clone(), Predicate::of([Filter::parse("other")]), &options);
        let sender = connection_id(3);

        let spec = PieceSpec::new(file("a/b"), 0).unwrap();
        house.on_piece_stored(&sender, spec, PutOutcome::Stored).await;

        assert!(matches!(interested_rx.recv().await, Some(Notice::AddedPiece(_))));
        assert!(uninterested_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn duplicate_outcome_skips_fan_out() {
        let house = ClearingHouse::new();
        let options = PeerOptions::default();
        let interested = connection_id(1);
        let mut interested_rx = house.register_peer(interested, Predicate::everything(), &options);
        let sender = connection_id(2);

        let spec = PieceSpec::new(file("a/b"), 0).unwrap();
        house.on_piece_stored(&sender, spec, PutOutcome::Duplicate).await;

        assert!(interested_rx.try_recv().is_err());
    }
}
