use std::sync::Arc;

use anyhow::Context;
use sruth_archive::Archive;
use sruth_core::{Piece, PieceSpec, PieceSpecSet};
use sruth_proto::{
    Connection, ConnectionId, Notice, NodeInfo, RequestOfPieces, Stream, StreamWriter, WirePiece,
    WirePieceSpec,
};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clearing_house::ClearingHouse;
use crate::options::PeerOptions;
use crate::spawn_utils;

/// Drives one [`Connection`] end to end: handshake, the three steady-state
/// stream tasks, and teardown (§4.5). Runs until the peer disconnects, a
/// fatal protocol error closes the connection, or `cancel` fires.
pub async fn run(
    connection: Connection,
    local_node_info: NodeInfo,
    archive: Arc<Archive>,
    clearing_house: Arc<ClearingHouse>,
    options: PeerOptions,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let Connection {
        id,
        peer_addr,
        mut notice,
        request,
        data,
    } = connection;

    let peer_info: NodeInfo = tokio::time::timeout(options.handshake_timeout, async {
        notice.writer().send(&local_node_info).await?;
        notice.recv::<NodeInfo>().await
    })
    .await
    .context("peer handshake timed out")?
    .context("peer handshake failed")?;
    debug!(%peer_addr, predicate = ?peer_info.predicate, "peer handshake complete");

    send_initial_snapshot(&archive, &peer_info.predicate, &notice.writer()).await?;

    let outbound_rx = clearing_house.register_peer(id.clone(), peer_info.predicate, &options);
    let conn_cancel = CancellationToken::new();

    let request_writer = request.writer();
    let data_writer = data.writer();

    let notice_task = spawn_utils::spawn_with_cancel(
        tracing::debug_span!("peer_notice_loop", %peer_addr),
        conn_cancel.clone(),
        notice_loop(
            notice,
            outbound_rx,
            request_writer,
            archive.clone(),
            clearing_house.clone(),
            id.clone(),
            cancel.clone(),
            conn_cancel.clone(),
        ),
    );
    let request_task = spawn_utils::spawn_with_cancel(
        tracing::debug_span!("peer_request_loop", %peer_addr),
        conn_cancel.clone(),
        request_loop(request, data_writer, archive.clone()),
    );
    let data_task = spawn_utils::spawn_with_cancel(
        tracing::debug_span!("peer_data_loop", %peer_addr),
        conn_cancel.clone(),
        data_loop(data, archive, clearing_house.clone(), id.clone()),
    );

    let _ = tokio::join!(notice_task, request_task, data_task);
    clearing_house.unregister_peer(&id);
    debug!(%peer_addr, "peer connection closed");
    Ok(())
}

/// The initial snapshot of locally-held pieces matching the peer's
/// predicate (§4.5(a)): one `AddedFile` plus one batched `NoticesOfPieces`
/// per file with at least one piece present.
async fn send_initial_snapshot(
    archive: &Archive,
    predicate: &sruth_core::Predicate,
    notice_writer: &Arc<StreamWriter>,
) -> anyhow::Result<()> {
    for (info, bits) in archive.walk_predicate(predicate).await {
        if bits.set_count() == 0 {
            continue;
        }
        let info = Arc::new(info);
        notice_writer.send(&Notice::AddedFile((*info).clone())).await?;
        let mut specs = Vec::with_capacity(bits.set_count() as usize);
        let mut next = bits.next_set_bit(0);
        while let Some(index) = next {
            let spec = PieceSpec::new(info.clone(), index)?;
            specs.push(WirePieceSpec::from(&spec));
            next = bits.next_set_bit(index + 1);
        }
        notice_writer.send(&Notice::NoticesOfPieces(specs)).await?;
    }
    Ok(())
}

/// Owns the notice stream: drains the clearing-house's outbound fan-out
/// queue for this peer, reacts to incoming notices (§4.5(b)), honors a
/// `Done` from the peer, and sends our own `Done` as a courtesy on node
/// shutdown.
#[allow(clippy::too_many_arguments)]
async fn notice_loop(
    mut stream: Stream,
    mut outbound_rx: mpsc::Receiver<Notice>,
    request_writer: Arc<StreamWriter>,
    archive: Arc<Archive>,
    clearing_house: Arc<ClearingHouse>,
    peer_id: ConnectionId,
    node_cancel: CancellationToken,
    conn_cancel: CancellationToken,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            _ = node_cancel.cancelled() => {
                stream.writer().send(&Notice::Done).await.ok();
                conn_cancel.cancel();
                return Ok(());
            }
            outgoing = outbound_rx.recv() => {
                let Some(notice) = outgoing else { return Ok(()) };
                stream.writer().send(&notice).await?;
            }
            incoming = stream.recv::<Notice>() => {
                match incoming? {
                    Notice::AddedFile(info) => archive.announce(info).await?,
                    Notice::AddedPiece(wire) => {
                        request_wanted(&archive, &clearing_house, &peer_id, &request_writer, [wire]).await?;
                    }
                    Notice::NoticesOfPieces(specs) => {
                        request_wanted(&archive, &clearing_house, &peer_id, &request_writer, specs).await?;
                    }
                    Notice::RemovedFiles(files) => {
                        for info in files {
                            archive.remove(&info.id).await?;
                        }
                    }
                    Notice::Done => {
                        debug!(peer = ?peer_id, "peer signalled done");
                        conn_cancel.cancel();
                        return Ok(());
                    }
                }
            }
        }
    }
}

/// Claims every spec in `wires` this peer's notice didn't already tell us
/// we have, subject to the clearing-house's single-issuer invariant, and
/// sends the whole claimed batch as a single `RequestOfPieces` (§4.2, §4.5(b),
/// §4.6) rather than one wire message per piece.
async fn request_wanted(
    archive: &Archive,
    clearing_house: &ClearingHouse,
    peer_id: &ConnectionId,
    request_writer: &Arc<StreamWriter>,
    wires: impl IntoIterator<Item = WirePieceSpec>,
) -> anyhow::Result<()> {
    let mut wanted = PieceSpecSet::empty();
    for wire in wires {
        let spec = wire.into_piece_spec()?;
        if archive.has(&spec).await {
            continue;
        }
        if !clearing_house.try_claim(peer_id.clone(), spec.clone()) {
            continue;
        }
        wanted = wanted.merge(PieceSpecSet::single(spec));
    }
    if wanted.is_empty() {
        return Ok(());
    }
    request_writer.send(&RequestOfPieces::from_set(&wanted)).await?;
    Ok(())
}

/// Owns the request stream: serves incoming requests by reading from the
/// archive and sending bytes on the data stream (§4.5(c)).
async fn request_loop(mut stream: Stream, data_writer: Arc<StreamWriter>, archive: Arc<Archive>) -> anyhow::Result<()> {
    loop {
        let request: RequestOfPieces = stream.recv().await?;
        for wire in request.specs {
            let spec = match wire.into_piece_spec() {
                Ok(spec) => spec,
                Err(err) => {
                    warn!(%err, "ignoring malformed requested piece spec");
                    continue;
                }
            };
            match archive.get(&spec).await? {
                Some(piece) => {
                    let wire_piece = WirePiece {
                        spec: WirePieceSpec::from(&piece.spec),
                        bytes: piece.bytes.to_vec(),
                    };
                    data_writer.send(&wire_piece).await?;
                }
                None => trace!(?spec, "ignoring request for a piece we do not have"),
            }
        }
    }
}

/// Owns the data stream: pieces arriving here were requested by us; each
/// is written through the archive and reported to the clearing-house
/// (§4.5(d)).
async fn data_loop(
    mut stream: Stream,
    archive: Arc<Archive>,
    clearing_house: Arc<ClearingHouse>,
    peer_id: ConnectionId,
) -> anyhow::Result<()> {
    loop {
        let wire: WirePiece = stream.recv().await?;
        let spec = wire.spec.into_piece_spec()?;
        let piece = Piece {
            spec: spec.clone(),
            bytes: bytes::Bytes::from(wire.bytes),
        };
        let outcome = archive.put(piece).await?;
        clearing_house.on_piece_stored(&peer_id, spec, outcome).await;
    }
}
