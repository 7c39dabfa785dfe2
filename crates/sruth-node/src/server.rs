use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use sruth_archive::Archive;
use sruth_proto::{Connection, ConnectionAcceptor, NodeInfo};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::clearing_house::ClearingHouse;
use crate::options::PeerOptions;
use crate::spawn_utils;

/// Accept-loop lifecycle owner (§4, L8): wraps a [`ConnectionAcceptor`] and
/// spawns a [`crate::peer`] task for each assembled [`Connection`].
pub struct Server {
    acceptor: ConnectionAcceptor,
}

impl Server {
    pub async fn bind(listen_addr: SocketAddr, handshake_timeout: Duration) -> anyhow::Result<Self> {
        let acceptor = ConnectionAcceptor::bind(listen_addr, handshake_timeout).await?;
        Ok(Self { acceptor })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Runs until `cancel` fires.
    pub async fn run(
        self,
        local_node_info: NodeInfo,
        archive: Arc<Archive>,
        clearing_house: Arc<ClearingHouse>,
        peer_options: PeerOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        let Server { acceptor } = self;
        let (tx, mut rx) = mpsc::channel(16);
        let accept_cancel = cancel.clone();
        let accept_task = spawn_utils::spawn_with_cancel(
            tracing::info_span!("server_accept_loop"),
            accept_cancel.clone(),
            async move { acceptor.run(tx, accept_cancel).await },
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                connection = rx.recv() => {
                    let Some(connection) = connection else { break };
                    spawn_peer(
                        connection,
                        local_node_info.clone(),
                        archive.clone(),
                        clearing_house.clone(),
                        peer_options.clone(),
                        cancel.clone(),
                    );
                }
            }
        }
        let _ = accept_task.await;
        Ok(())
    }
}

fn spawn_peer(
    connection: Connection,
    local_node_info: NodeInfo,
    archive: Arc<Archive>,
    clearing_house: Arc<ClearingHouse>,
    peer_options: PeerOptions,
    cancel: CancellationToken,
) {
    let peer_addr = connection.peer_addr;
    tokio::spawn(async move {
        if let Err(err) =
            crate::peer::run(connection, local_node_info, archive, clearing_house, peer_options, cancel).await
        {
            warn!(%peer_addr, %err, "peer connection ended with error");
        }
    });
}
