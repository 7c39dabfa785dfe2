use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use backon::{ExponentialBuilder, Retryable};
use sruth_archive::Archive;
use sruth_core::Filter;
use sruth_proto::{ConnectionId, NodeInfo};
use sruth_tracker::TrackerProxy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clearing_house::ClearingHouse;
use crate::options::{ClientManagerOptions, PeerOptions};

/// Outbound-connection lifecycle owner (§4, L8): repeatedly picks the best
/// server for `filter` (via the cached [`TrackerProxy`] topology) and runs
/// the peer protocol against it, retrying with exponential backoff between
/// `min_backoff` and `max_backoff` whenever an attempt fails (§5).
pub struct ClientManager {
    options: ClientManagerOptions,
    tracker_proxy: Arc<TrackerProxy>,
    filter: Filter,
    local_node_info: NodeInfo,
    handshake_timeout: Duration,
}

impl ClientManager {
    pub fn new(
        options: ClientManagerOptions,
        tracker_proxy: Arc<TrackerProxy>,
        filter: Filter,
        local_node_info: NodeInfo,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            options,
            tracker_proxy,
            filter,
            local_node_info,
            handshake_timeout,
        }
    }

    pub async fn run(
        self,
        archive: Arc<Archive>,
        clearing_house: Arc<ClearingHouse>,
        peer_options: PeerOptions,
        cancel: CancellationToken,
    ) -> anyhow::Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            let backoff = ExponentialBuilder::new()
                .without_max_times()
                .with_jitter()
                .with_factor(2.)
                .with_min_delay(self.options.min_backoff)
                .with_max_delay(self.options.max_backoff);

            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                r = (|| self.connect_once(&archive, &clearing_house, &peer_options, &cancel))
                    .retry(backoff)
                    .notify(|err, retry_in| {
                        warn!(%err, ?retry_in, filter = ?self.filter, "outbound connection attempt failed, retrying");
                    }) => r,
            };
            match attempt {
                Ok(()) => debug!(filter = ?self.filter, "peer session ended, reconnecting"),
                Err(err) => warn!(%err, filter = ?self.filter, "giving up on this connection attempt"),
            }
        }
    }

    /// One attempt: looks up the best server for `filter`, dials it, and
    /// runs the peer protocol until the session ends. Invalidates the
    /// cached topology on any failure so the next attempt (whether this
    /// retry or the next outer reconnect) re-contacts the tracker, or falls
    /// back to the distributed topology file, instead of repeating the same
    /// stale lookup (§4.7, §7 "Tracker unavailable").
    async fn connect_once(
        &self,
        archive: &Arc<Archive>,
        clearing_house: &Arc<ClearingHouse>,
        peer_options: &PeerOptions,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        let topology = match self.tracker_proxy.topology(&self.filter).await {
            Ok(topology) => topology,
            Err(err) => {
                self.tracker_proxy.invalidate();
                return Err(err);
            }
        };
        let server = match topology.get_best_server(&self.filter) {
            Some(server) => server,
            None => {
                self.tracker_proxy.invalidate();
                return Err(anyhow::anyhow!("no server currently satisfies this filter"));
            }
        };
        let remote = server.to_socket_addr()?;
        let id = ConnectionId::new(self.local_node_info.server_address.clone());
        let connection = match sruth_proto::connect(id, remote, self.handshake_timeout).await {
            Ok(connection) => connection,
            Err(err) => {
                self.tracker_proxy.invalidate();
                return Err(err).context("connecting to chosen server");
            }
        };
        crate::peer::run(
            connection,
            self.local_node_info.clone(),
            archive.clone(),
            clearing_house.clone(),
            peer_options.clone(),
            cancel.clone(),
        )
        .await
    }
}
