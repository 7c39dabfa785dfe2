use std::sync::Arc;

use anyhow::Context;
use sruth_archive::{Archive, PathDelayQueue};
use sruth_core::FileInfo;
use sruth_proto::NodeInfo;
use sruth_tracker::{publish_distributed_file, TrackerProxy};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::client_manager::ClientManager;
use crate::clearing_house::ClearingHouse;
use crate::object_lock::ObjectLock;
use crate::options::NodeOptions;
use crate::server::Server;
use crate::spawn_utils;

/// One participant in the overlay: an [`Archive`], the [`ClearingHouse`]
/// arbitrating its peers, an accept loop, and one [`ClientManager`] per
/// filter of its predicate (§2, L8). Unifies the spec's `SinkNode` and
/// publishing source node into a single configurable type: a node with an
/// empty predicate runs no client managers and only serves what it is
/// asked for, a node with `publish_topology_interval` set additionally
/// distributes the network topology it sees.
pub struct Node {
    options: NodeOptions,
    archive: Arc<Archive>,
    delay_queue: Arc<PathDelayQueue>,
    clearing_house: Arc<ClearingHouse>,
    tracker_proxy: Arc<TrackerProxy>,
    server: Server,
    local_node_info: NodeInfo,
}

impl Node {
    /// Opens the archive, binds the accept loop, and registers this node's
    /// predicate with the tracker. Returns the node plus the receiving end
    /// of completed-file data products (§4.6 "File-completion fan-out").
    pub async fn start(options: NodeOptions) -> anyhow::Result<(Self, mpsc::Receiver<FileInfo>)> {
        let (archive, products_rx) = Archive::open(options.archive.clone()).await?;
        let archive = Arc::new(archive);
        let indexed = archive.reindex().await.context("indexing pre-existing archive contents")?;
        info!(indexed, "reindexed pre-existing archive contents");

        let delay_queue = PathDelayQueue::open(&archive.admin_dir().join("deletion-queue"))?;
        let delay_queue = Arc::new(delay_queue);

        let server = Server::bind(options.server.listen_addr, options.peer.handshake_timeout).await?;
        let local_server = sruth_core::ServerAddress::from(server.local_addr()?);

        let clearing_house = Arc::new(ClearingHouse::new());

        let tracker_proxy = Arc::new(TrackerProxy::new(options.tracker.clone()));
        for filter in options.predicate.filters() {
            tracker_proxy
                .register(local_server.clone(), filter.clone())
                .await?;
        }

        let local_node_info = NodeInfo {
            server_address: local_server,
            predicate: options.predicate.clone(),
        };

        Ok((
            Self {
                options,
                archive,
                delay_queue,
                clearing_house,
                tracker_proxy,
                server,
                local_node_info,
            },
            products_rx,
        ))
    }

    pub fn local_node_info(&self) -> &NodeInfo {
        &self.local_node_info
    }

    /// Runs every owned task (sweeper, accept loop, client managers, and
    /// the topology distributor if configured) until `cancel` fires, then
    /// unregisters from the tracker.
    pub async fn run(self, cancel: CancellationToken) -> anyhow::Result<()> {
        let Node {
            options,
            archive,
            delay_queue,
            clearing_house,
            tracker_proxy,
            server,
            local_node_info,
        } = self;

        let sweeper_task = spawn_utils::spawn(tracing::info_span!("deletion_sweeper"), {
            let archive = archive.clone();
            let delay_queue = delay_queue.clone();
            let sweep_interval = options.archive.deletion_sweep_interval;
            let cancel = cancel.clone();
            async move {
                sruth_archive::sweeper::run(archive, delay_queue, sweep_interval, cancel).await;
                Ok(())
            }
        });

        let client_manager_tasks: Vec<_> = local_node_info
            .predicate
            .filters()
            .cloned()
            .map(|filter| {
                let manager = ClientManager::new(
                    options.client_manager.clone(),
                    tracker_proxy.clone(),
                    filter,
                    local_node_info.clone(),
                    options.peer.handshake_timeout,
                );
                let archive = archive.clone();
                let clearing_house = clearing_house.clone();
                let peer_options = options.peer.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move { manager.run(archive, clearing_house, peer_options, cancel).await })
            })
            .collect();

        let distributor_task = options.publish_topology_interval.map(|interval| {
            spawn_utils::spawn(
                tracing::info_span!("topology_distributor"),
                run_topology_distributor(
                    archive.clone(),
                    tracker_proxy.clone(),
                    local_node_info.server_address.clone(),
                    interval,
                    cancel.clone(),
                ),
            )
        });

        server
            .run(local_node_info.clone(), archive, clearing_house, options.peer, cancel)
            .await?;

        for task in client_manager_tasks {
            let _ = task.await;
        }
        if let Some(task) = distributor_task {
            let _ = task.await;
        }
        let _ = sweeper_task.await;

        if let Err(err) = tracker_proxy.unregister(local_node_info.server_address.clone()).await {
            warn!(%err, "failed to unregister from tracker on shutdown");
        }
        info!("node shut down");
        Ok(())
    }
}

/// Source-side half of §4.6 "Topology distribution": periodically fetches
/// the tracker's full network topology and hands it to an [`ObjectLock`],
/// whose consumer writes at most one coalesced snapshot per burst to the
/// archive's distributed topology file.
async fn run_topology_distributor(
    archive: Arc<Archive>,
    tracker_proxy: Arc<TrackerProxy>,
    local_server: sruth_core::ServerAddress,
    interval: std::time::Duration,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let lock: Arc<ObjectLock<sruth_core::Topology>> = Arc::new(ObjectLock::new());
    let path = archive
        .admin_dir()
        .join(local_server.admin_dirname())
        .join("FilterServerMap");

    let writer_cancel = cancel.clone();
    let writer_lock = lock.clone();
    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_cancel.cancelled() => return,
                topology = writer_lock.take() => {
                    if let Err(err) = publish_distributed_file(&path, &topology).await {
                        warn!(%err, "failed to publish distributed topology file");
                    }
                }
            }
        }
    });

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                match tracker_proxy.network(&local_server).await {
                    Ok(topology) => lock.put(topology),
                    Err(err) => warn!(%err, "failed to refresh network topology for distribution"),
                }
            }
        }
    }
    let _ = writer_task.await;
    Ok(())
}
