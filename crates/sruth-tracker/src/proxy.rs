use std::path::Path;

use anyhow::Context;
use parking_lot::RwLock;
use sruth_core::{Filter, ServerAddress, Topology};
use sruth_proto::{read_frame, write_frame};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use crate::message::{TrackerResponse, TrackerTask};
use crate::options::TrackerProxyOptions;

/// A client-side cache in front of the [`crate::Tracker`] (§4.7). Returns
/// the last known topology without a network round-trip; refreshes only on
/// explicit request (invalidation, or a newer distributed topology file
/// observed in the archive's admin subtree).
pub struct TrackerProxy {
    options: TrackerProxyOptions,
    cached: RwLock<Option<Topology>>,
}

impl TrackerProxy {
    pub fn new(options: TrackerProxyOptions) -> Self {
        Self {
            options,
            cached: RwLock::new(None),
        }
    }

    pub fn cached(&self) -> Option<Topology> {
        self.cached.read().clone()
    }

    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    /// Returns the cached topology if present, else contacts the tracker,
    /// falling back to the distributed topology file (if configured) when
    /// the tracker cannot be reached (§4.7, §7 "Tracker unavailable").
    pub async fn topology(&self, filter: &Filter) -> anyhow::Result<Topology> {
        if let Some(topology) = self.cached() {
            return Ok(topology);
        }
        match self.refresh(filter).await {
            Ok(topology) => Ok(topology),
            Err(err) => {
                let Some(path) = &self.options.distributed_topology_path else {
                    return Err(err);
                };
                warn!(%err, path = %path.display(), "tracker unreachable, falling back to distributed topology file");
                self.refresh_from_distributed_file(path).await
            }
        }
    }

    /// Unconditionally re-contacts the tracker for `filter` and replaces the
    /// cache with the result.
    pub async fn refresh(&self, filter: &Filter) -> anyhow::Result<Topology> {
        let task = TrackerTask::TopologyGetter {
            filter: filter.clone(),
            local_server: self.options.local_server.clone(),
        };
        let response = self.send(task).await?;
        match response {
            TrackerResponse::Topology { topology, .. } => {
                *self.cached.write() = Some(topology.clone());
                Ok(topology)
            }
            TrackerResponse::Ack => anyhow::bail!("tracker returned Ack for a topology request"),
        }
    }

    /// Asks the tracker for the whole registered topology, bypassing the
    /// per-filter cache entirely. Used by source-side publishers feeding
    /// the distributed topology file (§4.6 "Topology distribution").
    pub async fn network(&self, local_server: &ServerAddress) -> anyhow::Result<Topology> {
        let task = TrackerTask::NetworkGetter {
            filter: Filter::everything(),
            local_server: local_server.clone(),
        };
        match self.send(task).await? {
            TrackerResponse::Topology { topology, .. } => Ok(topology),
            TrackerResponse::Ack => anyhow::bail!("tracker returned Ack for a network request"),
        }
    }

    /// Falls back to a distributed topology file (`<host>:<port>/FilterServerMap`
    /// under the archive's admin subtree, §6) when the tracker itself is
    /// unreachable.
    pub async fn refresh_from_distributed_file(&self, path: &Path) -> anyhow::Result<Topology> {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading distributed topology file {}", path.display()))?;
        let (topology, _): (Topology, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .context("decoding distributed topology file")?;
        *self.cached.write() = Some(topology.clone());
        Ok(topology)
    }

    pub async fn register(&self, server: ServerAddress, filter: Filter) -> anyhow::Result<()> {
        self.expect_ack(TrackerTask::Register { server, filter }).await
    }

    pub async fn unregister(&self, server: ServerAddress) -> anyhow::Result<()> {
        self.expect_ack(TrackerTask::Unregister { server }).await
    }

    async fn expect_ack(&self, task: TrackerTask) -> anyhow::Result<()> {
        match self.send(task).await? {
            TrackerResponse::Ack => Ok(()),
            TrackerResponse::Topology { .. } => {
                anyhow::bail!("tracker returned a topology for a registration request")
            }
        }
    }

    async fn send(&self, task: TrackerTask) -> anyhow::Result<TrackerResponse> {
        let timeout = self.options.request_timeout;
        let mut socket = tokio::time::timeout(timeout, TcpStream::connect(self.options.tracker_addr))
            .await
            .context("timed out connecting to tracker")??;
        tokio::time::timeout(timeout, write_frame(&mut socket, &task))
            .await
            .context("timed out sending tracker task")??;
        let response = tokio::time::timeout(timeout, read_frame(&mut socket))
            .await
            .context("timed out reading tracker response")??;
        debug!(?response, "received tracker response");
        Ok(response)
    }
}

/// Writes the current topology to the distributed topology file so sink
/// nodes can pick it up without contacting the tracker (§4.6, "Topology
/// distribution").
pub async fn publish_distributed_file(path: &Path, topology: &Topology) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let bytes = bincode::serde::encode_to_vec(topology, bincode::config::standard())
        .context("encoding distributed topology file")?;
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_then_refresh_from_file_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin/127.0.0.1:9000/FilterServerMap");
        let mut topology = Topology::new();
        topology.register(ServerAddress::new("10.0.0.1", 9000), Filter::parse("a"));
        publish_distributed_file(&path, &topology).await.unwrap();

        let proxy = TrackerProxy::new(TrackerProxyOptions::new(
            "127.0.0.1:1".parse().unwrap(),
            ServerAddress::new("127.0.0.1", 2),
        ));
        let loaded = proxy.refresh_from_distributed_file(&path).await.unwrap();
        assert_eq!(loaded, topology);
        assert_eq!(proxy.cached(), Some(topology));
    }

    #[tokio::test]
    async fn topology_falls_back_to_distributed_file_when_tracker_unreachable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admin/127.0.0.1:9000/FilterServerMap");
        let mut topology = Topology::new();
        topology.register(ServerAddress::new("10.0.0.1", 9000), Filter::parse("a"));
        publish_distributed_file(&path, &topology).await.unwrap();

        let mut options = TrackerProxyOptions::new("127.0.0.1:1".parse().unwrap(), ServerAddress::new("127.0.0.1", 2));
        options.distributed_topology_path = Some(path);
        let proxy = TrackerProxy::new(options);

        let loaded = proxy.topology(&Filter::parse("a")).await.unwrap();
        assert_eq!(loaded, topology);
    }

    #[tokio::test]
    async fn topology_without_fallback_propagates_the_tracker_error() {
        let proxy = TrackerProxy::new(TrackerProxyOptions::new(
            "127.0.0.1:1".parse().unwrap(),
            ServerAddress::new("127.0.0.1", 2),
        ));
        assert!(proxy.topology(&Filter::parse("a")).await.is_err());
    }
}
