use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use sruth_archive::ArchiveOptions;
use sruth_core::Predicate;
use sruth_tracker::TrackerProxyOptions;

/// Per-peer knobs: handshake timeout and the bound on each peer's outbound
/// notice queue (§5 back-pressure).
#[serde_as]
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct PeerOptions {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub handshake_timeout: Duration,
    pub notice_queue_capacity: usize,
}

impl Default for PeerOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(30),
            notice_queue_capacity: 256,
        }
    }
}

/// Outbound-connection retry policy for [`crate::client_manager::ClientManager`]
/// (§5: exponential backoff between `min_backoff` and `max_backoff`).
#[serde_as]
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ClientManagerOptions {
    #[serde_as(as = "DurationSeconds<u64>")]
    pub min_backoff: Duration,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub max_backoff: Duration,
}

impl Default for ClientManagerOptions {
    fn default() -> Self {
        Self {
            min_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(60),
        }
    }
}

/// Accept-loop knobs for [`crate::server::Server`].
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ServerOptions {
    pub listen_addr: std::net::SocketAddr,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".parse().unwrap(),
        }
    }
}

/// Top-level configuration for one [`crate::node::Node`]: the union of
/// every component option struct plus the node's own data interest. A node
/// with a non-[`Predicate::nothing`] predicate runs one
/// [`crate::client_manager::ClientManager`] per filter of the predicate
/// (§4, L8); `publish_topology_interval`, when set, additionally runs the
/// source-side topology distributor (§4.6, §9 "Object-lock").
#[serde_as]
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct NodeOptions {
    pub archive: ArchiveOptions,
    pub server: ServerOptions,
    pub peer: PeerOptions,
    pub client_manager: ClientManagerOptions,
    pub tracker: TrackerProxyOptions,
    pub predicate: Predicate,
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub publish_topology_interval: Option<Duration>,
}

impl NodeOptions {
    pub fn new(archive: ArchiveOptions, tracker: TrackerProxyOptions, predicate: Predicate) -> Self {
        Self {
            archive,
            server: ServerOptions::default(),
            peer: PeerOptions::default(),
            client_manager: ClientManagerOptions::default(),
            tracker,
            predicate,
            publish_topology_interval: None,
        }
    }
}
