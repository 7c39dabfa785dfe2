use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use sruth_core::ServerAddress;

#[serde_as]
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct TrackerOptions {
    pub listen_addr: SocketAddr,
    pub reporting_address: ServerAddress,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:0".parse().unwrap(),
            reporting_address: ServerAddress::new("0.0.0.0", 0),
            request_timeout: Duration::from_secs(30),
        }
    }
}

#[serde_as]
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct TrackerProxyOptions {
    pub tracker_addr: SocketAddr,
    pub local_server: ServerAddress,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub request_timeout: Duration,
    /// Path to a distributed topology file to fall back to when the
    /// tracker itself cannot be reached (§4.7, §7 "Tracker unavailable").
    /// Typically a source node's published `FilterServerMap` under a
    /// shared archive admin subtree.
    pub distributed_topology_path: Option<PathBuf>,
}

impl TrackerProxyOptions {
    pub fn new(tracker_addr: SocketAddr, local_server: ServerAddress) -> Self {
        Self {
            tracker_addr,
            local_server,
            request_timeout: Duration::from_secs(30),
            distributed_topology_path: None,
        }
    }
}
