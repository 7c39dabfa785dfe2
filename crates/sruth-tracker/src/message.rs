use serde::{Deserialize, Serialize};
use sruth_core::{Filter, ServerAddress, Topology};

/// The tagged union of short-lived tracker requests (§4.7, §6).
///
/// `TopologyGetter` answers with the sub-topology whose servers can satisfy
/// `filter`; `NetworkGetter` answers with the tracker's entire registered
/// topology regardless of `filter`, for callers that want to see the whole
/// overlay rather than just their own slice of it. Both carry `local_server`
/// so the tracker can log who is asking; it does not otherwise affect the
/// response.
#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum TrackerTask {
    TopologyGetter {
        filter: Filter,
        local_server: ServerAddress,
    },
    NetworkGetter {
        filter: Filter,
        local_server: ServerAddress,
    },
    Register {
        server: ServerAddress,
        filter: Filter,
    },
    Unregister {
        server: ServerAddress,
    },
}

#[derive(Clone, Serialize, Deserialize, Debug, PartialEq)]
pub enum TrackerResponse {
    Topology {
        topology: Topology,
        reporting_address: ServerAddress,
    },
    Ack,
}
