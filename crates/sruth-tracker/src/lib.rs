// The overlay's membership tracker: the authoritative Topology registry,
// its tagged-union request protocol, and the client-side caching proxy
// sink nodes use to avoid re-contacting it on every connection attempt.

pub mod message;
pub mod options;
pub mod proxy;
pub mod tracker;

pub use message::{TrackerResponse, TrackerTask};
pub use options::{TrackerOptions, TrackerProxyOptions};
pub use proxy::{publish_distributed_file, TrackerProxy};
pub use tracker::Tracker;
