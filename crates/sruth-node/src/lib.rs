// Node-level lifecycle owners for the sruth overlay: the peer state
// machine, the clearing-house arbitrating peers against the archive, the
// accept loop and outbound-connection manager, and the `Node` type tying
// them together (§2 L7-L8).

pub mod clearing_house;
pub mod client_manager;
pub mod node;
pub mod object_lock;
pub mod options;
pub mod peer;
pub mod server;
pub mod spawn_utils;

pub use clearing_house::ClearingHouse;
pub use client_manager::ClientManager;
pub use node::Node;
pub use object_lock::ObjectLock;
pub use options::{ClientManagerOptions, NodeOptions, PeerOptions, ServerOptions};
pub use server::Server;
