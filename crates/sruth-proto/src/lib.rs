// Wire messages and the three-stream connection multiplexer for the sruth
// overlay. Framing is length-prefixed bincode; nothing here knows about
// archives, trackers, or peer state machines.

pub mod connection;
pub mod framing;
pub mod message;

pub use connection::{connect, Connection, ConnectionAcceptor, Stream, StreamRole, StreamWriter};
pub use framing::{read_frame, write_frame, FramingError, LENGTH_PREFIX_LEN, MAX_FRAME_LEN};
pub use message::{ConnectionId, Notice, NodeInfo, RequestOfPieces, WirePiece, WirePieceSpec};
