// The on-disk archive of pieced files: the piece-completeness bitmap
// sidecar, the memory-mapped persistent deletion heap, and the Archive
// itself (announce/put/get/walk/remove).

pub mod archive;
pub mod bits_file;
pub mod delay_queue;
pub mod heap;
pub mod options;
pub mod sweeper;

pub use archive::{Archive, PutOutcome};
pub use delay_queue::PathDelayQueue;
pub use heap::{HeapEntry, MinHeapFile};
pub use options::ArchiveOptions;
