use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};

/// Configuration for one [`crate::Archive`] instance. CLI-friendly plain
/// data; an external entry point is expected to fill this in from flags or
/// a config file and hand it to [`crate::Archive::open`].
#[serde_as]
#[derive(Clone, Serialize, Deserialize, Debug)]
pub struct ArchiveOptions {
    pub root: PathBuf,
    pub default_piece_size: u32,
    #[serde_as(as = "DurationSeconds<u64>")]
    pub deletion_sweep_interval: Duration,
    pub completion_queue_capacity: usize,
}

impl Default for ArchiveOptions {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            default_piece_size: 256 * 1024,
            deletion_sweep_interval: Duration::from_secs(60),
            completion_queue_capacity: 256,
        }
    }
}
