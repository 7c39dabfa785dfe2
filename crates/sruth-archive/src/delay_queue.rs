use std::path::Path;

use parking_lot::Mutex;
use sruth_core::ArchivePath;

use crate::heap::{HeapEntry, MinHeapFile};

/// Scheduled time-to-live deletions, persisted so a restart does not lose a
/// pending expiration (§3 "PathDelayQueue").
pub struct PathDelayQueue {
    heap: Mutex<MinHeapFile>,
}

impl PathDelayQueue {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        Ok(Self {
            heap: Mutex::new(MinHeapFile::open(path)?),
        })
    }

    pub fn schedule(&self, path: ArchivePath, deadline_millis: i64) -> anyhow::Result<()> {
        self.heap.lock().push(HeapEntry {
            deadline_millis,
            path,
        })
    }

    pub fn peek_deadline(&self) -> Option<i64> {
        self.heap.lock().peek().map(|e| e.deadline_millis)
    }

    /// Pops every entry whose deadline has elapsed as of `now_millis`.
    /// Callers must tolerate being handed a path that was already removed:
    /// a crash between a push's element write and its count bump can leave
    /// a duplicate entry at the tail (§9).
    pub fn pop_expired(&self, now_millis: i64) -> anyhow::Result<Vec<ArchivePath>> {
        let mut heap = self.heap.lock();
        let mut out = Vec::new();
        while heap.peek().is_some_and(|e| e.deadline_millis <= now_millis) {
            if let Some(entry) = heap.pop()? {
                out.push(entry.path);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_expired_only_takes_elapsed_entries() {
        let dir = tempfile::tempdir().unwrap();
        let queue = PathDelayQueue::open(&dir.path().join("deletion-queue")).unwrap();
        queue.schedule(ArchivePath::parse("a"), 100).unwrap();
        queue.schedule(ArchivePath::parse("b"), 200).unwrap();
        queue.schedule(ArchivePath::parse("c"), 300).unwrap();

        let due = queue.pop_expired(200).unwrap();
        assert_eq!(due, vec![ArchivePath::parse("a"), ArchivePath::parse("b")]);
        assert_eq!(queue.peek_deadline(), Some(300));
    }
}
