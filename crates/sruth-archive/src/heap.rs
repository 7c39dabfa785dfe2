use std::fs::OpenOptions;
use std::path::Path;

use anyhow::Context;
use memmap2::{MmapMut, MmapOptions};
use sruth_core::{ArchivePath, Error};

const HEADER_SIZE: usize = 12;
/// Fixed per-entry size: 8 bytes deadline + 2 bytes path length + up to 246
/// bytes of path text, zero-padded.
pub const ELEMENT_SIZE: usize = 256;
const MAX_PATH_BYTES: usize = ELEMENT_SIZE - 10;
const HEAP_VERSION: u32 = 1;
const MIN_CAPACITY: u32 = 16;
const GROWTH_FACTOR: f64 = 1.618_033_988_749_895;

fn file_len_for(capacity: u32) -> u64 {
    HEADER_SIZE as u64 + capacity as u64 * ELEMENT_SIZE as u64
}

/// One scheduled-deletion entry: an absolute millisecond deadline and the
/// archive path to remove when it elapses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HeapEntry {
    pub deadline_millis: i64,
    pub path: ArchivePath,
}

/// A persistent binary min-heap backed by a memory-mapped file (§9,
/// "Persistent min-heap"). A fixed 12-byte header `{version, elt_size,
/// elt_count}` is followed by `elt_count` fixed-size entries. The element
/// array is grown by a factor of φ when full; the file is `fsync`ed
/// immediately after any resize, since growth is the one mutation an mmap
/// flush alone cannot make durable (the old mapping may still be in use by
/// the OS page cache at a stale length).
pub struct MinHeapFile {
    file: std::fs::File,
    mmap: MmapMut,
    capacity: u32,
    count: u32,
}

impl MinHeapFile {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let existed = path.exists();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)
            .with_context(|| format!("opening heap file {}", path.display()))?;

        if !existed {
            file.set_len(file_len_for(MIN_CAPACITY))
                .context("sizing new heap file")?;
            let mut mmap =
                unsafe { MmapOptions::new().map_mut(&file) }.context("mapping new heap file")?;
            write_header(&mut mmap, HEAP_VERSION, ELEMENT_SIZE as u32, 0);
            mmap.flush().context("flushing new heap header")?;
            file.sync_all().context("fsyncing new heap file")?;
            return Ok(Self {
                file,
                mmap,
                capacity: MIN_CAPACITY,
                count: 0,
            });
        }

        let mmap =
            unsafe { MmapOptions::new().map_mut(&file) }.context("mapping existing heap file")?;
        let (version, elt_size, count) = read_header(&mmap);
        if version != HEAP_VERSION {
            return Err(Error::MalformedHeap(format!("unsupported deletion-queue version {version}")).into());
        }
        if elt_size as usize != ELEMENT_SIZE {
            return Err(Error::MalformedHeap(format!(
                "deletion-queue element size {elt_size} does not match {ELEMENT_SIZE}"
            ))
            .into());
        }
        let len = file.metadata().context("statting heap file")?.len();
        let capacity = ((len - HEADER_SIZE as u64) / ELEMENT_SIZE as u64) as u32;
        Ok(Self {
            file,
            mmap,
            capacity,
            count,
        })
    }

    pub fn len(&self) -> u32 {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn peek(&self) -> Option<HeapEntry> {
        (self.count > 0).then(|| self.read_entry(0))
    }

    pub fn push(&mut self, entry: HeapEntry) -> anyhow::Result<()> {
        let path_len = entry.path.to_string().len();
        if path_len > MAX_PATH_BYTES {
            return Err(Error::MalformedHeap(format!(
                "path too long for the deletion queue's fixed-size entries: {path_len} bytes (max {MAX_PATH_BYTES})"
            ))
            .into());
        }
        self.ensure_capacity(self.count + 1)?;
        let idx = self.count;
        self.write_entry(idx, &entry);
        self.mmap.flush().context("flushing new heap entry")?;
        self.count += 1;
        self.sift_up(idx);
        self.write_count().context("flushing updated heap count")?;
        Ok(())
    }

    /// Removes and returns the minimum-deadline entry, tolerating a crash
    /// between a prior push's element write and its count bump by simply
    /// never looking past `count` (§9).
    pub fn pop(&mut self) -> anyhow::Result<Option<HeapEntry>> {
        if self.count == 0 {
            return Ok(None);
        }
        let min = self.read_entry(0);
        let last = self.count - 1;
        if last > 0 {
            let moved = self.read_entry(last);
            self.write_entry(0, &moved);
        }
        self.count = last;
        self.write_count().context("flushing heap count after pop")?;
        if self.count > 0 {
            self.sift_down(0);
        }
        Ok(Some(min))
    }

    fn ensure_capacity(&mut self, needed: u32) -> anyhow::Result<()> {
        if needed <= self.capacity {
            return Ok(());
        }
        let grown = (self.capacity.max(1) as f64 * GROWTH_FACTOR).ceil() as u32;
        let new_capacity = grown.max(needed).max(MIN_CAPACITY);
        self.file
            .set_len(file_len_for(new_capacity))
            .context("growing heap file")?;
        self.mmap = unsafe { MmapOptions::new().map_mut(&self.file) }
            .context("remapping grown heap file")?;
        self.mmap.flush().context("flushing grown heap file")?;
        self.file.sync_all().context("fsyncing grown heap file")?;
        self.capacity = new_capacity;
        Ok(())
    }

    fn write_count(&mut self) -> anyhow::Result<()> {
        write_header(&mut self.mmap, HEAP_VERSION, ELEMENT_SIZE as u32, self.count);
        self.mmap.flush().context("flushing heap count")
    }

    fn entry_offset(index: u32) -> usize {
        HEADER_SIZE + index as usize * ELEMENT_SIZE
    }

    fn read_entry(&self, index: u32) -> HeapEntry {
        let off = Self::entry_offset(index);
        let raw = &self.mmap[off..off + ELEMENT_SIZE];
        let deadline_millis = i64::from_be_bytes(raw[0..8].try_into().unwrap());
        let path_len = u16::from_be_bytes(raw[8..10].try_into().unwrap()) as usize;
        let path_str = std::str::from_utf8(&raw[10..10 + path_len]).unwrap_or_default();
        HeapEntry {
            deadline_millis,
            path: ArchivePath::parse(path_str),
        }
    }

    fn write_entry(&mut self, index: u32, entry: &HeapEntry) {
        let off = Self::entry_offset(index);
        let raw = &mut self.mmap[off..off + ELEMENT_SIZE];
        raw.fill(0);
        raw[0..8].copy_from_slice(&entry.deadline_millis.to_be_bytes());
        let path_text = entry.path.to_string();
        let path_bytes = path_text.as_bytes();
        raw[8..10].copy_from_slice(&(path_bytes.len() as u16).to_be_bytes());
        raw[10..10 + path_bytes.len()].copy_from_slice(path_bytes);
    }

    fn sift_up(&mut self, mut idx: u32) {
        while idx > 0 {
            let parent = (idx - 1) / 2;
            if self.read_entry(parent).deadline_millis <= self.read_entry(idx).deadline_millis {
                break;
            }
            self.swap(parent, idx);
            idx = parent;
        }
    }

    fn sift_down(&mut self, mut idx: u32) {
        loop {
            let left = idx * 2 + 1;
            let right = idx * 2 + 2;
            let mut smallest = idx;
            if left < self.count
                && self.read_entry(left).deadline_millis < self.read_entry(smallest).deadline_millis
            {
                smallest = left;
            }
            if right < self.count
                && self.read_entry(right).deadline_millis < self.read_entry(smallest).deadline_millis
            {
                smallest = right;
            }
            if smallest == idx {
                break;
            }
            self.swap(idx, smallest);
            idx = smallest;
        }
    }

    fn swap(&mut self, a: u32, b: u32) {
        let ea = self.read_entry(a);
        let eb = self.read_entry(b);
        self.write_entry(a, &eb);
        self.write_entry(b, &ea);
    }
}

fn write_header(mmap: &mut MmapMut, version: u32, elt_size: u32, count: u32) {
    mmap[0..4].copy_from_slice(&version.to_be_bytes());
    mmap[4..8].copy_from_slice(&elt_size.to_be_bytes());
    mmap[8..12].copy_from_slice(&count.to_be_bytes());
}

fn read_header(mmap: &MmapMut) -> (u32, u32, u32) {
    (
        u32::from_be_bytes(mmap[0..4].try_into().unwrap()),
        u32::from_be_bytes(mmap[4..8].try_into().unwrap()),
        u32::from_be_bytes(mmap[8..12].try_into().unwrap()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(deadline: i64) -> HeapEntry {
        HeapEntry {
            deadline_millis: deadline,
            path: ArchivePath::parse(&format!("deadline-{deadline}")),
        }
    }

    #[test]
    fn pops_in_ascending_deadline_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deletion-queue");
        let mut heap = MinHeapFile::open(&path).unwrap();
        heap.push(entry(300)).unwrap();
        heap.push(entry(100)).unwrap();
        heap.push(entry(200)).unwrap();
        drop(heap);

        let mut heap = MinHeapFile::open(&path).unwrap();
        assert_eq!(heap.peek().unwrap().deadline_millis, 100);
        assert_eq!(heap.pop().unwrap().unwrap().deadline_millis, 100);
        assert_eq!(heap.pop().unwrap().unwrap().deadline_millis, 200);
        assert_eq!(heap.pop().unwrap().unwrap().deadline_millis, 300);
        assert!(heap.pop().unwrap().is_none());
    }

    #[test]
    fn grows_past_initial_capacity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deletion-queue");
        let mut heap = MinHeapFile::open(&path).unwrap();
        for i in 0..100 {
            heap.push(entry(i)).unwrap();
        }
        assert_eq!(heap.len(), 100);
        for i in 0..100 {
            assert_eq!(heap.pop().unwrap().unwrap().deadline_millis, i);
        }
    }

    #[test]
    fn rejects_a_header_with_the_wrong_version() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deletion-queue");
        drop(MinHeapFile::open(&path).unwrap());
        {
            let file = OpenOptions::new().write(true).open(&path).unwrap();
            let mut mmap = unsafe { MmapOptions::new().map_mut(&file) }.unwrap();
            write_header(&mut mmap, HEAP_VERSION + 1, ELEMENT_SIZE as u32, 0);
            mmap.flush().unwrap();
        }
        let err = MinHeapFile::open(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MalformedHeap(_))
        ));
    }

    #[test]
    fn rejects_a_path_too_long_for_a_fixed_size_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("deletion-queue");
        let mut heap = MinHeapFile::open(&path).unwrap();
        let long_path = ArchivePath::parse(&"x".repeat(MAX_PATH_BYTES + 1));
        let err = heap
            .push(HeapEntry {
                deadline_millis: 0,
                path: long_path,
            })
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<Error>(),
            Some(Error::MalformedHeap(_))
        ));
    }
}
