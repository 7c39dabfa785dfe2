use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use anyhow::Context;
use dashmap::DashMap;
use sruth_core::{ArchivePath, ArchiveTime, FileId, FileInfo, Filter, FiniteBitSet, Piece, PieceSpec};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::{instrument, warn};
use walkdir::WalkDir;

use crate::bits_file;
use crate::options::ArchiveOptions;

/// Outcome of [`Archive::put`] (§4.1).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The bit for this piece was already set; the bytes were not rewritten.
    Duplicate,
    Stored,
    /// This put supplied the file's last missing piece; the completion
    /// event for it has just been emitted.
    Completed,
}

struct FileState {
    info: FileInfo,
    bits: FiniteBitSet,
}

/// The local tree of archived files plus their piece-completeness bitmaps.
/// Holds one `tokio::sync::Mutex` per known file so concurrent `put`s of
/// different pieces of the same file serialise (write bytes, then set bit,
/// atomically per piece) while `get`s of distinct files, or distinct
/// already-complete pieces, proceed independently (§5).
pub struct Archive {
    options: ArchiveOptions,
    root: PathBuf,
    admin_dir: PathBuf,
    files: DashMap<FileId, Arc<AsyncMutex<FileState>>>,
    completions: mpsc::Sender<FileInfo>,
}

impl Archive {
    pub async fn open(options: ArchiveOptions) -> anyhow::Result<(Self, mpsc::Receiver<FileInfo>)> {
        let root = options.root.clone();
        tokio::fs::create_dir_all(&root)
            .await
            .context("creating archive root")?;
        let admin_dir = root.join("admin");
        tokio::fs::create_dir_all(&admin_dir)
            .await
            .context("creating admin subtree")?;
        let (tx, rx) = mpsc::channel(options.completion_queue_capacity);
        Ok((
            Self {
                options,
                root,
                admin_dir,
                files: DashMap::new(),
                completions: tx,
            },
            rx,
        ))
    }

    pub fn root(&self) -> &std::path::Path {
        &self.root
    }

    pub fn admin_dir(&self) -> &std::path::Path {
        &self.admin_dir
    }

    pub fn options(&self) -> &ArchiveOptions {
        &self.options
    }

    fn path_on_disk(&self, file_id: &FileId) -> PathBuf {
        self.root.join(file_id.path.to_relative_path())
    }

    /// Registers a file we have learned about (typically from a peer's
    /// `AddedFileNotice`). A sidecar `.bits` file left by a previous process
    /// on the same path is reused rather than truncated, so a restart never
    /// loses partially-received bytes.
    #[instrument(skip(self, info), fields(path = %info.id.path))]
    pub async fn announce(&self, info: FileInfo) -> anyhow::Result<()> {
        if info.id.path.is_admin() {
            return Err(sruth_core::Error::AdminPathForbidden(info.id.path.clone()).into());
        }
        if let Some(existing) = self.files.get(&info.id) {
            let state = existing.lock().await;
            state.info.check_consistent_with(&info)?;
            return Ok(());
        }

        let on_disk = self.path_on_disk(&info.id);
        let bits_path = bits_file::bits_path(&self.root, &info.id.path);
        let piece_count = info.piece_count();
        let bits = match bits_file::load(&bits_path).await? {
            Some(existing_bits) if existing_bits.len() == piece_count => existing_bits,
            _ => {
                if let Some(parent) = on_disk.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
                let file = tokio::fs::File::create(&on_disk)
                    .await
                    .with_context(|| format!("creating {}", on_disk.display()))?;
                file.set_len(info.size)
                    .await
                    .with_context(|| format!("sizing {}", on_disk.display()))?;
                FiniteBitSet::empty(piece_count)
            }
        };
        self.files
            .insert(info.id.clone(), Arc::new(AsyncMutex::new(FileState { info, bits })));
        Ok(())
    }

    /// Walks `root` for files already sitting on disk that this process
    /// never `announce`d — content dropped in before the node started, or
    /// left complete by an entirely separate writer (§4.1 "indexer"). A
    /// file already known is left alone; anything newly found is indexed
    /// as fully complete, since a file left partially written by a prior
    /// `sruth` process would already carry the `.bits` sidecar that
    /// `announce` restores instead. Returns the number of files indexed.
    #[instrument(skip(self))]
    pub async fn reindex(&self) -> anyhow::Result<usize> {
        let root = self.root.clone();
        let admin_dir = self.admin_dir.clone();
        let found = tokio::task::spawn_blocking(move || -> anyhow::Result<Vec<(PathBuf, u64, SystemTime)>> {
            let mut out = Vec::new();
            for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let path = entry.path();
                if path.starts_with(&admin_dir) {
                    continue;
                }
                if path.extension().is_some_and(|ext| ext == "bits") {
                    continue;
                }
                let metadata = entry.metadata().with_context(|| format!("stat {}", path.display()))?;
                out.push((path.to_path_buf(), metadata.len(), metadata.modified()?));
            }
            Ok(out)
        })
        .await
        .context("reindex task panicked")??;

        let mut indexed = 0;
        for (path, size, mtime) in found {
            let relative = path
                .strip_prefix(&self.root)
                .expect("walked path is under archive root");
            let archive_path = ArchivePath::new(
                relative
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned()),
            );
            let id = FileId::new(archive_path, ArchiveTime::from_system_time(mtime));
            if self.files.contains_key(&id) {
                continue;
            }
            let info = FileInfo::new(id.clone(), size, self.options.default_piece_size);
            let bits = FiniteBitSet::complete(info.piece_count());
            let bits_path = bits_file::bits_path(&self.root, &id.path);
            bits_file::remove(&bits_path).await?;
            self.files.insert(id, Arc::new(AsyncMutex::new(FileState { info, bits })));
            indexed += 1;
        }
        Ok(indexed)
    }

    /// Writes a piece's bytes and marks it present. Emits a completion
    /// event the instant the write that fills the last missing bit lands
    /// (§4.1, "exactly once").
    #[instrument(skip(self, piece), fields(path = %piece.spec.file.id.path, index = piece.spec.index))]
    pub async fn put(&self, piece: Piece) -> anyhow::Result<PutOutcome> {
        let Piece { spec, bytes } = piece;
        let expected_len = spec.len();
        if bytes.len() as u32 != expected_len {
            return Err(sruth_core::Error::PieceLengthMismatch {
                id: spec.file.id.clone(),
                index: spec.index,
                declared: bytes.len() as u32,
                expected: expected_len,
            }
            .into());
        }

        let entry = self
            .files
            .get(&spec.file.id)
            .map(|e| e.value().clone())
            .ok_or_else(|| sruth_core::Error::UnknownFile(spec.file.id.path.clone()))?;
        let mut state = entry.lock().await;
        if state.bits.is_set(spec.index) {
            return Ok(PutOutcome::Duplicate);
        }

        let on_disk = self.path_on_disk(&spec.file.id);
        {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&on_disk)
                .await
                .with_context(|| format!("opening {} for write", on_disk.display()))?;
            file.seek(std::io::SeekFrom::Start(spec.offset())).await?;
            file.write_all(&bytes).await?;
            file.sync_data().await.context("fsyncing piece bytes")?;
        }
        state.bits.set_bit(spec.index);

        let bits_path = bits_file::bits_path(&self.root, &spec.file.id.path);
        if state.bits.is_complete() {
            bits_file::remove(&bits_path).await?;
            set_mtime(on_disk, state.info.id.timestamp.to_system_time()).await?;
            let info = state.info.clone();
            drop(state);
            if self.completions.send(info).await.is_err() {
                warn!("completion event dropped: no receiver listening");
            }
            return Ok(PutOutcome::Completed);
        }
        bits_file::save(&bits_path, &state.bits).await?;
        Ok(PutOutcome::Stored)
    }

    /// True if the piece is present, without reading its bytes.
    pub async fn has(&self, spec: &PieceSpec) -> bool {
        let Some(entry) = self.files.get(&spec.file.id).map(|e| e.value().clone()) else {
            return false;
        };
        let state = entry.lock().await;
        state.bits.is_set(spec.index)
    }

    /// Reads a piece's bytes, or `None` if we do not yet have it.
    pub async fn get(&self, spec: &PieceSpec) -> anyhow::Result<Option<Piece>> {
        let Some(entry) = self.files.get(&spec.file.id).map(|e| e.value().clone()) else {
            return Ok(None);
        };
        let on_disk = {
            let state = entry.lock().await;
            if !state.bits.is_set(spec.index) {
                return Ok(None);
            }
            self.path_on_disk(&spec.file.id)
        };
        let mut file = tokio::fs::File::open(&on_disk)
            .await
            .with_context(|| format!("opening {} for read", on_disk.display()))?;
        file.seek(std::io::SeekFrom::Start(spec.offset())).await?;
        let mut buf = vec![0u8; spec.len() as usize];
        file.read_exact(&mut buf).await?;
        Ok(Some(Piece {
            spec: spec.clone(),
            bytes: bytes::Bytes::from(buf),
        }))
    }

    /// A snapshot of every known, non-admin file matching `filter`, along
    /// with its completeness bitmap. Calling `walk` again yields a fresh
    /// snapshot; nothing here streams incrementally.
    pub async fn walk(&self, filter: &Filter) -> Vec<(FileInfo, FiniteBitSet)> {
        let matching: Vec<Arc<AsyncMutex<FileState>>> = self
            .files
            .iter()
            .filter(|e| !e.key().path.is_admin() && filter.matches(&e.key().path))
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::with_capacity(matching.len());
        for entry in matching {
            let state = entry.lock().await;
            out.push((state.info.clone(), state.bits.clone()));
        }
        out
    }

    /// Like [`Archive::walk`], but matching any filter of a [`sruth_core::Predicate`]
    /// rather than a single [`Filter`].
    pub async fn walk_predicate(&self, predicate: &sruth_core::Predicate) -> Vec<(FileInfo, FiniteBitSet)> {
        let matching: Vec<Arc<AsyncMutex<FileState>>> = self
            .files
            .iter()
            .filter(|e| !e.key().path.is_admin() && predicate.matches(&e.key().path))
            .map(|e| e.value().clone())
            .collect();
        let mut out = Vec::with_capacity(matching.len());
        for entry in matching {
            let state = entry.lock().await;
            out.push((state.info.clone(), state.bits.clone()));
        }
        out
    }

    /// Unconditionally removes a file, its bitmap sidecar, and its entry
    /// from the index.
    pub async fn remove(&self, id: &FileId) -> anyhow::Result<()> {
        self.files.remove(id);
        let bits_path = bits_file::bits_path(&self.root, &id.path);
        bits_file::remove(&bits_path).await?;
        let on_disk = self.path_on_disk(id);
        match tokio::fs::remove_file(&on_disk).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", on_disk.display())),
        }
    }

    /// Removes by path alone, as driven by the [`crate::PathDelayQueue`]
    /// sweeper, which only ever records an `ArchivePath`. A no-op if
    /// nothing at `path` is known or on disk (§9: deletion replay must
    /// tolerate an already-absent path).
    pub async fn remove_path(&self, path: &ArchivePath) -> anyhow::Result<()> {
        let id = self
            .files
            .iter()
            .find(|e| &e.key().path == path)
            .map(|e| e.key().clone());
        if let Some(id) = id {
            return self.remove(&id).await;
        }
        let bits_path = bits_file::bits_path(&self.root, path);
        bits_file::remove(&bits_path).await?;
        let on_disk = self.root.join(path.to_relative_path());
        match tokio::fs::remove_file(&on_disk).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("removing {}", on_disk.display())),
        }
    }
}

async fn set_mtime(path: PathBuf, mtime: SystemTime) -> anyhow::Result<()> {
    tokio::task::spawn_blocking(move || {
        let file = std::fs::OpenOptions::new().write(true).open(&path)?;
        file.set_modified(mtime)
    })
    .await
    .context("mtime-setting task panicked")?
    .context("setting archived file mtime")
}

#[cfg(test)]
mod tests {
    use super::*;
    use sruth_core::{ArchivePath, ArchiveTime};

    fn options(root: PathBuf) -> ArchiveOptions {
        ArchiveOptions {
            root,
            ..ArchiveOptions::default()
        }
    }

    fn file_info(path: &str, size: u64, piece_size: u32) -> FileInfo {
        FileInfo::new(
            FileId::new(ArchivePath::parse(path), ArchiveTime::from_millis(0)),
            size,
            piece_size,
        )
    }

    #[tokio::test]
    async fn announce_then_put_completes_and_reads_back() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, mut completions) = Archive::open(options(dir.path().to_path_buf())).await.unwrap();
        let info = file_info("a/b.dat", 8, 4);
        archive.announce(info.clone()).await.unwrap();

        let spec0 = PieceSpec::new(Arc::new(info.clone()), 0).unwrap();
        let spec1 = PieceSpec::new(Arc::new(info.clone()), 1).unwrap();

        let outcome = archive
            .put(Piece {
                spec: spec0.clone(),
                bytes: bytes::Bytes::from_static(b"abcd"),
            })
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Stored);

        let outcome = archive
            .put(Piece {
                spec: spec1.clone(),
                bytes: bytes::Bytes::from_static(b"efgh"),
            })
            .await
            .unwrap();
        assert_eq!(outcome, PutOutcome::Completed);
        let completed = completions.recv().await.unwrap();
        assert_eq!(completed.id, info.id);

        let piece = archive.get(&spec0).await.unwrap().unwrap();
        assert_eq!(&piece.bytes[..], b"abcd");
    }

    #[tokio::test]
    async fn duplicate_put_is_reported_and_does_not_reemit_completion() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, mut completions) = Archive::open(options(dir.path().to_path_buf())).await.unwrap();
        let info = file_info("solo.dat", 4, 4);
        archive.announce(info.clone()).await.unwrap();
        let spec = PieceSpec::new(Arc::new(info), 0).unwrap();

        let piece = Piece {
            spec: spec.clone(),
            bytes: bytes::Bytes::from_static(b"wxyz"),
        };
        assert_eq!(archive.put(piece.clone()).await.unwrap(), PutOutcome::Completed);
        completions.recv().await.unwrap();
        assert_eq!(archive.put(piece).await.unwrap(), PutOutcome::Duplicate);
        assert!(completions.try_recv().is_err());
    }

    #[tokio::test]
    async fn put_for_an_unannounced_file_is_unknown_file() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, _completions) = Archive::open(options(dir.path().to_path_buf())).await.unwrap();
        let info = file_info("never-announced.dat", 4, 4);
        let spec = PieceSpec::new(Arc::new(info), 0).unwrap();
        let err = archive
            .put(Piece {
                spec,
                bytes: bytes::Bytes::from_static(b"abcd"),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<sruth_core::Error>(),
            Some(sruth_core::Error::UnknownFile(_))
        ));
    }

    #[tokio::test]
    async fn announce_rejects_admin_paths() {
        let dir = tempfile::tempdir().unwrap();
        let (archive, _completions) = Archive::open(options(dir.path().to_path_buf())).await.unwrap();
        let info = file_info("admin/secret", 4, 4);
        assert!(archive.announce(info).await.is_err());
    }

    #[tokio::test]
    async fn announce_restores_a_sidecar_bitset_left_by_a_previous_process() {
        let dir = tempfile::tempdir().unwrap();
        let info = file_info("restart.dat", 8, 4);
        {
            let (archive, _completions) = Archive::open(options(dir.path().to_path_buf())).await.unwrap();
            archive.announce(info.clone()).await.unwrap();
            let spec0 = PieceSpec::new(Arc::new(info.clone()), 0).unwrap();
            archive
                .put(Piece {
                    spec: spec0,
                    bytes: bytes::Bytes::from_static(b"abcd"),
                })
                .await
                .unwrap();
        }
        let (archive, _completions) = Archive::open(options(dir.path().to_path_buf())).await.unwrap();
        archive.announce(info.clone()).await.unwrap();
        let spec0 = PieceSpec::new(Arc::new(info.clone()), 0).unwrap();
        let spec1 = PieceSpec::new(Arc::new(info), 1).unwrap();
        assert!(archive.get(&spec0).await.unwrap().is_some());
        assert!(archive.get(&spec1).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn reindex_picks_up_files_never_announced() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::create_dir_all(dir.path().join("sub")).await.unwrap();
        tokio::fs::write(dir.path().join("sub/pre-existing.dat"), b"abcdefgh")
            .await
            .unwrap();

        let (archive, _completions) = Archive::open(options(dir.path().to_path_buf())).await.unwrap();
        let indexed = archive.reindex().await.unwrap();
        assert_eq!(indexed, 1);

        let path = ArchivePath::parse("sub/pre-existing.dat");
        let found = archive
            .walk(&sruth_core::Filter::parse("sub"))
            .await
            .into_iter()
            .find(|(info, _)| info.id.path == path);
        let (info, bits) = found.expect("reindexed file should be in the index");
        assert_eq!(info.size, 8);
        assert!(bits.is_complete());
    }

    #[tokio::test]
    async fn reindex_does_not_reindex_an_already_announced_file() {
        let dir = tempfile::tempdir().unwrap();
        let info = file_info("known.dat", 4, 4);
        let (archive, _completions) = Archive::open(options(dir.path().to_path_buf())).await.unwrap();
        archive.announce(info.clone()).await.unwrap();
        let spec = PieceSpec::new(Arc::new(info.clone()), 0).unwrap();
        archive
            .put(Piece {
                spec,
                bytes: bytes::Bytes::from_static(b"abcd"),
            })
            .await
            .unwrap();

        let indexed = archive.reindex().await.unwrap();
        assert_eq!(indexed, 0);
    }
}
