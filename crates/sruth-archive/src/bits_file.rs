use std::path::{Path, PathBuf};

use anyhow::Context;
use sruth_core::{ArchivePath, FiniteBitSet};

/// The on-disk sidecar for a partial file's completeness bitmap:
/// `<archivePath>.bits`, sibling to the data file itself (§6).
pub fn bits_path(root: &Path, archive_path: &ArchivePath) -> PathBuf {
    let mut path = root.join(archive_path.to_relative_path());
    let mut name = path.file_name().expect("archive path has a file name").to_os_string();
    name.push(".bits");
    path.set_file_name(name);
    path
}

pub async fn load(path: &Path) -> anyhow::Result<Option<FiniteBitSet>> {
    match tokio::fs::read(path).await {
        Ok(buf) => Ok(Some(FiniteBitSet::decode(&buf)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}

pub async fn save(path: &Path, bits: &FiniteBitSet) -> anyhow::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, bits.encode())
        .await
        .with_context(|| format!("writing {}", path.display()))
}

pub async fn remove(path: &Path) -> anyhow::Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bits_path_is_a_dotted_sibling() {
        let root = Path::new("/archive");
        let p = bits_path(root, &ArchivePath::parse("a/b/file.dat"));
        assert_eq!(p, Path::new("/archive/a/b/file.dat.bits"));
    }

    #[tokio::test]
    async fn save_load_roundtrips_and_remove_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.bits");
        let mut bits = FiniteBitSet::empty(4);
        bits.set_bit(1);
        save(&path, &bits).await.unwrap();
        let loaded = load(&path).await.unwrap().unwrap();
        assert_eq!(bits, loaded);
        remove(&path).await.unwrap();
        assert!(load(&path).await.unwrap().is_none());
        remove(&path).await.unwrap();
    }
}
