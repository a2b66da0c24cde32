//! Artifact cache: directory snapshots keyed by project and branch.
//!
//! A snapshot is a gzipped tarball of one cache entry's directory. Restoring
//! replaces the destination directory wholesale, so a restored tree is
//! exactly the tree that was saved.

pub mod fs;
pub mod memory;

use std::io::{self, Read, Write};
use std::path::Path;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use stageline_core::{CacheEntry, CacheKey};

pub use fs::FsCacheStore;
pub use memory::MemoryCacheStore;

/// Cache store errors.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("snapshot for {entry} is corrupt: expected sha256 {expected}, got {actual}")]
    Corrupt {
        entry: String,
        expected: String,
        actual: String,
    },

    #[error("invalid manifest for {entry}: {message}")]
    Manifest { entry: String, message: String },

    #[error("cache I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    Hit { bytes: u64 },
    Miss,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved { bytes: u64, sha256: String },
    /// The source directory does not exist.
    Skipped,
}

/// Metadata stored next to every snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub entry: String,
    /// Archive file name inside the key's directory.
    pub archive: String,
    pub bytes: u64,
    pub sha256: String,
    pub saved_at: DateTime<Utc>,
}

/// Persistent storage for cache snapshots.
///
/// Implementations are synchronous; callers on an async runtime should go
/// through `spawn_blocking`.
pub trait CacheStore: Send + Sync {
    /// Replace `dest` with the snapshot of `entry`, if one exists.
    /// On a miss `dest` is left untouched.
    fn restore(&self, key: &CacheKey, entry: &CacheEntry, dest: &Path) -> Result<RestoreOutcome>;

    /// Snapshot `src` as the new value of `entry`, replacing any previous one.
    fn save(&self, key: &CacheKey, entry: &CacheEntry, src: &Path) -> Result<SaveOutcome>;

    /// Snapshots stored under `key`, sorted by entry name.
    fn list(&self, key: &CacheKey) -> Result<Vec<SnapshotInfo>>;
}

/// Write `src` as a gzipped tarball into `writer`.
pub(crate) fn pack_dir<W: Write>(src: &Path, writer: W) -> io::Result<W> {
    let encoder = GzEncoder::new(writer, Compression::fast());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src)?;
    let encoder = builder.into_inner()?;
    encoder.finish()
}

/// Replace `dest` with the contents of a tarball produced by [`pack_dir`].
pub(crate) fn unpack_into<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
    if dest.exists() {
        std::fs::remove_dir_all(dest)?;
    }
    std::fs::create_dir_all(dest)?;

    let mut archive = tar::Archive::new(GzDecoder::new(reader));
    archive.set_preserve_permissions(true);
    archive.set_preserve_mtime(true);
    archive.set_overwrite(true);
    archive.unpack(dest)
}

pub(crate) fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub(crate) fn sha256_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn test_pack_unpack_preserves_tree() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());

        let archive = pack_dir(src.path(), Vec::new()).unwrap();
        let dest = tempfile::tempdir().unwrap();
        let target = dest.path().join("restored");
        unpack_into(archive.as_slice(), &target).unwrap();

        assert_tree_eq(src.path(), &target);
    }

    #[test]
    fn test_unpack_replaces_stale_files() {
        let src = tempfile::tempdir().unwrap();
        populate(src.path());
        let archive = pack_dir(src.path(), Vec::new()).unwrap();

        let dest = tempfile::tempdir().unwrap();
        std::fs::write(dest.path().join("stale.txt"), b"old").unwrap();
        unpack_into(archive.as_slice(), dest.path()).unwrap();

        assert!(!dest.path().join("stale.txt").exists());
        assert!(dest.path().join("top.txt").exists());
    }

    #[test]
    fn test_sha256_helpers_agree() {
        let data = b"snapshot bytes";
        assert_eq!(sha256_hex(data), sha256_reader(&data[..]).unwrap());
        assert_eq!(sha256_hex(data).len(), 64);
    }
}
