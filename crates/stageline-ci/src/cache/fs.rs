use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Seek};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Utc;
use stageline_core::{CacheEntry, CacheKey};
use tempfile::NamedTempFile;
use tracing::debug;

use super::{
    pack_dir, sha256_reader, unpack_into, CacheError, CacheStore, RestoreOutcome, Result,
    SaveOutcome, SnapshotInfo,
};

/// Filesystem-backed cache store.
///
/// Layout: `<root>/<project>/<branch>/<entry>.json` holds the manifest for
/// the current snapshot, which lives next to it as
/// `<entry>.<sha256>.tar.gz`. Archives and manifests are written to a temp
/// file and renamed into place; the manifest rename is the commit point, so
/// concurrent savers of the same entry resolve to last-writer-wins.
///
/// Pruning only removes archives older than the one the manifest names, so
/// a save that is still in flight keeps its archive. If a race leaves the
/// manifest pointing at a pruned archive, restore falls back to the newest
/// archive still on disk.
pub struct FsCacheStore {
    root: PathBuf,
}

impl FsCacheStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn key_dir(&self, key: &CacheKey) -> PathBuf {
        let (project, branch) = key.components();
        self.root.join(project).join(branch)
    }

    fn read_manifest(&self, dir: &Path, entry: &str) -> Result<Option<SnapshotInfo>> {
        let path = dir.join(format!("{entry}.json"));
        let content = match fs::read(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let info: SnapshotInfo =
            serde_json::from_slice(&content).map_err(|e| CacheError::Manifest {
                entry: entry.to_string(),
                message: e.to_string(),
            })?;
        if info.archive.contains(['/', '\\']) || info.archive.starts_with('.') {
            return Err(CacheError::Manifest {
                entry: entry.to_string(),
                message: format!("archive name {:?} is not a plain file name", info.archive),
            });
        }
        Ok(Some(info))
    }

    /// Archives of `entry` in `dir` with their modification times.
    fn archives(&self, dir: &Path, entry: &str) -> Vec<(String, SystemTime)> {
        let Ok(listing) = fs::read_dir(dir) else {
            return Vec::new();
        };
        listing
            .flatten()
            .filter_map(|file| {
                let name = file.file_name().to_string_lossy().into_owned();
                archive_digest(&name, entry)?;
                let modified = file.metadata().and_then(|m| m.modified()).ok()?;
                Some((name, modified))
            })
            .collect()
    }

    /// Remove archives of `entry` older than the one the manifest names.
    ///
    /// Nothing is removed while the named archive is missing.
    fn prune(&self, dir: &Path, entry: &str) {
        let Ok(Some(info)) = self.read_manifest(dir, entry) else {
            return;
        };
        let Ok(current) = fs::metadata(dir.join(&info.archive)).and_then(|m| m.modified())
        else {
            return;
        };
        for (name, modified) in self.archives(dir, entry) {
            if name == info.archive || modified >= current {
                continue;
            }
            if let Err(e) = fs::remove_file(dir.join(&name)) {
                debug!(file = %name, error = %e, "could not prune old snapshot");
            }
        }
    }

    /// Open the newest archive of `entry` still on disk.
    fn newest_archive(&self, dir: &Path, entry: &str) -> Result<Option<(File, String)>> {
        let mut candidates = self.archives(dir, entry);
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        for (name, _) in candidates {
            match File::open(dir.join(&name)) {
                Ok(file) => {
                    let sha256 = archive_digest(&name, entry).unwrap_or_default().to_string();
                    return Ok(Some((file, sha256)));
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(None)
    }
}

/// The digest in an archive name `<entry>.<sha256>.tar.gz`.
fn archive_digest<'a>(name: &'a str, entry: &str) -> Option<&'a str> {
    name.strip_prefix(entry)?
        .strip_prefix('.')?
        .strip_suffix(".tar.gz")
        .filter(|sha| sha.len() == 64 && sha.chars().all(|c| c.is_ascii_hexdigit()))
}

impl CacheStore for FsCacheStore {
    fn restore(&self, key: &CacheKey, entry: &CacheEntry, dest: &Path) -> Result<RestoreOutcome> {
        let dir = self.key_dir(key);
        let Some(info) = self.read_manifest(&dir, &entry.name)? else {
            return Ok(RestoreOutcome::Miss);
        };

        let (mut file, expected) = match File::open(dir.join(&info.archive)) {
            Ok(file) => (file, info.sha256),
            // Pruned by a concurrent save.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                match self.newest_archive(&dir, &entry.name)? {
                    Some((file, sha256)) => {
                        debug!(
                            entry = %entry.name,
                            missing = %info.archive,
                            "manifest archive gone, using newest snapshot"
                        );
                        (file, sha256)
                    }
                    None => return Ok(RestoreOutcome::Miss),
                }
            }
            Err(e) => return Err(e.into()),
        };

        let actual = sha256_reader(&mut file)?;
        if actual != expected {
            return Err(CacheError::Corrupt {
                entry: entry.name.clone(),
                expected,
                actual,
            });
        }
        let bytes = file.metadata()?.len();
        file.rewind()?;
        unpack_into(BufReader::new(file), dest)?;

        Ok(RestoreOutcome::Hit { bytes })
    }

    fn save(&self, key: &CacheKey, entry: &CacheEntry, src: &Path) -> Result<SaveOutcome> {
        if !src.is_dir() {
            return Ok(SaveOutcome::Skipped);
        }
        let dir = self.key_dir(key);
        fs::create_dir_all(&dir)?;

        let mut archive_tmp = NamedTempFile::new_in(&dir)?;
        pack_dir(src, BufWriter::new(archive_tmp.as_file_mut()))?
            .into_inner()
            .map_err(|e| e.into_error())?;
        archive_tmp.as_file().sync_all()?;

        let file = archive_tmp.as_file_mut();
        file.rewind()?;
        let sha256 = sha256_reader(&mut *file)?;
        let bytes = file.metadata()?.len();

        let archive = format!("{}.{}.tar.gz", entry.name, sha256);
        archive_tmp.persist(dir.join(&archive)).map_err(|e| e.error)?;

        let info = SnapshotInfo {
            entry: entry.name.clone(),
            archive: archive.clone(),
            bytes,
            sha256: sha256.clone(),
            saved_at: Utc::now(),
        };
        let mut manifest_tmp = NamedTempFile::new_in(&dir)?;
        serde_json::to_writer_pretty(&mut manifest_tmp, &info).map_err(io::Error::from)?;
        manifest_tmp.as_file().sync_all()?;
        manifest_tmp
            .persist(dir.join(format!("{}.json", entry.name)))
            .map_err(|e| e.error)?;

        self.prune(&dir, &entry.name);

        Ok(SaveOutcome::Saved { bytes, sha256 })
    }

    fn list(&self, key: &CacheKey) -> Result<Vec<SnapshotInfo>> {
        let dir = self.key_dir(key);
        let listing = match fs::read_dir(&dir) {
            Ok(listing) => listing,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut snapshots = Vec::new();
        for file in listing {
            let file = file?;
            let name = file.file_name().to_string_lossy().into_owned();
            let Some(entry) = name.strip_suffix(".json") else {
                continue;
            };
            if let Some(info) = self.read_manifest(&dir, entry)? {
                snapshots.push(info);
            }
        }
        snapshots.sort_by(|a, b| a.entry.cmp(&b.entry));
        Ok(snapshots)
    }
}
