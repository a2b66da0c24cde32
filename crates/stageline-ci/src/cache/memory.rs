//! In-memory cache store (testing only).

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;

use chrono::Utc;
use stageline_core::{CacheEntry, CacheKey};

use super::{
    pack_dir, sha256_hex, unpack_into, CacheStore, RestoreOutcome, Result, SaveOutcome,
    SnapshotInfo,
};

#[derive(Debug)]
struct Snapshot {
    archive: Vec<u8>,
    info: SnapshotInfo,
}

/// Cache store holding snapshots in a `HashMap<(key, entry), archive>`.
#[derive(Debug, Default)]
pub struct MemoryCacheStore {
    snapshots: Mutex<HashMap<(CacheKey, String), Snapshot>>,
}

impl MemoryCacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, key: &CacheKey, entry: &str) -> bool {
        let snapshots = self.snapshots.lock().unwrap();
        snapshots.contains_key(&(key.clone(), entry.to_string()))
    }

    pub fn len(&self) -> usize {
        self.snapshots.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CacheStore for MemoryCacheStore {
    fn restore(&self, key: &CacheKey, entry: &CacheEntry, dest: &Path) -> Result<RestoreOutcome> {
        let snapshots = self.snapshots.lock().unwrap();
        match snapshots.get(&(key.clone(), entry.name.clone())) {
            Some(snapshot) => {
                unpack_into(snapshot.archive.as_slice(), dest)?;
                Ok(RestoreOutcome::Hit {
                    bytes: snapshot.info.bytes,
                })
            }
            None => Ok(RestoreOutcome::Miss),
        }
    }

    fn save(&self, key: &CacheKey, entry: &CacheEntry, src: &Path) -> Result<SaveOutcome> {
        if !src.is_dir() {
            return Ok(SaveOutcome::Skipped);
        }
        let archive = pack_dir(src, Vec::new())?;
        let sha256 = sha256_hex(&archive);
        let bytes = archive.len() as u64;
        let info = SnapshotInfo {
            entry: entry.name.clone(),
            archive: format!("{}.{}.tar.gz", entry.name, sha256),
            bytes,
            sha256: sha256.clone(),
            saved_at: Utc::now(),
        };
        let mut snapshots = self.snapshots.lock().unwrap();
        snapshots.insert((key.clone(), entry.name.clone()), Snapshot { archive, info });
        Ok(SaveOutcome::Saved { bytes, sha256 })
    }

    fn list(&self, key: &CacheKey) -> Result<Vec<SnapshotInfo>> {
        let snapshots = self.snapshots.lock().unwrap();
        let mut infos: Vec<_> = snapshots
            .iter()
            .filter(|((k, _), _)| k == key)
            .map(|(_, s)| s.info.clone())
            .collect();
        infos.sort_by(|a, b| a.entry.cmp(&b.entry));
        Ok(infos)
    }
}
