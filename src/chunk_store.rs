//! Deduplicating, integrity-verified, garbage-collectable chunk repository
//! (C3).
//!
//! Physical layout is a two-level sharded directory scheme
//! (`<root>/<ab>/<cdef...>`) with a rename-after-write atomicity
//! discipline: write to a temp file on the same filesystem, then
//! atomically rename into place. A loser of a concurrent `put` race for
//! the same fingerprint simply discards its temp file and returns the
//! fingerprint the winner already produced.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use log::{trace, warn};
use tempfile::NamedTempFile;

use crate::chunk_index::ChunkIndex;
use crate::error::{Error, Result};
use crate::hash::{hash_buffer, Fingerprint};

/// Aggregate counters returned by `stats()`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ChunkStoreStats {
    pub count: u64,
    pub total_bytes: u64,
    pub last_gc_at: Option<i64>,
    pub orphans: u64,
}

/// Persists and retrieves chunks keyed by fingerprint, per §4.3.
///
/// The `ChunkIndex` is shared (`Arc`) with the `MetadataStore` that
/// applies reference-count deltas on commit/delete (§4.4): `put` and
/// `get` only ever read or insert-at-zero, never bump a reference count,
/// so the two components can safely hold the same index concurrently.
pub struct ChunkStore {
    root: PathBuf,
    index: Arc<ChunkIndex>,
    last_gc_at: Mutex<Option<i64>>,
}

impl ChunkStore {
    /// Open (creating if needed) a chunk store rooted at `root`, with its
    /// own index persisted alongside it at `<root>/index.db`. Use
    /// `with_index` instead when the index must be shared with a
    /// `MetadataStore`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join(".tmp"))?;
        let index = Arc::new(ChunkIndex::open(&root.join("index.db"))?);
        Ok(Self { root, index, last_gc_at: Mutex::new(None) })
    }

    /// Variant taking a pre-built, shared index - the common case, since
    /// `MetadataStore` needs the same `Arc<ChunkIndex>` to apply
    /// reference-count deltas on commit.
    pub fn with_index(root: impl Into<PathBuf>, index: Arc<ChunkIndex>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        fs::create_dir_all(root.join(".tmp"))?;
        Ok(Self { root, index, last_gc_at: Mutex::new(None) })
    }

    /// The shared index handle, for callers wiring a `MetadataStore` that
    /// must observe the same fingerprint -> location/refcount mapping.
    pub fn index_handle(&self) -> Arc<ChunkIndex> {
        Arc::clone(&self.index)
    }

    fn location_path(&self, fingerprint: &Fingerprint) -> PathBuf {
        self.root.join(fingerprint.shard_prefix()).join(fingerprint.rest_of_hex())
    }

    /// (1) hash, (2) dedup against an existing record, (3) write + index.
    /// `reference_count` is always inserted at 0: only `MetadataStore`
    /// commits change it (§4.3, §9).
    pub fn put(&self, bytes: &[u8]) -> Result<Fingerprint> {
        if bytes.is_empty() {
            return Err(Error::invalid_input("put() requires non-empty bytes"));
        }

        let fingerprint = hash_buffer(bytes);

        if self.index.lookup(&fingerprint)?.is_some() {
            trace!("chunk {} already present, skipping write", fingerprint);
            return Ok(fingerprint);
        }

        let path = self.location_path(&fingerprint);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        if !path.exists() {
            let mut tmp = NamedTempFile::new_in(self.root.join(".tmp"))?;
            tmp.write_all(bytes)?;
            tmp.flush()?;
            tmp.persist(&path).map_err(|e| Error::Io(e.error))?;
        }

        let location = format!("{}/{}", fingerprint.shard_prefix(), fingerprint.rest_of_hex());
        self.index.insert_if_absent(&fingerprint, &location, bytes.len() as u64)?;
        trace!("stored chunk {} ({} bytes)", fingerprint, bytes.len());

        Ok(fingerprint)
    }

    /// Look up location, read bytes, hash them, compare. Raises
    /// `IntegrityError` (and marks the record suspect, without deleting
    /// it) on mismatch per §4.3.
    pub fn get(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>> {
        let record = self
            .index
            .lookup(fingerprint)?
            .ok_or_else(|| Error::not_found(format!("chunk {}", fingerprint)))?;

        let path = self.location_path(fingerprint);
        let mut file = fs::File::open(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::Corrupt(format!(
                    "chunk {} indexed at {} but missing on disk",
                    fingerprint, record.location
                ))
            } else {
                Error::Io(e)
            }
        })?;
        let mut bytes = Vec::with_capacity(record.stored_size as usize);
        file.read_to_end(&mut bytes)?;

        let actual = hash_buffer(&bytes);
        if &actual != fingerprint {
            self.index.mark_suspect(fingerprint)?;
            warn!("integrity check failed for chunk {}: got {}", fingerprint, actual);
            return Err(Error::IntegrityError {
                fingerprint: fingerprint.to_hex(),
                actual: actual.to_hex(),
            });
        }

        self.index.touch_accessed(fingerprint)?;
        Ok(bytes)
    }

    pub fn contains(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.index.lookup(fingerprint)?.is_some())
    }

    pub fn iter_fingerprints(&self) -> Result<Vec<Fingerprint>> {
        self.index.iter_fingerprints()
    }

    /// Delete every chunk not in `live_set`, except ones written within
    /// `grace_seconds` of now - a chunk a concurrent backup just wrote may
    /// not be visible in `live_set` yet if its snapshot commit hasn't
    /// landed, so a short grace window avoids racing that commit. Index
    /// record removed AFTER the bytes, so a crash mid-sweep can only leave
    /// a dangling index entry (recoverable next run), never a dangling
    /// file (§4.8 ordering rule).
    pub fn garbage_collect(
        &self,
        live_set: &std::collections::HashSet<Fingerprint>,
        grace_seconds: u64,
    ) -> Result<u64> {
        let cutoff = now() - grace_seconds as i64;
        let mut removed = 0u64;
        for fingerprint in self.index.iter_fingerprints()? {
            if live_set.contains(&fingerprint) {
                continue;
            }
            match self.index.lookup(&fingerprint)? {
                Some(record) if record.first_seen_at > cutoff => continue,
                _ => {}
            }
            let path = self.location_path(&fingerprint);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(Error::Io(e)),
            }
            self.index.remove(&fingerprint)?;
            removed += 1;
        }
        *self.last_gc_at.lock().unwrap() = Some(now());
        Ok(removed)
    }

    /// Chunk files present on disk with no index entry (crash artifacts
    /// from an interrupted `put` before the rename, or an interrupted GC
    /// sweep). Detected by directory scan, never deleted automatically.
    fn count_orphans(&self) -> Result<u64> {
        let mut orphans = 0u64;
        let entries = match fs::read_dir(&self.root) {
            Ok(e) => e,
            Err(_) => return Ok(0),
        };
        for shard in entries.flatten() {
            if !shard.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                continue;
            }
            let name = shard.file_name();
            if name == ".tmp" {
                continue;
            }
            let shard_prefix = match name.to_str() {
                Some(s) => s.to_string(),
                None => continue,
            };
            let shard_entries = match fs::read_dir(shard.path()) {
                Ok(e) => e,
                Err(_) => continue,
            };
            for file in shard_entries.flatten() {
                let rest = match file.file_name().to_str() {
                    Some(s) => s.to_string(),
                    None => continue,
                };
                let hex = format!("{}{}", shard_prefix, rest);
                let known = Fingerprint::from_hex(&hex)
                    .ok()
                    .map(|fp| self.index.lookup(&fp).unwrap_or(None).is_some())
                    .unwrap_or(false);
                if !known {
                    orphans += 1;
                }
            }
        }
        Ok(orphans)
    }

    pub fn stats(&self) -> Result<ChunkStoreStats> {
        Ok(ChunkStoreStats {
            count: self.index.count()?,
            total_bytes: self.index.total_bytes()?,
            last_gc_at: *self.last_gc_at.lock().unwrap(),
            orphans: self.count_orphans()?,
        })
    }

    pub fn close(self) -> Result<()> {
        Ok(())
    }
}

fn now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::fs::OpenOptions;
    use std::io::Write as _;
    use tempfile::tempdir;

    fn store() -> (tempfile::TempDir, ChunkStore) {
        let dir = tempdir().unwrap();
        let store = ChunkStore::open(dir.path().join("chunks")).unwrap();
        (dir, store)
    }

    #[test]
    fn put_rejects_empty() {
        let (_dir, store) = store();
        assert!(store.put(&[]).is_err());
    }

    #[test]
    fn put_then_get_roundtrips() {
        let (_dir, store) = store();
        let fp = store.put(b"hello chunk").unwrap();
        let bytes = store.get(&fp).unwrap();
        assert_eq!(bytes, b"hello chunk");
    }

    #[test]
    fn put_is_idempotent_dedup() {
        let (_dir, store) = store();
        let fp1 = store.put(b"same bytes").unwrap();
        let fp2 = store.put(b"same bytes").unwrap();
        assert_eq!(fp1, fp2);
        assert_eq!(store.stats().unwrap().count, 1);
    }

    #[test]
    fn get_missing_is_not_found() {
        let (_dir, store) = store();
        let fp = hash_buffer(b"never stored");
        match store.get(&fp) {
            Err(Error::NotFound(_)) => {}
            other => panic!("expected NotFound, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn corruption_is_detected_on_get() {
        // Scenario 5: corrupt-then-get.
        let (dir, store) = store();
        let fp = store.put(b"pristine bytes, do not touch").unwrap();

        let path = dir
            .path()
            .join("chunks")
            .join(fp.shard_prefix())
            .join(fp.rest_of_hex());
        let mut file = OpenOptions::new().write(true).open(&path).unwrap();
        file.write_all(b"X").unwrap();
        drop(file);

        match store.get(&fp) {
            Err(Error::IntegrityError { .. }) => {}
            other => panic!("expected IntegrityError, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn garbage_collect_removes_only_unreferenced() {
        let (_dir, store) = store();
        let keep = store.put(b"keep me").unwrap();
        let drop_fp = store.put(b"drop me").unwrap();

        let mut live = HashSet::new();
        live.insert(keep);

        let removed = store.garbage_collect(&live, 0).unwrap();
        assert_eq!(removed, 1);
        assert!(store.contains(&keep).unwrap());
        assert!(!store.contains(&drop_fp).unwrap());
    }

    #[test]
    fn garbage_collect_respects_grace_window() {
        let (_dir, store) = store();
        let drop_fp = store.put(b"too fresh to sweep").unwrap();

        let live = HashSet::new();
        let removed = store.garbage_collect(&live, 3600).unwrap();
        assert_eq!(removed, 0);
        assert!(store.contains(&drop_fp).unwrap());

        let removed = store.garbage_collect(&live, 0).unwrap();
        assert_eq!(removed, 1);
    }

    #[test]
    fn iter_fingerprints_lists_everything_stored() {
        let (_dir, store) = store();
        let a = store.put(b"a").unwrap();
        let b = store.put(b"b").unwrap();
        let mut got = store.iter_fingerprints().unwrap();
        got.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(got, expected);
    }
}
