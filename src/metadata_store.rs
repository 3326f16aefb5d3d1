//! Transactional store of snapshots, file entries, and file-chunk edges
//! (C5).
//!
//! Backed by `rusqlite`. The invariants - `(snapshot_id, path)` unique,
//! `snapshot.name` unique, `(file_id, order)` unique and gap-free - are
//! enforced at the schema level with `UNIQUE` constraints rather than
//! re-checked in application code, so a violation surfaces as a SQLite
//! constraint error that we translate to `Error::Conflict`.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::chunk_index::ChunkIndex;
use crate::error::{Error, Result};
use crate::hash::Fingerprint;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub id: i64,
    pub name: String,
    pub created_at: i64,
    pub description: Option<String>,
    pub total_files: i64,
    pub total_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub id: i64,
    pub snapshot_id: i64,
    pub path: String,
    pub size: i64,
    pub modified_time: i64,
    pub file_fingerprint: Fingerprint,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub file_id: i64,
    pub order: i64,
    pub chunk_fingerprint: Fingerprint,
    pub chunk_size: i64,
}

#[derive(Debug, Default, Clone, Copy)]
pub struct MetadataStats {
    pub snapshot_count: i64,
    pub file_count: i64,
    pub chunk_edge_count: i64,
    pub total_size: i64,
}

/// A new file pending insertion into an in-flight `Txn`, built up by
/// `BackupOrchestrator` as it drains chunks for one file.
pub struct PendingFile {
    pub path: String,
    pub size: i64,
    pub modified_time: i64,
    pub file_fingerprint: Fingerprint,
    pub chunks: Vec<(Fingerprint, i64)>,
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// One atomic snapshot-creation transaction: the snapshot row, every file
/// row, and every chunk edge commit together or not at all (§4.5
/// atomicity).
pub struct Txn<'a> {
    store: &'a MetadataStore,
    name: String,
    description: Option<String>,
    files: Vec<PendingFile>,
}

impl<'a> Txn<'a> {
    pub fn add_file(&mut self, file: PendingFile) {
        self.files.push(file);
    }

    /// Commit the snapshot row, all file rows, all edges, and apply the
    /// chunk reference-count deltas, all inside one SQLite transaction.
    pub fn commit(self) -> Result<i64> {
        let conn = &self.store.conn;
        conn.execute("BEGIN IMMEDIATE", [])?;

        let result = (|| -> Result<i64> {
            let created_at = now();
            let total_files = self.files.len() as i64;
            let total_size: i64 = self.files.iter().map(|f| f.size).sum();

            conn.execute(
                "INSERT INTO snapshots (name, created_at, description, total_files, total_size)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![self.name, created_at, self.description, total_files, total_size],
            )
            .map_err(|e| {
                if is_unique_violation(&e) {
                    Error::Conflict(format!("snapshot name '{}' already exists", self.name))
                } else {
                    Error::from(e)
                }
            })?;
            let snapshot_id = conn.last_insert_rowid();

            for file in &self.files {
                conn.execute(
                    "INSERT INTO files (snapshot_id, path, size, modified_time, file_fingerprint)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        snapshot_id,
                        file.path,
                        file.size,
                        file.modified_time,
                        file.file_fingerprint.to_hex()
                    ],
                )
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        Error::Conflict(format!(
                            "duplicate path '{}' in snapshot {}",
                            file.path, snapshot_id
                        ))
                    } else {
                        Error::from(e)
                    }
                })?;
                let file_id = conn.last_insert_rowid();

                for (order, (fingerprint, size)) in file.chunks.iter().enumerate() {
                    conn.execute(
                        "INSERT INTO file_chunks (file_id, \"order\", chunk_fingerprint, chunk_size)
                         VALUES (?1, ?2, ?3, ?4)",
                        params![file_id, order as i64, fingerprint.to_hex(), size],
                    )?;
                    self.store.index.adjust_reference_count(fingerprint, 1)?;
                }
            }

            Ok(snapshot_id)
        })();

        match result {
            Ok(id) => {
                conn.execute("COMMIT", [])?;
                Ok(id)
            }
            Err(e) => {
                let _ = conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn abort(self) {
        // Nothing was written outside this in-memory builder; dropping
        // the transaction is sufficient. Already-stored chunk bytes are
        // left for the next GC to reclaim (§4.6 cancellation contract).
    }
}

/// Transactional store of snapshots, files, and file-chunk edges (§4.5).
/// Shares a `ChunkIndex` with the `ChunkStore` so that a snapshot commit
/// can apply reference-count deltas in the same logical transaction.
pub struct MetadataStore {
    conn: Connection,
    index: std::sync::Arc<ChunkIndex>,
}

impl MetadataStore {
    pub fn open(path: &Path, index: std::sync::Arc<ChunkIndex>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn, index })
    }

    pub fn open_in_memory(index: std::sync::Arc<ChunkIndex>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn, index })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS snapshots (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                name          TEXT NOT NULL UNIQUE,
                created_at    INTEGER NOT NULL,
                description   TEXT,
                total_files   INTEGER NOT NULL,
                total_size    INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS files (
                id               INTEGER PRIMARY KEY AUTOINCREMENT,
                snapshot_id      INTEGER NOT NULL REFERENCES snapshots(id),
                path             TEXT NOT NULL,
                size             INTEGER NOT NULL,
                modified_time    INTEGER NOT NULL,
                file_fingerprint TEXT NOT NULL,
                UNIQUE(snapshot_id, path)
            );
            CREATE TABLE IF NOT EXISTS file_chunks (
                file_id           INTEGER NOT NULL REFERENCES files(id),
                \"order\"         INTEGER NOT NULL,
                chunk_fingerprint TEXT NOT NULL,
                chunk_size        INTEGER NOT NULL,
                UNIQUE(file_id, \"order\")
            );
            CREATE INDEX IF NOT EXISTS idx_files_path ON files(path);
            ",
        )?;
        Ok(())
    }

    /// Begin a new snapshot-creation transaction. `name` must be unique
    /// across all snapshots.
    pub fn begin_txn(&self, name: impl Into<String>, description: Option<String>) -> Txn<'_> {
        Txn { store: self, name: name.into(), description, files: Vec::new() }
    }

    pub fn get_snapshot(&self, id: i64) -> Result<Snapshot> {
        self.conn
            .query_row(
                "SELECT id, name, created_at, description, total_files, total_size
                 FROM snapshots WHERE id = ?1",
                params![id],
                row_to_snapshot,
            )
            .optional()?
            .ok_or_else(|| Error::not_found(format!("snapshot {}", id)))
    }

    pub fn get_snapshot_by_name(&self, name: &str) -> Result<Snapshot> {
        self.conn
            .query_row(
                "SELECT id, name, created_at, description, total_files, total_size
                 FROM snapshots WHERE name = ?1",
                params![name],
                row_to_snapshot,
            )
            .optional()?
            .ok_or_else(|| Error::not_found(format!("snapshot '{}'", name)))
    }

    pub fn list_snapshots(&self) -> Result<Vec<Snapshot>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, created_at, description, total_files, total_size
             FROM snapshots ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], row_to_snapshot)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Deletes the snapshot's file rows and edges, decrementing each
    /// referenced chunk's reference count once per edge, then removes the
    /// snapshot row - all in one transaction (§4.5 deletion semantics).
    pub fn delete_snapshot(&self, id: i64) -> Result<()> {
        self.conn.execute("BEGIN IMMEDIATE", [])?;
        let result = (|| -> Result<()> {
            let file_ids: Vec<i64> = {
                let mut stmt = self.conn.prepare("SELECT id FROM files WHERE snapshot_id = ?1")?;
                let rows = stmt.query_map(params![id], |r| r.get(0))?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            for file_id in &file_ids {
                let fingerprints: Vec<String> = {
                    let mut stmt = self
                        .conn
                        .prepare("SELECT chunk_fingerprint FROM file_chunks WHERE file_id = ?1")?;
                    let rows = stmt.query_map(params![file_id], |r| r.get(0))?;
                    rows.collect::<rusqlite::Result<Vec<_>>>()?
                };
                for hex in fingerprints {
                    let fp = Fingerprint::from_hex(&hex)?;
                    self.index.adjust_reference_count(&fp, -1)?;
                }
                self.conn.execute("DELETE FROM file_chunks WHERE file_id = ?1", params![file_id])?;
            }
            self.conn.execute("DELETE FROM files WHERE snapshot_id = ?1", params![id])?;
            let deleted = self.conn.execute("DELETE FROM snapshots WHERE id = ?1", params![id])?;
            if deleted == 0 {
                return Err(Error::not_found(format!("snapshot {}", id)));
            }
            Ok(())
        })();

        match result {
            Ok(()) => {
                self.conn.execute("COMMIT", [])?;
                Ok(())
            }
            Err(e) => {
                let _ = self.conn.execute("ROLLBACK", []);
                Err(e)
            }
        }
    }

    pub fn files_in_snapshot(&self, snapshot_id: i64) -> Result<Vec<FileRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, snapshot_id, path, size, modified_time, file_fingerprint
             FROM files WHERE snapshot_id = ?1 ORDER BY path ASC",
        )?;
        let rows = stmt.query_map(params![snapshot_id], row_to_file)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Ordered chunk edges for a file, `order` gap-free from 0 (§4.5,
    /// P12).
    pub fn file_chunks(&self, file_id: i64) -> Result<Vec<FileChunk>> {
        let mut stmt = self.conn.prepare(
            "SELECT file_id, \"order\", chunk_fingerprint, chunk_size
             FROM file_chunks WHERE file_id = ?1 ORDER BY \"order\" ASC",
        )?;
        let rows = stmt.query_map(params![file_id], row_to_file_chunk)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Substring/prefix search over paths, optionally scoped to one
    /// snapshot (§4.5).
    pub fn search_files(&self, query: &str, snapshot_id: Option<i64>) -> Result<Vec<FileRecord>> {
        let pattern = format!("%{}%", query.replace('%', "\\%").replace('_', "\\_"));
        let mut stmt = match snapshot_id {
            Some(_) => self.conn.prepare(
                "SELECT id, snapshot_id, path, size, modified_time, file_fingerprint
                 FROM files WHERE snapshot_id = ?1 AND path LIKE ?2 ESCAPE '\\' ORDER BY path ASC",
            )?,
            None => self.conn.prepare(
                "SELECT id, snapshot_id, path, size, modified_time, file_fingerprint
                 FROM files WHERE path LIKE ?1 ESCAPE '\\' ORDER BY path ASC",
            )?,
        };
        let rows = match snapshot_id {
            Some(sid) => stmt.query_map(params![sid, pattern], row_to_file)?,
            None => stmt.query_map(params![pattern], row_to_file)?,
        };
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn stats(&self) -> Result<MetadataStats> {
        let snapshot_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM snapshots", [], |r| r.get(0))?;
        let file_count: i64 = self.conn.query_row("SELECT COUNT(*) FROM files", [], |r| r.get(0))?;
        let chunk_edge_count: i64 =
            self.conn.query_row("SELECT COUNT(*) FROM file_chunks", [], |r| r.get(0))?;
        let total_size: Option<i64> =
            self.conn.query_row("SELECT SUM(total_size) FROM snapshots", [], |r| r.get(0))?;
        Ok(MetadataStats {
            snapshot_count,
            file_count,
            chunk_edge_count,
            total_size: total_size.unwrap_or(0),
        })
    }

    /// Every live chunk fingerprint reachable from any surviving
    /// snapshot, used by `GarbageCollector` to build the live set (§4.8).
    pub fn live_chunk_fingerprints(&self) -> Result<std::collections::HashSet<Fingerprint>> {
        let mut stmt = self.conn.prepare("SELECT DISTINCT chunk_fingerprint FROM file_chunks")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        let mut out = std::collections::HashSet::new();
        for row in rows {
            out.insert(Fingerprint::from_hex(&row?)?);
        }
        Ok(out)
    }

    /// Authoritative per-fingerprint edge counts, recomputed directly from
    /// `file_chunks`. `GarbageCollector` diffs this against `ChunkIndex`'s
    /// stored `reference_count` to detect and correct drift (§4.8).
    pub fn reference_counts(&self) -> Result<std::collections::HashMap<Fingerprint, i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT chunk_fingerprint, COUNT(*) FROM file_chunks GROUP BY chunk_fingerprint")?;
        let rows = stmt.query_map([], |r| {
            let hex: String = r.get(0)?;
            let count: i64 = r.get(1)?;
            Ok((hex, count))
        })?;
        let mut out = std::collections::HashMap::new();
        for row in rows {
            let (hex, count) = row?;
            out.insert(Fingerprint::from_hex(&hex)?, count);
        }
        Ok(out)
    }
}

fn row_to_snapshot(row: &rusqlite::Row) -> rusqlite::Result<Snapshot> {
    Ok(Snapshot {
        id: row.get(0)?,
        name: row.get(1)?,
        created_at: row.get(2)?,
        description: row.get(3)?,
        total_files: row.get(4)?,
        total_size: row.get(5)?,
    })
}

fn row_to_file(row: &rusqlite::Row) -> rusqlite::Result<FileRecord> {
    let hex: String = row.get(5)?;
    let file_fingerprint = Fingerprint::from_hex(&hex)
        .map_err(|_| rusqlite::Error::InvalidColumnType(5, "file_fingerprint".into(), rusqlite::types::Type::Text))?;
    Ok(FileRecord {
        id: row.get(0)?,
        snapshot_id: row.get(1)?,
        path: row.get(2)?,
        size: row.get(3)?,
        modified_time: row.get(4)?,
        file_fingerprint,
    })
}

fn row_to_file_chunk(row: &rusqlite::Row) -> rusqlite::Result<FileChunk> {
    let hex: String = row.get(2)?;
    let chunk_fingerprint = Fingerprint::from_hex(&hex)
        .map_err(|_| rusqlite::Error::InvalidColumnType(2, "chunk_fingerprint".into(), rusqlite::types::Type::Text))?;
    Ok(FileChunk {
        file_id: row.get(0)?,
        order: row.get(1)?,
        chunk_fingerprint,
        chunk_size: row.get(3)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_buffer;
    use std::sync::Arc;

    fn store() -> MetadataStore {
        let index = Arc::new(ChunkIndex::open_in_memory().unwrap());
        MetadataStore::open_in_memory(index).unwrap()
    }

    fn pending_file(path: &str, chunks: &[&[u8]]) -> PendingFile {
        let chunk_rows: Vec<(Fingerprint, i64)> =
            chunks.iter().map(|c| (hash_buffer(c), c.len() as i64)).collect();
        let mut all = Vec::new();
        for c in chunks {
            all.extend_from_slice(c);
        }
        PendingFile {
            path: path.to_string(),
            size: all.len() as i64,
            modified_time: 0,
            file_fingerprint: hash_buffer(&all),
            chunks: chunk_rows,
        }
    }

    #[test]
    fn commit_creates_snapshot_with_files_and_edges() {
        let store = store();
        store.index.insert_if_absent(&hash_buffer(b"one"), "x", 3).unwrap();
        store.index.insert_if_absent(&hash_buffer(b"two"), "y", 3).unwrap();

        let mut txn = store.begin_txn("snap-1", None);
        txn.add_file(pending_file("/a", &[b"one", b"two"]));
        let id = txn.commit().unwrap();

        let snap = store.get_snapshot(id).unwrap();
        assert_eq!(snap.name, "snap-1");
        assert_eq!(snap.total_files, 1);

        let files = store.files_in_snapshot(id).unwrap();
        assert_eq!(files.len(), 1);
        let chunks = store.file_chunks(files[0].id).unwrap();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].order, 0);
        assert_eq!(chunks[1].order, 1);
    }

    #[test]
    fn duplicate_snapshot_name_is_conflict() {
        let store = store();
        store.begin_txn("dup", None).commit().unwrap();
        match store.begin_txn("dup", None).commit() {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn duplicate_path_in_one_snapshot_is_conflict() {
        let store = store();
        store.index.insert_if_absent(&hash_buffer(b"x"), "loc", 1).unwrap();
        let mut txn = store.begin_txn("snap", None);
        txn.add_file(pending_file("/dup", &[b"x"]));
        txn.add_file(pending_file("/dup", &[b"x"]));
        match txn.commit() {
            Err(Error::Conflict(_)) => {}
            other => panic!("expected Conflict, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn delete_snapshot_decrements_refcounts() {
        let store = store();
        let fp = hash_buffer(b"shared");
        store.index.insert_if_absent(&fp, "loc", 6).unwrap();

        let mut txn = store.begin_txn("s1", None);
        txn.add_file(pending_file("/a", &[b"shared"]));
        let id = txn.commit().unwrap();

        assert_eq!(store.index.lookup(&fp).unwrap().unwrap().reference_count, 1);
        store.delete_snapshot(id).unwrap();
        assert_eq!(store.index.lookup(&fp).unwrap().unwrap().reference_count, 0);
        assert!(store.get_snapshot(id).is_err());
    }

    #[test]
    fn search_files_matches_substring() {
        let store = store();
        store.index.insert_if_absent(&hash_buffer(b"c"), "loc", 1).unwrap();
        let mut txn = store.begin_txn("snap", None);
        txn.add_file(pending_file("/dir/report.txt", &[b"c"]));
        txn.add_file(pending_file("/dir/photo.png", &[b"c"]));
        txn.commit().unwrap();

        let hits = store.search_files("report", None).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].path, "/dir/report.txt");
    }
}
