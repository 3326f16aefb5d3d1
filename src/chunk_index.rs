//! Durable fingerprint -> location mapping with reference counts (C4).
//!
//! Liveness is tracked by an explicit reference count rather than access
//! time, so GC safety does not depend on read patterns. Backed by a small
//! SQLite table: one row per fingerprint, reference counts mutated only
//! by `MetadataStore` transactions, never by `ChunkStore::put`.

use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::hash::Fingerprint;

/// A row of the durable fingerprint -> location mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkRecord {
    pub fingerprint: Fingerprint,
    pub location: String,
    pub stored_size: u64,
    pub first_seen_at: i64,
    pub last_accessed_at: i64,
    pub reference_count: i64,
    pub suspect: bool,
}

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs() as i64
}

/// Durable `fingerprint -> {location, size, first_seen_at, last_accessed_at,
/// reference_count}` mapping, per §4.4. One connection owns one database
/// file (or an in-memory connection in tests); internal mutations take the
/// connection's own serialization, matching §5's "writers serialize index
/// mutations" policy.
pub struct ChunkIndex {
    conn: Connection,
}

impl ChunkIndex {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self { conn })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS chunk_index (
                fingerprint       TEXT PRIMARY KEY,
                location          TEXT NOT NULL,
                stored_size       INTEGER NOT NULL,
                first_seen_at     INTEGER NOT NULL,
                last_accessed_at  INTEGER NOT NULL,
                reference_count   INTEGER NOT NULL DEFAULT 0,
                suspect           INTEGER NOT NULL DEFAULT 0
            );",
        )?;
        Ok(())
    }

    /// Insert a new record with `reference_count = 0` if one does not
    /// already exist. Returns `true` if a row was inserted. `put` calls
    /// this; it must never bump reference counts (§4.3, §9 open question).
    pub fn insert_if_absent(
        &self,
        fingerprint: &Fingerprint,
        location: &str,
        stored_size: u64,
    ) -> Result<bool> {
        let t = now();
        let changed = self.conn.execute(
            "INSERT OR IGNORE INTO chunk_index
                (fingerprint, location, stored_size, first_seen_at, last_accessed_at, reference_count, suspect)
             VALUES (?1, ?2, ?3, ?4, ?4, 0, 0)",
            params![fingerprint.to_hex(), location, stored_size as i64, t],
        )?;
        Ok(changed > 0)
    }

    pub fn lookup(&self, fingerprint: &Fingerprint) -> Result<Option<ChunkRecord>> {
        self.conn
            .query_row(
                "SELECT fingerprint, location, stored_size, first_seen_at, last_accessed_at, reference_count, suspect
                 FROM chunk_index WHERE fingerprint = ?1",
                params![fingerprint.to_hex()],
                row_to_record,
            )
            .optional()
            .map_err(Error::from)
    }

    pub fn touch_accessed(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.conn.execute(
            "UPDATE chunk_index SET last_accessed_at = ?1 WHERE fingerprint = ?2",
            params![now(), fingerprint.to_hex()],
        )?;
        Ok(())
    }

    pub fn mark_suspect(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.conn.execute(
            "UPDATE chunk_index SET suspect = 1 WHERE fingerprint = ?1",
            params![fingerprint.to_hex()],
        )?;
        Ok(())
    }

    /// Apply a reference-count delta (`+1` or `-1`), called only from
    /// within `MetadataStore` commit/delete transactions (§4.4, §9).
    pub fn adjust_reference_count(&self, fingerprint: &Fingerprint, delta: i64) -> Result<()> {
        let changed = self.conn.execute(
            "UPDATE chunk_index SET reference_count = reference_count + ?1 WHERE fingerprint = ?2",
            params![delta, fingerprint.to_hex()],
        )?;
        if changed == 0 {
            return Err(Error::not_found(format!(
                "chunk {} not present in index",
                fingerprint
            )));
        }
        Ok(())
    }

    pub fn iter_fingerprints(&self) -> Result<Vec<Fingerprint>> {
        let mut stmt = self.conn.prepare("SELECT fingerprint FROM chunk_index")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Fingerprint::from_hex(&row?)?);
        }
        Ok(out)
    }

    /// Fingerprints whose `reference_count` is zero (candidates for GC).
    pub fn unreferenced(&self) -> Result<Vec<Fingerprint>> {
        let mut stmt = self
            .conn
            .prepare("SELECT fingerprint FROM chunk_index WHERE reference_count <= 0")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Fingerprint::from_hex(&row?)?);
        }
        Ok(out)
    }

    /// Remove a record entirely (GC sweep, after the chunk bytes are gone).
    pub fn remove(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.conn.execute(
            "DELETE FROM chunk_index WHERE fingerprint = ?1",
            params![fingerprint.to_hex()],
        )?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM chunk_index", [], |r| r.get(0))?;
        Ok(n as u64)
    }

    pub fn total_bytes(&self) -> Result<u64> {
        let n: Option<i64> = self
            .conn
            .query_row("SELECT SUM(stored_size) FROM chunk_index", [], |r| r.get(0))?;
        Ok(n.unwrap_or(0) as u64)
    }
}

fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<ChunkRecord> {
    let hex: String = row.get(0)?;
    let fingerprint = Fingerprint::from_hex(&hex)
        .map_err(|_| rusqlite::Error::InvalidColumnType(0, "fingerprint".into(), rusqlite::types::Type::Text))?;
    Ok(ChunkRecord {
        fingerprint,
        location: row.get(1)?,
        stored_size: row.get::<_, i64>(2)? as u64,
        first_seen_at: row.get(3)?,
        last_accessed_at: row.get(4)?,
        reference_count: row.get(5)?,
        suspect: row.get::<_, i64>(6)? != 0,
    })
}
