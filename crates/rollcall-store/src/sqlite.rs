//! SQLite enrollment store.
//!
//! Rows keep insertion order through an autoincrement `seq` column, so the
//! oldest record is always the smallest `seq`. Embeddings are stored as JSON
//! arrays. A row that fails to decode is skipped when snapshotting.

use chrono::{DateTime, Utc};
use rollcall_core::{Embedding, EnrolledRecord, EnrollmentStore, RecordMetadata};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use thiserror::Error;

const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS enrolled_faces (
    seq INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL UNIQUE,
    identity TEXT NOT NULL,
    embedding TEXT NOT NULL,
    extractor TEXT,
    display_name TEXT,
    grp TEXT,
    image_ref TEXT,
    enrolled_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_enrolled_faces_grp ON enrolled_faces(grp);
CREATE INDEX IF NOT EXISTS idx_enrolled_faces_identity ON enrolled_faces(identity);
";

const SELECT_COLUMNS: &str =
    "seq, identity, embedding, extractor, display_name, grp, image_ref, enrolled_at";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("embedding encoding: {0}")]
    Json(#[from] serde_json::Error),
    #[error("row count out of range: {0}")]
    CountOverflow(i64),
}

/// Raw row as read from `enrolled_faces`, before decoding.
struct RawRow {
    seq: i64,
    identity: String,
    embedding: String,
    extractor: Option<String>,
    display_name: Option<String>,
    group: Option<String>,
    image_ref: Option<String>,
    enrolled_at: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            seq: row.get(0)?,
            identity: row.get(1)?,
            embedding: row.get(2)?,
            extractor: row.get(3)?,
            display_name: row.get(4)?,
            group: row.get(5)?,
            image_ref: row.get(6)?,
            enrolled_at: row.get(7)?,
        })
    }

    fn decode(self) -> Result<EnrolledRecord, String> {
        let values: Vec<f32> = serde_json::from_str(&self.embedding)
            .map_err(|e| format!("embedding column: {e}"))?;
        let enrolled_at = DateTime::parse_from_rfc3339(&self.enrolled_at)
            .map_err(|e| format!("enrolled_at column: {e}"))?
            .with_timezone(&Utc);

        Ok(EnrolledRecord {
            identity: self.identity,
            embedding: Embedding {
                values,
                extractor: self.extractor,
            },
            metadata: RecordMetadata {
                display_name: self.display_name,
                group: self.group,
                image_ref: self.image_ref,
                enrolled_at,
            },
        })
    }
}

fn insert_record(conn: &Connection, record: &EnrolledRecord) -> Result<(), StoreError> {
    let record_id = uuid::Uuid::new_v4().to_string();
    let embedding = serde_json::to_string(&record.embedding.values)?;
    conn.execute(
        "INSERT INTO enrolled_faces (
            record_id, identity, embedding, extractor,
            display_name, grp, image_ref, enrolled_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            record_id,
            record.identity,
            embedding,
            record.embedding.extractor,
            record.metadata.display_name,
            record.metadata.group,
            record.metadata.image_ref,
            record.metadata.enrolled_at.to_rfc3339(),
        ],
    )?;
    tracing::debug!(
        identity = %record.identity,
        record_id = %record_id,
        dim = record.embedding.dim(),
        "appended enrolled record"
    );
    Ok(())
}

/// Persistent enrollment store backed by a single SQLite database.
pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    /// Open or create the store at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::info!(path = %path.display(), "opened enrollment store");
        Self::with_connection(conn)
    }

    /// Open a private in-memory store.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(Self { conn })
    }

    /// Distinct identities in enrollment order of their first record.
    pub fn identities(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT identity FROM enrolled_faces GROUP BY identity ORDER BY MIN(seq)",
        )?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }
}

impl EnrollmentStore for SqliteStore {
    type Error = StoreError;

    fn append(&mut self, record: EnrolledRecord) -> Result<(), StoreError> {
        insert_record(&self.conn, &record)?;
        Ok(())
    }

    /// Insert and evict inside one transaction: either both happen or neither.
    fn append_bounded(
        &mut self,
        record: EnrolledRecord,
        capacity: usize,
    ) -> Result<Vec<String>, StoreError> {
        let tx = self.conn.transaction()?;
        insert_record(&tx, &record)?;

        let count: i64 =
            tx.query_row("SELECT COUNT(*) FROM enrolled_faces", [], |row| row.get(0))?;
        let excess = count.saturating_sub(i64::try_from(capacity).unwrap_or(i64::MAX));

        let mut evicted = Vec::new();
        if excess > 0 {
            let mut stmt =
                tx.prepare("SELECT seq, identity FROM enrolled_faces ORDER BY seq ASC LIMIT ?1")?;
            let oldest = stmt
                .query_map(params![excess], |row| {
                    Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            for (seq, identity) in oldest {
                tx.execute("DELETE FROM enrolled_faces WHERE seq = ?1", params![seq])?;
                tracing::debug!(identity = %identity, seq, "evicted oldest enrolled record");
                evicted.push(identity);
            }
        }
        tx.commit()?;
        Ok(evicted)
    }

    fn len(&self) -> Result<usize, StoreError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM enrolled_faces", [], |row| row.get(0))?;
        usize::try_from(count).map_err(|_| StoreError::CountOverflow(count))
    }

    fn evict_oldest(&mut self) -> Result<Option<String>, StoreError> {
        let tx = self.conn.transaction()?;
        let oldest: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, identity FROM enrolled_faces ORDER BY seq ASC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((seq, identity)) = oldest else {
            return Ok(None);
        };
        tx.execute("DELETE FROM enrolled_faces WHERE seq = ?1", params![seq])?;
        tx.commit()?;

        tracing::debug!(identity = %identity, seq, "evicted oldest enrolled record");
        Ok(Some(identity))
    }

    fn remove_identity(&mut self, identity: &str) -> Result<usize, StoreError> {
        let removed = self
            .conn
            .execute("DELETE FROM enrolled_faces WHERE identity = ?1", params![identity])?;
        tracing::debug!(identity, removed, "removed identity from store");
        Ok(removed)
    }

    fn snapshot(&self, group: Option<&str>) -> Result<Vec<EnrolledRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SELECT_COLUMNS} FROM enrolled_faces
             WHERE ?1 IS NULL OR grp = ?1
             ORDER BY seq ASC"
        ))?;
        let raw = stmt
            .query_map(params![group], RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut records = Vec::with_capacity(raw.len());
        for row in raw {
            let (seq, identity) = (row.seq, row.identity.clone());
            match row.decode() {
                Ok(record) => records.push(record),
                Err(reason) => {
                    tracing::warn!(
                        seq,
                        identity = %identity,
                        %reason,
                        "skipping malformed enrolled record"
                    );
                }
            }
        }
        Ok(records)
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        let removed = self.conn.execute("DELETE FROM enrolled_faces", [])?;
        tracing::info!(removed, "cleared enrollment store");
        Ok(())
    }
}
