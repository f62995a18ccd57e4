//! SQLite-backed face store.

mod schema;

pub mod dedup;
pub mod search;

pub use dedup::{DuplicatePair, IngestOutcome};

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection};

use schema::{MIGRATIONS, SCHEMA_VERSION};

/// Errors surfaced by the store itself, as opposed to per-image problems
/// that ingestion logs and skips.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("database lock poisoned: {0}")]
    Lock(String),

    #[error("database schema version {found} is newer than supported version {supported}")]
    SchemaVersion { found: i32, supported: i32 },
}

/// A stored face. Records are immutable; changing one means deleting it
/// and inserting a replacement, which gets a fresh id.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceRecord {
    pub id: i64,
    pub name: String,
    pub image_path: String,
    pub embedding: Vec<f32>,
    pub age: String,
    pub image_hash: String,
    /// Milliseconds since the Unix epoch, set at insertion.
    pub timestamp: i64,
}

/// A face waiting to be inserted. Optional fields fall back to empty
/// strings, and the timestamp to the insertion time.
#[derive(Debug, Clone)]
pub struct NewFaceRecord {
    pub name: String,
    pub image_path: String,
    pub embedding: Vec<f32>,
    pub age: String,
    pub image_hash: String,
    pub timestamp: Option<i64>,
}

impl NewFaceRecord {
    pub fn new(
        name: impl Into<String>,
        image_path: impl Into<String>,
        embedding: Vec<f32>,
    ) -> Self {
        Self {
            name: name.into(),
            image_path: image_path.into(),
            embedding,
            age: String::new(),
            image_hash: String::new(),
            timestamp: None,
        }
    }

    pub fn with_age(mut self, age: impl Into<String>) -> Self {
        self.age = age.into();
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.image_hash = hash.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Face database handle. Cheap to share behind an `Arc`; all access goes
/// through an internal mutex so writes are serialized.
pub struct FaceStore {
    conn: Mutex<Connection>,
}

impl FaceStore {
    /// Open (or create) the database at `path` and bring its schema up
    /// to date.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut conn = Connection::open(path)?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, mainly for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let mut conn = Connection::open_in_memory()?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub(crate) fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|e| StoreError::Lock(e.to_string()))
    }

    /// Insert a record unconditionally and return its id. Duplicate
    /// checking is the caller's concern; see
    /// [`insert_unless_duplicate`](FaceStore::insert_unless_duplicate).
    pub fn insert(&self, record: &NewFaceRecord) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        execute_insert(&conn, record)
    }

    pub fn get_by_id(&self, id: i64) -> Result<Option<FaceRecord>, StoreError> {
        let conn = self.lock()?;
        query_get_by_id(&conn, id)
    }

    /// All records in ascending id order, i.e. insertion order.
    pub fn list_all(&self) -> Result<Vec<FaceRecord>, StoreError> {
        let conn = self.lock()?;
        query_list_all(&conn)
    }

    pub fn exists_by_path(&self, path: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        query_exists_by_path(&conn, path)
    }

    /// Whether any record carries this perceptual hash. The empty hash
    /// means "not hashed" and never matches anything.
    pub fn exists_by_hash(&self, hash: &str) -> Result<bool, StoreError> {
        if hash.is_empty() {
            return Ok(false);
        }
        let conn = self.lock()?;
        query_exists_by_hash(&conn, hash)
    }

    pub fn count(&self) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM faces", [], |row| row.get(0))?;
        Ok(count)
    }

    pub fn count_by_name(&self, name: &str) -> Result<i64, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM faces WHERE name = ?",
            [name],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Delete by id. Returns whether a row was actually removed.
    pub fn delete_by_id(&self, id: i64) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let rows = conn.execute("DELETE FROM faces WHERE id = ?", [id])?;
        Ok(rows > 0)
    }

    pub fn delete(&self, record: &FaceRecord) -> Result<bool, StoreError> {
        self.delete_by_id(record.id)
    }

    /// Remove every record. Ids are not reused afterwards; the sequence
    /// keeps climbing.
    pub fn clear(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM faces", [])?;
        tracing::debug!("cleared face store");
        Ok(())
    }
}

fn run_migrations(conn: &mut Connection) -> Result<(), StoreError> {
    let current: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > SCHEMA_VERSION {
        return Err(StoreError::SchemaVersion {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }

    for version in current..SCHEMA_VERSION {
        let tx = conn.transaction()?;
        tx.execute_batch(MIGRATIONS[version as usize])?;
        tx.pragma_update(None, "user_version", version + 1)?;
        tx.commit()?;
        tracing::debug!(from = version, to = version + 1, "applied schema migration");
    }

    Ok(())
}

const SELECT_COLUMNS: &str = "id, name, image_path, embedding, age, image_hash, timestamp";

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<FaceRecord> {
    let bytes: Vec<u8> = row.get(3)?;
    Ok(FaceRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        image_path: row.get(2)?,
        embedding: bytes_to_embedding(&bytes),
        age: row.get(4)?,
        image_hash: row.get(5)?,
        timestamp: row.get(6)?,
    })
}

// Query helpers take a plain connection so the duplicate-aware insert can
// run them inside its own transaction.

pub(crate) fn execute_insert(
    conn: &Connection,
    record: &NewFaceRecord,
) -> Result<i64, StoreError> {
    let timestamp = record
        .timestamp
        .unwrap_or_else(|| Utc::now().timestamp_millis());
    conn.execute(
        r#"
        INSERT INTO faces (name, image_path, embedding, age, image_hash, timestamp)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
        params![
            record.name,
            record.image_path,
            embedding_to_bytes(&record.embedding),
            record.age,
            record.image_hash,
            timestamp,
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub(crate) fn query_get_by_id(conn: &Connection, id: i64) -> Result<Option<FaceRecord>, StoreError> {
    let result = conn.query_row(
        &format!("SELECT {SELECT_COLUMNS} FROM faces WHERE id = ?"),
        [id],
        row_to_record,
    );

    match result {
        Ok(record) => Ok(Some(record)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn query_list_all(conn: &Connection) -> Result<Vec<FaceRecord>, StoreError> {
    let mut stmt =
        conn.prepare(&format!("SELECT {SELECT_COLUMNS} FROM faces ORDER BY id ASC"))?;

    let records = stmt
        .query_map([], row_to_record)?
        .filter_map(|r| r.ok())
        .collect();

    Ok(records)
}

pub(crate) fn query_exists_by_path(conn: &Connection, path: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM faces WHERE image_path = ?",
        [path],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

pub(crate) fn query_exists_by_hash(conn: &Connection, hash: &str) -> Result<bool, StoreError> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM faces WHERE image_hash = ?",
        [hash],
        |row| row.get(0),
    )?;
    Ok(count > 0)
}

/// Convert f32 slice to bytes for storage
pub(crate) fn embedding_to_bytes(embedding: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(embedding.len() * 4);
    for &val in embedding {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

/// Convert bytes back to f32 vector
pub(crate) fn bytes_to_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| {
            let arr: [u8; 4] = chunk.try_into().unwrap();
            f32::from_le_bytes(arr)
        })
        .collect()
}
