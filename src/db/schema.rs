//! Database schema and migration history.
//!
//! `MIGRATIONS[n]` upgrades a database at version `n` to version `n + 1`.
//! Entries are append-only; editing an existing step would desync any
//! database already stamped past it.

/// Schema version the code expects. Databases stamped higher than this
/// were written by a newer build and are refused.
pub const SCHEMA_VERSION: i32 = MIGRATIONS.len() as i32;

pub const MIGRATIONS: &[&str] = &[
    // v1: base table
    r#"
    CREATE TABLE IF NOT EXISTS faces (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        image_path TEXT NOT NULL,
        embedding BLOB NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_faces_image_path ON faces(image_path);
    CREATE INDEX IF NOT EXISTS idx_faces_name ON faces(name);
    "#,
    // v2: free-form age annotation
    r#"
    ALTER TABLE faces ADD COLUMN age TEXT NOT NULL DEFAULT '';
    "#,
    // v3: perceptual hash and insertion timestamp, via table rebuild so the
    // column order stays stable for positional reads
    r#"
    CREATE TABLE faces_new (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        image_path TEXT NOT NULL,
        embedding BLOB NOT NULL,
        age TEXT NOT NULL DEFAULT '',
        image_hash TEXT NOT NULL DEFAULT '',
        timestamp INTEGER NOT NULL DEFAULT 0
    );

    INSERT INTO faces_new (id, name, image_path, embedding, age)
        SELECT id, name, image_path, embedding, age FROM faces;

    DROP TABLE faces;
    ALTER TABLE faces_new RENAME TO faces;

    CREATE INDEX IF NOT EXISTS idx_faces_image_path ON faces(image_path);
    CREATE INDEX IF NOT EXISTS idx_faces_name ON faces(name);
    CREATE INDEX IF NOT EXISTS idx_faces_image_hash ON faces(image_hash);
    "#,
];
