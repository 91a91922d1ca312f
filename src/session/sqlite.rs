//! SQLite-backed session store.
//!
//! Uses `rusqlite` with the `bundled` feature so no system SQLite
//! library is required.  All async trait methods are thin wrappers
//! around synchronous rusqlite calls executed under a `Mutex`.
//!
//! Several coordinator processes can share one database file; WAL mode
//! and a busy timeout keep concurrent writers from failing outright.

use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};

use super::store::{PartRecord, SessionRecord, SessionStore};

/// Current schema version. Bumped when migrations are added.
const SCHEMA_VERSION: i64 = 1;

/// Session store backed by a single SQLite database file.
pub struct SqliteSessionStore {
    /// The database connection, guarded by a mutex for Send + Sync.
    conn: Mutex<Connection>,
}

impl SqliteSessionStore {
    /// Open (or create) the database at `path` and initialize the schema.
    ///
    /// Passing `":memory:"` creates an in-memory database (useful for tests).
    pub fn new(path: &str) -> anyhow::Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.apply_pragmas()?;
        store.init_db()?;
        Ok(store)
    }

    fn apply_pragmas(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;
            ",
        )?;
        Ok(())
    }

    /// Create tables if they do not already exist.  Idempotent.
    fn init_db(&self) -> anyhow::Result<()> {
        let conn = self.conn.lock().expect("mutex poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS schema_version (
                version    INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upload_sessions (
                upload_id   TEXT PRIMARY KEY,
                bucket      TEXT NOT NULL,
                object_key  TEXT NOT NULL,
                created_at  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS upload_parts (
                upload_id    TEXT NOT NULL,
                part_number  INTEGER NOT NULL,
                etag         TEXT NOT NULL,
                size         INTEGER NOT NULL,
                uploaded_at  TEXT NOT NULL,

                PRIMARY KEY (upload_id, part_number),
                FOREIGN KEY (upload_id) REFERENCES upload_sessions(upload_id) ON DELETE CASCADE
            );
            ",
        )?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (?1, ?2)",
            params![SCHEMA_VERSION, super::store::now_iso8601()],
        )?;
        Ok(())
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRecord> {
        Ok(SessionRecord {
            upload_id: row.get(0)?,
            bucket: row.get(1)?,
            object_key: row.get(2)?,
            created_at: row.get(3)?,
        })
    }
}

impl SessionStore for SqliteSessionStore {
    fn create_session(
        &self,
        record: SessionRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let inserted = conn.execute(
                "INSERT OR IGNORE INTO upload_sessions (upload_id, bucket, object_key, created_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    record.upload_id,
                    record.bucket,
                    record.object_key,
                    record.created_at,
                ],
            )?;
            if inserted == 0 {
                return Err(anyhow::anyhow!(
                    "Session already exists: {}",
                    record.upload_id
                ));
            }
            Ok(())
        })
    }

    fn get_session(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Option<SessionRecord>>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let result = conn
                .query_row(
                    "SELECT upload_id, bucket, object_key, created_at
                     FROM upload_sessions WHERE upload_id = ?1",
                    params![upload_id],
                    Self::row_to_session,
                )
                .optional()?;
            Ok(result)
        })
    }

    fn put_part(
        &self,
        upload_id: &str,
        part: PartRecord,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // The foreign key rejects parts for sessions that do not exist.
            conn.execute(
                "INSERT OR REPLACE INTO upload_parts
                    (upload_id, part_number, etag, size, uploaded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    upload_id,
                    part.part_number,
                    part.etag,
                    part.size as i64,
                    part.uploaded_at,
                ],
            )?;
            Ok(())
        })
    }

    fn list_parts(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<PartRecord>>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT part_number, etag, size, uploaded_at
                 FROM upload_parts
                 WHERE upload_id = ?1
                 ORDER BY part_number",
            )?;
            let rows = stmt.query_map(params![upload_id], |row| {
                let size: i64 = row.get(2)?;
                Ok(PartRecord {
                    part_number: row.get(0)?,
                    etag: row.get(1)?,
                    size: size as u64,
                    uploaded_at: row.get(3)?,
                })
            })?;
            let mut parts = Vec::new();
            for row in rows {
                parts.push(row?);
            }
            Ok(parts)
        })
    }

    fn delete_session(
        &self,
        upload_id: &str,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<bool>> + Send + '_>> {
        let upload_id = upload_id.to_string();
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            // Foreign key cascade deletes the parts too.
            let deleted = conn.execute(
                "DELETE FROM upload_sessions WHERE upload_id = ?1",
                params![upload_id],
            )?;
            Ok(deleted > 0)
        })
    }

    fn list_sessions(
        &self,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<Vec<SessionRecord>>> + Send + '_>> {
        Box::pin(async move {
            let conn = self.conn.lock().expect("mutex poisoned");
            let mut stmt = conn.prepare(
                "SELECT upload_id, bucket, object_key, created_at
                 FROM upload_sessions ORDER BY upload_id",
            )?;
            let rows = stmt.query_map([], Self::row_to_session)?;
            let mut sessions = Vec::new();
            for row in rows {
                sessions.push(row?);
            }
            Ok(sessions)
        })
    }
}
