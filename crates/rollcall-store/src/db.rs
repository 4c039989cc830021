//! SQLite connection and schema.

use rusqlite::{Connection, ErrorCode};
use std::path::Path;
use std::sync::{Arc, Mutex};
use thiserror::Error;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS classrooms (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    name  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS students (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    roll_no       TEXT NOT NULL UNIQUE,
    name          TEXT NOT NULL,
    classroom_id  INTEGER NOT NULL REFERENCES classrooms(id) ON DELETE CASCADE,
    photo         TEXT
);
CREATE INDEX IF NOT EXISTS students_classroom ON students(classroom_id);

CREATE TABLE IF NOT EXISTS teachers (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    username       TEXT NOT NULL UNIQUE,
    employee_id    TEXT NOT NULL UNIQUE,
    department     TEXT NOT NULL,
    phone          TEXT NOT NULL DEFAULT '',
    qualification  TEXT NOT NULL DEFAULT '',
    created_at     TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS attendance_sessions (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    classroom_id  INTEGER NOT NULL REFERENCES classrooms(id) ON DELETE CASCADE,
    taken_by      TEXT NOT NULL,
    date          TEXT NOT NULL,
    start_time    TEXT NOT NULL,
    end_time      TEXT
);

CREATE TABLE IF NOT EXISTS attendance_records (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id  INTEGER NOT NULL REFERENCES attendance_sessions(id) ON DELETE CASCADE,
    student_id  INTEGER NOT NULL REFERENCES students(id) ON DELETE CASCADE,
    status      TEXT NOT NULL CHECK (status IN ('ABSENT', 'PRESENT')),
    updated_at  TEXT NOT NULL,
    UNIQUE (session_id, student_id)
);
"#;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: i64 },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("invalid status: {0}")]
    InvalidStatus(String),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("database lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: i64) -> Self {
        Self::NotFound { entity, id }
    }
}

/// Map a uniqueness violation to [`StoreError::Conflict`], anything else to `Sqlite`.
pub(crate) fn conflict_or(err: rusqlite::Error, what: impl FnOnce() -> String) -> StoreError {
    match &err {
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE =>
        {
            StoreError::Conflict(what())
        }
        _ => StoreError::Sqlite(err),
    }
}

/// Handle to the relational store. Clones share one connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (creating if needed) the database file and apply the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        tracing::debug!(journal_mode = %mode, "journal mode set");
        tracing::info!(path = %path.display(), "opened database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    /// Run `f` with exclusive use of the connection.
    pub(crate) fn with_conn<T>(
        &self,
        f: impl FnOnce(&mut Connection) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let mut conn = self.conn.lock().map_err(|_| StoreError::LockPoisoned)?;
        f(&mut conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_file_creates_parent_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("rollcall.db");
        Store::open(&path).unwrap();
        assert!(path.exists());
        // schema application is idempotent
        Store::open(&path).unwrap();
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let store = Store::open_in_memory().unwrap();
        let err = store
            .with_conn(|conn| {
                conn.execute(
                    "INSERT INTO students (roll_no, name, classroom_id) VALUES ('r1', 'n', 999)",
                    [],
                )?;
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::Sqlite(_)));
    }
}
