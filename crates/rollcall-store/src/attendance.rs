//! Attendance sessions and the per-student records inside them.
//!
//! A session is opened for a classroom, every student in that classroom is
//! seeded as absent, and recognition events promote records to present. A
//! record never moves from present back to absent except through
//! [`SessionController::override_status`].

use crate::db::{Store, StoreError};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Status {
    Absent,
    Present,
}

impl Status {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Absent => "ABSENT",
            Self::Present => "PRESENT",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ABSENT" => Ok(Self::Absent),
            "PRESENT" => Ok(Self::Present),
            other => Err(StoreError::InvalidStatus(other.to_string())),
        }
    }
}

impl ToSql for Status {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for Status {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        let text = value.as_str()?;
        text.parse().map_err(|e: StoreError| FromSqlError::Other(Box::new(e)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceSession {
    pub id: i64,
    pub classroom_id: i64,
    pub taken_by: String,
    pub date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl AttendanceSession {
    pub fn state(&self) -> SessionState {
        match self.end_time {
            Some(_) => SessionState::Closed,
            None => SessionState::Streaming,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AttendanceRecord {
    pub id: i64,
    pub session_id: i64,
    pub student_id: i64,
    pub status: Status,
    pub updated_at: DateTime<Utc>,
}

/// A present record as shown in the live status poll. `id` is the record id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PresentStudent {
    pub id: i64,
    pub roll_no: String,
    pub name: String,
}

/// What a recognition event did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Promotion {
    /// No record existed; one was created as present.
    Created,
    /// An absent record became present.
    Promoted,
    AlreadyPresent,
}

const SESSION_COLUMNS: &str = "id, classroom_id, taken_by, date, start_time, end_time";

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceSession> {
    Ok(AttendanceSession {
        id: row.get(0)?,
        classroom_id: row.get(1)?,
        taken_by: row.get(2)?,
        date: row.get(3)?,
        start_time: row.get(4)?,
        end_time: row.get(5)?,
    })
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    Ok(AttendanceRecord {
        id: row.get(0)?,
        session_id: row.get(1)?,
        student_id: row.get(2)?,
        status: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// Lifecycle operations for attendance sessions.
#[derive(Clone)]
pub struct SessionController {
    store: Store,
}

impl SessionController {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Open a session for `classroom_id` and seed an absent record for every
    /// student currently in it.
    pub fn start(&self, classroom_id: i64, taken_by: &str) -> Result<AttendanceSession, StoreError> {
        let now = Utc::now();
        let session = self.store.with_conn(|conn| {
            let tx = conn.transaction()?;
            let exists: Option<i64> = tx
                .query_row("SELECT id FROM classrooms WHERE id = ?1", params![classroom_id], |r| r.get(0))
                .optional()?;
            if exists.is_none() {
                return Err(StoreError::not_found("classroom", classroom_id));
            }
            tx.execute(
                "INSERT INTO attendance_sessions (classroom_id, taken_by, date, start_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![classroom_id, taken_by, now.date_naive(), now],
            )?;
            let session = AttendanceSession {
                id: tx.last_insert_rowid(),
                classroom_id,
                taken_by: taken_by.to_string(),
                date: now.date_naive(),
                start_time: now,
                end_time: None,
            };
            seed_absences(&tx, session.id, classroom_id, now)?;
            tx.commit()?;
            Ok(session)
        })?;

        tracing::info!(session = session.id, classroom = classroom_id, taken_by, "attendance session started");
        Ok(session)
    }

    /// Record that `student_id` was seen in `session_id`.
    ///
    /// Creates the record as present when none exists, promotes an absent
    /// record, and leaves a present one alone. Idempotent under repeated calls.
    pub fn on_recognized(&self, session_id: i64, student_id: i64) -> Result<Promotion, StoreError> {
        let now = Utc::now();
        let outcome = self.store.with_conn(|conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let inserted = tx.execute(
                "INSERT INTO attendance_records (session_id, student_id, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT (session_id, student_id) DO NOTHING",
                params![session_id, student_id, Status::Present, now],
            )?;
            let outcome = if inserted == 1 {
                Promotion::Created
            } else {
                let promoted = tx.execute(
                    "UPDATE attendance_records SET status = ?3, updated_at = ?4
                     WHERE session_id = ?1 AND student_id = ?2 AND status <> ?3",
                    params![session_id, student_id, Status::Present, now],
                )?;
                if promoted == 1 {
                    Promotion::Promoted
                } else {
                    Promotion::AlreadyPresent
                }
            };
            tx.commit()?;
            Ok(outcome)
        })?;

        if outcome != Promotion::AlreadyPresent {
            tracing::info!(session = session_id, student = student_id, ?outcome, "marked present");
        }
        Ok(outcome)
    }

    /// Set `end_time`. Closing an already closed session keeps the first end time.
    pub fn close(&self, session_id: i64) -> Result<AttendanceSession, StoreError> {
        let now = Utc::now();
        self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE attendance_sessions SET end_time = ?2 WHERE id = ?1 AND end_time IS NULL",
                params![session_id, now],
            )?;
            if changed == 0 {
                tracing::debug!(session = session_id, "session already closed or missing");
            }
            Ok(())
        })?;
        let session = self.session(session_id)?;
        tracing::info!(session = session_id, "attendance session closed");
        Ok(session)
    }

    /// Manually set a record's status, in either direction.
    pub fn override_status(&self, record_id: i64, status: Status) -> Result<AttendanceRecord, StoreError> {
        let now = Utc::now();
        let record = self.store.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE attendance_records SET status = ?2, updated_at = ?3 WHERE id = ?1",
                params![record_id, status, now],
            )?;
            if changed == 0 {
                return Err(StoreError::not_found("record", record_id));
            }
            conn.query_row(
                "SELECT id, session_id, student_id, status, updated_at FROM attendance_records WHERE id = ?1",
                params![record_id],
                record_from_row,
            )
            .map_err(StoreError::from)
        })?;
        tracing::info!(record = record_id, status = %status, "record status overridden");
        Ok(record)
    }

    pub fn session(&self, session_id: i64) -> Result<AttendanceSession, StoreError> {
        self.store.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM attendance_sessions WHERE id = ?1"),
                params![session_id],
                session_from_row,
            )
            .optional()?
            .ok_or(StoreError::not_found("session", session_id))
        })
    }

    pub fn is_closed(&self, session_id: i64) -> Result<bool, StoreError> {
        Ok(self.session(session_id)?.state() == SessionState::Closed)
    }

    /// Present records of a session, in record order.
    pub fn present_students(&self, session_id: i64) -> Result<Vec<PresentStudent>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT r.id, s.roll_no, s.name
                 FROM attendance_records r JOIN students s ON s.id = r.student_id
                 WHERE r.session_id = ?1 AND r.status = ?2
                 ORDER BY r.id",
            )?;
            let rows = stmt.query_map(params![session_id, Status::Present], |row| {
                Ok(PresentStudent { id: row.get(0)?, roll_no: row.get(1)?, name: row.get(2)? })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    pub fn records(&self, session_id: i64) -> Result<Vec<AttendanceRecord>, StoreError> {
        self.store.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, session_id, student_id, status, updated_at
                 FROM attendance_records WHERE session_id = ?1 ORDER BY id",
            )?;
            let rows = stmt.query_map(params![session_id], record_from_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }
}

/// Insert an absent record for each student of the classroom that has none yet.
fn seed_absences(
    conn: &rusqlite::Connection,
    session_id: i64,
    classroom_id: i64,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let seeded = conn.execute(
        "INSERT INTO attendance_records (session_id, student_id, status, updated_at)
         SELECT ?1, id, ?3, ?4 FROM students WHERE classroom_id = ?2
         ON CONFLICT (session_id, student_id) DO NOTHING",
        params![session_id, classroom_id, Status::Absent, now],
    )?;
    tracing::debug!(session = session_id, seeded, "seeded absent records");
    Ok(seeded)
}
