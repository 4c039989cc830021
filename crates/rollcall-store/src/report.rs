//! Read-only summaries of past sessions.

use crate::attendance::{AttendanceSession, SessionController, Status};
use crate::db::StoreError;
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::params;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    pub id: i64,
    pub classroom_id: i64,
    pub classroom: String,
    pub taken_by: String,
    pub date: NaiveDate,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub present: u32,
    pub absent: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecordLine {
    pub record_id: i64,
    pub student_id: i64,
    pub roll_no: String,
    pub name: String,
    pub status: Status,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionDetail {
    pub session: AttendanceSession,
    pub classroom: String,
    pub present: u32,
    pub absent: u32,
    pub records: Vec<RecordLine>,
}

impl SessionController {
    /// All sessions, newest first.
    pub fn session_summaries(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.store().with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT s.id, s.classroom_id, c.name, s.taken_by, s.date, s.start_time, s.end_time,
                        COALESCE(SUM(r.status = 'PRESENT'), 0),
                        COALESCE(SUM(r.status = 'ABSENT'), 0)
                 FROM attendance_sessions s
                 JOIN classrooms c ON c.id = s.classroom_id
                 LEFT JOIN attendance_records r ON r.session_id = s.id
                 GROUP BY s.id
                 ORDER BY s.date DESC, s.start_time DESC, s.id DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok(SessionSummary {
                    id: row.get(0)?,
                    classroom_id: row.get(1)?,
                    classroom: row.get(2)?,
                    taken_by: row.get(3)?,
                    date: row.get(4)?,
                    start_time: row.get(5)?,
                    end_time: row.get(6)?,
                    present: row.get(7)?,
                    absent: row.get(8)?,
                })
            })?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// One session with every record, ordered by roll number.
    pub fn session_detail(&self, session_id: i64) -> Result<SessionDetail, StoreError> {
        let session = self.session(session_id)?;
        let (classroom, records) = self.store().with_conn(|conn| {
            let classroom: String = conn.query_row(
                "SELECT name FROM classrooms WHERE id = ?1",
                params![session.classroom_id],
                |row| row.get(0),
            )?;
            let mut stmt = conn.prepare(
                "SELECT r.id, s.id, s.roll_no, s.name, r.status
                 FROM attendance_records r JOIN students s ON s.id = r.student_id
                 WHERE r.session_id = ?1
                 ORDER BY s.roll_no",
            )?;
            let rows = stmt.query_map(params![session_id], |row| {
                Ok(RecordLine {
                    record_id: row.get(0)?,
                    student_id: row.get(1)?,
                    roll_no: row.get(2)?,
                    name: row.get(3)?,
                    status: row.get(4)?,
                })
            })?;
            let records: Vec<RecordLine> = rows.collect::<Result<_, _>>()?;
            Ok((classroom, records))
        })?;

        let present = records.iter().filter(|r| r.status == Status::Present).count() as u32;
        let absent = records.len() as u32 - present;
        Ok(SessionDetail { session, classroom, present, absent, records })
    }
}
