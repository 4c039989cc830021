//! Classrooms, students, and teachers.

use crate::db::{conflict_or, Store, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classroom {
    pub id: i64,
    pub name: String,
}

/// An enrolled subject. `photo` is relative to the media root.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Student {
    pub id: i64,
    pub roll_no: String,
    pub name: String,
    pub classroom_id: i64,
    pub photo: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewStudent {
    pub roll_no: String,
    pub name: String,
    pub classroom_id: i64,
    pub photo: Option<String>,
}

/// Partial update; `None` fields keep their current value.
#[derive(Debug, Clone, Default)]
pub struct StudentUpdate {
    pub roll_no: Option<String>,
    pub name: Option<String>,
    pub classroom_id: Option<i64>,
    pub photo: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Teacher {
    pub id: i64,
    pub username: String,
    pub employee_id: String,
    pub department: String,
    pub phone: String,
    pub qualification: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTeacher {
    pub username: String,
    pub employee_id: String,
    pub department: String,
    pub phone: String,
    pub qualification: String,
}

#[derive(Debug, Clone, Default)]
pub struct TeacherUpdate {
    pub username: Option<String>,
    pub employee_id: Option<String>,
    pub department: Option<String>,
    pub phone: Option<String>,
    pub qualification: Option<String>,
}

const STUDENT_COLUMNS: &str = "id, roll_no, name, classroom_id, photo";

fn student_from_row(row: &Row<'_>) -> rusqlite::Result<Student> {
    Ok(Student {
        id: row.get(0)?,
        roll_no: row.get(1)?,
        name: row.get(2)?,
        classroom_id: row.get(3)?,
        photo: row.get(4)?,
    })
}

const TEACHER_COLUMNS: &str = "id, username, employee_id, department, phone, qualification, created_at";

fn teacher_from_row(row: &Row<'_>) -> rusqlite::Result<Teacher> {
    Ok(Teacher {
        id: row.get(0)?,
        username: row.get(1)?,
        employee_id: row.get(2)?,
        department: row.get(3)?,
        phone: row.get(4)?,
        qualification: row.get(5)?,
        created_at: row.get(6)?,
    })
}

impl Store {
    pub fn create_classroom(&self, name: &str) -> Result<Classroom, StoreError> {
        self.with_conn(|conn| {
            conn.execute("INSERT INTO classrooms (name) VALUES (?1)", params![name])?;
            Ok(Classroom { id: conn.last_insert_rowid(), name: name.to_string() })
        })
    }

    pub fn get_classroom(&self, id: i64) -> Result<Classroom, StoreError> {
        self.with_conn(|conn| {
            conn.query_row("SELECT id, name FROM classrooms WHERE id = ?1", params![id], |row| {
                Ok(Classroom { id: row.get(0)?, name: row.get(1)? })
            })
            .optional()?
            .ok_or(StoreError::not_found("classroom", id))
        })
    }

    pub fn list_classrooms(&self) -> Result<Vec<Classroom>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT id, name FROM classrooms ORDER BY id")?;
            let rows = stmt.query_map([], |row| Ok(Classroom { id: row.get(0)?, name: row.get(1)? }))?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    pub fn rename_classroom(&self, id: i64, name: &str) -> Result<Classroom, StoreError> {
        self.with_conn(|conn| {
            let changed = conn.execute("UPDATE classrooms SET name = ?2 WHERE id = ?1", params![id, name])?;
            if changed == 0 {
                return Err(StoreError::not_found("classroom", id));
            }
            Ok(Classroom { id, name: name.to_string() })
        })
    }

    /// Delete a classroom together with its students and sessions.
    pub fn delete_classroom(&self, id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| match conn.execute("DELETE FROM classrooms WHERE id = ?1", params![id])? {
            0 => Err(StoreError::not_found("classroom", id)),
            _ => Ok(()),
        })
    }

    pub fn create_student(&self, new: &NewStudent) -> Result<Student, StoreError> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO students (roll_no, name, classroom_id, photo) VALUES (?1, ?2, ?3, ?4)",
                params![new.roll_no, new.name, new.classroom_id, new.photo],
            )
            .map_err(|e| conflict_or(e, || format!("roll number {} already exists", new.roll_no)))?;
            Ok(Student {
                id: conn.last_insert_rowid(),
                roll_no: new.roll_no.clone(),
                name: new.name.clone(),
                classroom_id: new.classroom_id,
                photo: new.photo.clone(),
            })
        })
    }

    pub fn update_student(&self, id: i64, update: &StudentUpdate) -> Result<Student, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current = tx
                .query_row(
                    &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
                    params![id],
                    student_from_row,
                )
                .optional()?
                .ok_or(StoreError::not_found("student", id))?;

            let next = Student {
                id,
                roll_no: update.roll_no.clone().unwrap_or(current.roll_no),
                name: update.name.clone().unwrap_or(current.name),
                classroom_id: update.classroom_id.unwrap_or(current.classroom_id),
                photo: update.photo.clone().or(current.photo),
            };
            tx.execute(
                "UPDATE students SET roll_no = ?2, name = ?3, classroom_id = ?4, photo = ?5 WHERE id = ?1",
                params![id, next.roll_no, next.name, next.classroom_id, next.photo],
            )
            .map_err(|e| conflict_or(e, || format!("roll number {} already exists", next.roll_no)))?;
            tx.commit()?;
            Ok(next)
        })
    }

    pub fn get_student(&self, id: i64) -> Result<Student, StoreError> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {STUDENT_COLUMNS} FROM students WHERE id = ?1"),
                params![id],
                student_from_row,
            )
            .optional()?
            .ok_or(StoreError::not_found("student", id))
        })
    }

    /// Every student, in id order.
    pub fn list_students(&self) -> Result<Vec<Student>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!("SELECT {STUDENT_COLUMNS} FROM students ORDER BY id"))?;
            let rows = stmt.query_map([], student_from_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    pub fn list_students_in_classroom(&self, classroom_id: i64) -> Result<Vec<Student>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {STUDENT_COLUMNS} FROM students WHERE classroom_id = ?1 ORDER BY id"
            ))?;
            let rows = stmt.query_map(params![classroom_id], student_from_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Delete a student row. Its embedding file is not touched.
    pub fn delete_student(&self, id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| match conn.execute("DELETE FROM students WHERE id = ?1", params![id])? {
            0 => Err(StoreError::not_found("student", id)),
            _ => Ok(()),
        })
    }

    pub fn create_teacher(&self, new: &NewTeacher) -> Result<Teacher, StoreError> {
        let created_at = Utc::now();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO teachers (username, employee_id, department, phone, qualification, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![new.username, new.employee_id, new.department, new.phone, new.qualification, created_at],
            )
            .map_err(|e| conflict_or(e, || format!("teacher {} or employee id {} already exists", new.username, new.employee_id)))?;
            Ok(Teacher {
                id: conn.last_insert_rowid(),
                username: new.username.clone(),
                employee_id: new.employee_id.clone(),
                department: new.department.clone(),
                phone: new.phone.clone(),
                qualification: new.qualification.clone(),
                created_at,
            })
        })
    }

    /// Teachers, newest first.
    pub fn list_teachers(&self) -> Result<Vec<Teacher>, StoreError> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare(&format!("SELECT {TEACHER_COLUMNS} FROM teachers ORDER BY created_at DESC, id DESC"))?;
            let rows = stmt.query_map([], teacher_from_row)?;
            Ok(rows.collect::<Result<_, _>>()?)
        })
    }

    /// Partial update; `created_at` never changes.
    pub fn update_teacher(&self, id: i64, update: &TeacherUpdate) -> Result<Teacher, StoreError> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current = tx
                .query_row(&format!("SELECT {TEACHER_COLUMNS} FROM teachers WHERE id = ?1"), params![id], teacher_from_row)
                .optional()?
                .ok_or(StoreError::not_found("teacher", id))?;

            let next = Teacher {
                id,
                username: update.username.clone().unwrap_or(current.username),
                employee_id: update.employee_id.clone().unwrap_or(current.employee_id),
                department: update.department.clone().unwrap_or(current.department),
                phone: update.phone.clone().unwrap_or(current.phone),
                qualification: update.qualification.clone().unwrap_or(current.qualification),
                created_at: current.created_at,
            };
            tx.execute(
                "UPDATE teachers SET username = ?2, employee_id = ?3, department = ?4, phone = ?5, qualification = ?6
                 WHERE id = ?1",
                params![id, next.username, next.employee_id, next.department, next.phone, next.qualification],
            )
            .map_err(|e| {
                conflict_or(e, || format!("teacher {} or employee id {} already exists", next.username, next.employee_id))
            })?;
            tx.commit()?;
            Ok(next)
        })
    }

    pub fn delete_teacher(&self, id: i64) -> Result<(), StoreError> {
        self.with_conn(|conn| match conn.execute("DELETE FROM teachers WHERE id = ?1", params![id])? {
            0 => Err(StoreError::not_found("teacher", id)),
            _ => Ok(()),
        })
    }
}
