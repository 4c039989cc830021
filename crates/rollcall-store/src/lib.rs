//! rollcall-store: Persistent state for attendance.
//!
//! SQLite holds the roster and attendance sessions; embedding vectors live
//! as `.npy` files beside the photo media. The [`SessionController`] owns
//! session lifecycle and record promotion, and the [`EmbeddingBuilder`]
//! turns student photos into stored embeddings.

pub mod attendance;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod enroll;
pub mod report;
pub mod roster;

pub use attendance::{AttendanceRecord, AttendanceSession, PresentStudent, Promotion, SessionController, SessionState, Status};
pub use config::{Config, ConfigError};
pub use db::{Store, StoreError};
pub use embeddings::{EmbeddingError, EmbeddingStore};
pub use enroll::{
    attach_photo, edit_student, enroll_student, register_student, remove_student, revise_student, store_photo, BuildError,
    EmbeddingBuilder,
};
pub use report::{RecordLine, SessionDetail, SessionSummary};
pub use roster::{Classroom, NewStudent, NewTeacher, Student, StudentUpdate, Teacher, TeacherUpdate};
