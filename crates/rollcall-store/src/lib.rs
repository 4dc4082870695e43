//! rollcall-store — SQLite persistence for the face gallery and attendance log.
//!
//! Mirrors the two tables the recognition flow depends on,
//! `student_face_embeddings` and `attendance` (unique on `(student_id, date)`),
//! plus a `students` roster supplying display names.

mod attendance;
mod db;
mod gallery;

pub use attendance::AttendanceEntry;
pub use db::Store;
pub use gallery::Student;
