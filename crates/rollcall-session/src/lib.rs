//! rollcall-session — Attendance check-in session.
//!
//! Runs the matcher and the enrollment store on a dedicated worker thread.
//! Async callers (capture loops polling a camera, UI handlers) talk to it
//! through a cloneable [`SessionHandle`]; each check-in matches against a
//! fresh snapshot of the enrolled set.

pub mod config;
pub mod session;

pub use config::{Config, ConfigError};
pub use session::{
    spawn_from_config, spawn_session, AttendanceMark, CheckInOutcome, EnrollOutcome,
    SessionError, SessionHandle,
};
