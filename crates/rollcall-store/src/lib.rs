//! rollcall-store — Durable enrollment storage.
//!
//! Implements [`rollcall_core::EnrollmentStore`] on top of SQLite so the
//! enrolled set survives restarts while keeping oldest-first retention.

pub mod sqlite;

pub use sqlite::{SqliteStore, StoreError};
