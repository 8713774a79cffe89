//! SQLite bootstrap for the bundled backend.
//!
//! # Responsibility
//! - Open file or in-memory connections with the pragmas the backend needs.
//! - Apply schema migrations in order before any document row is touched.
//!
//! # Invariants
//! - Schema version is mirrored to `PRAGMA user_version`.
//! - A database newer than this binary is refused, never downgraded.

use thiserror::Error;

pub mod migrations;
mod open;

pub use open::{open_db, open_db_in_memory};

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error("database schema version {db_version} is newer than supported {latest_supported}")]
    UnsupportedSchemaVersion {
        db_version: u32,
        latest_supported: u32,
    },
}
