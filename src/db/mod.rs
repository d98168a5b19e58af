pub mod sqlite;

pub use sqlite::*;

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Migration failed at version {version}: {reason}")]
    MigrationFailed { version: i64, reason: String },
}

/// Handle to the alarm store, cloneable into background tasks.
///
/// Each caller opens its own short-lived connection: the poller loop,
/// the deferred escalation check, and user-action handlers all run on
/// separate tokio tasks, and rusqlite connections are Send but not Sync.
#[derive(Debug, Clone)]
pub struct DbHandle {
    path: PathBuf,
}

impl DbHandle {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a connection and run any pending migrations.
    pub fn open(&self) -> Result<Connection, DatabaseError> {
        sqlite::open_database(&self.path)
    }
}
