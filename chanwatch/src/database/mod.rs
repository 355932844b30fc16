//! Database module for channel crawl state.
//!
//! This module provides SQLite-based persistent storage for:
//! - Channels, their source URLs and their opaque settings blobs
//! - Discovered videos and their download status
//! - The process singleton lock
//!
//! Settings blobs are only ever mutated through the read-modify-write
//! protocol in [`settings_store`], which requires a per-channel
//! [`ChannelGuard`] from [`ChannelLocks`].

mod channel;
mod channel_lock;
mod models;
mod program_lock;
mod schema;
mod settings_store;
mod video;

pub use channel_lock::{ChannelGuard, ChannelLocks};
pub use models::*;
pub use program_lock::STALE_HEARTBEAT_SECS;
pub use settings_store::{BlobColumn, ChannelPredicate};

use std::path::Path;
use std::sync::Arc;

use chanwatch_types::ValidationError;
use rusqlite::Connection;
use thiserror::Error;

/// Shared handle used by async tasks.
pub type DatabaseHandle = Arc<tokio::sync::Mutex<Database>>;

/// Database error types.
#[derive(Error, Debug)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Channel not found: {0}")]
    ChannelNotFound(String),

    #[error("Video not found: id={0}")]
    VideoNotFound(i64),

    #[error("Failed to (de)serialize {column} blob: {source}")]
    Blob {
        column: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("Mutation aborted: {0}")]
    MutationAborted(#[source] Box<dyn std::error::Error + Send + Sync>),

    #[error("Channel guard for id={guard} used on channel id={target}")]
    GuardMismatch { guard: i64, target: i64 },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Program already running: pid={pid} host={host} (heartbeat {age_secs}s ago)")]
    AlreadyRunning { pid: u32, host: String, age_secs: i64 },

    #[error("Program lock is no longer held by pid={0}")]
    LockLost(u32),
}

pub type Result<T> = std::result::Result<T, DatabaseError>;

/// Main database connection wrapper.
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Open or create a database at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        // URL and video rows cascade with their channel
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self { conn };
        db.initialize_schema()?;
        Ok(db)
    }

    /// Wrap into a shared async handle.
    pub fn into_handle(self) -> DatabaseHandle {
        Arc::new(tokio::sync::Mutex::new(self))
    }

    /// Initialize the database schema.
    fn initialize_schema(&self) -> Result<()> {
        self.conn.execute_batch(schema::SCHEMA_SQL)?;
        self.apply_migrations()?;
        Ok(())
    }

    /// Add a column to a table if it doesn't exist.
    fn add_column_if_not_exists(
        &self,
        table: &str,
        column: &str,
        column_type: &str,
    ) -> Result<()> {
        let mut stmt = self.conn.prepare(&format!("PRAGMA table_info({})", table))?;
        let column_exists = stmt
            .query_map([], |row| row.get::<_, String>(1))?
            .filter_map(|r| r.ok())
            .any(|name| name == column);

        if !column_exists {
            let sql = format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type);
            self.conn.execute(&sql, [])?;
            log::info!("Migration: Added column {} to table {}", column, table);
        }

        Ok(())
    }

    /// Apply pending migrations.
    fn apply_migrations(&self) -> Result<()> {
        // Databases created before post-processing args existed
        self.add_column_if_not_exists("channels", "postproc_args", "TEXT NOT NULL DEFAULT '{}'")?;
        // Databases created before per-URL login overrides existed
        self.add_column_if_not_exists("channel_urls", "login_url", "TEXT")?;
        self.add_column_if_not_exists("videos", "percentage", "REAL DEFAULT 0")?;
        Ok(())
    }

    #[cfg(test)]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
