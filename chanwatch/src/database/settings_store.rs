//! Read-modify-write protocol over the opaque per-channel blobs.
//!
//! An update reads the current blob for the row selected by a predicate,
//! deserializes it, hands a mutable reference to a caller-supplied mutation,
//! and writes the result back with the same predicate. The mutation must not
//! perform I/O; if it returns an error nothing is written.
//!
//! There is no content versioning. Two writers racing on the same row would
//! lose an update, which is why every entry point takes a [`ChannelGuard`].

use rusqlite::types::Value;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{ChannelGuard, Database, DatabaseError, Result};
use chanwatch_types::{ChannelSettings, PostProcessArgs};

/// Which blob column of `channels` to operate on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobColumn {
    Settings,
    PostProcessArgs,
}

impl BlobColumn {
    fn column(&self) -> &'static str {
        match self {
            BlobColumn::Settings => "settings",
            BlobColumn::PostProcessArgs => "postproc_args",
        }
    }
}

/// Row selector for blob reads and writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPredicate {
    Id(i64),
    Name(String),
}

impl ChannelPredicate {
    fn clause(&self) -> (&'static str, Value) {
        match self {
            ChannelPredicate::Id(id) => ("id = ?1", Value::Integer(*id)),
            ChannelPredicate::Name(name) => ("name = ?1", Value::Text(name.clone())),
        }
    }
}

impl std::fmt::Display for ChannelPredicate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelPredicate::Id(id) => write!(f, "id={}", id),
            ChannelPredicate::Name(name) => write!(f, "name={}", name),
        }
    }
}

impl Database {
    /// Read a blob exactly as stored.
    pub fn read_blob_raw(&self, column: BlobColumn, predicate: &ChannelPredicate) -> Result<String> {
        let (clause, value) = predicate.clause();
        let sql = format!("SELECT {} FROM channels WHERE {}", column.column(), clause);

        match self.conn.query_row(&sql, [value], |row| row.get::<_, Option<String>>(0)) {
            Ok(raw) => Ok(raw.unwrap_or_default()),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(DatabaseError::ChannelNotFound(predicate.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read and deserialize a blob.
    pub fn read_blob<T>(&self, column: BlobColumn, predicate: &ChannelPredicate) -> Result<T>
    where
        T: DeserializeOwned + Default,
    {
        let raw = self.read_blob_raw(column, predicate)?;
        if raw.trim().is_empty() {
            return Ok(T::default());
        }
        serde_json::from_str(&raw).map_err(|e| DatabaseError::Blob {
            column: column.column(),
            source: e,
        })
    }

    /// Apply a pure mutation to a blob and persist the result.
    ///
    /// The guard must belong to the channel the predicate selects. Returns
    /// the value that was written.
    pub fn update_blob<T, F, E>(
        &self,
        guard: &ChannelGuard,
        column: BlobColumn,
        predicate: &ChannelPredicate,
        mutate: F,
    ) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T) -> std::result::Result<(), E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let target = self.resolve_channel_id(predicate)?;
        if target != guard.channel_id() {
            return Err(DatabaseError::GuardMismatch {
                guard: guard.channel_id(),
                target,
            });
        }

        let mut value: T = self.read_blob(column, predicate)?;
        mutate(&mut value).map_err(|e| DatabaseError::MutationAborted(e.into()))?;

        let serialized = serde_json::to_string(&value).map_err(|e| DatabaseError::Blob {
            column: column.column(),
            source: e,
        })?;

        let (clause, key) = predicate.clause();
        let sql = format!(
            "UPDATE channels SET {} = ?2 WHERE {}",
            column.column(),
            clause
        );
        let n = self
            .conn
            .execute(&sql, rusqlite::params![key, serialized])?;
        if n == 0 {
            return Err(DatabaseError::ChannelNotFound(predicate.to_string()));
        }

        Ok(value)
    }

    /// Mutate the crawl settings of the guarded channel.
    pub fn update_channel_settings<F, E>(&self, guard: &ChannelGuard, mutate: F) -> Result<ChannelSettings>
    where
        F: FnOnce(&mut ChannelSettings) -> std::result::Result<(), E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.update_blob(
            guard,
            BlobColumn::Settings,
            &ChannelPredicate::Id(guard.channel_id()),
            mutate,
        )
    }

    /// Mutate the post-processing arguments of the guarded channel.
    pub fn update_post_process_args<F, E>(
        &self,
        guard: &ChannelGuard,
        mutate: F,
    ) -> Result<PostProcessArgs>
    where
        F: FnOnce(&mut PostProcessArgs) -> std::result::Result<(), E>,
        E: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        self.update_blob(
            guard,
            BlobColumn::PostProcessArgs,
            &ChannelPredicate::Id(guard.channel_id()),
            mutate,
        )
    }

    fn resolve_channel_id(&self, predicate: &ChannelPredicate) -> Result<i64> {
        let (clause, value) = predicate.clause();
        let sql = format!("SELECT id FROM channels WHERE {}", clause);

        match self.conn.query_row(&sql, [value], |row| row.get(0)) {
            Ok(id) => Ok(id),
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                Err(DatabaseError::ChannelNotFound(predicate.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
