//! Channel and channel URL CRUD operations.

use super::{
    ChannelRecord, ChannelUrlRecord, ChannelWithUrls, Database, DatabaseError, NewChannel,
    NewChannelUrl, Result,
};
use chanwatch_types::{ChannelSettings, PostProcessArgs};
use rusqlite::params;

const CHANNEL_COLUMNS: &str =
    "id, name, settings, postproc_args, last_scan, created_at, updated_at";

const CHANNEL_URL_COLUMNS: &str =
    "id, channel_id, url, username, password, login_url, is_manual, last_scan, created_at, updated_at";

impl Database {
    /// Insert a channel and all its URLs in one transaction.
    pub fn create_channel(&mut self, channel: &NewChannel) -> Result<i64> {
        channel.validate()?;

        let settings = serde_json::to_string(&channel.settings).map_err(|e| {
            DatabaseError::Blob {
                column: "settings",
                source: e,
            }
        })?;
        let postproc = serde_json::to_string(&channel.postproc_args).map_err(|e| {
            DatabaseError::Blob {
                column: "postproc_args",
                source: e,
            }
        })?;

        let tx = self.conn.transaction()?;
        tx.execute(
            "INSERT INTO channels (name, settings, postproc_args) VALUES (?1, ?2, ?3)",
            params![channel.name.trim(), settings, postproc],
        )?;
        let channel_id = tx.last_insert_rowid();

        for u in &channel.urls {
            tx.execute(
                "INSERT INTO channel_urls (channel_id, url, username, password, login_url, is_manual)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    channel_id,
                    u.url,
                    u.username,
                    u.password,
                    u.login_url,
                    u.is_manual as i32
                ],
            )?;
        }
        tx.commit()?;

        log::info!(
            "Created channel '{}' (id={}) with {} URL(s)",
            channel.name,
            channel_id,
            channel.urls.len()
        );
        Ok(channel_id)
    }

    /// Get channel by ID.
    pub fn get_channel(&self, id: i64) -> Result<Option<ChannelRecord>> {
        let sql = format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLUMNS);
        let result = self
            .conn
            .query_row(&sql, [id], Self::row_to_channel_record);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get channel by its unique name.
    pub fn get_channel_by_name(&self, name: &str) -> Result<Option<ChannelRecord>> {
        let sql = format!("SELECT {} FROM channels WHERE name = ?1", CHANNEL_COLUMNS);
        let result = self
            .conn
            .query_row(&sql, [name], Self::row_to_channel_record);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Find the channel owning a source URL (secondary index).
    pub fn get_channel_by_url(&self, url: &str) -> Result<Option<ChannelRecord>> {
        let sql = "SELECT c.id, c.name, c.settings, c.postproc_args, c.last_scan, c.created_at, c.updated_at
             FROM channels c
             JOIN channel_urls cu ON cu.channel_id = c.id
             WHERE cu.url = ?1
             LIMIT 1";
        let result = self.conn.query_row(sql, [url], Self::row_to_channel_record);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get a channel by ID or fail.
    pub fn require_channel(&self, id: i64) -> Result<ChannelRecord> {
        self.get_channel(id)?
            .ok_or_else(|| DatabaseError::ChannelNotFound(format!("id={}", id)))
    }

    /// Get all channels ordered by name.
    pub fn list_channels(&self) -> Result<Vec<ChannelRecord>> {
        let sql = format!("SELECT {} FROM channels ORDER BY name ASC", CHANNEL_COLUMNS);
        let mut stmt = self.conn.prepare(&sql)?;

        let records = stmt
            .query_map([], Self::row_to_channel_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Get a channel together with its URLs.
    pub fn get_channel_with_urls(&self, id: i64) -> Result<Option<ChannelWithUrls>> {
        match self.get_channel(id)? {
            Some(channel) => {
                let urls = self.get_channel_urls(id)?;
                Ok(Some(ChannelWithUrls { channel, urls }))
            }
            None => Ok(None),
        }
    }

    /// Delete a channel. URLs and videos are removed by cascade.
    pub fn delete_channel(&self, id: i64) -> Result<()> {
        let n = self.conn.execute("DELETE FROM channels WHERE id = ?1", [id])?;
        if n == 0 {
            return Err(DatabaseError::ChannelNotFound(format!("id={}", id)));
        }
        Ok(())
    }

    /// Record a completed crawl on the channel.
    pub fn touch_channel_scan(&self, id: i64, at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE channels SET last_scan = ?2 WHERE id = ?1",
            params![id, at],
        )?;
        Ok(())
    }

    /// Get URLs for a channel.
    pub fn get_channel_urls(&self, channel_id: i64) -> Result<Vec<ChannelUrlRecord>> {
        let sql = format!(
            "SELECT {} FROM channel_urls WHERE channel_id = ?1 ORDER BY id ASC",
            CHANNEL_URL_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;

        let records = stmt
            .query_map([channel_id], Self::row_to_channel_url_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Add a URL to an existing channel.
    pub fn add_channel_url(&self, channel_id: i64, new_url: &NewChannelUrl) -> Result<i64> {
        new_url.validate()?;
        self.require_channel(channel_id)?;

        self.conn.execute(
            "INSERT INTO channel_urls (channel_id, url, username, password, login_url, is_manual)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                channel_id,
                new_url.url,
                new_url.username,
                new_url.password,
                new_url.login_url,
                new_url.is_manual as i32
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Remove a URL from a channel. The last URL cannot be removed.
    pub fn remove_channel_url(&self, channel_id: i64, url: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM channel_urls WHERE channel_id = ?1",
            [channel_id],
            |row| row.get(0),
        )?;
        if count <= 1 {
            return Err(chanwatch_types::ValidationError::NoUrls.into());
        }

        let n = self.conn.execute(
            "DELETE FROM channel_urls WHERE channel_id = ?1 AND url = ?2",
            params![channel_id, url],
        )?;
        Ok(n > 0)
    }

    /// Set or clear the per-URL login override.
    pub fn set_channel_url_credentials(
        &self,
        channel_url_id: i64,
        username: Option<&str>,
        password: Option<&str>,
        login_url: Option<&str>,
    ) -> Result<()> {
        self.conn.execute(
            "UPDATE channel_urls SET username = ?2, password = ?3, login_url = ?4 WHERE id = ?1",
            params![channel_url_id, username, password, login_url],
        )?;
        Ok(())
    }

    /// Record a completed crawl on one channel URL.
    pub fn touch_channel_url_scan(&self, channel_url_id: i64, at: i64) -> Result<()> {
        self.conn.execute(
            "UPDATE channel_urls SET last_scan = ?2 WHERE id = ?1",
            params![channel_url_id, at],
        )?;
        Ok(())
    }

    /// Helper: Convert a row to ChannelRecord.
    fn row_to_channel_record(row: &rusqlite::Row) -> rusqlite::Result<ChannelRecord> {
        let settings: String = row.get("settings")?;
        let postproc: String = row.get("postproc_args")?;

        Ok(ChannelRecord {
            id: row.get("id")?,
            name: row.get("name")?,
            settings: parse_blob::<ChannelSettings>(&settings, 2)?,
            postproc_args: parse_blob::<PostProcessArgs>(&postproc, 3)?,
            last_scan: row.get("last_scan")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    /// Helper: Convert a row to ChannelUrlRecord.
    fn row_to_channel_url_record(row: &rusqlite::Row) -> rusqlite::Result<ChannelUrlRecord> {
        Ok(ChannelUrlRecord {
            id: row.get("id")?,
            channel_id: row.get("channel_id")?,
            url: row.get("url")?,
            username: row.get("username")?,
            password: row.get("password")?,
            login_url: row.get("login_url")?,
            is_manual: row.get::<_, i32>("is_manual")? != 0,
            last_scan: row.get("last_scan")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

/// Deserialize a JSON blob column; an empty value yields the default.
pub(super) fn parse_blob<T>(raw: &str, column_index: usize) -> rusqlite::Result<T>
where
    T: serde::de::DeserializeOwned + Default,
{
    if raw.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(
            column_index,
            rusqlite::types::Type::Text,
            Box::new(e),
        )
    })
}
