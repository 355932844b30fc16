//! Video CRUD operations.

use super::{CompletedVideo, Database, DatabaseError, NewVideo, Result, VideoRecord};
use chanwatch_types::DownloadStatus;
use rusqlite::params;

const VIDEO_COLUMNS: &str = "id, channel_id, channel_url_id, url, finished, title, description, metadata,
     status, percentage, created_at, updated_at";

impl Database {
    /// Insert a video unless (channel_id, url) already exists.
    ///
    /// Returns the new row ID, or `None` when the row was already present.
    pub fn insert_video_if_absent(&self, video: &NewVideo) -> Result<Option<i64>> {
        let n = self.conn.execute(
            "INSERT OR IGNORE INTO videos (channel_id, channel_url_id, url, finished, status)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                video.channel_id,
                video.channel_url_id,
                video.url,
                video.finished as i32,
                video.status.as_str(),
            ],
        )?;

        if n == 0 {
            Ok(None)
        } else {
            Ok(Some(self.conn.last_insert_rowid()))
        }
    }

    /// Insert many ignored videos in one transaction. Returns the inserted rows.
    pub fn insert_ignored_videos(&mut self, videos: &[NewVideo]) -> Result<Vec<i64>> {
        let tx = self.conn.transaction()?;
        let mut inserted = Vec::new();
        {
            let mut stmt = tx.prepare(
                "INSERT OR IGNORE INTO videos (channel_id, channel_url_id, url, finished, status, percentage)
                 VALUES (?1, ?2, ?3, 1, 'finished', 100)",
            )?;
            for v in videos {
                if stmt.execute(params![v.channel_id, v.channel_url_id, v.url])? > 0 {
                    inserted.push(tx.last_insert_rowid());
                }
            }
        }
        tx.commit()?;
        Ok(inserted)
    }

    /// Get video by ID.
    pub fn get_video(&self, id: i64) -> Result<Option<VideoRecord>> {
        let sql = format!("SELECT {} FROM videos WHERE id = ?1", VIDEO_COLUMNS);
        let result = self.conn.query_row(&sql, [id], Self::row_to_video_record);

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Get all videos of a channel, oldest first.
    pub fn list_videos(&self, channel_id: i64) -> Result<Vec<VideoRecord>> {
        let sql = format!(
            "SELECT {} FROM videos WHERE channel_id = ?1 ORDER BY id ASC",
            VIDEO_COLUMNS
        );
        let mut stmt = self.conn.prepare(&sql)?;

        let records = stmt
            .query_map([channel_id], Self::row_to_video_record)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Get every known video URL of a channel, finished or not.
    pub fn get_video_urls_for_channel(&self, channel_id: i64) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT url FROM videos WHERE channel_id = ?1")?;

        let urls = stmt
            .query_map([channel_id], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(urls)
    }

    /// Update the download status of a video.
    pub fn update_video_status(&self, id: i64, status: DownloadStatus) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE videos SET status = ?2 WHERE id = ?1",
            params![id, status.as_str()],
        )?;
        if n == 0 {
            return Err(DatabaseError::VideoNotFound(id));
        }
        Ok(())
    }

    /// Update the download percentage of a video.
    pub fn update_video_progress(&self, id: i64, percentage: f64) -> Result<()> {
        self.conn.execute(
            "UPDATE videos SET percentage = ?2 WHERE id = ?1",
            params![id, percentage.clamp(0.0, 100.0)],
        )?;
        Ok(())
    }

    /// Mark a video as downloaded and store its metadata.
    pub fn complete_video(&self, id: i64, completed: &CompletedVideo) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE videos SET finished = 1, status = 'finished', percentage = 100,
                title = COALESCE(?2, title), description = COALESCE(?3, description),
                metadata = COALESCE(?4, metadata)
             WHERE id = ?1",
            params![id, completed.title, completed.description, completed.metadata],
        )?;
        if n == 0 {
            return Err(DatabaseError::VideoNotFound(id));
        }
        Ok(())
    }

    /// Delete a video row.
    pub fn delete_video(&self, id: i64) -> Result<()> {
        self.conn.execute("DELETE FROM videos WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Delete failed rows so the next crawl rediscovers them.
    pub fn reset_failed_videos(&self, channel_id: i64) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM videos WHERE channel_id = ?1 AND status = 'failed' AND finished = 0",
            [channel_id],
        )?;
        Ok(n)
    }

    /// Delete rows a previous run left mid-fetch, in every channel.
    ///
    /// Only safe while holding the program lock: no other process can be
    /// fetching them.
    pub fn reset_interrupted_videos(&self) -> Result<usize> {
        let n = self.conn.execute(
            "DELETE FROM videos WHERE finished = 0 AND status IN ('pending', 'downloading')",
            [],
        )?;
        Ok(n)
    }

    /// Helper: Convert a row to VideoRecord.
    fn row_to_video_record(row: &rusqlite::Row) -> rusqlite::Result<VideoRecord> {
        let status: String = row.get("status")?;
        let status = status.parse::<DownloadStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                8,
                rusqlite::types::Type::Text,
                e.into(),
            )
        })?;

        Ok(VideoRecord {
            id: row.get("id")?,
            channel_id: row.get("channel_id")?,
            channel_url_id: row.get("channel_url_id")?,
            url: row.get("url")?,
            finished: row.get::<_, i32>("finished")? != 0,
            title: row.get("title")?,
            description: row.get("description")?,
            metadata: row.get("metadata")?,
            status,
            percentage: row.get::<_, Option<f64>>("percentage")?.unwrap_or(0.0),
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}
