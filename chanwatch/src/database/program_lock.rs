//! Process singleton lock.
//!
//! A single row in `program` records which process currently owns the
//! store. A heartbeat older than [`STALE_HEARTBEAT_SECS`] means the owner
//! died without calling quit, and the next start takes the lock over.
//! Videos the previous owner left pending or downloading are forgotten on
//! start so the next crawl fetches them again.

use super::{Database, DatabaseError, ProgramLockRecord, Result};
use rusqlite::{params, TransactionBehavior};

/// Heartbeat age after which a running lock is considered abandoned.
pub const STALE_HEARTBEAT_SECS: i64 = 120;

impl Database {
    /// Claim the program lock for this process.
    pub fn program_start(&mut self) -> Result<u32> {
        let pid = std::process::id();
        let host = dns_lookup::get_hostname().unwrap_or_else(|_| "unknown".to_string());
        self.program_start_at(pid, &host, chrono::Utc::now().timestamp())?;
        Ok(pid)
    }

    /// Claim the program lock for `pid` on `host` at time `now`.
    pub fn program_start_at(&mut self, pid: u32, host: &str, now: i64) -> Result<()> {
        // Take the write lock up front so concurrent starts see AlreadyRunning
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current = tx.query_row(
            "SELECT running, pid, host, heartbeat FROM program WHERE id = 1",
            [],
            |row| {
                Ok((
                    row.get::<_, i32>(0)? != 0,
                    row.get::<_, Option<u32>>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<i64>>(3)?,
                ))
            },
        );

        match current {
            Ok((true, old_pid, old_host, heartbeat)) => {
                let age = now - heartbeat.unwrap_or(0);
                let old_pid = old_pid.unwrap_or(0);
                let old_host = old_host.unwrap_or_default();
                if age < STALE_HEARTBEAT_SECS {
                    return Err(DatabaseError::AlreadyRunning {
                        pid: old_pid,
                        host: old_host,
                        age_secs: age,
                    });
                }
                log::warn!(
                    "ProgramLock: resetting stale lock held by pid={} host={} (heartbeat {}s ago)",
                    old_pid,
                    old_host,
                    age
                );
            }
            Ok(_) | Err(rusqlite::Error::QueryReturnedNoRows) => {}
            Err(e) => return Err(e.into()),
        }

        tx.execute(
            "INSERT INTO program (id, running, pid, host, started_at, heartbeat)
             VALUES (1, 1, ?1, ?2, ?3, ?3)
             ON CONFLICT(id) DO UPDATE SET
                running = 1, pid = excluded.pid, host = excluded.host,
                started_at = excluded.started_at, heartbeat = excluded.heartbeat",
            params![pid, host, now],
        )?;
        tx.commit()?;

        log::info!("ProgramLock: acquired by pid={} host={}", pid, host);
        let interrupted = self.reset_interrupted_videos()?;
        if interrupted > 0 {
            log::warn!(
                "ProgramLock: forgot {} video(s) interrupted mid-fetch by the previous run",
                interrupted
            );
        }
        Ok(())
    }

    /// Refresh the heartbeat of the lock held by `pid`.
    pub fn program_heartbeat(&self, pid: u32) -> Result<()> {
        self.program_heartbeat_at(pid, chrono::Utc::now().timestamp())
    }

    pub fn program_heartbeat_at(&self, pid: u32, now: i64) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE program SET heartbeat = ?2 WHERE id = 1 AND running = 1 AND pid = ?1",
            params![pid, now],
        )?;
        if n == 0 {
            return Err(DatabaseError::LockLost(pid));
        }
        Ok(())
    }

    /// Release the lock if `pid` still holds it.
    pub fn program_quit(&self, pid: u32) -> Result<()> {
        let n = self.conn.execute(
            "UPDATE program SET running = 0 WHERE id = 1 AND pid = ?1",
            [pid],
        )?;
        if n == 0 {
            log::warn!("ProgramLock: quit by pid={} which no longer holds the lock", pid);
        } else {
            log::info!("ProgramLock: released by pid={}", pid);
        }
        Ok(())
    }

    /// Get the current lock row, if any process ever started.
    pub fn get_program_lock(&self) -> Result<Option<ProgramLockRecord>> {
        let result = self.conn.query_row(
            "SELECT running, pid, host, started_at, heartbeat FROM program WHERE id = 1",
            [],
            |row| {
                Ok(ProgramLockRecord {
                    running: row.get::<_, i32>(0)? != 0,
                    pid: row.get(1)?,
                    host: row.get(2)?,
                    started_at: row.get(3)?,
                    heartbeat: row.get(4)?,
                })
            },
        );

        match result {
            Ok(record) => Ok(Some(record)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{NewChannel, NewVideo};
    use chanwatch_types::DownloadStatus;

    #[test]
    fn test_fresh_start() {
        let mut db = Database::open_in_memory().unwrap();
        assert!(db.get_program_lock().unwrap().is_none());

        db.program_start_at(100, "alpha", 1_000).unwrap();
        let lock = db.get_program_lock().unwrap().unwrap();
        assert!(lock.running);
        assert_eq!(lock.pid, Some(100));
        assert_eq!(lock.host.as_deref(), Some("alpha"));
        assert_eq!(lock.started_at, Some(1_000));
    }

    #[test]
    fn test_second_start_while_fresh_fails() {
        let mut db = Database::open_in_memory().unwrap();
        db.program_start_at(100, "alpha", 1_000).unwrap();

        let err = db.program_start_at(200, "beta", 1_000 + 119).unwrap_err();
        match err {
            DatabaseError::AlreadyRunning { pid, host, .. } => {
                assert_eq!(pid, 100);
                assert_eq!(host, "alpha");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_stale_lock_is_taken_over() {
        let mut db = Database::open_in_memory().unwrap();
        db.program_start_at(100, "alpha", 1_000).unwrap();

        db.program_start_at(200, "beta", 1_000 + STALE_HEARTBEAT_SECS)
            .unwrap();
        let lock = db.get_program_lock().unwrap().unwrap();
        assert_eq!(lock.pid, Some(200));
        assert_eq!(lock.host.as_deref(), Some("beta"));
        assert_eq!(lock.heartbeat, Some(1_000 + STALE_HEARTBEAT_SECS));
    }

    #[test]
    fn test_heartbeat_keeps_lock_fresh() {
        let mut db = Database::open_in_memory().unwrap();
        db.program_start_at(100, "alpha", 1_000).unwrap();
        db.program_heartbeat_at(100, 1_100).unwrap();

        // 150s after start but only 50s after the heartbeat
        assert!(db.program_start_at(200, "beta", 1_150).is_err());
    }

    #[test]
    fn test_heartbeat_after_takeover_reports_lost() {
        let mut db = Database::open_in_memory().unwrap();
        db.program_start_at(100, "alpha", 1_000).unwrap();
        db.program_start_at(200, "beta", 2_000).unwrap();

        assert!(matches!(
            db.program_heartbeat_at(100, 2_001),
            Err(DatabaseError::LockLost(100))
        ));
    }

    #[test]
    fn test_quit_releases() {
        let mut db = Database::open_in_memory().unwrap();
        db.program_start_at(100, "alpha", 1_000).unwrap();
        db.program_quit(100).unwrap();
        assert!(!db.get_program_lock().unwrap().unwrap().running);

        db.program_start_at(200, "beta", 1_001).unwrap();

        // A stale quit must not release the new owner
        db.program_quit(100).unwrap();
        assert!(db.get_program_lock().unwrap().unwrap().running);
    }

    #[test]
    fn test_takeover_forgets_interrupted_videos() {
        let mut db = Database::open_in_memory().unwrap();
        let channel_id = db
            .create_channel(&NewChannel::new("Demo").with_url("https://site.com/c"))
            .unwrap();
        db.program_start_at(100, "alpha", 1_000).unwrap();

        let downloading = db
            .insert_video_if_absent(&NewVideo::pending(channel_id, None, "https://site.com/a"))
            .unwrap()
            .unwrap();
        db.update_video_status(downloading, DownloadStatus::Downloading)
            .unwrap();
        db.insert_video_if_absent(&NewVideo::pending(channel_id, None, "https://site.com/b"))
            .unwrap()
            .unwrap();
        let failed = db
            .insert_video_if_absent(&NewVideo::pending(channel_id, None, "https://site.com/c"))
            .unwrap()
            .unwrap();
        db.update_video_status(failed, DownloadStatus::Failed).unwrap();
        db.insert_ignored_videos(&[NewVideo::ignored(channel_id, None, "https://site.com/d")])
            .unwrap();

        // pid 100 died without quitting
        db.program_start_at(200, "beta", 1_000 + STALE_HEARTBEAT_SECS)
            .unwrap();

        let mut urls = db.get_video_urls_for_channel(channel_id).unwrap();
        urls.sort();
        assert_eq!(
            urls,
            vec!["https://site.com/c".to_string(), "https://site.com/d".to_string()]
        );
    }

    #[test]
    fn test_second_connection_sees_running_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("chanwatch.db");
        let mut first = Database::open(&path).unwrap();
        let mut second = Database::open(&path).unwrap();

        first.program_start_at(100, "alpha", 1_000).unwrap();
        assert!(matches!(
            second.program_start_at(200, "beta", 1_010),
            Err(DatabaseError::AlreadyRunning { pid: 100, .. })
        ));

        first.program_quit(100).unwrap();
        second.program_start_at(200, "beta", 1_020).unwrap();
        assert_eq!(first.get_program_lock().unwrap().unwrap().pid, Some(200));
    }
}
