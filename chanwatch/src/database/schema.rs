//! Database schema definitions.

/// SQL schema for the channel database.
pub const SCHEMA_SQL: &str = r#"
-- Channel subscriptions
CREATE TABLE IF NOT EXISTS channels (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    -- Opaque JSON blobs (versionless, additive fields only)
    settings TEXT NOT NULL DEFAULT '{}',
    postproc_args TEXT NOT NULL DEFAULT '{}',
    last_scan INTEGER,                    -- Last completed crawl timestamp
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now'))
);

-- Source URLs belonging to a channel
CREATE TABLE IF NOT EXISTS channel_urls (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id INTEGER NOT NULL,
    url TEXT NOT NULL,
    -- Optional per-URL login override
    username TEXT,
    password TEXT,
    login_url TEXT,
    is_manual INTEGER DEFAULT 0,          -- Seeded outside the normal crawl
    last_scan INTEGER,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now')),
    UNIQUE(channel_id, url),
    FOREIGN KEY(channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

-- Discovered videos
CREATE TABLE IF NOT EXISTS videos (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_id INTEGER NOT NULL,
    channel_url_id INTEGER,               -- Weak back-reference, may dangle
    url TEXT NOT NULL,
    finished INTEGER DEFAULT 0,           -- Downloaded or explicitly ignored
    title TEXT,
    description TEXT,
    metadata TEXT,                        -- Raw info JSON from the fetcher
    status TEXT NOT NULL DEFAULT 'pending',
    percentage REAL DEFAULT 0,
    created_at INTEGER DEFAULT (strftime('%s', 'now')),
    updated_at INTEGER DEFAULT (strftime('%s', 'now')),
    UNIQUE(channel_id, url),
    FOREIGN KEY(channel_id) REFERENCES channels(id) ON DELETE CASCADE
);

-- Process singleton lock
CREATE TABLE IF NOT EXISTS program (
    id INTEGER PRIMARY KEY CHECK (id = 1),  -- Only one row allowed
    running INTEGER NOT NULL DEFAULT 0,
    pid INTEGER,
    host TEXT,
    started_at INTEGER,
    heartbeat INTEGER
);

CREATE INDEX IF NOT EXISTS idx_channel_urls_channel ON channel_urls(channel_id);
CREATE INDEX IF NOT EXISTS idx_channel_urls_url ON channel_urls(url);
CREATE INDEX IF NOT EXISTS idx_videos_channel ON videos(channel_id);
CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status);

CREATE TRIGGER IF NOT EXISTS channels_updated_at
AFTER UPDATE ON channels
BEGIN
    UPDATE channels SET updated_at = strftime('%s', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS channel_urls_updated_at
AFTER UPDATE ON channel_urls
BEGIN
    UPDATE channel_urls SET updated_at = strftime('%s', 'now') WHERE id = NEW.id;
END;

CREATE TRIGGER IF NOT EXISTS videos_updated_at
AFTER UPDATE ON videos
BEGIN
    UPDATE videos SET updated_at = strftime('%s', 'now') WHERE id = NEW.id;
END;
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    #[test]
    fn test_schema_valid() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();

        let tables: Vec<String> = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .filter_map(|r| r.ok())
            .collect();

        assert!(tables.contains(&"channels".to_string()));
        assert!(tables.contains(&"channel_urls".to_string()));
        assert!(tables.contains(&"videos".to_string()));
        assert!(tables.contains(&"program".to_string()));
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
    }
}
