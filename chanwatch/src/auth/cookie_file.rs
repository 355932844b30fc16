//! Netscape cookie jar files handed to the fetch collaborator.

use std::io::Write;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;

use chanwatch_types::Cookie;

const HEADER: &str = "# Netscape HTTP Cookie File\n";

/// Stable jar path for one channel URL.
pub fn cookie_file_path(dir: &Path, channel_id: i64, url: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(channel_id.to_le_bytes());
    hasher.update(url.as_bytes());
    let digest = hex::encode(hasher.finalize());
    dir.join(format!("cookies-{}.txt", &digest[..32]))
}

/// Render cookies in the Netscape jar format.
pub fn render_cookie_file(cookies: &[Cookie]) -> String {
    let mut out = String::from(HEADER);
    for cookie in cookies {
        out.push_str(&cookie.to_netscape_line());
        out.push('\n');
    }
    out
}

/// Write the jar next to its final location and rename it into place.
pub async fn write_cookie_file(path: &Path, cookies: &[Cookie]) -> std::io::Result<()> {
    let path = path.to_path_buf();
    let contents = render_cookie_file(cookies);
    tokio::task::spawn_blocking(move || persist_atomically(&path, contents.as_bytes()))
        .await
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?
}

fn persist_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;
    let mut tmp = NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
