//! URL canonicalization for dedup comparison.

use url::Url;

/// Canonical form used to compare discovered URLs with stored ones.
///
/// The scheme and any trailing slashes are removed. Case is preserved
/// because some platforms use case-sensitive path segments.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_scheme = match trimmed.find("://") {
        Some(idx) => &trimmed[idx + 3..],
        None => trimmed,
    };
    without_scheme.trim_end_matches('/').to_string()
}

/// Hostname of a URL, if it parses and has one.
pub fn hostname_of(raw: &str) -> Option<String> {
    Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
}

/// Registrable domain (eTLD+1) of a hostname.
/// Falls back to the last two labels for hosts the public suffix list does
/// not cover, such as `localhost` or bare IPs.
pub fn base_domain(hostname: &str) -> String {
    match psl::domain(hostname.as_bytes()) {
        Some(domain) => String::from_utf8_lossy(domain.as_bytes()).to_string(),
        None => {
            let parts: Vec<&str> = hostname.split('.').collect();
            if parts.len() >= 2 {
                format!("{}.{}", parts[parts.len() - 2], parts[parts.len() - 1])
            } else {
                hostname.to_string()
            }
        }
    }
}
