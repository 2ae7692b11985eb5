//! Polling file watch for the peers file

use std::fs;
use std::io;
use std::path::Path;
use std::time::SystemTime;

/// Whether `path` was modified after `last_seen`
///
/// A missing or unreadable file is never "updated". With no previous
/// observation any existing file counts as updated.
pub fn is_file_updated(path: &Path, last_seen: Option<SystemTime>) -> bool {
    match (modified(path), last_seen) {
        (Some(current), Some(seen)) => current > seen,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Modification time of `path`, if it can be read
pub fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// One peer URL per line; blank lines and `#` comments are skipped
pub fn read_peers_file(path: &Path) -> io::Result<Vec<String>> {
    Ok(parse_peers(&fs::read_to_string(path)?))
}

fn parse_peers(contents: &str) -> Vec<String> {
    contents
        .lines()
        .map(|line| line.split('#').next().unwrap_or_default().trim())
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}
