//! URL-list input handling.

use std::collections::HashSet;
use std::io;
use std::path::Path;

use tracing::warn;

/// Read a file of download inputs, one per line. Lines that do not start
/// with `http` are skipped with a log; duplicates are dropped preserving
/// first occurrence.
pub fn load_urls(path: &Path) -> io::Result<Vec<String>> {
    let body = std::fs::read_to_string(path)?;
    let mut seen = HashSet::new();
    let mut urls = Vec::new();
    for raw in body.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        if !line.starts_with("http") {
            warn!(line, "skipping invalid URL");
            continue;
        }
        if seen.insert(line.to_owned()) {
            urls.push(line.to_owned());
        }
    }
    Ok(urls)
}
