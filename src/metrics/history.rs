use std::io::Write;
use std::path::Path;

use serde_json::Value;

use super::MetricsSnapshot;
use crate::error::Result;

/// Snapshots kept in the history file unless configured otherwise.
pub const DEFAULT_CAP: usize = 100;

/// Read the history array. Missing, empty, corrupt, or non-array content
/// is treated as an empty history.
pub fn read_history(path: &Path) -> Vec<Value> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
        Err(e) => {
            tracing::warn!("unreadable metrics history {}: {} -- resetting", path.display(), e);
            return Vec::new();
        }
    };
    if contents.trim().is_empty() {
        return Vec::new();
    }
    match serde_json::from_str::<Value>(&contents) {
        Ok(Value::Array(entries)) => entries,
        Ok(_) => {
            tracing::warn!("metrics history {} is not an array -- resetting", path.display());
            Vec::new()
        }
        Err(e) => {
            tracing::warn!("corrupt metrics history {}: {} -- resetting", path.display(), e);
            Vec::new()
        }
    }
}

/// Push `entry` and drop the oldest entries beyond `cap`.
pub fn push_capped(history: &mut Vec<Value>, entry: Value, cap: usize) {
    history.push(entry);
    if history.len() > cap {
        let excess = history.len() - cap;
        history.drain(..excess);
    }
}

/// Read-append-truncate-rewrite. The new file is written beside the old one
/// and renamed over it so readers never see a partial write.
pub fn append_snapshot(path: &Path, snapshot: &MetricsSnapshot, cap: usize) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(dir)?;

    let mut history = read_history(path);
    push_capped(&mut history, serde_json::to_value(snapshot)?, cap);

    let json = serde_json::to_string_pretty(&history)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
