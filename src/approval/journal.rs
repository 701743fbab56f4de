//! Durable decision log: one JSON record per line, appended as decisions
//! are made.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use super::ApprovalRecord;
use crate::error::Result;

/// The newest records of a journal plus counts over the whole file.
#[derive(Debug, Default)]
pub struct JournalTail {
    /// Oldest first.
    pub records: Vec<ApprovalRecord>,
    /// Readable records in the file.
    pub total: usize,
    /// Lines that did not decode as a record.
    pub unreadable: usize,
}

/// Append `record` as a single write so concurrent appenders never
/// interleave within a line.
pub fn append(path: &Path, record: &ApprovalRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?
        .write_all(&line)?;
    Ok(())
}

/// Every readable record, oldest first.
pub fn read(path: &Path) -> Result<Vec<ApprovalRecord>> {
    Ok(tail(path, usize::MAX)?.records)
}

/// Stream the journal keeping only the last `limit` records in memory.
pub fn tail(path: &Path, limit: usize) -> Result<JournalTail> {
    let file = match fs::File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(JournalTail::default()),
        Err(e) => return Err(e.into()),
    };

    let mut window = VecDeque::new();
    let mut tail = JournalTail::default();
    for line in BufReader::new(file).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<ApprovalRecord>(&line) {
            Ok(record) => {
                tail.total += 1;
                if limit == 0 {
                    continue;
                }
                if window.len() == limit {
                    window.pop_front();
                }
                window.push_back(record);
            }
            Err(_) => tail.unreadable += 1,
        }
    }
    if tail.unreadable > 0 {
        tracing::warn!(
            "{} unreadable line(s) in approval journal {}",
            tail.unreadable,
            path.display()
        );
    }

    tail.records = window.into();
    Ok(tail)
}
