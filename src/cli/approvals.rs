use std::path::Path;

use crate::approval::journal;
use crate::config::DaemonConfig;
use crate::error::Result;

/// Print the most recent persisted approval decisions, oldest first.
pub fn run_approvals(root: &Path, config: &DaemonConfig, limit: usize) -> Result<()> {
    let path = config.paths.resolve(root).approval_log;
    let tail = journal::tail(&path, limit)?;

    if tail.total == 0 {
        println!("No approval decisions recorded.");
        return Ok(());
    }

    for record in &tail.records {
        println!(
            "[{}] {:<8} {} {} -- {}",
            record.timestamp.format("%Y-%m-%d %H:%M:%S"),
            record.decision,
            record.request_type,
            record.tool_name,
            truncate(&record.description, 80),
        );
    }

    println!(
        "{} of {} decision(s) shown",
        tail.records.len(),
        tail.total
    );
    if tail.unreadable > 0 {
        println!("{} unreadable line(s) skipped", tail.unreadable);
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}
