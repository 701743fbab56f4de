pub mod daemon;
pub mod env;

pub use daemon::*;

use std::path::PathBuf;

/// Returns the project root: the current directory, or `.` if it is unreadable.
pub fn default_project_root() -> PathBuf {
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
