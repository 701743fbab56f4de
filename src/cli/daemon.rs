use std::path::{Path, PathBuf};

use crate::config::DaemonConfig;
use crate::coordinator::{Coordinator, RunOptions, StopReason};
use crate::error::{ArtelError, Result};
use crate::process::{stop_daemon, PidFile, StopOutcome};

/// Log lines shown by `status`.
const STATUS_TAIL: usize = 5;

/// Run the daemon in the foreground until it is stopped.
pub async fn run_start(
    root: PathBuf,
    config: DaemonConfig,
    options: RunOptions,
) -> Result<StopReason> {
    let paths = config.paths.resolve(&root);
    let status = PidFile::new(&paths.pid_file).status();
    if let (true, Some(pid)) = (status.running, status.pid) {
        return Err(ArtelError::AlreadyRunning { pid });
    }

    let coordinator = Coordinator::new(root, config, options);
    coordinator.run().await
}

/// Print daemon status. Returns whether a daemon is running.
pub fn run_status(root: &Path, config: &DaemonConfig) -> Result<bool> {
    let paths = config.paths.resolve(root);
    let status = PidFile::new(&paths.pid_file).status();

    match (status.running, status.pid) {
        (true, Some(pid)) => println!("Wire daemon: RUNNING (pid {})", pid),
        _ => println!("Wire daemon: STOPPED"),
    }
    println!("  PID file: {}", paths.pid_file.display());
    println!("  Log file: {}", paths.log_file.display());

    match std::fs::read_to_string(&paths.log_file) {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            println!("  Log lines: {}", lines.len());
            if !lines.is_empty() {
                println!("  Last {} log lines:", STATUS_TAIL.min(lines.len()));
                for line in &lines[lines.len().saturating_sub(STATUS_TAIL)..] {
                    println!("    {}", line);
                }
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => println!("  Log lines: 0"),
        Err(e) => return Err(e.into()),
    }

    Ok(status.running)
}

/// Stop a running daemon. Returns `false` if nothing was running.
pub async fn run_stop(root: &Path, config: &DaemonConfig) -> Result<bool> {
    let paths = config.paths.resolve(root);
    let pid_file = PidFile::new(&paths.pid_file);

    match stop_daemon(&pid_file, config.stop_grace()).await? {
        StopOutcome::NotRunning => {
            eprintln!("artel-wire: daemon is not running");
            Ok(false)
        }
        StopOutcome::Stopped { pid } => {
            eprintln!("artel-wire: stopped daemon (pid {})", pid);
            Ok(true)
        }
        StopOutcome::Killed { pid } => {
            eprintln!("artel-wire: force-killed daemon (pid {})", pid);
            Ok(true)
        }
    }
}
