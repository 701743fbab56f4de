use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ArtelError, Result};

/// Whether a daemon owns the PID marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonStatus {
    pub running: bool,
    pub pid: Option<u32>,
}

/// What `stop_daemon` had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    NotRunning,
    Stopped { pid: u32 },
    Killed { pid: u32 },
}

/// PID marker file recording the owning daemon process.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the recorded pid, `None` if there is no marker.
    pub fn read(&self) -> Result<Option<u32>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        contents
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: std::num::ParseIntError| ArtelError::InvalidPidFile {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Record `pid` as the owner, creating parent dirs if needed.
    pub fn write(&self, pid: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, pid.to_string())?;
        Ok(())
    }

    pub fn remove(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Liveness-check the recorded pid. A stale or unreadable marker is removed.
    pub fn status(&self) -> DaemonStatus {
        match self.read() {
            Ok(Some(pid)) if is_alive(pid) => DaemonStatus {
                running: true,
                pid: Some(pid),
            },
            Ok(None) => DaemonStatus {
                running: false,
                pid: None,
            },
            Ok(Some(_)) | Err(_) => {
                let _ = self.remove();
                DaemonStatus {
                    running: false,
                    pid: None,
                }
            }
        }
    }

    /// Claim the marker for the current process, refusing if a live daemon
    /// already holds it.
    pub fn claim(&self) -> Result<()> {
        self.claim_as(std::process::id())
    }

    /// Check-then-write under an exclusive lock on a sibling `.lock` file,
    /// so two racing starts cannot both win.
    fn claim_as(&self, owner: u32) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let _lock = ClaimLock::acquire(&self.path)?;

        let status = self.status();
        if let (true, Some(pid)) = (status.running, status.pid) {
            if pid != owner {
                return Err(ArtelError::AlreadyRunning { pid });
            }
        }
        self.write(owner)
    }
}

/// Advisory flock(2) held for the duration of a claim.
struct ClaimLock {
    _file: std::fs::File,
}

impl ClaimLock {
    fn acquire(marker: &Path) -> Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(marker.with_extension("lock"))?;
        lock_exclusive(&file)?;
        Ok(Self { _file: file })
    }
}

// Dropping the file releases the lock.

#[cfg(unix)]
fn lock_exclusive(file: &std::fs::File) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    // SAFETY: the fd stays open for as long as `file` is borrowed.
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(ArtelError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(unix))]
fn lock_exclusive(_file: &std::fs::File) -> Result<()> {
    Ok(())
}

/// Check whether a process exists by sending signal 0.
#[cfg(unix)]
pub fn is_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    // SAFETY: signal 0 performs permission and existence checks only.
    let ret = unsafe { libc::kill(pid, 0) };
    ret == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
pub fn is_alive(_pid: u32) -> bool {
    false
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: libc::c_int) -> Result<()> {
    let pid = libc::pid_t::try_from(pid).map_err(|e| ArtelError::Io(std::io::Error::other(e)))?;
    // SAFETY: plain kill(2) on a pid read from our own marker file.
    let ret = unsafe { libc::kill(pid, signal) };
    if ret != 0 {
        return Err(ArtelError::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

/// Stop the daemon recorded in `pid_file`: SIGTERM, poll every 500ms for up
/// to `grace`, then SIGKILL. The marker is removed afterwards.
#[cfg(unix)]
pub async fn stop_daemon(pid_file: &PidFile, grace: Duration) -> Result<StopOutcome> {
    let status = pid_file.status();
    let Some(pid) = status.pid.filter(|_| status.running) else {
        return Ok(StopOutcome::NotRunning);
    };

    match send_signal(pid, libc::SIGTERM) {
        Ok(()) => {}
        Err(ArtelError::Io(e)) if e.raw_os_error() == Some(libc::ESRCH) => {
            pid_file.remove()?;
            return Ok(StopOutcome::NotRunning);
        }
        Err(e) => return Err(e),
    }

    let poll = Duration::from_millis(500);
    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(poll).await;
        if !is_alive(pid) {
            pid_file.remove()?;
            return Ok(StopOutcome::Stopped { pid });
        }
    }

    tracing::warn!("daemon {} ignored SIGTERM; sending SIGKILL", pid);
    let _ = send_signal(pid, libc::SIGKILL);
    pid_file.remove()?;
    Ok(StopOutcome::Killed { pid })
}

#[cfg(not(unix))]
pub async fn stop_daemon(pid_file: &PidFile, _grace: Duration) -> Result<StopOutcome> {
    pid_file.remove()?;
    Ok(StopOutcome::NotRunning)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn missing_marker_is_stopped() {
        let tmp = TempDir::new().unwrap();
        let pid_file = PidFile::new(tmp.path().join("wire-daemon.pid"));
        assert_eq!(
            pid_file.status(),
            DaemonStatus {
                running: false,
                pid: None
            }
        );
    }

    #[test]
    fn claim_records_current_process() {
        let tmp = TempDir::new().unwrap();
        let pid_file = PidFile::new(tmp.path().join(".git").join("wire-daemon.pid"));
        pid_file.claim().unwrap();

        assert_eq!(pid_file.read().unwrap(), Some(std::process::id()));
        let status = pid_file.status();
        assert!(status.running);
        assert_eq!(status.pid, Some(std::process::id()));

        pid_file.remove().unwrap();
        assert!(!pid_file.path().exists());
        pid_file.remove().unwrap();
    }

    #[test]
    fn garbage_marker_is_cleared() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("wire-daemon.pid");
        std::fs::write(&path, "not-a-pid").unwrap();
        let pid_file = PidFile::new(&path);

        assert!(matches!(
            pid_file.read(),
            Err(ArtelError::InvalidPidFile { .. })
        ));
        assert!(!pid_file.status().running);
        assert!(!path.exists());
    }

    #[cfg(unix)]
    #[test]
    fn claim_refuses_live_foreign_owner() {
        let tmp = TempDir::new().unwrap();
        let pid_file = PidFile::new(tmp.path().join("wire-daemon.pid"));
        let mut child = std::process::Command::new("sleep").arg("5").spawn().unwrap();
        pid_file.write(child.id()).unwrap();

        let result = pid_file.claim();
        let _ = child.kill();
        let _ = child.wait();
        assert!(matches!(result, Err(ArtelError::AlreadyRunning { .. })));
    }

    #[cfg(unix)]
    #[test]
    fn racing_claims_have_one_winner() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join(".git").join("wire-daemon.pid");
        let mut owners: Vec<std::process::Child> = (0..2)
            .map(|_| std::process::Command::new("sleep").arg("5").spawn().unwrap())
            .collect();
        let pids: Vec<u32> = owners.iter().map(|c| c.id()).collect();

        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let claims: Vec<_> = (0..8)
            .map(|n| {
                let pid_file = PidFile::new(&path);
                let barrier = barrier.clone();
                let owner = pids[n % 2];
                std::thread::spawn(move || {
                    barrier.wait();
                    pid_file.claim_as(owner).map(|()| owner)
                })
            })
            .collect();
        let winners: std::collections::BTreeSet<u32> = claims
            .into_iter()
            .filter_map(|t| t.join().unwrap().ok())
            .collect();

        let recorded = PidFile::new(&path).read().unwrap();
        for owner in &mut owners {
            let _ = owner.kill();
            let _ = owner.wait();
        }
        assert_eq!(winners.len(), 1);
        assert_eq!(recorded, winners.into_iter().next());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_terminates_recorded_process() {
        let tmp = TempDir::new().unwrap();
        let pid_file = PidFile::new(tmp.path().join("wire-daemon.pid"));
        let mut child = tokio::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        pid_file.write(child.id().unwrap()).unwrap();

        let reaper = tokio::spawn(async move { child.wait().await });
        let outcome = stop_daemon(&pid_file, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, StopOutcome::Stopped { .. }));
        assert!(!pid_file.path().exists());
        reaper.await.unwrap().unwrap();
    }
}
