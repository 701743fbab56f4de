use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::{changed_branches, BranchSnapshot, ChangeEvent, RepoSource, RoutingTag};
use crate::error::Result;

/// Callback invoked for every routed commit.
pub type ChangeCallback = Arc<dyn Fn(&ChangeEvent) + Send + Sync>;

/// Polls branch heads and reports commits that carry a routing tag.
pub struct RepoWatcher {
    source: Arc<dyn RepoSource>,
    interval: Duration,
    callbacks: Arc<RwLock<Vec<ChangeCallback>>>,
    running: Mutex<Option<(watch::Sender<bool>, JoinHandle<()>)>>,
}

impl RepoWatcher {
    pub fn new(source: Arc<dyn RepoSource>, interval: Duration) -> Self {
        Self {
            source,
            interval,
            callbacks: Arc::new(RwLock::new(Vec::new())),
            running: Mutex::new(None),
        }
    }

    pub fn on_change<F>(&self, callback: F)
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        self.callbacks
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(callback));
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Capture the baseline snapshot and start polling. Commits that already
    /// exist at start are never reported.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let baseline = self.source.branch_heads().await?;
        tracing::info!(
            "git watcher started ({} branch(es), interval {:?})",
            baseline.len(),
            self.interval
        );

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(watch_loop(
            self.source.clone(),
            self.callbacks.clone(),
            self.interval,
            baseline,
            stop_rx,
        ));
        *self.running.lock().unwrap_or_else(|e| e.into_inner()) = Some((stop_tx, handle));
        Ok(())
    }

    /// Stop polling, waiting briefly for an in-flight poll to finish.
    pub async fn stop(&self) {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner()).take();
        let Some((stop_tx, mut handle)) = running else {
            return;
        };
        let _ = stop_tx.send(true);
        if tokio::time::timeout(Duration::from_secs(5), &mut handle)
            .await
            .is_err()
        {
            tracing::warn!("git watcher did not stop in time; aborting");
            handle.abort();
        }
        tracing::info!("git watcher stopped");
    }
}

async fn watch_loop(
    source: Arc<dyn RepoSource>,
    callbacks: Arc<RwLock<Vec<ChangeCallback>>>,
    interval: Duration,
    mut previous: BranchSnapshot,
    mut stop_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if *stop_rx.borrow() {
            break;
        }

        for event in poll_once(source.as_ref(), &mut previous).await {
            tracing::info!(
                "routed commit: branch={} agent={} action={} task={}",
                event.branch,
                event.tag.agent,
                event.tag.action,
                event.tag.task
            );
            let snapshot: Vec<ChangeCallback> = callbacks
                .read()
                .unwrap_or_else(|e| e.into_inner())
                .clone();
            for callback in snapshot {
                if catch_unwind(AssertUnwindSafe(|| callback(&event))).is_err() {
                    tracing::error!("commit callback panicked for {}", event.hash);
                }
            }
        }
    }
}

/// Take a fresh snapshot, diff it against `previous`, and return the routed
/// commits among the changed heads. `previous` is replaced by the new
/// snapshot unless the snapshot itself could not be taken.
pub async fn poll_once(source: &dyn RepoSource, previous: &mut BranchSnapshot) -> Vec<ChangeEvent> {
    let current = match source.branch_heads().await {
        Ok(current) => current,
        Err(e) => {
            tracing::error!("git watcher error: {}", e);
            return Vec::new();
        }
    };

    let mut events = Vec::new();
    for branch in changed_branches(previous, &current) {
        // Deleted branches have no head to read.
        let Some(hash) = current.get(&branch) else {
            tracing::debug!("branch {} removed", branch);
            continue;
        };
        tracing::debug!(
            "change detected on {}: {} -> {}",
            branch,
            previous.get(&branch).map(String::as_str).unwrap_or("(new)"),
            hash
        );

        let message = match source.commit_message(hash).await {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!("skipping {} on {}: {}", hash, branch, e);
                continue;
            }
        };
        match RoutingTag::parse(&message) {
            Some(tag) => events.push(ChangeEvent {
                branch,
                hash: hash.clone(),
                tag,
                message,
            }),
            None => tracing::debug!("no routing headers in commit on {}", branch),
        }
    }

    *previous = current;
    events
}
