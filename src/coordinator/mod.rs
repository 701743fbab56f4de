//! Daemon lifecycle: wires the agent link, the branch watcher, approvals and
//! metrics together and supervises the agent process.

pub mod actions;
pub mod restart;

pub use actions::{Action, ActionOutcome};
pub use restart::{RecoveryOutcome, RestartPolicy, RestartSupervisor};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::approval::{ApprovalGate, ApprovalMode};
use crate::config::{env, DaemonConfig, PathsConfig};
use crate::error::Result;
use crate::metrics::MetricsCollector;
use crate::process::PidFile;
use crate::repo::watcher::RepoWatcher;
use crate::repo::{ChangeEvent, GitRepo, RepoSource};
use crate::rpc::link::{LinkSettings, RpcLink};
use crate::rpc::EventKind;

/// Lifecycle state of the daemon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Why the control loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    Signal(&'static str),
    Requested,
    RestartsExhausted,
}

impl std::fmt::Display for StopReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StopReason::Signal(name) => write!(f, "received {}", name),
            StopReason::Requested => write!(f, "stop requested"),
            StopReason::RestartsExhausted => write!(f, "agent restarts exhausted"),
        }
    }
}

#[derive(Debug)]
pub enum ControlMessage {
    Stop(StopReason),
}

/// Cloneable handle that asks a running control loop to stop.
#[derive(Clone)]
pub struct StopHandle {
    tx: mpsc::UnboundedSender<ControlMessage>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        let _ = self.tx.send(ControlMessage::Stop(StopReason::Requested));
    }
}

/// Command-line overrides applied on top of the config file.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub auto_approve: bool,
}

/// An approval waiting to be resolved. Only peer requests carry an id to
/// reply to.
#[derive(Debug, Clone)]
pub struct ApprovalJob {
    pub reply_to: Option<Value>,
    pub request_type: String,
    pub tool_name: String,
    pub description: String,
}

impl ApprovalJob {
    pub fn from_params(params: &Value, reply_to: Option<Value>) -> Self {
        let field = |key: &str, fallback: &str| {
            params
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or(fallback)
                .to_string()
        };
        Self {
            reply_to,
            request_type: field("type", "unknown"),
            tool_name: field("tool_name", "unknown"),
            description: field("description", "No description"),
        }
    }
}

pub struct Coordinator {
    root: PathBuf,
    config: DaemonConfig,
    paths: PathsConfig,
    link: Arc<RpcLink>,
    watcher: RepoWatcher,
    gate: Arc<ApprovalGate>,
    metrics: Arc<MetricsCollector>,
    pid_file: PidFile,
    state: Mutex<DaemonState>,
    running: AtomicBool,
    restarts: tokio::sync::Mutex<RestartSupervisor>,
    control_tx: mpsc::UnboundedSender<ControlMessage>,
    control_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<ControlMessage>>,
    action_rx: Mutex<Option<mpsc::UnboundedReceiver<ChangeEvent>>>,
    approval_rx: Mutex<Option<mpsc::UnboundedReceiver<ApprovalJob>>>,
    approval_task: Mutex<Option<JoinHandle<()>>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// How long shutdown waits for an interrupted approval to be answered.
const APPROVAL_DRAIN: Duration = Duration::from_secs(2);

impl Coordinator {
    /// Coordinator for the git repository at `root`.
    pub fn new(root: PathBuf, config: DaemonConfig, options: RunOptions) -> Self {
        let mode = if options.auto_approve {
            ApprovalMode::Automatic
        } else {
            ApprovalMode::Interactive
        };
        let source = Arc::new(GitRepo::new(root.clone()));
        Self::with_parts(root, config, options, source, ApprovalGate::new(mode))
    }

    /// Coordinator over an arbitrary repository source and approval gate.
    pub fn with_parts(
        root: PathBuf,
        config: DaemonConfig,
        options: RunOptions,
        source: Arc<dyn RepoSource>,
        gate: ApprovalGate,
    ) -> Self {
        let paths = config.paths.resolve(&root);
        let settings =
            LinkSettings::from_config(&config, env::load_project_env(&root), options.dry_run);
        let link = Arc::new(RpcLink::new(settings));
        let gate = Arc::new(gate.with_journal(paths.approval_log.clone()));
        let metrics = Arc::new(
            MetricsCollector::new()
                .with_history(paths.metrics_file.clone(), config.metrics_history_cap),
        );

        let watcher = RepoWatcher::new(source, config.poll_interval());
        let (action_tx, action_rx) = mpsc::unbounded_channel();
        watcher.on_change(move |event| {
            if action_tx.send(event.clone()).is_err() {
                tracing::warn!("action worker gone; dropping commit {}", event.hash);
            }
        });

        let (approval_tx, approval_rx) = mpsc::unbounded_channel();
        wire_agent_events(&link, &metrics, approval_tx);

        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            pid_file: PidFile::new(&paths.pid_file),
            restarts: tokio::sync::Mutex::new(RestartSupervisor::new(RestartPolicy::from(
                &config.restart,
            ))),
            root,
            config,
            paths,
            link,
            watcher,
            gate,
            metrics,
            state: Mutex::new(DaemonState::Stopped),
            running: AtomicBool::new(false),
            control_tx,
            control_rx: tokio::sync::Mutex::new(control_rx),
            action_rx: Mutex::new(Some(action_rx)),
            approval_rx: Mutex::new(Some(approval_rx)),
            approval_task: Mutex::new(None),
            shutdown_tx: watch::channel(false).0,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn paths(&self) -> &PathsConfig {
        &self.paths
    }

    pub fn state(&self) -> DaemonState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn pid_file(&self) -> &PidFile {
        &self.pid_file
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.control_tx.clone(),
        }
    }

    fn set_state(&self, state: DaemonState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Claim the PID marker, start the agent, the workers and the watcher.
    /// On failure everything already started is torn down again.
    pub async fn start(&self) -> Result<()> {
        self.set_state(DaemonState::Starting);
        tracing::info!("starting wire daemon");
        tracing::info!("  project root: {}", self.root.display());
        tracing::info!("  dry run: {}", self.link.is_dry_run());
        tracing::info!("  approvals: {:?}", self.gate.mode());

        if let Err(e) = self.config.validate() {
            self.abort_tasks();
            self.set_state(DaemonState::Stopped);
            return Err(e);
        }

        if let Err(e) = self.pid_file.claim() {
            // The marker belongs to someone else; leave it in place.
            self.abort_tasks();
            self.set_state(DaemonState::Stopped);
            return Err(e);
        }

        if let Err(e) = self.link.start(&self.root).await {
            tracing::error!("failed to start agent: {}", e);
            self.abort_start();
            return Err(e);
        }

        self.spawn_workers();

        if let Err(e) = self.watcher.start().await {
            tracing::error!("failed to start git watcher: {}", e);
            self.link.stop().await;
            self.abort_start();
            return Err(e);
        }

        self.running.store(true, Ordering::SeqCst);
        self.set_state(DaemonState::Running);
        tracing::info!("wire daemon running (pid {})", std::process::id());
        Ok(())
    }

    fn abort_start(&self) {
        self.abort_tasks();
        if let Err(e) = self.pid_file.remove() {
            tracing::warn!("failed to remove pid file: {}", e);
        }
        self.set_state(DaemonState::Stopped);
    }

    fn spawn_workers(&self) {
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());

        let action_rx = self
            .action_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = action_rx {
            tasks.push(tokio::spawn(action_worker(self.link.clone(), rx)));
        }

        let approval_rx = self
            .approval_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(rx) = approval_rx {
            let worker = tokio::spawn(approval_worker(
                self.link.clone(),
                self.gate.clone(),
                rx,
                self.shutdown_tx.subscribe(),
            ));
            *self
                .approval_task
                .lock()
                .unwrap_or_else(|e| e.into_inner()) = Some(worker);
        }
    }

    fn abort_tasks(&self) {
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for task in tasks {
            task.abort();
        }
        if let Some(worker) = self
            .approval_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            worker.abort();
        }
    }

    /// Interrupt any open approval prompt and give the worker a moment to
    /// answer the agent before the link goes down.
    async fn drain_approvals(&self) {
        self.shutdown_tx.send_replace(true);
        let worker = self
            .approval_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut worker) = worker {
            if tokio::time::timeout(APPROVAL_DRAIN, &mut worker).await.is_err() {
                tracing::warn!("approval worker did not finish; aborting");
                worker.abort();
            }
        }
    }

    /// Start the daemon and run the control loop until a stop is requested
    /// or restarts are exhausted. Teardown happens before returning.
    pub async fn run(&self) -> Result<StopReason> {
        self.spawn_signal_listener();
        self.start().await?;

        let mut ticker = tokio::time::interval(self.config.tick_interval());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut control = self.control_rx.lock().await;
        // Set after a failed restart: there is no child left to poll.
        let mut link_down = false;

        let reason = loop {
            tokio::select! {
                message = control.recv() => break stop_reason(message),
                _ = ticker.tick() => {
                    if self.link.is_dry_run() || !(link_down || self.link.has_exited().await) {
                        continue;
                    }
                    if !link_down {
                        tracing::warn!("agent process exited unexpectedly");
                    }

                    let recovery = tokio::select! {
                        outcome = self.recover() => Ok(outcome),
                        message = control.recv() => Err(stop_reason(message)),
                    };
                    match recovery {
                        Err(reason) => break reason,
                        Ok(RecoveryOutcome::Reconnected) => link_down = false,
                        Ok(RecoveryOutcome::Failed { .. }) => link_down = true,
                        Ok(RecoveryOutcome::Exhausted) => {
                            tracing::error!("agent could not be restarted; shutting down");
                            break StopReason::RestartsExhausted;
                        }
                    }
                }
            }
        };
        drop(control);

        tracing::info!("stopping: {}", reason);
        self.shutdown().await;
        Ok(reason)
    }

    async fn recover(&self) -> RecoveryOutcome {
        let mut restarts = self.restarts.lock().await;
        let link = self.link.clone();
        let metrics = self.metrics.clone();
        let root = self.root.clone();
        restarts
            .recover(|| async move {
                metrics.record_error();
                match link.restart(&root).await {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::error!("agent restart failed: {}", e);
                        false
                    }
                }
            })
            .await
    }

    /// Consecutive failed restart attempts since the last reconnect.
    pub async fn restart_attempt(&self) -> u32 {
        self.restarts.lock().await.attempt()
    }

    /// Handlers are installed before this returns so a signal arriving
    /// during startup is not lost.
    #[cfg(unix)]
    fn spawn_signal_listener(&self) {
        use tokio::signal::unix::{signal, SignalKind};

        let (mut term, mut int) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                tracing::warn!("cannot install signal handlers: {}", e);
                return;
            }
        };

        let tx = self.control_tx.clone();
        let task = tokio::spawn(async move {
            let name = tokio::select! {
                _ = term.recv() => "SIGTERM",
                _ = int.recv() => "SIGINT",
            };
            tracing::info!("received {}", name);
            let _ = tx.send(ControlMessage::Stop(StopReason::Signal(name)));
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    #[cfg(not(unix))]
    fn spawn_signal_listener(&self) {
        let tx = self.control_tx.clone();
        let task = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = tx.send(ControlMessage::Stop(StopReason::Signal("SIGINT")));
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(task);
    }

    /// Tear everything down. Only the first call after a successful start
    /// does anything.
    pub async fn shutdown(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.set_state(DaemonState::Stopping);
        tracing::info!("stopping wire daemon");

        if let Err(e) = self.metrics.flush() {
            tracing::error!("failed to save metrics: {}", e);
        }
        self.drain_approvals().await;
        self.watcher.stop().await;
        self.link.stop().await;
        self.abort_tasks();
        if let Err(e) = self.pid_file.remove() {
            tracing::warn!("failed to remove pid file: {}", e);
        }

        self.set_state(DaemonState::Stopped);
        tracing::info!("wire daemon stopped");
    }
}

fn stop_reason(message: Option<ControlMessage>) -> StopReason {
    match message {
        Some(ControlMessage::Stop(reason)) => reason,
        None => StopReason::Requested,
    }
}

/// Route agent events into metrics and approval jobs.
fn wire_agent_events(
    link: &RpcLink,
    metrics: &Arc<MetricsCollector>,
    approvals: mpsc::UnboundedSender<ApprovalJob>,
) {
    let m = metrics.clone();
    link.on_event(EventKind::TurnBegin, move |_| {
        m.record_turn_begin();
        tracing::debug!("turn started");
        Ok(())
    });

    let m = metrics.clone();
    link.on_event(EventKind::TurnEnd, move |_| {
        m.record_turn_end();
        tracing::debug!("turn ended");
        // Keep file I/O off the reader task.
        let m = m.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = m.flush() {
                tracing::error!("failed to save metrics: {}", e);
            }
        });
        Ok(())
    });

    let m = metrics.clone();
    link.on_event(EventKind::ToolCall, move |params| {
        let name = params
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or("unknown");
        m.record_tool_call(name);
        tracing::debug!("tool call: {}", name);
        Ok(())
    });

    let m = metrics.clone();
    link.on_event(EventKind::ToolResult, move |params| {
        if params.get("is_error").and_then(Value::as_bool) == Some(true) {
            m.record_error();
            let output = params.get("output").and_then(Value::as_str).unwrap_or("");
            tracing::warn!(
                "tool error: {}",
                output.chars().take(100).collect::<String>()
            );
        }
        Ok(())
    });

    let m = metrics.clone();
    link.on_event(EventKind::StepBegin, move |params| {
        m.record_step();
        tracing::debug!("step {} started", step_number(params));
        Ok(())
    });

    link.on_event(EventKind::StepEnd, |params| {
        tracing::debug!("step {} ended", step_number(params));
        Ok(())
    });

    link.on_event(EventKind::ContentPart, |params| {
        let kind = params.get("type").and_then(Value::as_str).unwrap_or("text");
        tracing::debug!("content part: {}", kind);
        Ok(())
    });

    let tx = approvals.clone();
    link.on_event(EventKind::ApprovalRequest, move |params| {
        enqueue_approval(&tx, ApprovalJob::from_params(params, None));
        Ok(())
    });

    link.on_event(EventKind::Request, move |message| {
        let params = message.get("params").unwrap_or(&Value::Null);
        let id = message.get("id").cloned();
        enqueue_approval(&approvals, ApprovalJob::from_params(params, id));
        Ok(())
    });
}

fn step_number(params: &Value) -> String {
    params
        .get("n")
        .map(|n| n.to_string())
        .unwrap_or_else(|| "?".into())
}

fn enqueue_approval(tx: &mpsc::UnboundedSender<ApprovalJob>, job: ApprovalJob) {
    if tx.send(job).is_err() {
        tracing::warn!("approval worker gone; dropping request");
    }
}

/// Issue instruction requests one routed commit at a time.
async fn action_worker(link: Arc<RpcLink>, mut events: mpsc::UnboundedReceiver<ChangeEvent>) {
    while let Some(event) = events.recv().await {
        actions::handle_change(&link, &event).await;
    }
}

/// Resolve approvals one at a time and answer peer requests. Once
/// `shutdown` turns true an open prompt is rejected and the worker exits.
async fn approval_worker(
    link: Arc<RpcLink>,
    gate: Arc<ApprovalGate>,
    mut jobs: mpsc::UnboundedReceiver<ApprovalJob>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let approved = gate
            .resolve_or_cancel(
                &job.request_type,
                &job.tool_name,
                &job.description,
                &mut shutdown,
            )
            .await;

        if let Some(id) = job.reply_to {
            if let Err(e) = link.respond(id, json!({ "approved": approved })).await {
                tracing::error!("failed to answer approval request: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;
    use crate::repo::BranchSnapshot;
    use async_trait::async_trait;
    use tempfile::TempDir;

    struct EmptyRepo;

    #[async_trait]
    impl RepoSource for EmptyRepo {
        async fn branch_heads(&self) -> Result<BranchSnapshot> {
            Ok(BranchSnapshot::new())
        }

        async fn commit_message(&self, _hash: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn dry_run_coordinator(root: &Path) -> Coordinator {
        Coordinator::with_parts(
            root.to_path_buf(),
            DaemonConfig::default(),
            RunOptions {
                dry_run: true,
                auto_approve: true,
            },
            Arc::new(EmptyRepo),
            ApprovalGate::new(ApprovalMode::Automatic),
        )
    }

    #[test]
    fn approval_job_defaults_missing_fields() {
        let job = ApprovalJob::from_params(&json!({ "type": "ApprovalRequest" }), None);
        assert_eq!(job.request_type, "ApprovalRequest");
        assert_eq!(job.tool_name, "unknown");
        assert_eq!(job.description, "No description");
        assert!(job.reply_to.is_none());
    }

    #[tokio::test]
    async fn start_claims_marker_and_shutdown_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let coordinator = dry_run_coordinator(tmp.path());
        assert_eq!(coordinator.state(), DaemonState::Stopped);

        coordinator.start().await.unwrap();
        assert_eq!(coordinator.state(), DaemonState::Running);
        assert!(coordinator.is_running());
        assert_eq!(
            coordinator.pid_file().read().unwrap(),
            Some(std::process::id())
        );

        coordinator.shutdown().await;
        coordinator.shutdown().await;
        assert_eq!(coordinator.state(), DaemonState::Stopped);
        assert!(!coordinator.pid_file().path().exists());

        // One flush means the teardown ran once.
        let history = crate::metrics::history::read_history(&coordinator.paths().metrics_file);
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn shutdown_before_start_is_noop() {
        let tmp = TempDir::new().unwrap();
        let coordinator = dry_run_coordinator(tmp.path());
        coordinator.shutdown().await;
        assert_eq!(coordinator.state(), DaemonState::Stopped);
        assert!(!coordinator.paths().metrics_file.exists());
    }

    #[tokio::test]
    async fn concurrent_shutdowns_tear_down_once() {
        let tmp = TempDir::new().unwrap();
        let coordinator = Arc::new(dry_run_coordinator(tmp.path()));
        coordinator.start().await.unwrap();

        let a = coordinator.clone();
        let b = coordinator.clone();
        tokio::join!(a.shutdown(), b.shutdown());

        let history = crate::metrics::history::read_history(&coordinator.paths().metrics_file);
        assert_eq!(history.len(), 1);
        assert_eq!(coordinator.state(), DaemonState::Stopped);
    }

    #[tokio::test]
    async fn stop_handle_ends_run() {
        let tmp = TempDir::new().unwrap();
        let coordinator = Arc::new(dry_run_coordinator(tmp.path()));
        let handle = coordinator.stop_handle();

        let runner = coordinator.clone();
        let run = tokio::spawn(async move { runner.run().await });
        for _ in 0..100 {
            if coordinator.is_running() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        handle.request_stop();

        let reason = run.await.unwrap().unwrap();
        assert_eq!(reason, StopReason::Requested);
        assert_eq!(coordinator.state(), DaemonState::Stopped);
        assert!(!coordinator.pid_file().path().exists());
    }

    #[tokio::test]
    async fn zero_tick_interval_is_refused_before_claiming_marker() {
        let tmp = TempDir::new().unwrap();
        let mut config = DaemonConfig::default();
        config.tick_interval_secs = 0;
        let coordinator = Coordinator::with_parts(
            tmp.path().to_path_buf(),
            config,
            RunOptions {
                dry_run: true,
                auto_approve: true,
            },
            Arc::new(EmptyRepo),
            ApprovalGate::new(ApprovalMode::Automatic),
        );

        let err = coordinator.run().await.unwrap_err();
        assert!(matches!(err, crate::error::ArtelError::InvalidConfig { .. }));
        assert_eq!(coordinator.state(), DaemonState::Stopped);
        assert!(!coordinator.pid_file().path().exists());
    }

    #[tokio::test]
    async fn failed_spawn_leaves_daemon_stopped() {
        let tmp = TempDir::new().unwrap();
        let mut config = DaemonConfig::default();
        config.agent.command = "/nonexistent/artel-agent".into();
        let coordinator = Coordinator::with_parts(
            tmp.path().to_path_buf(),
            config,
            RunOptions::default(),
            Arc::new(EmptyRepo),
            ApprovalGate::new(ApprovalMode::Automatic),
        );

        let err = coordinator.start().await.unwrap_err();
        assert!(matches!(err, crate::error::ArtelError::Spawn { .. }));
        assert_eq!(coordinator.state(), DaemonState::Stopped);
        assert!(!coordinator.pid_file().path().exists());
    }
}
