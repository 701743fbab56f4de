use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use super::dispatch::HandlerRegistry;
use super::{parse_line, type_of, EventKind, InboundMessage, OutboundReply, OutboundRequest, RpcReply};
use crate::config::DaemonConfig;
use crate::error::{ArtelError, Result};

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// How the agent is launched and talked to.
#[derive(Debug, Clone)]
pub struct LinkSettings {
    pub command: String,
    pub args: Vec<String>,
    pub agent_file: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub protocol_version: String,
    pub client_name: String,
    pub client_version: String,
    pub call_timeout: Duration,
    pub handshake_timeout: Duration,
    pub stop_grace: Duration,
    /// Diagnostic mode: no agent is spawned and every call succeeds synthetically.
    pub dry_run: bool,
}

impl Default for LinkSettings {
    fn default() -> Self {
        Self::from_config(&DaemonConfig::default(), BTreeMap::new(), false)
    }
}

impl LinkSettings {
    pub fn from_config(config: &DaemonConfig, env: BTreeMap<String, String>, dry_run: bool) -> Self {
        Self {
            command: config.agent.command.clone(),
            args: config.agent.args.clone(),
            agent_file: config.agent.agent_file.clone(),
            env,
            protocol_version: config.protocol_version.clone(),
            client_name: env!("CARGO_PKG_NAME").into(),
            client_version: env!("CARGO_PKG_VERSION").into(),
            call_timeout: config.call_timeout(),
            handshake_timeout: config.handshake_timeout(),
            stop_grace: config.stop_grace(),
            dry_run,
        }
    }
}

/// A call waiting for its response. The oneshot is both the completion
/// signal and the result slot, so it can be fulfilled at most once.
struct PendingCall {
    method: String,
    issued_at: Instant,
    slot: oneshot::Sender<RpcReply>,
}

/// Why a call produced no reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallFailure {
    /// The request could not be encoded or written.
    Unsent,
    TimedOut,
    /// The agent's output closed while the call was pending.
    Closed,
}

/// State shared between callers and the reader task.
struct LinkShared {
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    pending: Mutex<HashMap<u64, PendingCall>>,
    handlers: HandlerRegistry,
    /// Bumped on every attach so a stale reader cannot release newer calls.
    generation: AtomicU64,
}

impl LinkShared {
    /// Write one line, giving up at `deadline`. A child that stops draining
    /// its stdin must not pin the writer lock.
    async fn write_line(&self, line: &str, deadline: tokio::time::Instant) -> Result<()> {
        let write = async {
            let mut guard = self.writer.lock().await;
            let writer = guard.as_mut().ok_or(ArtelError::NotConnected)?;
            let io = |e: std::io::Error| ArtelError::Transport {
                reason: format!("write failed: {}", e),
            };
            writer.write_all(line.as_bytes()).await.map_err(io)?;
            writer.write_all(b"\n").await.map_err(io)?;
            writer.flush().await.map_err(io)?;
            Ok(())
        };
        tokio::time::timeout_at(deadline, write)
            .await
            .unwrap_or_else(|_| {
                Err(ArtelError::Transport {
                    reason: "write timed out; agent is not reading".into(),
                })
            })
    }

    fn take_pending(&self, id: u64) -> Option<PendingCall> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    /// Drop every pending call; their waiters observe "no result".
    fn release_pending(&self) {
        let mut pending = self.pending.lock().unwrap_or_else(|e| e.into_inner());
        if !pending.is_empty() {
            tracing::warn!("releasing {} pending call(s)", pending.len());
        }
        pending.clear();
    }

    fn route(&self, message: InboundMessage) {
        match message {
            InboundMessage::Response { id, outcome } => match self.take_pending(id) {
                Some(call) => {
                    tracing::debug!(
                        "response for {} (id={}) after {:?}",
                        call.method,
                        id,
                        call.issued_at.elapsed()
                    );
                    let _ = call.slot.send(outcome);
                }
                None => tracing::debug!("discarding response for unknown or expired id {}", id),
            },
            InboundMessage::Notification { method, params } => {
                if method != "event" {
                    tracing::debug!("ignoring notification method {}", method);
                    return;
                }
                let kind = EventKind::parse(type_of(&params));
                tracing::debug!("event: {}", kind);
                self.handlers.dispatch(&kind, &params);
            }
            InboundMessage::PeerRequest {
                id,
                request_type,
                params,
            } => {
                tracing::info!("request: {}", request_type);
                let message = json!({ "method": "request", "id": id, "params": params });
                self.handlers.dispatch(&EventKind::Request, &message);
            }
        }
    }
}

async fn read_loop<R>(shared: Arc<LinkShared>, reader: R, generation: u64)
where
    R: AsyncRead + Send + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match parse_line(trimmed) {
                    Some(message) => shared.route(message),
                    None => tracing::debug!("non-protocol output: {}", truncate(trimmed, 100)),
                }
            }
            Ok(None) => {
                tracing::warn!("agent output stream closed");
                break;
            }
            Err(e) => {
                tracing::warn!("agent output read failed: {}", e);
                break;
            }
        }
    }
    if shared.generation.load(Ordering::SeqCst) == generation {
        shared.release_pending();
    }
    tracing::debug!("read loop ended");
}

/// Bidirectional JSON-RPC link to one agent process.
pub struct RpcLink {
    settings: LinkSettings,
    shared: Arc<LinkShared>,
    next_id: AtomicU64,
    child: tokio::sync::Mutex<Option<Child>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl RpcLink {
    pub fn new(settings: LinkSettings) -> Self {
        Self {
            settings,
            shared: Arc::new(LinkShared {
                writer: tokio::sync::Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                handlers: HandlerRegistry::new(),
                generation: AtomicU64::new(0),
            }),
            next_id: AtomicU64::new(1),
            child: tokio::sync::Mutex::new(None),
            reader: Mutex::new(None),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.settings.dry_run
    }

    /// Register a handler for an event kind. Handlers run on the reader task.
    pub fn on_event<F>(&self, kind: EventKind, handler: F)
    where
        F: Fn(&Value) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.handlers.register(kind, handler);
    }

    /// Launch the agent in `working_dir` and perform the handshake.
    pub async fn start(&self, working_dir: &Path) -> Result<()> {
        if self.settings.dry_run {
            tracing::info!("dry run: agent not started");
            return Ok(());
        }

        let mut cmd = Command::new(&self.settings.command);
        cmd.args(&self.settings.args)
            .arg("--work-dir")
            .arg(working_dir);
        if let Some(agent_file) = &self.settings.agent_file {
            let agent_file = working_dir.join(agent_file);
            if agent_file.exists() {
                cmd.arg("--agent-file").arg(agent_file);
            }
        }
        cmd.envs(&self.settings.env)
            .current_dir(working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::info!(
            "starting agent: {} {}",
            self.settings.command,
            self.settings.args.join(" ")
        );
        let mut child = cmd.spawn().map_err(|e| ArtelError::Spawn {
            command: self.settings.command.clone(),
            reason: e.to_string(),
        })?;

        let transport = |what: &str| ArtelError::Transport {
            reason: format!("agent {} not captured", what),
        };
        let stdout = child.stdout.take().ok_or_else(|| transport("stdout"))?;
        let stdin = child.stdin.take().ok_or_else(|| transport("stdin"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("agent stderr: {}", line);
                }
            });
        }

        *self.child.lock().await = Some(child);
        self.attach(stdout, stdin).await;

        if let Err(e) = self.handshake().await {
            self.stop().await;
            return Err(e);
        }
        Ok(())
    }

    /// Wire the link to an already-open pair of streams and start the reader.
    pub async fn attach<R, W>(&self, reader: R, writer: W)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        *self.shared.writer.lock().await = Some(Box::new(writer));

        let generation = self.shared.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let handle = tokio::spawn(read_loop(self.shared.clone(), reader, generation));
        let previous = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Send `initialize` with the protocol version and client identity.
    pub async fn handshake(&self) -> Result<()> {
        let params = json!({
            "protocol_version": self.settings.protocol_version,
            "client_info": {
                "name": self.settings.client_name,
                "version": self.settings.client_version,
            }
        });

        if self.settings.dry_run {
            return Ok(());
        }

        match self
            .exchange("initialize", Some(params), self.settings.handshake_timeout)
            .await
        {
            Ok(Ok(_)) => {
                tracing::info!("wire protocol initialized");
                Ok(())
            }
            Ok(Err(error)) => {
                tracing::error!("wire protocol initialization failed: {}", error);
                Err(ArtelError::HandshakeRejected {
                    reason: error.to_string(),
                })
            }
            Err(CallFailure::TimedOut) => Err(ArtelError::HandshakeTimeout {
                timeout_secs: self.settings.handshake_timeout.as_secs(),
            }),
            Err(CallFailure::Closed) => Err(ArtelError::Transport {
                reason: "agent output closed before initialize was answered".into(),
            }),
            Err(CallFailure::Unsent) => Err(ArtelError::Transport {
                reason: "initialize could not be sent".into(),
            }),
        }
    }

    /// Send a request and wait up to `timeout` for its response.
    ///
    /// Returns `None` if the request could not be written, timed out, or the
    /// agent's output closed first. A response arriving after the timeout is
    /// discarded by the reader.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Option<RpcReply> {
        if self.settings.dry_run {
            tracing::info!("dry run: would send {}({:?})", method, params);
            return Some(Ok(json!({ "status": "dry_run" })));
        }
        self.exchange(method, params, timeout).await.ok()
    }

    /// One request/response round trip. Writing and waiting share a single
    /// deadline.
    async fn exchange(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> std::result::Result<RpcReply, CallFailure> {
        let deadline = tokio::time::Instant::now() + timeout;
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = match serde_json::to_string(&OutboundRequest::new(id, method, params.as_ref()))
        {
            Ok(line) => line,
            Err(e) => {
                tracing::error!("failed to encode {} request: {}", method, e);
                return Err(CallFailure::Unsent);
            }
        };

        let (tx, rx) = oneshot::channel();
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(
                id,
                PendingCall {
                    method: method.to_string(),
                    issued_at: Instant::now(),
                    slot: tx,
                },
            );

        if let Err(e) = self.shared.write_line(&line, deadline).await {
            tracing::error!("failed to send {} request: {}", method, e);
            self.shared.take_pending(id);
            return Err(CallFailure::Unsent);
        }
        tracing::debug!("sent: {} (id={})", method, id);

        match tokio::time::timeout_at(deadline, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                tracing::warn!("request {} ({}) abandoned: agent output closed", id, method);
                Err(CallFailure::Closed)
            }
            Err(_) => {
                self.shared.take_pending(id);
                tracing::warn!("request {} ({}) timed out", id, method);
                Err(CallFailure::TimedOut)
            }
        }
    }

    /// Send a request with the default call timeout.
    pub async fn call(&self, method: &str, params: Option<Value>) -> Option<RpcReply> {
        self.send_request(method, params, self.settings.call_timeout)
            .await
    }

    /// Hand the agent a natural-language instruction and wait for the turn.
    pub async fn prompt(&self, user_input: &str) -> Option<RpcReply> {
        self.call("prompt", Some(json!({ "user_input": user_input })))
            .await
    }

    /// Ask the agent to cancel its current turn.
    pub async fn cancel(&self) -> Option<RpcReply> {
        self.call("cancel", Some(json!({}))).await
    }

    /// Answer a peer request.
    pub async fn respond(&self, id: Value, result: Value) -> Result<()> {
        if self.settings.dry_run {
            tracing::info!("dry run: would reply to {} with {}", id, result);
            return Ok(());
        }
        let line = serde_json::to_string(&OutboundReply::new(id, result))?;
        let deadline = tokio::time::Instant::now() + self.settings.call_timeout;
        self.shared.write_line(&line, deadline).await
    }

    pub fn pending_count(&self) -> usize {
        self.shared
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// True if an agent was spawned and has since exited.
    pub async fn has_exited(&self) -> bool {
        let mut guard = self.child.lock().await;
        match guard.as_mut() {
            Some(child) => match child.try_wait() {
                Ok(Some(status)) => {
                    tracing::debug!("agent exited with {}", status);
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!("failed to query agent status: {}", e);
                    true
                }
            },
            None => false,
        }
    }

    /// Stop the reader, close the agent's stdin, and terminate the agent,
    /// force-killing it after the grace period.
    pub async fn stop(&self) {
        let reader = self
            .reader
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(reader) = reader {
            reader.abort();
        }
        // Close stdin first unless a write is in flight; that write ends
        // once the agent is gone.
        if let Ok(mut writer) = self.shared.writer.try_lock() {
            writer.take();
        }

        let child = self.child.lock().await.take();
        if let Some(child) = child {
            terminate(child, self.settings.stop_grace).await;
            tracing::info!("agent stopped");
        }
        self.shared.writer.lock().await.take();
        self.shared.release_pending();
    }

    /// Stop the current agent and start a fresh one.
    pub async fn restart(&self, working_dir: &Path) -> Result<()> {
        self.stop().await;
        self.start(working_dir).await
    }
}

#[cfg(unix)]
async fn terminate(mut child: Child, grace: Duration) {
    if let Ok(Some(_)) = child.try_wait() {
        return;
    }
    if let Some(pid) = child.id() {
        // SAFETY: signalling a pid we spawned and have not yet reaped.
        unsafe {
            libc::kill(pid as libc::pid_t, libc::SIGTERM);
        }
    }
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        tracing::warn!("agent ignored SIGTERM for {:?}; killing", grace);
        let _ = child.kill().await;
    }
}

#[cfg(not(unix))]
async fn terminate(mut child: Child, _grace: Duration) {
    let _ = child.kill().await;
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn test_settings() -> LinkSettings {
        LinkSettings {
            call_timeout: Duration::from_secs(5),
            handshake_timeout: Duration::from_secs(5),
            ..LinkSettings::default()
        }
    }

    #[tokio::test]
    async fn dry_run_short_circuits_calls() {
        let link = RpcLink::new(LinkSettings {
            dry_run: true,
            ..test_settings()
        });
        link.start(Path::new(".")).await.unwrap();
        let reply = link.prompt("hello").await.unwrap().unwrap();
        assert_eq!(reply["status"], "dry_run");
        assert!(!link.has_exited().await);
    }

    #[tokio::test]
    async fn send_without_connection_returns_none() {
        let link = RpcLink::new(test_settings());
        let reply = link
            .send_request("prompt", None, Duration::from_millis(50))
            .await;
        assert!(reply.is_none());
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn ids_increase_monotonically() {
        let link = RpcLink::new(test_settings());
        let (agent_side, daemon_side) = duplex(4096);
        let (daemon_read, daemon_write) = tokio::io::split(daemon_side);
        link.attach(daemon_read, daemon_write).await;

        let (agent_read, _agent_write) = tokio::io::split(agent_side);
        let mut requests = BufReader::new(agent_read).lines();

        for _ in 0..3 {
            link.send_request("cancel", None, Duration::from_millis(10))
                .await;
        }

        let mut ids = Vec::new();
        for _ in 0..3 {
            let line = requests.next_line().await.unwrap().unwrap();
            let value: Value = serde_json::from_str(&line).unwrap();
            assert_eq!(value["jsonrpc"], "2.0");
            ids.push(value["id"].as_u64().unwrap());
        }
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn peer_requests_reach_request_handlers() {
        let link = RpcLink::new(test_settings());
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let s = seen.clone();
        link.on_event(EventKind::Request, move |message| {
            s.lock().unwrap().push(message.clone());
            Ok(())
        });

        let (agent_side, daemon_side) = duplex(4096);
        let (daemon_read, daemon_write) = tokio::io::split(daemon_side);
        link.attach(daemon_read, daemon_write).await;
        let (_agent_read, mut agent_write) = tokio::io::split(agent_side);

        agent_write
            .write_all(b"{\"method\":\"request\",\"id\":9,\"params\":{\"type\":\"ApprovalRequest\"}}\n")
            .await
            .unwrap();
        drop(agent_write);

        for _ in 0..50 {
            if !seen.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0]["id"], 9);
        assert_eq!(seen[0]["params"]["type"], "ApprovalRequest");
    }
}
