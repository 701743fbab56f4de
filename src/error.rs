use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum ArtelError {
    #[error("config parse error in {path}: {reason}")]
    ConfigParse { path: PathBuf, reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("failed to spawn agent `{command}`: {reason}")]
    Spawn { command: String, reason: String },

    #[error("rpc transport error: {reason}")]
    Transport { reason: String },

    #[error("agent link is not connected")]
    NotConnected,

    #[error("handshake rejected by agent: {reason}")]
    HandshakeRejected { reason: String },

    #[error("handshake timeout after {timeout_secs}s")]
    HandshakeTimeout { timeout_secs: u64 },

    #[error("git command failed: {reason}")]
    RepoCommand { reason: String },

    #[error("daemon already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("invalid pid file {path}: {reason}")]
    InvalidPidFile { path: PathBuf, reason: String },

    #[error("no API key found (set KIMI_API_KEY in .env.project, .env or the environment)")]
    MissingApiKey,

    #[error("invalid API key: {reason}")]
    InvalidApiKey { reason: String },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("api error: status={status}, body={body}")]
    Api { status: u16, body: String },
}

pub type Result<T> = std::result::Result<T, ArtelError>;
