//! Single-instance bookkeeping for the daemon process.

pub mod pidfile;

pub use pidfile::{stop_daemon, DaemonStatus, PidFile, StopOutcome};
