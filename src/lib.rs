//! Coordination daemon that drives a wire-mode coding agent over JSON-RPC and
//! reacts to routed commits in a git repository.

pub mod approval;
pub mod cli;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod files;
pub mod metrics;
pub mod process;
pub mod repo;
pub mod rpc;
