use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use artel_wire::cli;
use artel_wire::config::{self, DaemonConfig};
use artel_wire::coordinator::{RunOptions, StopReason};
use artel_wire::files::DEFAULT_PURPOSE;

#[derive(Parser)]
#[command(name = "artel-wire", version, about = "Wire-mode agent coordination daemon")]
struct Cli {
    /// Project root (defaults to the current directory).
    #[arg(long, global = true)]
    project_root: Option<PathBuf>,

    /// Debug-level logging.
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the daemon in the foreground.
    Start {
        /// Do not spawn the agent; every call succeeds synthetically.
        #[arg(long)]
        dry_run: bool,
        /// Approve every agent request without asking.
        #[arg(long)]
        auto_approve: bool,
    },
    /// Show whether the daemon is running and the tail of its log.
    Status,
    /// Stop a running daemon.
    Stop,
    /// List recent approval decisions.
    Approvals {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
    /// Manage files in the remote file store.
    Files {
        #[command(subcommand)]
        action: FilesCommand,
    },
}

#[derive(Subcommand)]
enum FilesCommand {
    Upload {
        file: PathBuf,
        #[arg(long, default_value = DEFAULT_PURPOSE)]
        purpose: String,
    },
    List {
        #[arg(long)]
        purpose: Option<String>,
    },
    Get {
        id: String,
        /// Print the file content instead of its metadata.
        #[arg(long)]
        content: bool,
    },
    Delete {
        id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("artel-wire: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let root = cli
        .project_root
        .clone()
        .unwrap_or_else(config::default_project_root);
    let config = DaemonConfig::load_project(&root).context("failed to load configuration")?;

    let log_file = match cli.command {
        Command::Start { .. } => Some(config.paths.resolve(&root).log_file),
        _ => None,
    };
    init_logging(cli.verbose, log_file.as_deref())?;

    let code = match cli.command {
        Command::Start {
            dry_run,
            auto_approve,
        } => {
            let options = RunOptions {
                dry_run,
                auto_approve,
            };
            match cli::daemon::run_start(root, config, options).await? {
                StopReason::RestartsExhausted => ExitCode::FAILURE,
                _ => ExitCode::SUCCESS,
            }
        }
        Command::Status => {
            cli::daemon::run_status(&root, &config)?;
            ExitCode::SUCCESS
        }
        Command::Stop => exit_code(cli::daemon::run_stop(&root, &config).await?),
        Command::Approvals { limit } => {
            cli::approvals::run_approvals(&root, &config, limit)?;
            ExitCode::SUCCESS
        }
        Command::Files { action } => match action {
            FilesCommand::Upload { file, purpose } => {
                cli::files::run_upload(&root, &file, &purpose).await?;
                ExitCode::SUCCESS
            }
            FilesCommand::List { purpose } => {
                cli::files::run_list(&root, purpose.as_deref()).await?;
                ExitCode::SUCCESS
            }
            FilesCommand::Get { id, content } => {
                cli::files::run_get(&root, &id, content).await?;
                ExitCode::SUCCESS
            }
            FilesCommand::Delete { id } => exit_code(cli::files::run_delete(&root, &id).await?),
        },
    };
    Ok(code)
}

fn exit_code(ok: bool) -> ExitCode {
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// stderr always; `start` also appends to the daemon log file.
fn init_logging(verbose: bool, log_file: Option<&Path>) -> anyhow::Result<()> {
    let default_level = if verbose {
        "artel_wire=debug"
    } else {
        "artel_wire=info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let file_layer = match log_file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("failed to open log file {}", path.display()))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(Mutex::new(file))
                    .with_ansi(false),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();
    Ok(())
}
