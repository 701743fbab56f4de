pub mod journal;

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, watch};

/// Outcome of an approval request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Pending,
    Approved,
    Rejected,
}

impl std::fmt::Display for ApprovalDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ApprovalDecision::Pending => "pending",
            ApprovalDecision::Approved => "approved",
            ApprovalDecision::Rejected => "rejected",
        })
    }
}

/// One entry in the decision log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub timestamp: DateTime<Utc>,
    pub request_type: String,
    pub tool_name: String,
    pub description: String,
    pub decision: ApprovalDecision,
}

/// How requests are resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalMode {
    /// Approve everything without asking (CI).
    Automatic,
    /// Ask the operator on the terminal.
    Interactive,
}

/// The request as shown to an operator.
#[derive(Debug, Clone)]
pub struct ApprovalPrompt {
    pub request_type: String,
    pub tool_name: String,
    pub description: String,
}

/// Source of operator answers. `ask` may block indefinitely.
pub trait Prompter: Send + Sync {
    /// Present the request and read one line of input. `Ok(None)` means the
    /// input stream ended.
    fn ask(&self, prompt: &ApprovalPrompt) -> std::io::Result<Option<String>>;
}

/// Prompts on stdout and reads the answer from stdin.
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&self, prompt: &ApprovalPrompt) -> std::io::Result<Option<String>> {
        let rule = "=".repeat(60);
        let mut out = std::io::stdout().lock();
        writeln!(out, "\n{rule}")?;
        writeln!(out, "  APPROVAL REQUEST")?;
        writeln!(out, "{rule}")?;
        writeln!(out, "  Type: {}", prompt.request_type)?;
        writeln!(out, "  Tool: {}", prompt.tool_name)?;
        writeln!(out, "  Description: {}", prompt.description)?;
        writeln!(out, "{rule}")?;
        write!(out, "  Approve? [Y/n]: ")?;
        out.flush()?;
        drop(out);

        let mut line = String::new();
        match std::io::stdin().lock().read_line(&mut line)? {
            0 => Ok(None),
            _ => Ok(Some(line)),
        }
    }
}

/// Empty input or an affirmative token approves.
pub fn is_affirmative(answer: &str) -> bool {
    matches!(answer.trim().to_lowercase().as_str(), "" | "y" | "yes")
}

/// Run `ask` on a detached thread. A read stuck on stdin must never hold up
/// runtime shutdown, so the blocking pool is not used.
fn ask_detached(
    prompter: Arc<dyn Prompter>,
    prompt: ApprovalPrompt,
) -> oneshot::Receiver<std::io::Result<Option<String>>> {
    let (tx, rx) = oneshot::channel();
    let spawned = std::thread::Builder::new()
        .name("approval-prompt".into())
        .spawn(move || {
            let _ = tx.send(prompter.ask(&prompt));
        });
    if let Err(e) = spawned {
        // The sender went down with the closure, so `rx` resolves to an error.
        tracing::error!("failed to start approval prompt: {}", e);
    }
    rx
}

/// Resolves agent approval requests and keeps the decision log.
pub struct ApprovalGate {
    mode: ApprovalMode,
    prompter: Arc<dyn Prompter>,
    log: Mutex<Vec<ApprovalRecord>>,
    journal: Option<PathBuf>,
}

impl ApprovalGate {
    pub fn new(mode: ApprovalMode) -> Self {
        Self::with_prompter(mode, Arc::new(TerminalPrompter))
    }

    pub fn with_prompter(mode: ApprovalMode, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            mode,
            prompter,
            log: Mutex::new(Vec::new()),
            journal: None,
        }
    }

    /// Also append every resolved record to a JSONL file.
    pub fn with_journal(mut self, path: PathBuf) -> Self {
        self.journal = Some(path);
        self
    }

    pub fn mode(&self) -> ApprovalMode {
        self.mode
    }

    /// Resolve one request. Blocks for operator input in interactive mode.
    /// Exactly one record is appended per call.
    pub fn resolve(&self, request_type: &str, tool_name: &str, description: &str) -> bool {
        let index = self.open(request_type, tool_name, description);
        let approved = match self.mode {
            ApprovalMode::Automatic => self.auto_approve(tool_name),
            ApprovalMode::Interactive => {
                let answer = self.prompter.ask(&ApprovalPrompt {
                    request_type: request_type.to_string(),
                    tool_name: tool_name.to_string(),
                    description: description.to_string(),
                });
                interpret(tool_name, answer)
            }
        };
        self.close(index, approved)
    }

    /// Like [`resolve`](Self::resolve), but an open operator prompt is
    /// abandoned and the request rejected once `shutdown` turns true.
    pub async fn resolve_or_cancel(
        &self,
        request_type: &str,
        tool_name: &str,
        description: &str,
        shutdown: &mut watch::Receiver<bool>,
    ) -> bool {
        let index = self.open(request_type, tool_name, description);
        let approved = match self.mode {
            ApprovalMode::Automatic => self.auto_approve(tool_name),
            ApprovalMode::Interactive => {
                let answer = ask_detached(
                    self.prompter.clone(),
                    ApprovalPrompt {
                        request_type: request_type.to_string(),
                        tool_name: tool_name.to_string(),
                        description: description.to_string(),
                    },
                );
                tokio::select! {
                    answer = answer => match answer {
                        Ok(answer) => interpret(tool_name, answer),
                        Err(_) => {
                            tracing::warn!("approval prompt ended without an answer");
                            false
                        }
                    },
                    _ = shutdown.wait_for(|stop| *stop) => {
                        tracing::warn!("approval prompt interrupted; rejecting {}", tool_name);
                        false
                    }
                }
            }
        };
        self.close(index, approved)
    }

    fn auto_approve(&self, tool_name: &str) -> bool {
        tracing::info!("auto-approving: {}", tool_name);
        true
    }

    /// Push a pending record and return its position.
    fn open(&self, request_type: &str, tool_name: &str, description: &str) -> usize {
        tracing::info!(
            "approval request: type={} tool={} desc={}",
            request_type,
            tool_name,
            description.chars().take(80).collect::<String>()
        );
        let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
        log.push(ApprovalRecord {
            timestamp: Utc::now(),
            request_type: request_type.to_string(),
            tool_name: tool_name.to_string(),
            description: description.to_string(),
            decision: ApprovalDecision::Pending,
        });
        log.len() - 1
    }

    /// Settle the record at `index` and journal it.
    fn close(&self, index: usize, approved: bool) -> bool {
        let record = {
            let mut log = self.log.lock().unwrap_or_else(|e| e.into_inner());
            let record = &mut log[index];
            record.decision = if approved {
                ApprovalDecision::Approved
            } else {
                ApprovalDecision::Rejected
            };
            record.clone()
        };

        if let Some(path) = &self.journal {
            if let Err(e) = journal::append(path, &record) {
                tracing::warn!("failed to persist approval record: {}", e);
            }
        }
        approved
    }

    /// Snapshot of the in-memory decision log.
    pub fn records(&self) -> Vec<ApprovalRecord> {
        self.log.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Map a prompter answer to a decision. End of input and read errors reject.
fn interpret(tool_name: &str, answer: std::io::Result<Option<String>>) -> bool {
    let approved = match answer {
        Ok(Some(answer)) => is_affirmative(&answer),
        Ok(None) => false,
        Err(e) => {
            tracing::warn!("approval input failed: {}", e);
            false
        }
    };
    tracing::info!(
        "human {}: {}",
        if approved { "approved" } else { "rejected" },
        tool_name
    );
    approved
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Replays scripted answers; `None` simulates end of input.
    struct ScriptedPrompter {
        answers: Mutex<VecDeque<std::io::Result<Option<String>>>>,
    }

    impl ScriptedPrompter {
        fn new(answers: Vec<std::io::Result<Option<String>>>) -> Arc<Self> {
            Arc::new(Self {
                answers: Mutex::new(answers.into()),
            })
        }
    }

    impl Prompter for ScriptedPrompter {
        fn ask(&self, _prompt: &ApprovalPrompt) -> std::io::Result<Option<String>> {
            self.answers
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Ok(None))
        }
    }

    #[test]
    fn automatic_mode_always_approves() {
        let gate = ApprovalGate::with_prompter(ApprovalMode::Automatic, ScriptedPrompter::new(vec![]));
        assert!(gate.resolve("ApprovalRequest", "shell", "rm -rf target"));
        let records = gate.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].decision, ApprovalDecision::Approved);
        assert_eq!(records[0].tool_name, "shell");
    }

    #[test]
    fn interactive_answers() {
        let gate = ApprovalGate::with_prompter(
            ApprovalMode::Interactive,
            ScriptedPrompter::new(vec![
                Ok(Some("\n".into())),
                Ok(Some("YES\n".into())),
                Ok(Some("n\n".into())),
                Ok(None),
                Err(std::io::Error::new(std::io::ErrorKind::Interrupted, "ctrl-c")),
            ]),
        );

        let outcomes: Vec<bool> = (0..5)
            .map(|_| gate.resolve("request", "write_file", "edit"))
            .collect();
        assert_eq!(outcomes, vec![true, true, false, false, false]);

        let decisions: Vec<ApprovalDecision> =
            gate.records().into_iter().map(|r| r.decision).collect();
        assert_eq!(
            decisions,
            vec![
                ApprovalDecision::Approved,
                ApprovalDecision::Approved,
                ApprovalDecision::Rejected,
                ApprovalDecision::Rejected,
                ApprovalDecision::Rejected,
            ]
        );
    }

    /// Never answers, like an operator who walked away.
    struct SilentPrompter;

    impl Prompter for SilentPrompter {
        fn ask(&self, _prompt: &ApprovalPrompt) -> std::io::Result<Option<String>> {
            std::thread::sleep(std::time::Duration::from_secs(3600));
            Ok(None)
        }
    }

    #[tokio::test]
    async fn shutdown_interrupts_open_prompt() {
        let gate = Arc::new(ApprovalGate::with_prompter(
            ApprovalMode::Interactive,
            Arc::new(SilentPrompter),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);

        let resolver = gate.clone();
        let pending = tokio::spawn(async move {
            let mut stop_rx = stop_rx;
            resolver
                .resolve_or_cancel("request", "shell", "make deploy", &mut stop_rx)
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(gate.records()[0].decision, ApprovalDecision::Pending);

        stop_tx.send(true).unwrap();
        let approved = tokio::time::timeout(std::time::Duration::from_secs(2), pending)
            .await
            .expect("prompt was not interrupted")
            .unwrap();
        assert!(!approved);
        assert_eq!(gate.records()[0].decision, ApprovalDecision::Rejected);
    }

    #[tokio::test]
    async fn prompt_answer_wins_before_shutdown() {
        let gate = ApprovalGate::with_prompter(
            ApprovalMode::Interactive,
            ScriptedPrompter::new(vec![Ok(Some("y\n".into()))]),
        );
        let (_stop_tx, mut stop_rx) = watch::channel(false);
        assert!(
            gate.resolve_or_cancel("request", "read_file", "cat", &mut stop_rx)
                .await
        );
        assert_eq!(gate.records()[0].decision, ApprovalDecision::Approved);
    }

    #[test]
    fn affirmative_tokens() {
        assert!(is_affirmative(""));
        assert!(is_affirmative("  y "));
        assert!(is_affirmative("Yes"));
        assert!(!is_affirmative("no"));
        assert!(!is_affirmative("yep"));
    }
}
