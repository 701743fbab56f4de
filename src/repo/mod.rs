pub mod watcher;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::{ArtelError, Result};

/// Branch name -> head commit hash. Replaced wholesale on every poll.
pub type BranchSnapshot = BTreeMap<String, String>;

/// Branches whose head differs between two snapshots, including branches
/// that were created or deleted.
pub fn changed_branches(previous: &BranchSnapshot, current: &BranchSnapshot) -> BTreeSet<String> {
    let mut changed: BTreeSet<String> = current
        .iter()
        .filter(|(branch, hash)| previous.get(*branch) != Some(*hash))
        .map(|(branch, _)| branch.clone())
        .collect();
    changed.extend(
        previous
            .keys()
            .filter(|branch| !current.contains_key(*branch))
            .cloned(),
    );
    changed
}

static AGENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[AGENT:(\w+)\]").expect("valid agent tag regex"));
static ACTION_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[ACTION:(\w+)\]").expect("valid action tag regex"));
static TASK_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[TASK:([\w-]+)\]").expect("valid task tag regex"));

/// The `[AGENT:x] [ACTION:y] [TASK:z]` triple carried in a commit message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTag {
    pub agent: String,
    pub action: String,
    pub task: String,
}

impl RoutingTag {
    /// Extract the tag from anywhere in `message`. All three tokens must be
    /// present; their order does not matter.
    pub fn parse(message: &str) -> Option<Self> {
        let capture = |re: &Regex| {
            re.captures(message)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
        };
        Some(Self {
            agent: capture(&AGENT_TAG)?,
            action: capture(&ACTION_TAG)?,
            task: capture(&TASK_TAG)?,
        })
    }
}

/// A routed commit observed on a branch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub branch: String,
    pub hash: String,
    pub tag: RoutingTag,
    pub message: String,
}

/// Read access to a repository's branch heads and commit messages.
#[async_trait]
pub trait RepoSource: Send + Sync {
    /// Current head of every local branch.
    async fn branch_heads(&self) -> Result<BranchSnapshot>;

    /// Full message of the commit `hash`.
    async fn commit_message(&self, hash: &str) -> Result<String>;
}

/// A git working tree read through `.git/` and the `git` binary.
pub struct GitRepo {
    root: PathBuf,
}

impl GitRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn git_dir(&self) -> PathBuf {
        self.root.join(".git")
    }
}

#[async_trait]
impl RepoSource for GitRepo {
    async fn branch_heads(&self) -> Result<BranchSnapshot> {
        let git_dir = self.git_dir();
        tokio::task::spawn_blocking(move || read_branch_heads(&git_dir))
            .await
            .map_err(|e| ArtelError::RepoCommand {
                reason: format!("ref scan task failed: {}", e),
            })?
    }

    async fn commit_message(&self, hash: &str) -> Result<String> {
        let output = tokio::process::Command::new("git")
            .args(["log", "-1", "--pretty=%B", hash])
            .current_dir(&self.root)
            .output()
            .await
            .map_err(|e| ArtelError::RepoCommand {
                reason: format!("failed to run git log: {}", e),
            })?;

        if !output.status.success() {
            return Err(ArtelError::RepoCommand {
                reason: format!(
                    "git log {} exited with {}: {}",
                    hash,
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Read heads from `packed-refs` and then loose refs, which take precedence.
pub fn read_branch_heads(git_dir: &Path) -> Result<BranchSnapshot> {
    let mut heads = BranchSnapshot::new();

    let packed = git_dir.join("packed-refs");
    if packed.exists() {
        let contents = std::fs::read_to_string(&packed)?;
        heads.extend(parse_packed_refs(&contents));
    }

    let refs_dir = git_dir.join("refs").join("heads");
    if refs_dir.is_dir() {
        collect_loose_refs(&refs_dir, &refs_dir, &mut heads)?;
    }
    Ok(heads)
}

fn parse_packed_refs(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .filter(|line| !line.starts_with('#') && !line.starts_with('^'))
        .filter_map(|line| line.split_once(' '))
        .filter_map(|(hash, name)| {
            name.trim()
                .strip_prefix("refs/heads/")
                .map(|branch| (branch.to_string(), hash.trim().to_string()))
        })
        .collect()
}

fn collect_loose_refs(base: &Path, dir: &Path, heads: &mut BranchSnapshot) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            collect_loose_refs(base, &path, heads)?;
        } else if path.is_file() {
            let Ok(relative) = path.strip_prefix(base) else {
                continue;
            };
            let branch = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            // A ref being rewritten may be briefly unreadable; skip it this round.
            if let Ok(contents) = std::fs::read_to_string(&path) {
                let hash = contents.trim();
                if !hash.is_empty() {
                    heads.insert(branch, hash.to_string());
                }
            }
        }
    }
    Ok(())
}
