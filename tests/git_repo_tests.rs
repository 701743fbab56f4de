//! Tests for reading a real git repository. Skipped when `git` is not installed.

use std::path::Path;
use std::process::Command;

use tempfile::TempDir;

use artel_wire::repo::watcher::poll_once;
use artel_wire::repo::{GitRepo, RepoSource};

fn git_available() -> bool {
    Command::new("git").arg("--version").output().is_ok()
}

fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "artel")
        .env("GIT_AUTHOR_EMAIL", "artel@example.com")
        .env("GIT_COMMITTER_NAME", "artel")
        .env("GIT_COMMITTER_EMAIL", "artel@example.com")
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

fn init_repo() -> TempDir {
    let tmp = TempDir::new().unwrap();
    git(tmp.path(), &["init", "-q"]);
    git(tmp.path(), &["commit", "-q", "--allow-empty", "-m", "initial"]);
    tmp
}

#[tokio::test]
async fn reads_heads_and_messages() {
    if !git_available() {
        return;
    }
    let tmp = init_repo();
    git(tmp.path(), &["checkout", "-q", "-b", "kimi/T-3"]);
    git(
        tmp.path(),
        &[
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            "[AGENT:kimi] [ACTION:report] [TASK:T-3] weekly notes",
        ],
    );

    let repo = GitRepo::new(tmp.path());
    let heads = repo.branch_heads().await.unwrap();
    assert_eq!(heads.len(), 2);
    let hash = heads.get("kimi/T-3").expect("nested branch name");
    assert_eq!(hash.len(), 40);

    let message = repo.commit_message(hash).await.unwrap();
    assert_eq!(message, "[AGENT:kimi] [ACTION:report] [TASK:T-3] weekly notes");
}

#[tokio::test]
async fn unknown_revision_is_an_error() {
    if !git_available() {
        return;
    }
    let tmp = init_repo();
    let repo = GitRepo::new(tmp.path());
    assert!(repo
        .commit_message("0000000000000000000000000000000000000000")
        .await
        .is_err());
}

#[tokio::test]
async fn new_tagged_commit_is_detected_once() {
    if !git_available() {
        return;
    }
    let tmp = init_repo();
    let repo = GitRepo::new(tmp.path());
    let mut previous = repo.branch_heads().await.unwrap();

    git(
        tmp.path(),
        &[
            "commit",
            "-q",
            "--allow-empty",
            "-m",
            "Add tokenizer\n\n[AGENT:kimi] [ACTION:submit] [TASK:T-11]",
        ],
    );

    let events = poll_once(&repo, &mut previous).await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].tag.task, "T-11");
    assert_eq!(events[0].tag.action, "submit");

    assert!(poll_once(&repo, &mut previous).await.is_empty());
}

#[tokio::test]
async fn packed_refs_are_read() {
    if !git_available() {
        return;
    }
    let tmp = init_repo();
    git(tmp.path(), &["branch", "archived"]);
    git(tmp.path(), &["pack-refs", "--all"]);

    let heads = GitRepo::new(tmp.path()).branch_heads().await.unwrap();
    assert!(heads.contains_key("archived"));
}
