use std::fmt;
use std::str::FromStr;

use crate::repo::ChangeEvent;
use crate::rpc::link::RpcLink;

/// Automations a routed commit can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Submit,
    Approve,
    Report,
    Evaluate,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Submit => "submit",
            Action::Approve => "approve",
            Action::Report => "report",
            Action::Evaluate => "evaluate",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "submit" => Ok(Action::Submit),
            "approve" => Ok(Action::Approve),
            "report" => Ok(Action::Report),
            "evaluate" => Ok(Action::Evaluate),
            other => Err(format!("unknown action: {other}")),
        }
    }
}

/// What happened to a routed commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionOutcome {
    Completed(Action),
    Failed(Action),
    /// The action name has no automation.
    Ignored(String),
}

/// Build the natural-language instruction for `action`.
pub fn instruction(action: Action, event: &ChangeEvent) -> String {
    let agent = &event.tag.agent;
    let task = &event.tag.task;
    match action {
        Action::Submit => format!(
            "You are reviewing a code submission for task {task} from agent {agent} \
             (commit {hash}).\n\n\
             Review steps:\n\
             1. Read the task brief in .ai/tasks/{task}.md and note its acceptance criteria.\n\
             2. Inspect the change with: git show {hash}\n\
             3. Mark every acceptance criterion as MET or UNMET.\n\
             4. Check that the touched files stay inside .ai/boundaries.md.\n\
             5. Check that the commit message follows the [AGENT:x] [ACTION:y] [TASK:z] convention.\n\n\
             Write the review to .ai/reviews/{task}-review.md following .ai/templates/review.md \
             and finish with a verdict of APPROVED, CHANGES_REQUESTED or REJECTED.",
            hash = event.hash,
        ),
        Action::Approve => format!(
            "Task {task} has been approved. Merge it:\n\n\
             1. Confirm that branch {agent}/{task} exists.\n\
             2. Check out the pre-mortal branch: git checkout pre-mortal\n\
             3. Merge with: git merge {agent}/{task} --no-ff\n\
             4. On conflicts, run git merge --abort and write a conflict report.\n\
             5. On success, mark {task} as DONE in .ai/status.md.\n\
             6. Check out the branch you started on."
        ),
        Action::Report => format!(
            "Agent {agent} committed a report for task {task}.\n\n\
             Commit message:\n{message}\n\n\
             Append a structured summary of it to .ai/reports/sprint-current.md.",
            message = event.message,
        ),
        Action::Evaluate => format!(
            "Run the sprint evaluation requested by task {task}.\n\n\
             1. If scripts/generate-evaluation.sh exists, run: scripts/generate-evaluation.sh --baseline\n\
             2. Summarize the results against the sprint goals in .ai/status.md.\n\
             3. Write the evaluation report to .ai/reports/evaluation-{task}.md."
        ),
    }
}

/// Route one commit to its automation and wait for the agent's turn.
pub async fn handle_change(link: &RpcLink, event: &ChangeEvent) -> ActionOutcome {
    let tag = &event.tag;
    tracing::info!(
        "processing [{}] [{}] [{}] on {}",
        tag.agent,
        tag.action,
        tag.task,
        event.branch
    );

    let action = match tag.action.parse::<Action>() {
        Ok(action) => action,
        Err(_) => {
            tracing::info!("action '{}': no automation triggered", tag.action);
            return ActionOutcome::Ignored(tag.action.clone());
        }
    };

    tracing::info!("sending {} request for {}", action, tag.task);
    match link.prompt(&instruction(action, event)).await {
        Some(Ok(_)) => {
            tracing::info!("{} for {} completed", action, tag.task);
            ActionOutcome::Completed(action)
        }
        Some(Err(error)) => {
            tracing::error!("{} for {} failed: {}", action, tag.task, error);
            ActionOutcome::Failed(action)
        }
        None => {
            tracing::error!("{} for {} failed: no response", action, tag.task);
            ActionOutcome::Failed(action)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::RoutingTag;
    use crate::rpc::link::LinkSettings;

    fn event(action: &str) -> ChangeEvent {
        ChangeEvent {
            branch: "kimi/T-042".into(),
            hash: "abc123".into(),
            tag: RoutingTag {
                agent: "kimi".into(),
                action: action.into(),
                task: "T-042".into(),
            },
            message: format!("[AGENT:kimi] [ACTION:{action}] [TASK:T-042] progress notes"),
        }
    }

    #[test]
    fn action_names_round_trip() {
        for action in [Action::Submit, Action::Approve, Action::Report, Action::Evaluate] {
            assert_eq!(action.as_str().parse::<Action>(), Ok(action));
        }
        assert!("deploy".parse::<Action>().is_err());
        assert!("Submit".parse::<Action>().is_err());
    }

    #[test]
    fn submit_points_at_task_brief_and_review() {
        let text = instruction(Action::Submit, &event("submit"));
        assert!(text.contains(".ai/tasks/T-042.md"));
        assert!(text.contains(".ai/reviews/T-042-review.md"));
        assert!(text.contains("abc123"));
        assert!(text.contains("CHANGES_REQUESTED"));
    }

    #[test]
    fn approve_merges_agent_branch() {
        let text = instruction(Action::Approve, &event("approve"));
        assert!(text.contains("git merge kimi/T-042 --no-ff"));
        assert!(text.contains("pre-mortal"));
        assert!(text.contains(".ai/status.md"));
    }

    #[test]
    fn report_carries_commit_message() {
        let text = instruction(Action::Report, &event("report"));
        assert!(text.contains("progress notes"));
        assert!(text.contains(".ai/reports/sprint-current.md"));
    }

    #[test]
    fn evaluate_mentions_baseline_script() {
        let text = instruction(Action::Evaluate, &event("evaluate"));
        assert!(text.contains("scripts/generate-evaluation.sh --baseline"));
    }

    #[tokio::test]
    async fn unknown_action_is_ignored() {
        let link = RpcLink::new(LinkSettings {
            dry_run: true,
            ..LinkSettings::default()
        });
        let outcome = handle_change(&link, &event("deploy")).await;
        assert_eq!(outcome, ActionOutcome::Ignored("deploy".into()));
    }

    #[tokio::test]
    async fn known_action_completes_in_dry_run() {
        let link = RpcLink::new(LinkSettings {
            dry_run: true,
            ..LinkSettings::default()
        });
        let outcome = handle_change(&link, &event("report")).await;
        assert_eq!(outcome, ActionOutcome::Completed(Action::Report));
    }
}
