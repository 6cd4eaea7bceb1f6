//! Trigger events received from the version-control host.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Kind of event that can start a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Push,
    PullRequest,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Push => "push",
            EventKind::PullRequest => "pull_request",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "push" => Ok(EventKind::Push),
            "pull_request" | "pull-request" | "pr" => Ok(EventKind::PullRequest),
            other => Err(format!("unknown event kind: {other}")),
        }
    }
}

/// A push or pull-request notification.
///
/// For pull requests `git_ref` names the base branch the change targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerEvent {
    pub kind: EventKind,
    #[serde(rename = "ref")]
    pub git_ref: String,
    #[serde(default)]
    pub changed_paths: BTreeSet<String>,
    #[serde(default)]
    pub sha: Option<String>,
    #[serde(default)]
    pub actor: Option<String>,
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl TriggerEvent {
    pub fn new<I, S>(kind: EventKind, git_ref: impl Into<String>, changed_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind,
            git_ref: git_ref.into(),
            changed_paths: changed_paths.into_iter().map(Into::into).collect(),
            sha: None,
            actor: None,
            received_at: Utc::now(),
        }
    }

    pub fn push<I, S>(git_ref: impl Into<String>, changed_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(EventKind::Push, git_ref, changed_paths)
    }

    pub fn pull_request<I, S>(base_ref: impl Into<String>, changed_paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(EventKind::PullRequest, base_ref, changed_paths)
    }

    pub fn with_sha(mut self, sha: impl Into<String>) -> Self {
        self.sha = Some(sha.into());
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }

    /// Short branch name, with any `refs/heads/` prefix removed.
    pub fn branch(&self) -> &str {
        self.git_ref
            .strip_prefix("refs/heads/")
            .unwrap_or(&self.git_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_branch_strips_ref_prefix() {
        let event = TriggerEvent::push("refs/heads/main", ["src/lib.rs"]);
        assert_eq!(event.branch(), "main");

        let event = TriggerEvent::push("feature/x", ["src/lib.rs"]);
        assert_eq!(event.branch(), "feature/x");
    }

    #[test]
    fn test_deserialize_minimal_event() {
        let json = r#"{"kind":"pull_request","ref":"main","changed_paths":["Cargo.toml"]}"#;
        let event: TriggerEvent = serde_json::from_str(json).unwrap();

        assert_eq!(event.kind, EventKind::PullRequest);
        assert!(event.changed_paths.contains("Cargo.toml"));
        assert!(event.sha.is_none());
    }

    #[test]
    fn test_event_kind_parse() {
        assert_eq!("push".parse::<EventKind>().unwrap(), EventKind::Push);
        assert_eq!("pr".parse::<EventKind>().unwrap(), EventKind::PullRequest);
        assert!("tag".parse::<EventKind>().is_err());
    }
}
