//! Workflow definition types.
//!
//! These types represent the user-authored `ferrous.yaml` configuration.

use crate::error::{Error, Result};
use crate::trigger::EventKind;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct WorkflowDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub triggers: Vec<TriggerConfig>,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    /// Environment passed to every backend phase.
    #[serde(default)]
    pub env: HashMap<String, String>,
    pub phases: PhaseCommands,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

fn default_version() -> String {
    "1".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TriggerConfig {
    #[serde(rename = "type")]
    pub trigger_type: EventKind,
    #[serde(default)]
    pub branches: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
    #[serde(default)]
    pub paths_ignore: Vec<String>,
}

impl TriggerConfig {
    pub fn new(trigger_type: EventKind) -> Self {
        Self {
            trigger_type,
            branches: vec![],
            paths: vec![],
            paths_ignore: vec![],
        }
    }

    pub fn branches(mut self, branches: &[&str]) -> Self {
        self.branches = branches.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn paths(mut self, paths: &[&str]) -> Self {
        self.paths = paths.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn paths_ignore(mut self, paths: &[&str]) -> Self {
        self.paths_ignore = paths.iter().map(|s| s.to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ConcurrencyConfig {
    /// Group key template. Supports `${{ workflow }}`, `${{ event }}`,
    /// `${{ ref }}`, `${{ branch }}` and `${{ env.NAME }}`.
    #[serde(default = "default_group")]
    pub group: String,
    /// Cancel the in-flight run of the group when a newer one arrives.
    ///
    /// Setting this to false opts into queueing: the in-flight run keeps
    /// going and the newest arrival waits behind it in `Pending`, replacing
    /// any run already waiting there. The group then holds two non-terminal
    /// runs at once, one executing and one pending. Only the default keeps
    /// the group to a single non-terminal run.
    #[serde(default = "default_true")]
    pub cancel_in_progress: bool,
}

fn default_group() -> String {
    "ci".to_string()
}

fn default_true() -> bool {
    true
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            group: default_group(),
            cancel_in_progress: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct PhaseCommands {
    pub build: String,
    pub test: String,
    #[serde(default = "default_shell")]
    pub shell: String,
}

fn default_shell() -> String {
    "sh".to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct TimeoutConfig {
    #[serde(default = "default_phase_minutes")]
    pub phase_minutes: u32,
    #[serde(default = "default_cancel_grace")]
    pub cancel_grace_seconds: u64,
}

fn default_phase_minutes() -> u32 {
    60
}

fn default_cancel_grace() -> u64 {
    10
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            phase_minutes: default_phase_minutes(),
            cancel_grace_seconds: default_cancel_grace(),
        }
    }
}

impl TimeoutConfig {
    pub fn phase_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(u64::from(self.phase_minutes) * 60)
    }

    pub fn cancel_grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.cancel_grace_seconds)
    }
}

impl Default for WorkflowDefinition {
    /// Build and test a Cargo project whenever Rust sources or the manifest
    /// change, cancelling superseded runs.
    fn default() -> Self {
        let paths = ["**.rs", "Cargo.toml"];
        Self {
            version: default_version(),
            name: "ci".to_string(),
            description: None,
            triggers: vec![
                TriggerConfig::new(EventKind::Push)
                    .branches(&["main"])
                    .paths(&paths),
                TriggerConfig::new(EventKind::PullRequest)
                    .branches(&["main"])
                    .paths(&paths),
            ],
            concurrency: ConcurrencyConfig::default(),
            env: HashMap::from([("CARGO_TERM_COLOR".to_string(), "always".to_string())]),
            phases: PhaseCommands {
                build: "cargo build --verbose".to_string(),
                test: "cargo test --verbose".to_string(),
                shell: default_shell(),
            },
            timeouts: TimeoutConfig::default(),
        }
    }
}

impl WorkflowDefinition {
    pub fn from_yaml(content: &str) -> Result<Self> {
        let definition: Self = serde_yaml::from_str(content)?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(Error::WorkflowNotFound(path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| Error::Serialization(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if self.name.trim().is_empty() {
            problems.push("name must not be empty".to_string());
        }
        if self.phases.build.trim().is_empty() {
            problems.push("phases.build must not be empty".to_string());
        }
        if self.phases.test.trim().is_empty() {
            problems.push("phases.test must not be empty".to_string());
        }
        if self.phases.shell.trim().is_empty() {
            problems.push("phases.shell must not be empty".to_string());
        }
        if self.concurrency.group.trim().is_empty() {
            problems.push("concurrency.group must not be empty".to_string());
        }
        if self.timeouts.phase_minutes == 0 {
            problems.push("timeouts.phase_minutes must be at least 1".to_string());
        }
        for (i, trigger) in self.triggers.iter().enumerate() {
            let patterns = trigger
                .branches
                .iter()
                .chain(&trigger.paths)
                .chain(&trigger.paths_ignore);
            if patterns.into_iter().any(|p| p.trim().is_empty()) {
                problems.push(format!("triggers[{i}] contains an empty pattern"));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(Error::WorkflowValidation(problems.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_minimal_workflow() {
        let yaml = r#"
name: ci
phases:
  build: make
  test: make test
"#;
        let workflow = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(workflow.concurrency, ConcurrencyConfig::default());
        assert_eq!(workflow.timeouts, TimeoutConfig::default());
        assert_eq!(workflow.phases.shell, "sh");
        assert!(workflow.triggers.is_empty());
    }

    #[test]
    fn test_parse_full_workflow() {
        let yaml = r#"
name: rust
triggers:
  - type: push
    branches: ["main"]
    paths: ["**.rs", "Cargo.toml"]
  - type: pull_request
    paths_ignore: ["docs/**"]
concurrency:
  group: "ci-${{ ref }}"
  cancel_in_progress: false
env:
  CARGO_TERM_COLOR: always
phases:
  build: cargo build --verbose
  test: cargo test --verbose
  shell: bash
timeouts:
  phase_minutes: 5
  cancel_grace_seconds: 2
"#;
        let workflow = WorkflowDefinition::from_yaml(yaml).unwrap();
        assert_eq!(workflow.triggers.len(), 2);
        assert_eq!(workflow.triggers[1].trigger_type, EventKind::PullRequest);
        assert!(!workflow.concurrency.cancel_in_progress);
        assert_eq!(workflow.env.get("CARGO_TERM_COLOR").map(String::as_str), Some("always"));
        assert_eq!(workflow.timeouts.cancel_grace().as_secs(), 2);
    }

    #[test]
    fn test_validation_collects_problems() {
        let yaml = r#"
name: ""
phases:
  build: ""
  test: cargo test
timeouts:
  phase_minutes: 0
"#;
        let err = WorkflowDefinition::from_yaml(yaml).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("name must not be empty"));
        assert!(message.contains("phases.build"));
        assert!(message.contains("phase_minutes"));
    }

    #[test]
    fn test_default_workflow_round_trips_through_yaml() {
        let workflow = WorkflowDefinition::default();
        workflow.validate().unwrap();

        let yaml = workflow.to_yaml().unwrap();
        let parsed = WorkflowDefinition::from_yaml(&yaml).unwrap();
        assert_eq!(parsed, workflow);
    }
}
