//! Runner configuration and output types.

use chrono::{DateTime, Utc};
use ferrous_core::run::Phase;
use ferrous_core::workflow::WorkflowDefinition;
use std::time::Duration;

/// Output line from a backend phase.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub phase: Phase,
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Configuration for phase execution.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub shell: String,
    /// Limit on a single phase. `None` lets a phase run forever.
    pub timeout_seconds: Option<u64>,
    /// How long to wait for a killed process to be reaped.
    pub cancel_grace_seconds: u64,
}

impl RunnerConfig {
    pub fn from_workflow(workflow: &WorkflowDefinition) -> Self {
        Self {
            shell: workflow.phases.shell.clone(),
            timeout_seconds: Some(workflow.timeouts.phase_timeout().as_secs()),
            cancel_grace_seconds: workflow.timeouts.cancel_grace().as_secs(),
        }
    }

    pub fn cancel_grace(&self) -> Duration {
        Duration::from_secs(self.cancel_grace_seconds)
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            timeout_seconds: Some(3600), // 1 hour default
            cancel_grace_seconds: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_workflow() {
        let mut workflow = WorkflowDefinition::default();
        workflow.phases.shell = "bash".to_string();
        workflow.timeouts.phase_minutes = 5;
        workflow.timeouts.cancel_grace_seconds = 3;

        let config = RunnerConfig::from_workflow(&workflow);
        assert_eq!(config.shell, "bash");
        assert_eq!(config.timeout_seconds, Some(300));
        assert_eq!(config.cancel_grace(), Duration::from_secs(3));
    }
}
