//! Run and execution types.
//!
//! A run moves through an explicit state machine:
//!
//! ```text
//! Pending -> Building -> Testing -> Succeeded
//!    |          |          |
//!    |          +----------+-----> Failed
//!    +----------+----------+-----> Cancelled
//! ```

use crate::error::{Error, Result};
use crate::ids::{GroupKey, RunId};
use crate::trigger::TriggerEvent;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Run {
    pub id: RunId,
    pub workflow: String,
    pub group: GroupKey,
    pub run_number: u32,
    pub trigger: TriggerEvent,
    pub phase: RunPhase,
    #[serde(default)]
    pub phases: Vec<PhaseRecord>,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub cancel_reason: Option<CancelReason>,
    pub failure: Option<String>,
}

impl Run {
    pub fn new(
        id: RunId,
        workflow: impl Into<String>,
        group: GroupKey,
        run_number: u32,
        trigger: TriggerEvent,
    ) -> Self {
        Self {
            id,
            workflow: workflow.into(),
            group,
            run_number,
            trigger,
            phase: RunPhase::Pending,
            phases: Vec::new(),
            queued_at: Utc::now(),
            started_at: None,
            completed_at: None,
            duration_ms: None,
            cancel_reason: None,
            failure: None,
        }
    }

    /// Move the run to `next`, stamping timestamps on the way in and out.
    pub fn transition(&mut self, next: RunPhase) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }

        let now = Utc::now();
        if next == RunPhase::Building {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.completed_at = Some(now);
            let start = self.started_at.unwrap_or(self.queued_at);
            self.duration_ms = Some((now - start).num_milliseconds().max(0) as u64);
        }
        self.phase = next;
        Ok(())
    }

    pub fn cancel(&mut self, reason: CancelReason) -> Result<()> {
        self.transition(RunPhase::Cancelled)?;
        self.cancel_reason = Some(reason);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>) -> Result<()> {
        self.transition(RunPhase::Failed)?;
        self.failure = Some(message.into());
        Ok(())
    }

    pub fn record(&mut self, record: PhaseRecord) {
        self.phases.push(record);
    }

    pub fn phase_record(&self, phase: Phase) -> Option<&PhaseRecord> {
        self.phases.iter().find(|r| r.phase == phase)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    Pending,
    Building,
    Testing,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RunPhase::Succeeded | RunPhase::Failed | RunPhase::Cancelled
        )
    }

    /// Whether the run occupies its concurrency group's execution slot.
    pub fn is_executing(&self) -> bool {
        matches!(self, RunPhase::Building | RunPhase::Testing)
    }

    pub fn can_transition_to(&self, next: RunPhase) -> bool {
        use RunPhase::*;
        matches!(
            (*self, next),
            (Pending, Building)
                | (Building, Testing)
                | (Testing, Succeeded)
                | (Building | Testing, Failed)
                | (Pending | Building | Testing, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Pending => "pending",
            RunPhase::Building => "building",
            RunPhase::Testing => "testing",
            RunPhase::Succeeded => "succeeded",
            RunPhase::Failed => "failed",
            RunPhase::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// One of the two backend phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Build,
    Test,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Build => "build",
            Phase::Test => "test",
        }
    }

    /// The run phase a run sits in while this backend phase executes.
    pub fn run_phase(&self) -> RunPhase {
        match self {
            Phase::Build => RunPhase::Building,
            Phase::Test => RunPhase::Testing,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PhaseRecord {
    pub phase: Phase,
    pub status: PhaseStatus,
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub output: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Success,
    Failure,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct CancelReason {
    pub reason: CancelReasonType,
    pub superseded_by: Option<RunId>,
    pub message: Option<String>,
}

impl CancelReason {
    pub fn superseded(by: RunId) -> Self {
        Self {
            reason: CancelReasonType::Superseded,
            superseded_by: Some(by),
            message: None,
        }
    }

    pub fn user_requested(message: Option<String>) -> Self {
        Self {
            reason: CancelReasonType::UserRequested,
            superseded_by: None,
            message,
        }
    }

    pub fn shutdown() -> Self {
        Self {
            reason: CancelReasonType::Shutdown,
            superseded_by: None,
            message: None,
        }
    }
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.reason, self.superseded_by) {
            (CancelReasonType::Superseded, Some(by)) => write!(f, "superseded by {by}"),
            (CancelReasonType::Superseded, None) => f.write_str("superseded"),
            (CancelReasonType::UserRequested, _) => match &self.message {
                Some(msg) => write!(f, "cancelled by user: {msg}"),
                None => f.write_str("cancelled by user"),
            },
            (CancelReasonType::Shutdown, _) => f.write_str("coordinator shutdown"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CancelReasonType {
    Superseded,
    UserRequested,
    Shutdown,
}
