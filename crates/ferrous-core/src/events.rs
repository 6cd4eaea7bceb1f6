//! Run lifecycle events.

use crate::ids::{GroupKey, RunId};
use crate::run::{CancelReasonType, Phase, PhaseStatus, RunPhase};
use crate::trigger::EventKind;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// All lifecycle events emitted by the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunQueued(RunQueuedPayload),
    RunStarted(RunStartedPayload),
    PhaseStarted(PhaseStartedPayload),
    PhaseCompleted(PhaseCompletedPayload),
    RunCompleted(RunCompletedPayload),
    RunCancelled(RunCancelledPayload),
}

impl RunEvent {
    /// Dotted subject for routing and filtering.
    pub fn subject(&self) -> String {
        match self {
            RunEvent::RunQueued(p) => format!("run.queued.{}", p.group),
            RunEvent::RunStarted(p) => format!("run.started.{}.{}", p.group, p.run_id),
            RunEvent::PhaseStarted(p) => format!("run.{}.phase.{}.started", p.run_id, p.phase),
            RunEvent::PhaseCompleted(p) => {
                format!("run.{}.phase.{}.completed", p.run_id, p.phase)
            }
            RunEvent::RunCompleted(p) => format!("run.completed.{}.{}", p.group, p.run_id),
            RunEvent::RunCancelled(p) => format!("run.cancelled.{}.{}", p.group, p.run_id),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunQueued(p) => p.run_id,
            RunEvent::RunStarted(p) => p.run_id,
            RunEvent::PhaseStarted(p) => p.run_id,
            RunEvent::PhaseCompleted(p) => p.run_id,
            RunEvent::RunCompleted(p) => p.run_id,
            RunEvent::RunCancelled(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunQueuedPayload {
    pub run_id: RunId,
    pub group: GroupKey,
    pub workflow: String,
    pub run_number: u32,
    pub trigger: EventKind,
    pub git_ref: String,
    pub queued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub group: GroupKey,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PhaseStartedPayload {
    pub run_id: RunId,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct PhaseCompletedPayload {
    pub run_id: RunId,
    pub phase: Phase,
    pub status: PhaseStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub group: GroupKey,
    pub run_number: u32,
    pub status: RunPhase,
    pub duration_ms: u64,
    pub failure: Option<String>,
    pub completed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct RunCancelledPayload {
    pub run_id: RunId,
    pub group: GroupKey,
    pub reason: CancelReasonType,
    pub superseded_by: Option<RunId>,
    pub cancelled_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subjects() {
        let run_id = RunId::new();
        let group = GroupKey::new("ci");

        let queued = RunEvent::RunQueued(RunQueuedPayload {
            run_id,
            group: group.clone(),
            workflow: "ci".to_string(),
            run_number: 1,
            trigger: EventKind::Push,
            git_ref: "main".to_string(),
            queued_at: Utc::now(),
        });
        assert_eq!(queued.subject(), "run.queued.ci");

        let phase = RunEvent::PhaseStarted(PhaseStartedPayload {
            run_id,
            phase: Phase::Test,
            started_at: Utc::now(),
        });
        assert_eq!(phase.subject(), format!("run.{run_id}.phase.test.started"));
        assert_eq!(phase.run_id(), run_id);
    }

    #[test]
    fn test_event_is_tagged() {
        let event = RunEvent::RunCancelled(RunCancelledPayload {
            run_id: RunId::new(),
            group: GroupKey::new("ci"),
            reason: CancelReasonType::Superseded,
            superseded_by: Some(RunId::new()),
            cancelled_at: Utc::now(),
        });

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "run_cancelled");
        assert_eq!(json["reason"], "superseded");
    }
}
