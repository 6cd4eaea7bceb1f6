//! Run coordination: filter events, enforce concurrency groups, drive runs.

use crate::concurrency::{ConcurrencyRegistry, RunSlot};
use crate::triggers::TriggerMatcher;

use chrono::{DateTime, Utc};
use ferrous_core::cancel::{CancelSignal, CancelToken};
use ferrous_core::events::{
    PhaseCompletedPayload, PhaseStartedPayload, RunCancelledPayload, RunCompletedPayload,
    RunEvent, RunQueuedPayload, RunStartedPayload,
};
use ferrous_core::ids::{GroupKey, RunId};
use ferrous_core::interpolation::InterpolationContext;
use ferrous_core::ports::{BuildBackend, EventSink, PhaseContext, PhaseOutput, RunArchive};
use ferrous_core::run::{
    CancelReason, CancelReasonType, Phase, PhaseRecord, PhaseStatus, Run, RunPhase,
};
use ferrous_core::trigger::TriggerEvent;
use ferrous_core::workflow::WorkflowDefinition;
use ferrous_core::{Error, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Resolve the concurrency group an event's run belongs to.
///
/// A template that interpolates to nothing falls back to the workflow name.
pub fn resolve_group(workflow: &WorkflowDefinition, event: &TriggerEvent) -> GroupKey {
    let ctx = InterpolationContext::for_event(&workflow.name, event, &workflow.env);
    let key = ctx.interpolate(&workflow.concurrency.group);
    let key = key.trim();
    if key.is_empty() {
        GroupKey::new(workflow.name.clone())
    } else {
        GroupKey::new(key)
    }
}

/// Caller's handle on an accepted run.
#[derive(Debug, Clone)]
pub struct RunHandle {
    run_id: RunId,
    group: GroupKey,
    run_number: u32,
    phase: watch::Receiver<RunPhase>,
    done: watch::Receiver<Option<Run>>,
}

impl RunHandle {
    pub fn id(&self) -> RunId {
        self.run_id
    }

    pub fn group(&self) -> &GroupKey {
        &self.group
    }

    pub fn run_number(&self) -> u32 {
        self.run_number
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    /// Wait until the run's phase satisfies `predicate`, returning that phase.
    pub async fn wait_for_phase(&self, predicate: impl Fn(RunPhase) -> bool) -> Result<RunPhase> {
        let mut rx = self.phase.clone();
        let phase = rx
            .wait_for(|p| predicate(*p))
            .await
            .map_err(|_| Error::Internal(format!("run {} dropped its phase", self.run_id)))?;
        Ok(*phase)
    }

    /// Wait for the run to finish and return its final record.
    pub async fn wait(&self) -> Result<Run> {
        let mut rx = self.done.clone();
        let run = rx
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Internal(format!("run {} ended without a result", self.run_id)))?;
        run.clone()
            .ok_or_else(|| Error::Internal(format!("run {} has no result", self.run_id)))
    }
}

/// Receives trigger events and turns matching ones into runs.
pub struct RunCoordinator {
    workflow: Arc<WorkflowDefinition>,
    workspace: PathBuf,
    matcher: TriggerMatcher,
    registry: Arc<ConcurrencyRegistry>,
    backend: Arc<dyn BuildBackend>,
    events: Arc<dyn EventSink>,
    archive: Arc<dyn RunArchive>,
    tasks: Mutex<JoinSet<()>>,
}

impl RunCoordinator {
    pub fn new(
        workflow: WorkflowDefinition,
        workspace: PathBuf,
        registry: Arc<ConcurrencyRegistry>,
        backend: Arc<dyn BuildBackend>,
        events: Arc<dyn EventSink>,
        archive: Arc<dyn RunArchive>,
    ) -> Self {
        Self {
            workflow: Arc::new(workflow),
            workspace,
            matcher: TriggerMatcher::new(),
            registry,
            backend,
            events,
            archive,
            tasks: Mutex::new(JoinSet::new()),
        }
    }

    /// Whether `event` would start a run.
    pub fn accepts(&self, event: &TriggerEvent) -> bool {
        self.matcher.matches(&self.workflow, event)
    }

    /// Handle a trigger event.
    ///
    /// Returns `None` when the event does not match the workflow's triggers.
    /// Otherwise the run is admitted to its concurrency group, pre-empting or
    /// queueing behind older runs, and starts executing in the background.
    pub async fn submit(&self, event: TriggerEvent) -> Result<Option<RunHandle>> {
        if !self.accepts(&event) {
            debug!(
                kind = %event.kind,
                git_ref = %event.git_ref,
                changed = event.changed_paths.len(),
                "Event does not match workflow triggers, ignoring"
            );
            return Ok(None);
        }

        let group = resolve_group(&self.workflow, &event);
        let run_id = RunId::new();
        let cancel = CancelToken::new();
        let (phase_tx, phase_rx) = watch::channel(RunPhase::Pending);
        let (done_tx, done_rx) = watch::channel(None);

        let slot = RunSlot::new(run_id, cancel.clone(), phase_rx.clone());
        let admission = self
            .registry
            .admit(&group, slot, self.workflow.concurrency.cancel_in_progress)
            .await;

        for superseded in &admission.superseded {
            info!(run_id = %superseded, by = %run_id, group = %group, "Cancelling superseded run");
        }

        let run = Run::new(
            run_id,
            self.workflow.name.clone(),
            group.clone(),
            admission.run_number,
            event,
        );

        info!(
            run_id = %run_id,
            group = %group,
            run_number = run.run_number,
            git_ref = %run.trigger.git_ref,
            "Run queued"
        );

        publish(
            self.events.as_ref(),
            RunEvent::RunQueued(RunQueuedPayload {
                run_id,
                group: group.clone(),
                workflow: run.workflow.clone(),
                run_number: run.run_number,
                trigger: run.trigger.kind,
                git_ref: run.trigger.git_ref.clone(),
                queued_at: run.queued_at,
            }),
        )
        .await;

        let task = RunTask {
            run,
            workspace: self.workspace.clone(),
            workflow: Arc::clone(&self.workflow),
            backend: Arc::clone(&self.backend),
            events: Arc::clone(&self.events),
            archive: Arc::clone(&self.archive),
            registry: Arc::clone(&self.registry),
            cancel: cancel.signal(),
            phase_tx,
            done_tx,
            wait_for: admission.wait_for,
        };

        let mut tasks = self.tasks.lock().await;
        while let Some(finished) = tasks.try_join_next() {
            if let Err(e) = finished {
                error!(error = %e, "Run task panicked");
            }
        }
        tasks.spawn(task.drive());

        Ok(Some(RunHandle {
            run_id,
            group,
            run_number: admission.run_number,
            phase: phase_rx,
            done: done_rx,
        }))
    }

    /// Cancel a run on behalf of a user.
    pub async fn cancel(&self, run_id: RunId, message: Option<String>) -> Result<()> {
        let slot = self
            .registry
            .find(run_id)
            .await
            .ok_or_else(|| Error::RunNotFound(run_id.to_string()))?;
        if slot.is_terminal() {
            return Err(Error::RunAlreadyCompleted);
        }

        info!(run_id = %run_id, "Cancelling run on request");
        slot.cancel(CancelReason::user_requested(message));
        Ok(())
    }

    /// The run currently holding or waiting for a group's slot.
    pub async fn active(&self, group: &GroupKey) -> Option<RunId> {
        self.registry.active(group).await.map(|slot| slot.run_id())
    }

    pub async fn get(&self, run_id: RunId) -> Result<Option<Run>> {
        self.archive.get(run_id).await
    }

    /// Cancel every unfinished run and wait for all run tasks to exit.
    pub async fn shutdown(&self) -> Result<()> {
        let unfinished = self.registry.non_terminal().await;
        if !unfinished.is_empty() {
            info!(count = unfinished.len(), "Cancelling unfinished runs for shutdown");
        }
        for slot in unfinished {
            slot.cancel(CancelReason::shutdown());
        }
        self.drain().await
    }

    /// Wait for every spawned run task to exit, without cancelling anything.
    pub async fn drain(&self) -> Result<()> {
        let mut tasks = std::mem::take(&mut *self.tasks.lock().await);
        let mut panicked = 0;
        while let Some(result) = tasks.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Run task panicked");
                panicked += 1;
            }
        }
        if panicked > 0 {
            return Err(Error::Internal(format!("{panicked} run task(s) panicked")));
        }
        Ok(())
    }
}

async fn publish(events: &dyn EventSink, event: RunEvent) {
    if let Err(e) = events.publish(event).await {
        warn!(error = %e, "Failed to publish run event");
    }
}

/// How a backend phase ended from the coordinator's point of view.
enum PhaseResult {
    Completed(PhaseOutput),
    Errored(Error),
    Cancelled(Vec<String>),
}

/// One run's state machine, executed in its own task.
struct RunTask {
    run: Run,
    workspace: PathBuf,
    workflow: Arc<WorkflowDefinition>,
    backend: Arc<dyn BuildBackend>,
    events: Arc<dyn EventSink>,
    archive: Arc<dyn RunArchive>,
    registry: Arc<ConcurrencyRegistry>,
    cancel: CancelSignal,
    phase_tx: watch::Sender<RunPhase>,
    done_tx: watch::Sender<Option<Run>>,
    wait_for: Vec<watch::Receiver<RunPhase>>,
}

impl RunTask {
    async fn drive(mut self) {
        if let Err(e) = self.execute().await {
            error!(run_id = %self.run.id, error = %e, "Run aborted");
            let outcome = match self.run.phase {
                RunPhase::Pending => self.cancel_run(CancelReason::shutdown()),
                phase if phase.is_executing() => self.fail_run(e.to_string()),
                _ => Ok(()),
            };
            if let Err(e) = outcome {
                error!(run_id = %self.run.id, error = %e, "Could not settle aborted run");
            }
        }
        self.finish().await;
    }

    async fn execute(&mut self) -> Result<()> {
        if let Some(reason) = self.wait_for_slot().await {
            return self.cancel_run(reason);
        }

        self.set_phase(RunPhase::Building)?;
        info!(run_id = %self.run.id, group = %self.run.group, "Run started");
        publish(
            self.events.as_ref(),
            RunEvent::RunStarted(RunStartedPayload {
                run_id: self.run.id,
                group: self.run.group.clone(),
                started_at: self.run.started_at.unwrap_or_else(Utc::now),
            }),
        )
        .await;

        for phase in [Phase::Build, Phase::Test] {
            if phase == Phase::Test {
                self.set_phase(RunPhase::Testing)?;
            }

            let started_at = Utc::now();
            publish(
                self.events.as_ref(),
                RunEvent::PhaseStarted(PhaseStartedPayload {
                    run_id: self.run.id,
                    phase,
                    started_at,
                }),
            )
            .await;

            match self.run_phase(phase).await {
                PhaseResult::Completed(output) if output.success => {
                    self.record(phase, PhaseStatus::Success, started_at, output).await;
                }
                PhaseResult::Completed(output) => {
                    let message = match (&output.failure, output.exit_code) {
                        (Some(reason), _) => format!("{phase} phase failed: {reason}"),
                        (None, Some(code)) => format!("{phase} phase failed with exit code {code}"),
                        (None, None) => format!("{phase} phase failed"),
                    };
                    self.record(phase, PhaseStatus::Failure, started_at, output).await;
                    return self.fail_run(message);
                }
                PhaseResult::Errored(e) => {
                    error!(run_id = %self.run.id, %phase, error = %e, "Backend error");
                    let output = PhaseOutput::default();
                    self.record(phase, PhaseStatus::Failure, started_at, output).await;
                    return self.fail_run(e.to_string());
                }
                PhaseResult::Cancelled(lines) => {
                    let output = PhaseOutput::cancelled(lines);
                    self.record(phase, PhaseStatus::Cancelled, started_at, output).await;
                    return Ok(());
                }
            }
        }

        self.set_phase(RunPhase::Succeeded)
    }

    /// Wait until every run this one superseded or queued behind is done.
    /// Returns the cancel reason if this run was cancelled meanwhile.
    async fn wait_for_slot(&mut self) -> Option<CancelReason> {
        let blockers = std::mem::take(&mut self.wait_for);
        if !blockers.is_empty() {
            debug!(run_id = %self.run.id, count = blockers.len(), "Waiting for group slot");
            let all_done = futures::future::join_all(blockers.into_iter().map(|mut rx| async move {
                // A dropped sender means the run task is gone
                let _ = rx.wait_for(|p| p.is_terminal()).await;
            }));

            tokio::select! {
                _ = all_done => {}
                reason = self.cancel.cancelled() => return Some(reason),
            }
        }

        if let Some(reason) = self.cancel.reason() {
            return Some(reason);
        }
        if !self.registry.promote(&self.run.group, self.run.id).await {
            // Replaced while queued; the registry already signalled us
            return Some(self.cancel.reason().unwrap_or(CancelReason {
                reason: CancelReasonType::Superseded,
                superseded_by: None,
                message: None,
            }));
        }
        None
    }

    async fn run_phase(&mut self, phase: Phase) -> PhaseResult {
        let ctx = PhaseContext {
            run_id: self.run.id,
            phase,
            workspace: self.workspace.clone(),
            env: self.workflow.env.clone(),
        };
        let backend = Arc::clone(&self.backend);
        let fut = backend.execute(&ctx, self.cancel.clone());
        tokio::pin!(fut);

        let reason = tokio::select! {
            result = &mut fut => match result {
                Ok(output) if output.cancelled => {
                    let reason = self.cancel.reason().unwrap_or_else(CancelReason::shutdown);
                    return match self.cancel_run(reason) {
                        Ok(()) => PhaseResult::Cancelled(output.output),
                        Err(e) => PhaseResult::Errored(e),
                    };
                }
                Ok(output) => return PhaseResult::Completed(output),
                Err(e) => return PhaseResult::Errored(e),
            },
            reason = self.cancel.cancelled() => reason,
        };

        // Cancelled is visible right away; the backend gets a bounded grace
        // period to stop its process.
        if let Err(e) = self.cancel_run(reason) {
            return PhaseResult::Errored(e);
        }
        let grace = self.workflow.timeouts.cancel_grace();
        let lines = match tokio::time::timeout(grace, &mut fut).await {
            Ok(Ok(output)) => output.output,
            Ok(Err(e)) => {
                debug!(run_id = %self.run.id, error = %e, "Backend errored while cancelling");
                vec![]
            }
            Err(_) => {
                warn!(
                    run_id = %self.run.id,
                    %phase,
                    grace_secs = grace.as_secs(),
                    "Backend did not stop within grace period, abandoning it"
                );
                vec![]
            }
        };
        PhaseResult::Cancelled(lines)
    }

    fn set_phase(&mut self, next: RunPhase) -> Result<()> {
        self.run.transition(next)?;
        self.phase_tx.send_replace(next);
        Ok(())
    }

    fn cancel_run(&mut self, reason: CancelReason) -> Result<()> {
        info!(run_id = %self.run.id, reason = %reason, "Run cancelled");
        self.run.cancel(reason)?;
        self.phase_tx.send_replace(RunPhase::Cancelled);
        Ok(())
    }

    fn fail_run(&mut self, message: String) -> Result<()> {
        warn!(run_id = %self.run.id, failure = %message, "Run failed");
        self.run.fail(message)?;
        self.phase_tx.send_replace(RunPhase::Failed);
        Ok(())
    }

    async fn record(
        &mut self,
        phase: Phase,
        status: PhaseStatus,
        started_at: DateTime<Utc>,
        output: PhaseOutput,
    ) {
        let completed_at = Utc::now();
        let duration_ms = if output.duration_ms > 0 {
            output.duration_ms
        } else {
            (completed_at - started_at).num_milliseconds().max(0) as u64
        };

        publish(
            self.events.as_ref(),
            RunEvent::PhaseCompleted(PhaseCompletedPayload {
                run_id: self.run.id,
                phase,
                status,
                exit_code: output.exit_code,
                duration_ms,
                completed_at,
            }),
        )
        .await;

        self.run.record(PhaseRecord {
            phase,
            status,
            exit_code: output.exit_code,
            output: output.output,
            started_at,
            completed_at,
            duration_ms,
        });
    }

    async fn finish(self) {
        let RunTask {
            run,
            events,
            archive,
            registry,
            done_tx,
            ..
        } = self;

        if let Err(e) = archive.store(&run).await {
            warn!(run_id = %run.id, error = %e, "Failed to archive run");
        }

        let event = match (&run.cancel_reason, run.phase) {
            (Some(reason), RunPhase::Cancelled) => RunEvent::RunCancelled(RunCancelledPayload {
                run_id: run.id,
                group: run.group.clone(),
                reason: reason.reason,
                superseded_by: reason.superseded_by,
                cancelled_at: run.completed_at.unwrap_or_else(Utc::now),
            }),
            _ => {
                if run.phase == RunPhase::Succeeded {
                    info!(run_id = %run.id, duration_ms = run.duration_ms, "Run succeeded");
                }
                RunEvent::RunCompleted(RunCompletedPayload {
                    run_id: run.id,
                    group: run.group.clone(),
                    run_number: run.run_number,
                    status: run.phase,
                    duration_ms: run.duration_ms.unwrap_or_default(),
                    failure: run.failure.clone(),
                    completed_at: run.completed_at.unwrap_or_else(Utc::now),
                })
            }
        };
        publish(events.as_ref(), event).await;

        registry.release(&run.group, run.id).await;
        done_tx.send_replace(Some(run));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_group_interpolates_template() {
        let mut workflow = WorkflowDefinition::default();
        workflow.concurrency.group = "${{ workflow }}-${{ branch }}".to_string();

        let event = TriggerEvent::push("refs/heads/main", ["src/lib.rs"]);
        assert_eq!(resolve_group(&workflow, &event).as_str(), "ci-main");
    }

    #[test]
    fn test_resolve_group_falls_back_to_workflow_name() {
        let mut workflow = WorkflowDefinition::default();
        workflow.concurrency.group = "${{ env.UNSET_FERROUS_GROUP }}".to_string();

        let event = TriggerEvent::push("main", ["src/lib.rs"]);
        assert_eq!(resolve_group(&workflow, &event).as_str(), "ci");
    }
}
