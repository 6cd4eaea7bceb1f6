//! Concurrency groups: at most one executing run per group key.
//!
//! The registry is an owned value injected into the coordinator, so tests can
//! create as many independent registries as they need.

use ferrous_core::cancel::CancelToken;
use ferrous_core::ids::{GroupKey, RunId};
use ferrous_core::run::{CancelReason, RunPhase};
use std::collections::HashMap;
use tokio::sync::{Mutex, watch};
use tracing::debug;

/// The registry's view of one run: its id, its cancel switch and its phase.
#[derive(Debug, Clone)]
pub struct RunSlot {
    run_id: RunId,
    cancel: CancelToken,
    phase: watch::Receiver<RunPhase>,
}

impl RunSlot {
    pub fn new(run_id: RunId, cancel: CancelToken, phase: watch::Receiver<RunPhase>) -> Self {
        Self {
            run_id,
            cancel,
            phase,
        }
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn is_terminal(&self) -> bool {
        self.phase().is_terminal()
    }

    /// Request cancellation. Returns `false` if it was already requested.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        self.cancel.cancel(reason)
    }

    pub fn watch(&self) -> watch::Receiver<RunPhase> {
        self.phase.clone()
    }
}

#[derive(Debug, Default)]
struct GroupState {
    /// Run holding (or about to hold) the execution slot.
    running: Option<RunSlot>,
    /// Run queued behind `running` when the group does not cancel in progress.
    pending: Option<RunSlot>,
}

impl GroupState {
    fn is_empty(&self) -> bool {
        self.running.is_none() && self.pending.is_none()
    }
}

#[derive(Debug, Default)]
struct Groups {
    /// Only groups with a run in them; emptied groups are removed.
    states: HashMap<GroupKey, GroupState>,
    /// Last run number handed out per group. Outlives the group's state so
    /// numbering stays monotonic.
    run_numbers: HashMap<GroupKey, u32>,
}

/// Outcome of admitting a run into its group.
#[derive(Debug)]
pub struct Admission {
    pub run_number: u32,
    /// Runs cancelled because this one superseded them.
    pub superseded: Vec<RunId>,
    /// Phases to wait on before the new run may start building.
    pub wait_for: Vec<watch::Receiver<RunPhase>>,
}

/// Registry of concurrency groups, mapping group keys to their runs.
#[derive(Debug, Default)]
pub struct ConcurrencyRegistry {
    groups: Mutex<Groups>,
}

impl ConcurrencyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Admit a new run into `group`.
    ///
    /// With `cancel_in_progress` every non-terminal run of the group is
    /// cancelled and the new run waits only for them to wind down. Otherwise
    /// the running run is left alone, any run still pending behind it is
    /// cancelled, and the new run queues behind the running one.
    pub async fn admit(&self, group: &GroupKey, slot: RunSlot, cancel_in_progress: bool) -> Admission {
        let mut groups = self.groups.lock().await;
        let run_number = groups.run_numbers.entry(group.clone()).or_default();
        *run_number += 1;
        let run_number = *run_number;
        let state = groups.states.entry(group.clone()).or_default();

        let new_id = slot.run_id();
        let mut superseded = Vec::new();
        let mut wait_for = Vec::new();

        if let Some(pending) = state.pending.take()
            && !pending.is_terminal()
        {
            pending.cancel(CancelReason::superseded(new_id));
            superseded.push(pending.run_id());
            wait_for.push(pending.watch());
        }

        let running = state.running.take().filter(|r| !r.is_terminal());
        match running {
            Some(running) if cancel_in_progress => {
                running.cancel(CancelReason::superseded(new_id));
                superseded.push(running.run_id());
                wait_for.push(running.watch());
                state.running = Some(slot);
            }
            Some(running) => {
                wait_for.push(running.watch());
                state.running = Some(running);
                state.pending = Some(slot);
            }
            None => state.running = Some(slot),
        }

        debug!(
            group = %group,
            run_id = %new_id,
            superseded = superseded.len(),
            waiting_on = wait_for.len(),
            "Run admitted to concurrency group"
        );

        Admission {
            run_number,
            superseded,
            wait_for,
        }
    }

    /// Move a queued run into the group's execution slot.
    ///
    /// Returns `false` if the run is no longer part of the group, which means
    /// a newer arrival superseded it.
    pub async fn promote(&self, group: &GroupKey, run_id: RunId) -> bool {
        let mut groups = self.groups.lock().await;
        let Some(state) = groups.states.get_mut(group) else {
            return false;
        };

        if state.running.as_ref().map(RunSlot::run_id) == Some(run_id) {
            return true;
        }
        if state.pending.as_ref().map(RunSlot::run_id) == Some(run_id) {
            state.running = state.pending.take();
            return true;
        }
        false
    }

    /// Drop a finished run from its group, and the group once it is empty.
    pub async fn release(&self, group: &GroupKey, run_id: RunId) {
        let mut groups = self.groups.lock().await;
        let Some(state) = groups.states.get_mut(group) else {
            return;
        };
        if state.running.as_ref().map(RunSlot::run_id) == Some(run_id) {
            state.running = None;
        }
        if state.pending.as_ref().map(RunSlot::run_id) == Some(run_id) {
            state.pending = None;
        }
        if state.is_empty() {
            groups.states.remove(group);
            debug!(group = %group, "Concurrency group emptied");
        }
    }

    /// Number of groups that currently hold a run.
    pub async fn group_count(&self) -> usize {
        self.groups.lock().await.states.len()
    }

    /// The run currently holding or waiting for the group's slot.
    pub async fn active(&self, group: &GroupKey) -> Option<RunSlot> {
        let groups = self.groups.lock().await;
        let state = groups.states.get(group)?;
        state
            .running
            .iter()
            .chain(state.pending.iter())
            .find(|slot| !slot.is_terminal())
            .cloned()
    }

    pub async fn find(&self, run_id: RunId) -> Option<RunSlot> {
        let groups = self.groups.lock().await;
        groups
            .states
            .values()
            .flat_map(|state| state.running.iter().chain(state.pending.iter()))
            .find(|slot| slot.run_id() == run_id)
            .cloned()
    }

    /// Every run not yet in a terminal phase, across all groups.
    pub async fn non_terminal(&self) -> Vec<RunSlot> {
        let groups = self.groups.lock().await;
        groups
            .states
            .values()
            .flat_map(|state| state.running.iter().chain(state.pending.iter()))
            .filter(|slot| !slot.is_terminal())
            .cloned()
            .collect()
    }
}
