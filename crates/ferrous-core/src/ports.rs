//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the coordinator and external adapters.

use crate::Result;
use crate::cancel::CancelSignal;
use crate::events::RunEvent;
use crate::ids::{GroupKey, RunId};
use crate::run::{Phase, Run};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;

/// Context handed to the backend for one phase of a run.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub run_id: RunId,
    pub phase: Phase,
    pub workspace: PathBuf,
    pub env: HashMap<String, String>,
}

/// What a backend phase reports back.
#[derive(Debug, Clone, Default)]
pub struct PhaseOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub output: Vec<String>,
    pub duration_ms: u64,
    /// The phase stopped because cancellation was requested.
    pub cancelled: bool,
    /// Why the phase failed, when there is more to say than the exit code.
    pub failure: Option<String>,
}

impl PhaseOutput {
    pub fn success(output: Vec<String>) -> Self {
        Self {
            success: true,
            exit_code: Some(0),
            output,
            ..Default::default()
        }
    }

    pub fn failure(exit_code: i32, output: Vec<String>) -> Self {
        Self {
            success: false,
            exit_code: Some(exit_code),
            output,
            ..Default::default()
        }
    }

    pub fn timed_out(seconds: u64, output: Vec<String>) -> Self {
        Self {
            success: false,
            output,
            failure: Some(format!("timed out after {seconds} seconds")),
            ..Default::default()
        }
    }

    pub fn cancelled(output: Vec<String>) -> Self {
        Self {
            cancelled: true,
            output,
            ..Default::default()
        }
    }
}

/// The external toolchain that compiles and tests the project.
///
/// Both operations are opaque to the coordinator beyond success and output.
/// Implementations should stop promptly once `cancel` fires.
#[async_trait]
pub trait BuildBackend: Send + Sync {
    async fn build(&self, ctx: &PhaseContext, cancel: CancelSignal) -> Result<PhaseOutput>;

    async fn test(&self, ctx: &PhaseContext, cancel: CancelSignal) -> Result<PhaseOutput>;

    /// Dispatch on `ctx.phase`.
    async fn execute(&self, ctx: &PhaseContext, cancel: CancelSignal) -> Result<PhaseOutput> {
        match ctx.phase {
            Phase::Build => self.build(ctx, cancel).await,
            Phase::Test => self.test(ctx, cancel).await,
        }
    }
}

/// Sink for run lifecycle events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: RunEvent) -> Result<()>;
}

/// Discards every event.
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(&self, _event: RunEvent) -> Result<()> {
        Ok(())
    }
}

/// Storage for runs that reached a terminal phase.
#[async_trait]
pub trait RunArchive: Send + Sync {
    async fn store(&self, run: &Run) -> Result<()>;

    async fn get(&self, id: RunId) -> Result<Option<Run>>;

    /// Runs newest first, optionally restricted to one group.
    async fn list(&self, group: Option<&GroupKey>, limit: usize) -> Result<Vec<Run>>;
}
