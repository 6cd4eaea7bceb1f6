//! Shell-based phase execution on the host.

use crate::runner::{OutputLine, OutputStream, RunnerConfig};
use async_trait::async_trait;
use ferrous_core::cancel::CancelSignal;
use ferrous_core::ports::{BuildBackend, PhaseContext, PhaseOutput};
use ferrous_core::run::{CancelReason, Phase};
use ferrous_core::workflow::{PhaseCommands, WorkflowDefinition};
use ferrous_core::{Error, Result};
use std::process::{ExitStatus, Stdio};
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Duration, timeout};
use tracing::{debug, info, warn};

/// Runs the workflow's build and test commands through a shell on the host.
pub struct ShellBackend {
    commands: PhaseCommands,
    config: RunnerConfig,
    output_tx: Option<mpsc::Sender<OutputLine>>,
}

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut(u64),
    Cancelled(CancelReason),
}

impl ShellBackend {
    pub fn new(commands: PhaseCommands, config: RunnerConfig) -> Self {
        Self {
            commands,
            config,
            output_tx: None,
        }
    }

    pub fn from_workflow(workflow: &WorkflowDefinition) -> Self {
        Self::new(workflow.phases.clone(), RunnerConfig::from_workflow(workflow))
    }

    /// Also stream every output line to `tx` as it is produced.
    pub fn with_output(mut self, tx: mpsc::Sender<OutputLine>) -> Self {
        self.output_tx = Some(tx);
        self
    }

    fn command_for(&self, phase: Phase) -> &str {
        match phase {
            Phase::Build => &self.commands.build,
            Phase::Test => &self.commands.test,
        }
    }

    async fn execute_command(
        &self,
        ctx: &PhaseContext,
        mut cancel: CancelSignal,
    ) -> Result<PhaseOutput> {
        let phase = ctx.phase;
        let command = self.command_for(phase);
        let start = Instant::now();

        info!(
            run_id = %ctx.run_id,
            %phase,
            command = %command,
            workspace = %ctx.workspace.display(),
            "Executing phase command"
        );

        // Workflow env is layered over the inherited process environment
        let mut cmd = Command::new(&self.config.shell);
        cmd.arg("-c")
            .arg(command)
            .current_dir(&ctx.workspace)
            .envs(&ctx.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // Its own process group, so everything the command starts can be
        // killed together
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd
            .spawn()
            .map_err(|e| Error::BackendSpawn(format!("{} -c {command:?}: {e}", self.config.shell)))?;
        let mut group = ProcessGroup::of(&child);

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(stream_lines(
                stdout,
                phase,
                OutputStream::Stdout,
                line_tx.clone(),
            )));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(stream_lines(
                stderr,
                phase,
                OutputStream::Stderr,
                line_tx,
            )));
        }
        let output = OutputTasks {
            readers,
            collector: Some(tokio::spawn(collect_lines(line_rx, self.output_tx.clone()))),
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            secs = deadline(self.config.timeout_seconds) => Outcome::TimedOut(secs),
            reason = cancel.cancelled() => Outcome::Cancelled(reason),
        };

        let grace = self.config.cancel_grace();
        match outcome {
            Outcome::Exited(status) => {
                group.release();
                let output = output.finish(grace).await;
                let status = status
                    .map_err(|e| Error::Internal(format!("Failed to wait for process: {e}")))?;
                let duration_ms = start.elapsed().as_millis() as u64;
                debug!(run_id = %ctx.run_id, %phase, exit_code = ?status.code(), duration_ms, "Command completed");

                Ok(PhaseOutput {
                    success: status.success(),
                    exit_code: status.code(),
                    output,
                    duration_ms,
                    ..Default::default()
                })
            }
            Outcome::TimedOut(secs) => {
                warn!(run_id = %ctx.run_id, %phase, timeout_secs = secs, "Command timed out, killing process");
                terminate(&mut child, &mut group, grace).await;
                let output = output.finish(grace).await;
                Ok(PhaseOutput {
                    duration_ms: start.elapsed().as_millis() as u64,
                    ..PhaseOutput::timed_out(secs, output)
                })
            }
            Outcome::Cancelled(reason) => {
                info!(run_id = %ctx.run_id, %phase, reason = %reason, "Cancelling command");
                terminate(&mut child, &mut group, grace).await;
                let output = output.finish(grace).await;
                Ok(PhaseOutput {
                    duration_ms: start.elapsed().as_millis() as u64,
                    ..PhaseOutput::cancelled(output)
                })
            }
        }
    }
}

#[async_trait]
impl BuildBackend for ShellBackend {
    async fn build(&self, ctx: &PhaseContext, cancel: CancelSignal) -> Result<PhaseOutput> {
        self.execute_command(ctx, cancel).await
    }

    async fn test(&self, ctx: &PhaseContext, cancel: CancelSignal) -> Result<PhaseOutput> {
        self.execute_command(ctx, cancel).await
    }
}

/// Resolves after `seconds`, or never when there is no limit.
async fn deadline(seconds: Option<u64>) -> u64 {
    match seconds {
        Some(secs) => {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            secs
        }
        None => std::future::pending().await,
    }
}

/// The process group a command runs in.
///
/// Killed as a whole on cancel or timeout, and when the phase future is
/// dropped before the command exits.
struct ProcessGroup {
    pgid: Option<u32>,
    live: bool,
}

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self {
            pgid: child.id().filter(|_| cfg!(unix)),
            live: true,
        }
    }

    /// The command exited on its own; leave the group alone.
    fn release(&mut self) {
        self.live = false;
    }

    /// Send SIGKILL to every process in the group. Returns the `kill`
    /// process so callers that can wait for it may do so.
    fn kill(&mut self) -> Option<Child> {
        if !std::mem::replace(&mut self.live, false) {
            return None;
        }
        let pgid = self.pgid?;
        // Spawning needs a runtime; there is none once it is shutting down
        tokio::runtime::Handle::try_current().ok()?;

        match Command::new("kill")
            .args(["-s", "KILL", "--", &format!("-{pgid}")])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(kill) => Some(kill),
            Err(e) => {
                warn!(pgid, error = %e, "Failed to signal process group");
                None
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        if self.live {
            debug!(pgid = ?self.pgid, "Phase abandoned, killing its process group");
            self.kill();
        }
    }
}

/// Kill the command's whole process group and give the shell `grace` to be
/// reaped.
async fn terminate(child: &mut Child, group: &mut ProcessGroup, grace: Duration) {
    if let Some(mut kill) = group.kill() {
        match timeout(grace, kill.wait()).await {
            Ok(Ok(status)) if status.success() => debug!(pgid = ?group.pgid, "Process group killed"),
            Ok(Ok(status)) => debug!(?status, "Process group already gone"),
            Ok(Err(e)) => warn!(error = %e, "Failed to wait for kill"),
            Err(_) => warn!("kill did not finish within grace period"),
        }
    }
    if let Err(e) = child.start_kill() {
        debug!(error = %e, "Process already gone");
    }
    match timeout(grace, child.wait()).await {
        Ok(Ok(status)) => debug!(?status, "Process reaped"),
        Ok(Err(e)) => warn!(error = %e, "Failed to reap killed process"),
        Err(_) => warn!(
            grace_secs = grace.as_secs(),
            "Process did not exit within grace period"
        ),
    }
}

async fn stream_lines<R>(
    reader: R,
    phase: Phase,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<OutputLine>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut line_number = 0u32;

    while let Ok(Some(content)) = lines.next_line().await {
        line_number += 1;
        let line = OutputLine {
            phase,
            stream,
            content,
            line_number,
            timestamp: chrono::Utc::now(),
        };
        if tx.send(line).is_err() {
            break;
        }
    }
}

/// Gather lines in arrival order, forwarding each to the live listener.
async fn collect_lines(
    mut rx: mpsc::UnboundedReceiver<OutputLine>,
    mut forward: Option<mpsc::Sender<OutputLine>>,
) -> Vec<String> {
    let mut collected = Vec::new();
    while let Some(line) = rx.recv().await {
        collected.push(line.content.clone());
        if let Some(tx) = &forward
            && tx.send(line).await.is_err()
        {
            forward = None;
        }
    }
    collected
}

/// The pipe readers and the line collector of one command.
///
/// Dropping it aborts them all, which closes the live output channel.
struct OutputTasks {
    readers: Vec<JoinHandle<()>>,
    collector: Option<JoinHandle<Vec<String>>>,
}

impl OutputTasks {
    /// Wait for the pipe readers, abandoning any held open past `grace` by a
    /// process that outlived the shell.
    async fn finish(mut self, grace: Duration) -> Vec<String> {
        for reader in &mut self.readers {
            if timeout(grace, &mut *reader).await.is_err() {
                debug!("Output pipe still open, aborting reader");
                reader.abort();
            }
        }
        match self.collector.take() {
            Some(collector) => collector.await.unwrap_or_default(),
            None => Vec::new(),
        }
    }
}

impl Drop for OutputTasks {
    fn drop(&mut self) {
        for reader in &self.readers {
            reader.abort();
        }
        if let Some(collector) = &self.collector {
            collector.abort();
        }
    }
}
