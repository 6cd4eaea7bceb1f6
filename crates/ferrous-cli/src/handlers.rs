//! Command handlers.

use crate::commands::EventArgs;
use crate::config::CliConfig;
use console::style;
use ferrous_core::events::RunEvent;
use ferrous_core::ids::{GroupKey, RunId};
use ferrous_core::ports::RunArchive;
use ferrous_core::run::{CancelReasonType, PhaseStatus, Run, RunPhase};
use ferrous_core::trigger::TriggerEvent;
use ferrous_core::workflow::WorkflowDefinition;
use ferrous_runner::{OutputLine, OutputStream, ShellBackend};
use ferrous_scheduler::{
    ConcurrencyRegistry, EventBus, InMemoryRunArchive, JsonFileRunArchive, RunCoordinator,
    TriggerMatcher, resolve_group,
};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinSet;
use tracing::{info, warn};

pub const DEFAULT_WORKFLOW_FILE: &str = "ferrous.yaml";

/// Finished runs a `serve` session keeps for its closing summary.
pub const RECENT_RUNS: usize = 50;

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Settings shared by every command.
pub struct Context {
    pub config: CliConfig,
    /// `--workflow`, when given.
    pub workflow: Option<PathBuf>,
    pub workspace: PathBuf,
}

impl Context {
    pub fn workflow_path(&self) -> PathBuf {
        self.workflow
            .clone()
            .or_else(|| self.config.workflow_file.clone())
            .unwrap_or_else(|| self.workspace.join(DEFAULT_WORKFLOW_FILE))
    }

    /// Load the workflow. A missing default file means the built-in
    /// workflow; a missing file the user named is an error.
    pub fn load_workflow(&self) -> ferrous_core::Result<WorkflowDefinition> {
        let path = self.workflow_path();
        let named = self.workflow.is_some() || self.config.workflow_file.is_some();
        if !named && !path.exists() {
            info!(path = %path.display(), "No workflow file, using the built-in workflow");
            return Ok(WorkflowDefinition::default());
        }
        WorkflowDefinition::from_file(&path)
    }

    fn archive(&self) -> Arc<dyn RunArchive> {
        match self.stored_runs() {
            Some(archive) => Arc::new(archive),
            None => Arc::new(InMemoryRunArchive::new()),
        }
    }

    /// Runs archived by earlier invocations, when an archive directory is set.
    fn stored_runs(&self) -> Option<JsonFileRunArchive> {
        self.config.archive_dir.clone().map(JsonFileRunArchive::new)
    }
}

/// Process exit code for a finished run.
pub fn exit_code(phase: RunPhase) -> u8 {
    match phase {
        RunPhase::Succeeded => 0,
        RunPhase::Cancelled => 2,
        _ => 1,
    }
}

/// Write a workflow file mirroring the built-in workflow.
pub async fn init(ctx: &Context) -> CliResult<()> {
    let path = ctx.workflow_path();

    if path.exists() {
        println!("{} {} already exists", style("!").yellow(), path.display());
        return Ok(());
    }

    let template = format!(
        "# Ferrous CI workflow\n# Runs whenever Rust sources or the manifest change.\n{}",
        WorkflowDefinition::default().to_yaml()?
    );

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&path, template)?;
    println!("{} Created {}", style("✓").green(), path.display());
    Ok(())
}

/// Validate a workflow file and print what it does.
pub async fn validate(ctx: &Context, path: Option<&Path>) -> CliResult<()> {
    let path = path.map(Path::to_path_buf).unwrap_or_else(|| ctx.workflow_path());
    let definition = WorkflowDefinition::from_file(&path)?;

    println!(
        "{} Workflow \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Triggers: {}", definition.triggers.len());
    for trigger in &definition.triggers {
        let branches = if trigger.branches.is_empty() {
            "any branch".to_string()
        } else {
            trigger.branches.join(", ")
        };
        println!("    - {} on {}", trigger.trigger_type, branches);
        if !trigger.paths.is_empty() {
            println!("      paths: {}", trigger.paths.join(", "));
        }
        if !trigger.paths_ignore.is_empty() {
            println!("      paths-ignore: {}", trigger.paths_ignore.join(", "));
        }
    }
    println!(
        "  Concurrency: group \"{}\", {}",
        definition.concurrency.group,
        if definition.concurrency.cancel_in_progress {
            "cancel in progress"
        } else {
            "queue behind running"
        }
    );
    println!("  Build: {}", definition.phases.build);
    println!("  Test: {}", definition.phases.test);

    Ok(())
}

/// Print the workflow JSON schema.
pub fn schema() -> CliResult<()> {
    let schema = schemars::schema_for!(WorkflowDefinition);
    println!("{}", serde_json::to_string_pretty(&schema)?);
    Ok(())
}

/// Report whether an event would start a run.
pub async fn check(ctx: &Context, args: EventArgs) -> CliResult<bool> {
    let workflow = ctx.load_workflow()?;
    let event = args.into_event();

    if TriggerMatcher::new().matches(&workflow, &event) {
        println!(
            "{} {} on {} would start a run of \"{}\" in group {}",
            style("✓").green(),
            event.kind,
            style(&event.git_ref).bold(),
            workflow.name,
            style(resolve_group(&workflow, &event)).cyan()
        );
        Ok(true)
    } else {
        println!(
            "{} {} on {} does not match the workflow triggers",
            style("-").dim(),
            event.kind,
            style(&event.git_ref).bold()
        );
        Ok(false)
    }
}

/// Run the workflow for one event and wait for the result.
///
/// Returns `None` when the event does not match the workflow's triggers.
pub async fn run(ctx: &Context, args: EventArgs) -> CliResult<Option<Run>> {
    let workflow = ctx.load_workflow()?;
    let event = args.into_event();

    let session = Session::start(ctx, workflow);
    let Some(handle) = session.coordinator.submit(event).await? else {
        println!(
            "{} Event does not match the workflow triggers, nothing to run",
            style("-").dim()
        );
        session.finish().await?;
        return Ok(None);
    };

    let run = tokio::select! {
        run = handle.wait() => run?,
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling run");
            session.coordinator.shutdown().await?;
            handle.wait().await?
        }
    };

    session.finish().await?;
    print_summary([&run]);
    Ok(Some(run))
}

/// Tally of the runs a `serve` session finished.
#[derive(Debug, Default)]
pub struct ServeReport {
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
    /// The last [`RECENT_RUNS`] runs to finish, in the order they finished.
    pub recent: VecDeque<Run>,
}

impl ServeReport {
    pub(crate) fn add(&mut self, run: Run) {
        match run.phase {
            RunPhase::Succeeded => self.succeeded += 1,
            RunPhase::Cancelled => self.cancelled += 1,
            _ => self.failed += 1,
        }
        if self.recent.len() == RECENT_RUNS {
            self.recent.pop_front();
        }
        self.recent.push_back(run);
    }

    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.cancelled
    }
}

/// Coordinate runs for newline-delimited JSON events read from stdin.
pub async fn serve(ctx: &Context) -> CliResult<ServeReport> {
    serve_from(ctx, BufReader::new(tokio::io::stdin())).await
}

/// Coordinate runs for newline-delimited JSON events read from `reader`,
/// then wait for every accepted run once the input ends.
///
/// Runs are collected as they finish, so a long session holds only the
/// runs still in flight plus the report.
pub async fn serve_from<R>(ctx: &Context, reader: R) -> CliResult<ServeReport>
where
    R: AsyncBufRead + Unpin,
{
    let workflow = ctx.load_workflow()?;
    info!(workflow = %workflow.name, "Reading events from input");

    let session = Session::start(ctx, workflow);
    let mut lines = reader.lines();
    let mut in_flight = JoinSet::new();
    let mut report = ServeReport::default();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            Some(finished) = in_flight.join_next() => {
                report.add(finished??);
                continue;
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("Interrupted, cancelling outstanding runs");
                session.coordinator.shutdown().await?;
                break;
            }
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match serde_json::from_str::<TriggerEvent>(line) {
            Ok(event) => {
                let git_ref = event.git_ref.clone();
                match session.coordinator.submit(event).await? {
                    Some(handle) => {
                        in_flight.spawn(async move { handle.wait().await });
                    }
                    None => println!(
                        "{} Ignored event on {}: no matching trigger",
                        style("-").dim(),
                        git_ref
                    ),
                }
            }
            Err(e) => warn!(error = %e, "Skipping malformed event"),
        }
    }

    while let Some(finished) = in_flight.join_next().await {
        report.add(finished??);
    }
    session.finish().await?;

    print_summary(&report.recent);
    if report.total() > report.recent.len() {
        println!("  ... and {} earlier runs", report.total() - report.recent.len());
    }
    println!(
        "  {} succeeded, {} failed, {} cancelled",
        report.succeeded, report.failed, report.cancelled
    );
    Ok(report)
}

/// List archived runs, newest first.
pub async fn history(ctx: &Context, group: Option<&str>, limit: usize) -> CliResult<Vec<Run>> {
    let Some(archive) = ctx.stored_runs() else {
        print_no_archive();
        return Ok(vec![]);
    };

    let group = group.map(GroupKey::new);
    let runs = archive.list(group.as_ref(), limit).await?;
    if runs.is_empty() {
        println!("{} No archived runs", style("i").blue());
        return Ok(runs);
    }

    let header = format!(
        "{:<42} {:<16} {:>5} {:<10} {:>8}  QUEUED",
        "RUN", "GROUP", "#", "PHASE", "TOOK"
    );
    println!("{}", style(header).bold());
    for run in &runs {
        println!(
            "{:<42} {:<16} {:>5} {:<10} {:>8}  {}",
            run.id.to_string(),
            run.group.as_str(),
            run.run_number,
            run.phase,
            run.duration_ms.map(format_duration).unwrap_or_default(),
            run.queued_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(runs)
}

/// Print one archived run with its phase output.
pub async fn show(ctx: &Context, run_id: RunId) -> CliResult<Run> {
    let Some(archive) = ctx.stored_runs() else {
        print_no_archive();
        return Err(ferrous_core::Error::RunNotFound(run_id.to_string()).into());
    };
    let run = archive
        .get(run_id)
        .await?
        .ok_or_else(|| ferrous_core::Error::RunNotFound(run_id.to_string()))?;

    println!("{} {}", style("Run").bold(), run.id);
    println!("  Workflow: {} #{}", run.workflow, run.run_number);
    println!("  Group: {}", run.group);
    println!("  Trigger: {} on {}", run.trigger.kind, run.trigger.git_ref);
    if let Some(sha) = &run.trigger.sha {
        println!("  Commit: {sha}");
    }
    println!("  Phase: {}", run.phase);
    if let Some(ms) = run.duration_ms {
        println!("  Duration: {}", format_duration(ms));
    }
    if let Some(failure) = &run.failure {
        println!("  Failure: {failure}");
    }
    if let Some(reason) = &run.cancel_reason {
        println!("  Cancelled: {reason}");
    }

    for record in &run.phases {
        let status = match record.status {
            PhaseStatus::Success => style("succeeded").green(),
            PhaseStatus::Failure => style("failed").red(),
            PhaseStatus::Cancelled => style("cancelled").yellow(),
        };
        println!(
            "\n{} {} {}",
            style("▸").cyan(),
            style(record.phase).bold(),
            status
        );
        for line in &record.output {
            println!("{} {}", style(format!("{:>5} |", record.phase)).dim(), line);
        }
    }
    Ok(run)
}

fn print_no_archive() {
    println!(
        "{} No archive directory configured. Set one with `ferrous config set archive_dir <dir>`",
        style("!").yellow()
    );
}

/// Show configuration.
pub fn show_config(ctx: &Context) -> CliResult<()> {
    let config = &ctx.config;
    let unset = || "(not set)".to_string();

    println!("Current configuration:");
    println!(
        "  workflow_file: {}",
        config
            .workflow_file
            .as_ref()
            .map_or_else(unset, |p| p.display().to_string())
    );
    println!(
        "  archive_dir: {}",
        config
            .archive_dir
            .as_ref()
            .map_or_else(unset, |p| p.display().to_string())
    );
    println!("  log_format: {:?}", config.log_format);

    if let Ok(path) = CliConfig::config_path() {
        println!("\nConfig file: {}", path.display());
    }

    Ok(())
}

/// Set configuration.
pub fn set_config(key: &str, value: &str) -> CliResult<()> {
    let mut config = CliConfig::load().unwrap_or_default();
    config.set(key, value)?;
    config.save()?;

    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

/// A coordinator wired to the shell backend, with printers for its output.
struct Session {
    coordinator: RunCoordinator,
    printers: Vec<tokio::task::JoinHandle<()>>,
}

impl Session {
    fn start(ctx: &Context, workflow: WorkflowDefinition) -> Self {
        let (output_tx, output_rx) = mpsc::channel(256);
        let backend = ShellBackend::from_workflow(&workflow).with_output(output_tx);
        let bus = EventBus::new();
        let events = bus.subscribe();

        let coordinator = RunCoordinator::new(
            workflow,
            ctx.workspace.clone(),
            Arc::new(ConcurrencyRegistry::new()),
            Arc::new(backend),
            Arc::new(bus),
            ctx.archive(),
        );

        Self {
            coordinator,
            printers: vec![
                tokio::spawn(print_output(output_rx)),
                tokio::spawn(print_events(events)),
            ],
        }
    }

    /// Wait for outstanding runs, then let the printers drain.
    async fn finish(self) -> CliResult<()> {
        self.coordinator.drain().await?;
        drop(self.coordinator);
        for printer in self.printers {
            let _ = printer.await;
        }
        Ok(())
    }
}

async fn print_output(mut rx: mpsc::Receiver<OutputLine>) {
    while let Some(line) = rx.recv().await {
        let prefix = format!("{:>5} |", line.phase);
        match line.stream {
            OutputStream::Stdout => println!("{} {}", style(prefix).dim(), line.content),
            OutputStream::Stderr => eprintln!("{} {}", style(prefix).dim(), line.content),
        }
    }
}

async fn print_events(mut rx: broadcast::Receiver<RunEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => println!("{}", describe(&event)),
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                warn!(missed, "Event printer fell behind");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// One-line, human-readable rendering of a lifecycle event.
pub fn describe(event: &RunEvent) -> String {
    match event {
        RunEvent::RunQueued(p) => format!(
            "{} Run #{} queued in group {} ({} on {}) {}",
            style("●").cyan(),
            p.run_number,
            style(&p.group).bold(),
            p.trigger,
            p.git_ref,
            style(p.run_id).dim()
        ),
        RunEvent::RunStarted(p) => format!("{} Run {} started", style("▶").cyan(), p.run_id),
        RunEvent::PhaseStarted(p) => format!("  {} {} started", style("→").cyan(), p.phase),
        RunEvent::PhaseCompleted(p) => match p.status {
            PhaseStatus::Success => format!(
                "  {} {} succeeded in {}",
                style("✓").green(),
                p.phase,
                format_duration(p.duration_ms)
            ),
            PhaseStatus::Failure => format!(
                "  {} {} failed{}",
                style("✗").red(),
                p.phase,
                p.exit_code
                    .map(|code| format!(" with exit code {code}"))
                    .unwrap_or_default()
            ),
            PhaseStatus::Cancelled => {
                format!("  {} {} cancelled", style("⊘").yellow(), p.phase)
            }
        },
        RunEvent::RunCompleted(p) => match (&p.status, &p.failure) {
            (RunPhase::Succeeded, _) => format!(
                "{} Run {} succeeded in {}",
                style("✓").green(),
                p.run_id,
                format_duration(p.duration_ms)
            ),
            (_, Some(failure)) => {
                format!("{} Run {} failed: {}", style("✗").red(), p.run_id, failure)
            }
            (status, None) => format!("{} Run {} {}", style("✗").red(), p.run_id, status),
        },
        RunEvent::RunCancelled(p) => {
            let why = match (p.reason, p.superseded_by) {
                (CancelReasonType::Superseded, Some(by)) => format!("superseded by {by}"),
                (CancelReasonType::Superseded, None) => "superseded".to_string(),
                (CancelReasonType::UserRequested, _) => "cancelled by user".to_string(),
                (CancelReasonType::Shutdown, _) => "shutting down".to_string(),
            };
            format!("{} Run {} cancelled: {}", style("⊘").yellow(), p.run_id, why)
        }
    }
}

fn format_duration(ms: u64) -> String {
    if ms < 1000 {
        format!("{ms}ms")
    } else if ms < 60_000 {
        format!("{:.1}s", ms as f64 / 1000.0)
    } else {
        format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

fn print_summary<'a>(runs: impl IntoIterator<Item = &'a Run>) {
    let mut runs = runs.into_iter().peekable();
    if runs.peek().is_none() {
        println!("\n{} No runs", style("i").blue());
        return;
    }

    println!("\n{}", style("Summary").bold());
    for run in runs {
        let marker = match run.phase {
            RunPhase::Succeeded => style("✓").green(),
            RunPhase::Cancelled => style("⊘").yellow(),
            _ => style("✗").red(),
        };
        println!(
            "  {} #{} {} {} {}",
            marker,
            run.run_number,
            run.phase,
            run.duration_ms.map(format_duration).unwrap_or_default(),
            style(run.id).dim()
        );
        if let Some(failure) = &run.failure {
            println!("      {}", failure);
        }
        if let Some(reason) = &run.cancel_reason {
            println!("      {}", reason);
        }
    }
}
