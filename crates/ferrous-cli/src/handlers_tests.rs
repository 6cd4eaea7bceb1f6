//! Tests for the command handlers.

#[cfg(test)]
mod tests {
    use crate::commands::EventArgs;
    use crate::config::CliConfig;
    use crate::handlers::{self, Context, DEFAULT_WORKFLOW_FILE};
    use chrono::Utc;
    use ferrous_core::events::{RunEvent, RunQueuedPayload};
    use ferrous_core::ids::{GroupKey, RunId};
    use ferrous_core::run::{Phase, PhaseStatus, RunPhase};
    use ferrous_core::trigger::EventKind;
    use ferrous_core::workflow::WorkflowDefinition;
    use pretty_assertions::assert_eq;
    use std::path::Path;
    use std::time::{Duration, Instant};
    use tokio::io::{AsyncWriteExt, BufReader};

    fn context(workspace: &Path) -> Context {
        Context {
            config: CliConfig::default(),
            workflow: None,
            workspace: workspace.to_path_buf(),
        }
    }

    fn write_workflow(workspace: &Path, build: &str, test: &str) {
        let yaml = format!(
            r#"name: local
triggers:
  - type: push
    branches: ["main"]
    paths: ["**.rs"]
phases:
  build: "{build}"
  test: "{test}"
timeouts:
  cancel_grace_seconds: 1
"#
        );
        std::fs::write(workspace.join(DEFAULT_WORKFLOW_FILE), yaml).unwrap();
    }

    fn push(paths: &[&str]) -> EventArgs {
        EventArgs {
            event: EventKind::Push,
            git_ref: "main".to_string(),
            paths: paths.iter().map(|p| p.to_string()).collect(),
            sha: None,
            actor: None,
        }
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(handlers::exit_code(RunPhase::Succeeded), 0);
        assert_eq!(handlers::exit_code(RunPhase::Failed), 1);
        assert_eq!(handlers::exit_code(RunPhase::Cancelled), 2);
    }

    #[test]
    fn test_event_args_into_event() {
        let mut args = push(&["src/lib.rs", "src/lib.rs", "Cargo.toml"]);
        args.sha = Some("abc123".to_string());

        let event = args.into_event();
        assert_eq!(event.kind, EventKind::Push);
        assert_eq!(event.changed_paths.len(), 2);
        assert_eq!(event.sha.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_missing_default_workflow_uses_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let workflow = context(dir.path()).load_workflow().unwrap();
        assert_eq!(workflow, WorkflowDefinition::default());
    }

    #[test]
    fn test_missing_named_workflow_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = context(dir.path());
        ctx.workflow = Some(dir.path().join("elsewhere.yaml"));

        let err = ctx.load_workflow().unwrap_err();
        assert!(matches!(err, ferrous_core::Error::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_init_writes_builtin_workflow_once() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        handlers::init(&ctx).await.unwrap();
        let path = dir.path().join(DEFAULT_WORKFLOW_FILE);
        let written = WorkflowDefinition::from_file(&path).unwrap();
        assert_eq!(written, WorkflowDefinition::default());

        std::fs::write(&path, "name: edited\n").unwrap();
        handlers::init(&ctx).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "name: edited\n");
    }

    #[tokio::test]
    async fn test_validate_rejects_broken_workflow() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.yaml");
        std::fs::write(&path, "name: broken\nphases:\n  build: \"\"\n  test: \"\"\n").unwrap();

        let err = handlers::validate(&context(dir.path()), Some(&path))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("phases.build"));
    }

    #[tokio::test]
    async fn test_check_filters_events() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = context(dir.path());

        assert!(handlers::check(&ctx, push(&["src/lib.rs"])).await.unwrap());
        assert!(!handlers::check(&ctx, push(&["README"])).await.unwrap());
    }

    #[tokio::test]
    async fn test_run_reports_test_failure() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(dir.path(), "echo building", "echo failing; exit 4");
        let mut ctx = context(dir.path());
        ctx.config.archive_dir = Some(dir.path().join("runs"));

        let run = handlers::run(&ctx, push(&["src/main.rs"]))
            .await
            .unwrap()
            .unwrap();

        assert_eq!(run.phase, RunPhase::Failed);
        assert_eq!(handlers::exit_code(run.phase), 1);
        let build = run.phase_record(Phase::Build).unwrap();
        assert_eq!(build.status, PhaseStatus::Success);
        assert_eq!(build.output, vec!["building".to_string()]);
        let test = run.phase_record(Phase::Test).unwrap();
        assert_eq!(test.exit_code, Some(4));
        assert_eq!(test.output, vec!["failing".to_string()]);

        let archived = dir.path().join("runs").join(format!("{}.json", run.id));
        assert!(archived.exists());
    }

    #[tokio::test]
    async fn test_run_ignores_unmatched_event() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(dir.path(), "true", "true");

        let run = handlers::run(&context(dir.path()), push(&["docs/index.md"]))
            .await
            .unwrap();
        assert!(run.is_none());
    }

    #[tokio::test]
    async fn test_serve_supersedes_earlier_run() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(dir.path(), "sleep 1", "true");

        let input = [
            r#"{"kind":"push","ref":"main","changed_paths":["README"]}"#,
            "not json",
            r#"{"kind":"push","ref":"main","changed_paths":["src/lib.rs"]}"#,
            "",
            r#"{"kind":"push","ref":"refs/heads/main","changed_paths":["src/main.rs"]}"#,
        ]
        .join("\n");

        let report = handlers::serve_from(&context(dir.path()), input.as_bytes())
            .await
            .unwrap();

        assert_eq!(report.total(), 2);
        assert_eq!((report.succeeded, report.failed, report.cancelled), (1, 0, 1));
        let runs = &report.recent;
        assert_eq!(runs[0].phase, RunPhase::Cancelled);
        assert_eq!(
            runs[0].cancel_reason.as_ref().and_then(|r| r.superseded_by),
            Some(runs[1].id)
        );
        assert_eq!(runs[1].phase, RunPhase::Succeeded);
        assert_eq!(runs[1].run_number, 2);
    }

    #[tokio::test]
    async fn test_serve_superseded_run_leaves_no_processes_behind() {
        let dir = tempfile::tempdir().unwrap();
        // The first run starts a nested shell; later runs find the marker and
        // finish at once
        write_workflow(
            dir.path(),
            "if [ -e first ]; then echo again; else touch first; sh -c 'sleep 3; touch leftover'; fi",
            "true",
        );

        let (mut writer, reader) = tokio::io::duplex(1024);
        let feeder = tokio::spawn(async move {
            let event = b"{\"kind\":\"push\",\"ref\":\"main\",\"changed_paths\":[\"src/lib.rs\"]}\n";
            writer.write_all(event).await.unwrap();
            tokio::time::sleep(Duration::from_millis(700)).await;
            writer.write_all(event).await.unwrap();
        });

        let started = Instant::now();
        let report = handlers::serve_from(&context(dir.path()), BufReader::new(reader))
            .await
            .unwrap();
        feeder.await.unwrap();

        assert_eq!((report.succeeded, report.cancelled), (1, 1));
        assert!(started.elapsed() < Duration::from_millis(2500));

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(dir.path().join("first").exists());
        assert!(!dir.path().join("leftover").exists());
    }

    #[tokio::test]
    async fn test_history_and_show_read_the_archive() {
        let dir = tempfile::tempdir().unwrap();
        write_workflow(dir.path(), "echo building", "true");
        let mut ctx = context(dir.path());

        // Nothing to read without an archive directory
        assert!(handlers::history(&ctx, None, 10).await.unwrap().is_empty());

        ctx.config.archive_dir = Some(dir.path().join("runs"));
        let first = handlers::run(&ctx, push(&["src/lib.rs"])).await.unwrap().unwrap();
        let second = handlers::run(&ctx, push(&["src/main.rs"])).await.unwrap().unwrap();

        let listed = handlers::history(&ctx, Some("ci"), 10).await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].id, second.id);
        assert!(handlers::history(&ctx, Some("other"), 10).await.unwrap().is_empty());
        assert_eq!(handlers::history(&ctx, None, 1).await.unwrap().len(), 1);

        let shown = handlers::show(&ctx, first.id).await.unwrap();
        assert_eq!(shown.phase, RunPhase::Succeeded);
        assert_eq!(
            shown.phase_record(Phase::Build).unwrap().output,
            vec!["building".to_string()]
        );

        let err = handlers::show(&ctx, RunId::new()).await.unwrap_err();
        assert!(err.to_string().contains("Run not found"));
    }

    #[test]
    fn test_serve_report_keeps_recent_runs_only() {
        let mut report = handlers::ServeReport::default();
        for number in 1..=(handlers::RECENT_RUNS as u32 + 5) {
            let mut run = ferrous_core::run::Run::new(
                RunId::new(),
                "ci",
                GroupKey::new("ci"),
                number,
                ferrous_core::trigger::TriggerEvent::push("main", ["src/lib.rs"]),
            );
            run.transition(RunPhase::Building).unwrap();
            run.transition(RunPhase::Failed).unwrap();
            report.add(run);
        }

        assert_eq!(report.failed, handlers::RECENT_RUNS + 5);
        assert_eq!(report.recent.len(), handlers::RECENT_RUNS);
        assert_eq!(report.recent[0].run_number, 6);
    }

    #[test]
    fn test_describe_queued_event() {
        let event = RunEvent::RunQueued(RunQueuedPayload {
            run_id: RunId::new(),
            group: GroupKey::new("ci"),
            workflow: "ci".to_string(),
            run_number: 3,
            trigger: EventKind::PullRequest,
            git_ref: "main".to_string(),
            queued_at: Utc::now(),
        });

        let line = handlers::describe(&event);
        assert!(line.contains("Run #3 queued in group"));
        assert!(line.contains("pull_request on main"));
    }
}
