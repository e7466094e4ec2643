//! End-to-end cascade executions against scripted collaborators.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ripple_core::fakes::{CiResponse, Scripted, ScriptedCiStatus, ScriptedRunner, StaticResolver};
use ripple_core::{
    build_graph, CascadeConfig, CascadeError, CascadeExecution, CascadeOptions, CascadeResult,
    CascadeService, CiConfig, CiRun, CiRunState, CiStepStatus, Collaborators, CommandOutput,
    CommandRunner, DependencyGraph, DependencyRef, ExecutionStatus, RepoNode, StepStatus,
};
use ripple_store::fakes::MemoryHistoryStore;
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

struct Fixture {
    _dir: TempDir,
    root: PathBuf,
    graph: DependencyGraph,
    runner: Arc<ScriptedRunner>,
    resolver: Arc<StaticResolver>,
    ci: Arc<ScriptedCiStatus>,
    history: Arc<MemoryHistoryStore>,
}

fn write_manifest(dir: &Path, name: &str, version: &str, deps: &[(&str, &str)]) {
    std::fs::create_dir_all(dir).unwrap();
    let mut dependencies = serde_json::Map::new();
    for (dep, spec) in deps {
        dependencies.insert(dep.to_string(), json!(spec));
    }
    let manifest = json!({
        "name": name,
        "version": version,
        "dependencies": dependencies,
    });
    std::fs::write(
        dir.join("package.json"),
        serde_json::to_string_pretty(&manifest).unwrap(),
    )
    .unwrap();
}

/// lib-a ← lib-b ← lib-c, with lib-c also depending on lib-a directly.
fn fixture(runner: ScriptedRunner, ci: ScriptedCiStatus) -> Fixture {
    let dir = TempDir::new().unwrap();
    let root = dir.path().to_path_buf();

    write_manifest(&root.join("lib-a"), "@acme/lib-a", "1.0.0", &[]);
    write_manifest(
        &root.join("lib-b"),
        "@acme/lib-b",
        "1.4.0",
        &[("@acme/lib-a", "^1.0.0")],
    );
    write_manifest(
        &root.join("lib-c"),
        "@acme/lib-c",
        "3.0.0",
        &[("@acme/lib-a", "^1.0.0"), ("@acme/lib-b", "~1.3.0"), ("lodash", "^4.17.21")],
    );

    let graph = build_graph(&[
        RepoNode::new("lib-a", "@acme/lib-a", "1.0.0").with_path(root.join("lib-a")),
        RepoNode::new("lib-b", "@acme/lib-b", "1.4.0")
            .with_path(root.join("lib-b"))
            .with_dependency(DependencyRef::internal("@acme/lib-a", "^1.0.0", "lib-a")),
        RepoNode::new("lib-c", "@acme/lib-c", "3.0.0")
            .with_path(root.join("lib-c"))
            .with_dependency(DependencyRef::internal("@acme/lib-a", "^1.0.0", "lib-a"))
            .with_dependency(DependencyRef::internal("@acme/lib-b", "~1.3.0", "lib-b"))
            .with_dependency(DependencyRef::external("lodash", "^4.17.21")),
    ]);

    Fixture {
        _dir: dir,
        root,
        graph,
        runner: Arc::new(runner),
        resolver: Arc::new(StaticResolver::new().with("@acme/lib-a", "1.1.0")),
        ci: Arc::new(ci),
        history: Arc::new(MemoryHistoryStore::new()),
    }
}

fn test_config() -> CascadeConfig {
    CascadeConfig {
        ci: CiConfig {
            poll_interval_secs: 0,
            max_attempts: 3,
        },
        ..CascadeConfig::default()
    }
}

fn service(fx: &Fixture) -> CascadeService {
    service_with(fx, test_config())
}

fn service_with(fx: &Fixture, config: CascadeConfig) -> CascadeService {
    let deps = Collaborators {
        runner: fx.runner.clone(),
        resolver: fx.resolver.clone(),
        ci: fx.ci.clone(),
        history: fx.history.clone(),
    };
    CascadeService::new(config, deps)
}

async fn start(service: &CascadeService, fx: &Fixture, source: &str, options: CascadeOptions) -> String {
    let plan = service
        .create_plan(source, &fx.graph, options)
        .await
        .expect("plan");
    service.start_execution(plan)
}

async fn settle(service: &CascadeService, id: &str) -> CascadeExecution {
    tokio::time::timeout(
        SETTLE_TIMEOUT,
        service.wait_until_settled(id, Duration::from_millis(5)),
    )
    .await
    .expect("execution did not settle")
    .expect("execution exists")
}

async fn wait_for_calls(runner: &ScriptedRunner, prefix: &str, n: usize) {
    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while runner.count(prefix) < n {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("command was never invoked");
}

fn dependency_spec(fx: &Fixture, repo: &str, package: &str) -> String {
    let raw = std::fs::read_to_string(fx.root.join(repo).join("package.json")).unwrap();
    let manifest: Value = serde_json::from_str(&raw).unwrap();
    manifest["dependencies"][package]
        .as_str()
        .unwrap_or_default()
        .to_string()
}

fn status_of(exec: &CascadeExecution, repo: &str) -> StepStatus {
    exec.step(repo).unwrap().status
}

fn ci_options() -> CascadeOptions {
    CascadeOptions {
        wait_for_ci: true,
        ..CascadeOptions::default()
    }
}

fn with_origin(runner: ScriptedRunner) -> ScriptedRunner {
    runner
        .on_in("git remote get-url origin", "lib-b", Scripted::ok("git@github.com:acme/lib-b.git\n"))
        .on_in("git remote get-url origin", "lib-c", Scripted::ok("https://github.com/acme/lib-c.git\n"))
}

fn ci_run(state: CiRunState) -> CiResponse {
    CiResponse::Run(CiRun {
        state,
        url: Some("https://github.com/acme/runs/42".to_string()),
    })
}

// ---------------------------------------------------------------------------
// Happy paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_cascade_updates_manifests_layer_by_layer() {
    let fx = fixture(ScriptedRunner::new(), ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.completed, 2);
    assert_eq!(exec.failed, 0);
    assert_eq!(status_of(&exec, "lib-b"), StepStatus::Done);
    assert_eq!(status_of(&exec, "lib-c"), StepStatus::Done);
    assert!(exec.finished_at.is_some());

    assert_eq!(dependency_spec(&fx, "lib-b", "@acme/lib-a"), "^1.1.0");
    assert_eq!(dependency_spec(&fx, "lib-c", "@acme/lib-a"), "^1.1.0");
    assert_eq!(dependency_spec(&fx, "lib-c", "@acme/lib-b"), "~1.4.0");
    assert_eq!(dependency_spec(&fx, "lib-c", "lodash"), "^4.17.21");

    // Every lib-b command runs before any lib-c command.
    let calls = fx.runner.calls();
    let last_b = calls.iter().rposition(|c| c.cwd.ends_with("lib-b")).unwrap();
    let first_c = calls.iter().position(|c| c.cwd.ends_with("lib-c")).unwrap();
    assert!(last_b < first_c);

    let commits = fx.runner.calls_matching("git commit -m");
    assert_eq!(commits[0].argv[3], "chore(deps): update lib-a");
    assert_eq!(commits[1].argv[3], "chore(deps): update lib-a, lib-b");
    assert_eq!(fx.runner.count("git push"), 2);
    assert_eq!(fx.runner.count("npm test"), 2);

    assert_eq!(fx.history.save_count(), 1);
    let page = service.history(0, 10).await.unwrap();
    assert_eq!(page.total, 1);
    assert_eq!(page.entries[0].execution_id, id);
    assert_eq!(page.entries[0].status, "completed");
}

#[tokio::test]
async fn test_no_staged_changes_skips_commit_and_push() {
    let runner = ScriptedRunner::new().on("git diff --cached --quiet", Scripted::ok(""));
    let fx = fixture(runner, ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(status_of(&exec, "lib-b"), StepStatus::Done);
    assert_eq!(fx.runner.count("git commit"), 0);
    assert_eq!(fx.runner.count("git push"), 0);
    assert_eq!(fx.runner.count("git pull"), 0);
}

#[tokio::test]
async fn test_tests_are_optional() {
    let fx = fixture(ScriptedRunner::new(), ScriptedCiStatus::default());
    let service = service(&fx);
    let options = CascadeOptions {
        run_tests: false,
        ..CascadeOptions::default()
    };
    let id = start(&service, &fx, "lib-a", options).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(fx.runner.count("npm test"), 0);
    assert_eq!(fx.runner.count("npm install"), 2);
}

#[tokio::test]
async fn test_empty_plan_completes_immediately() {
    let fx = fixture(ScriptedRunner::new(), ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-c", CascadeOptions::default()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.completed, 0);
    assert!(fx.runner.calls().is_empty());
    assert_eq!(fx.history.save_count(), 1);
}

// ---------------------------------------------------------------------------
// Failures, skip and retry
// ---------------------------------------------------------------------------

fn failing_install_in_lib_b() -> ScriptedRunner {
    ScriptedRunner::new().on_in(
        "npm install",
        "lib-b",
        Scripted::fail(1, "npm ERR! ERESOLVE unable to resolve dependency tree\n"),
    )
}

#[tokio::test]
async fn test_step_failure_pauses_before_next_layer() {
    let fx = fixture(failing_install_in_lib_b(), ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Paused);
    assert_eq!(exec.current_layer, 0);
    assert_eq!(exec.failed, 1);

    let lib_b = exec.step("lib-b").unwrap();
    assert_eq!(lib_b.status, StepStatus::Failed);
    assert_eq!(
        lib_b.error.as_deref(),
        Some("npm ERR! ERESOLVE unable to resolve dependency tree")
    );
    assert_eq!(status_of(&exec, "lib-c"), StepStatus::Pending);
    assert_eq!(fx.runner.count("npm test"), 0);
    assert_eq!(fx.history.save_count(), 0);
}

#[tokio::test]
async fn test_skip_then_resume_completes() {
    let fx = fixture(failing_install_in_lib_b(), ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;
    settle(&service, &id).await;

    service.skip_step(&id, "lib-b").await.unwrap();
    let paused = service.get_execution(&id).unwrap();
    assert_eq!(paused.status, ExecutionStatus::Paused);
    assert_eq!(status_of(&paused, "lib-b"), StepStatus::Skipped);

    service.resume(&id).await.unwrap();
    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.skipped, 1);
    assert_eq!(exec.failed, 0);
    assert_eq!(exec.completed, 1);
    assert_eq!(status_of(&exec, "lib-c"), StepStatus::Done);
    // Skipped repos are not re-run.
    assert_eq!(fx.runner.calls_matching("npm install").iter().filter(|c| c.cwd.ends_with("lib-b")).count(), 1);
}

#[tokio::test]
async fn test_resume_retries_failed_steps() {
    let fx = fixture(failing_install_in_lib_b(), ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;
    settle(&service, &id).await;

    fx.runner.script("npm install", Some("lib-b"), Scripted::ok(""));
    service.resume(&id).await.unwrap();

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.failed, 0);
    assert_eq!(exec.completed, 2);
    let lib_b = exec.step("lib-b").unwrap();
    assert_eq!(lib_b.status, StepStatus::Done);
    assert_eq!(lib_b.error, None);
}

#[tokio::test]
async fn test_skip_of_non_failed_step_is_rejected() {
    let fx = fixture(failing_install_in_lib_b(), ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;
    settle(&service, &id).await;

    let err = service.skip_step(&id, "lib-c").await.unwrap_err();
    assert!(matches!(err, CascadeError::InvalidStepTransition { .. }));
    let err = service.skip_step(&id, "ghost").await.unwrap_err();
    assert!(matches!(err, CascadeError::StepNotFound { .. }));
}

// ---------------------------------------------------------------------------
// Abort and pause
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_abort_paused_execution_records_history() {
    let fx = fixture(failing_install_in_lib_b(), ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;
    settle(&service, &id).await;

    service.abort(&id).await.unwrap();
    let exec = service.get_execution(&id).unwrap();
    assert_eq!(exec.status, ExecutionStatus::Aborted);
    assert!(exec.finished_at.is_some());
    assert_eq!(fx.history.save_count(), 1);
    assert_eq!(fx.history.entries()[0].status, "aborted");

    let err = service.resume(&id).await.unwrap_err();
    assert!(matches!(err, CascadeError::InvalidState { .. }));
}

#[tokio::test]
async fn test_abort_while_running_takes_effect_after_layer() {
    let gate = Arc::new(Notify::new());
    let runner = ScriptedRunner::new().on_in(
        "npm install",
        "lib-b",
        Scripted::Blocked(gate.clone(), CommandOutput::default()),
    );
    let fx = fixture(runner, ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;

    wait_for_calls(&fx.runner, "npm install", 1).await;
    service.abort(&id).await.unwrap();
    assert_eq!(
        service.get_execution(&id).unwrap().status,
        ExecutionStatus::Running
    );

    gate.notify_one();
    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Aborted);
    assert_eq!(status_of(&exec, "lib-b"), StepStatus::Done);
    assert_eq!(status_of(&exec, "lib-c"), StepStatus::Pending);
    assert!(fx
        .runner
        .calls()
        .iter()
        .all(|c| !c.cwd.ends_with("lib-c")));
    assert_eq!(fx.history.save_count(), 1);
}

/// Start a cascade and pause it while lib-b's install is in flight.
async fn paused_after_first_layer() -> (Fixture, CascadeService, String) {
    let gate = Arc::new(Notify::new());
    let runner = ScriptedRunner::new().on_in(
        "npm install",
        "lib-b",
        Scripted::Blocked(gate.clone(), CommandOutput::default()),
    );
    let fx = fixture(runner, ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;

    wait_for_calls(&fx.runner, "npm install", 1).await;
    service.pause(&id).await.unwrap();
    gate.notify_one();

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Paused);
    assert_eq!(exec.current_layer, 1);
    assert_eq!(status_of(&exec, "lib-b"), StepStatus::Done);
    assert_eq!(status_of(&exec, "lib-c"), StepStatus::Pending);
    (fx, service, id)
}

#[tokio::test]
async fn test_pause_at_layer_boundary_then_resume() {
    let (fx, service, id) = paused_after_first_layer().await;

    let err = service.pause(&id).await.unwrap_err();
    assert!(matches!(err, CascadeError::InvalidState { .. }));

    service.resume(&id).await.unwrap();
    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.completed, 2);
    assert_eq!(fx.runner.count("npm install"), 2);
}

#[tokio::test]
async fn test_pause_during_last_layer_completes() {
    let gate = Arc::new(Notify::new());
    let runner = ScriptedRunner::new().on_in(
        "npm install",
        "lib-c",
        Scripted::Blocked(gate.clone(), CommandOutput::default()),
    );
    let fx = fixture(runner, ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;

    wait_for_calls(&fx.runner, "npm install", 2).await;
    service.pause(&id).await.unwrap();
    gate.notify_one();

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.current_layer, 2);
    assert_eq!(status_of(&exec, "lib-c"), StepStatus::Done);
    assert!(exec.finished_at.is_some());
    assert_eq!(fx.history.save_count(), 1);
    assert_eq!(fx.history.entries()[0].status, "completed");
}

#[tokio::test]
async fn test_published_version_override_feeds_later_layers() {
    let (fx, service, id) = paused_after_first_layer().await;

    service
        .set_published_version(&id, "lib-b", "1.5.0")
        .await
        .unwrap();
    service.resume(&id).await.unwrap();

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(
        exec.step("lib-b").unwrap().published_version.as_deref(),
        Some("1.5.0")
    );
    assert_eq!(dependency_spec(&fx, "lib-c", "@acme/lib-b"), "~1.5.0");
}

#[tokio::test]
async fn test_control_errors() {
    let gate = Arc::new(Notify::new());
    let runner = ScriptedRunner::new().on(
        "npm install",
        Scripted::Blocked(gate.clone(), CommandOutput::default()),
    );
    let fx = fixture(runner, ScriptedCiStatus::default());
    let service = service(&fx);

    let err = service.pause("no-such-execution").await.unwrap_err();
    assert!(matches!(err, CascadeError::ExecutionNotFound { .. }));

    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;
    wait_for_calls(&fx.runner, "npm install", 1).await;
    let err = service.resume(&id).await.unwrap_err();
    assert!(matches!(err, CascadeError::InvalidState { .. }));

    // Release lib-b, then lib-c.
    gate.notify_one();
    wait_for_calls(&fx.runner, "npm install", 2).await;
    gate.notify_one();
    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);

    let err = service.abort(&id).await.unwrap_err();
    assert!(matches!(err, CascadeError::InvalidState { .. }));
    assert_eq!(service.list_executions().len(), 1);
}

#[tokio::test]
async fn test_forget_drops_only_finished_executions() {
    let (fx, service, paused) = paused_after_first_layer().await;

    let err = service.forget(&paused).unwrap_err();
    assert!(matches!(err, CascadeError::InvalidState { .. }));
    let err = service.forget("no-such-execution").unwrap_err();
    assert!(matches!(err, CascadeError::ExecutionNotFound { .. }));

    let done = start(&service, &fx, "lib-b", CascadeOptions::default()).await;
    settle(&service, &done).await;
    assert_eq!(service.list_executions().len(), 2);

    let forgotten = service.forget(&done).unwrap();
    assert_eq!(forgotten.status, ExecutionStatus::Completed);
    assert!(service.get_execution(&done).is_none());
    assert!(matches!(
        service.abort(&done).await.unwrap_err(),
        CascadeError::ExecutionNotFound { .. }
    ));
    assert_eq!(service.list_executions().len(), 1);
    assert_eq!(service.prune_finished(), 0);

    service.abort(&paused).await.unwrap();
    assert_eq!(service.prune_finished(), 1);
    assert!(service.list_executions().is_empty());
}

// ---------------------------------------------------------------------------
// CI
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ci_success_records_published_version() {
    let fx = fixture(
        with_origin(ScriptedRunner::new()),
        ScriptedCiStatus::new(vec![ci_run(CiRunState::Running), ci_run(CiRunState::Success)]),
    );
    fx.resolver.set("@acme/lib-b", "1.5.0");
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", ci_options()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    let lib_b = exec.step("lib-b").unwrap();
    assert_eq!(lib_b.status, StepStatus::Done);
    assert_eq!(lib_b.ci_status, Some(CiStepStatus::Success));
    assert_eq!(lib_b.ci_url.as_deref(), Some("https://github.com/acme/runs/42"));
    assert_eq!(lib_b.published_version.as_deref(), Some("1.5.0"));
    assert_eq!(dependency_spec(&fx, "lib-c", "@acme/lib-b"), "~1.5.0");
    assert_eq!(fx.ci.polls(), 3);
}

#[tokio::test]
async fn test_ci_failure_is_recorded_without_pausing() {
    let fx = fixture(
        with_origin(ScriptedRunner::new()),
        ScriptedCiStatus::new(vec![ci_run(CiRunState::Failure)]),
    );
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", ci_options()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    let lib_b = exec.step("lib-b").unwrap();
    assert_eq!(lib_b.status, StepStatus::Done);
    assert_eq!(lib_b.ci_status, Some(CiStepStatus::Failure));
    assert_eq!(
        lib_b.error.as_deref(),
        Some("CI failed: https://github.com/acme/runs/42")
    );
}

#[tokio::test]
async fn test_ci_unavailable_degrades_to_skipped() {
    let fx = fixture(
        with_origin(ScriptedRunner::new()),
        ScriptedCiStatus::new(vec![CiResponse::Unavailable("gh: not logged in".to_string())]),
    );
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", ci_options()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.step("lib-b").unwrap().ci_status, Some(CiStepStatus::Skipped));
    assert_eq!(exec.step("lib-c").unwrap().ci_status, Some(CiStepStatus::Skipped));
}

#[tokio::test]
async fn test_ci_without_remote_is_skipped_without_polling() {
    let fx = fixture(ScriptedRunner::new(), ScriptedCiStatus::new(vec![ci_run(CiRunState::Success)]));
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", ci_options()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.step("lib-b").unwrap().ci_status, Some(CiStepStatus::Skipped));
    assert_eq!(fx.ci.polls(), 0);
}

#[tokio::test]
async fn test_ci_times_out_after_max_attempts() {
    let fx = fixture(
        with_origin(ScriptedRunner::new()),
        ScriptedCiStatus::new(vec![CiResponse::NoRuns]),
    );
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", ci_options()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Completed);
    let lib_b = exec.step("lib-b").unwrap();
    assert_eq!(lib_b.status, StepStatus::Done);
    assert_eq!(lib_b.ci_status, Some(CiStepStatus::TimedOut));
    assert!(lib_b.error.as_deref().unwrap().contains("3 polls"));
    assert_eq!(fx.ci.polls(), 6);
}

#[tokio::test]
async fn test_abort_during_ci_wait_settles_waiting_steps() {
    let fx = fixture(
        with_origin(ScriptedRunner::new())
            .on_in("git remote get-url origin", "lib-d", Scripted::ok("git@github.com:acme/lib-d.git\n")),
        ScriptedCiStatus::new(vec![ci_run(CiRunState::Running)]),
    );
    // Give lib-a a second direct dependent so one layer holds two CI waits.
    write_manifest(
        &fx.root.join("lib-d"),
        "@acme/lib-d",
        "0.2.0",
        &[("@acme/lib-a", "^1.0.0")],
    );
    let graph = build_graph(&[
        RepoNode::new("lib-a", "@acme/lib-a", "1.0.0").with_path(fx.root.join("lib-a")),
        RepoNode::new("lib-b", "@acme/lib-b", "1.4.0")
            .with_path(fx.root.join("lib-b"))
            .with_dependency(DependencyRef::internal("@acme/lib-a", "^1.0.0", "lib-a")),
        RepoNode::new("lib-d", "@acme/lib-d", "0.2.0")
            .with_path(fx.root.join("lib-d"))
            .with_dependency(DependencyRef::internal("@acme/lib-a", "^1.0.0", "lib-a")),
    ]);
    let service = service_with(
        &fx,
        CascadeConfig {
            ci: CiConfig {
                poll_interval_secs: 1,
                max_attempts: 1_000,
            },
            ..CascadeConfig::default()
        },
    );
    let plan = service.create_plan("lib-a", &graph, ci_options()).await.unwrap();
    let id = service.start_execution(plan);

    tokio::time::timeout(SETTLE_TIMEOUT, async {
        while fx.ci.polls() < 1 {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("CI was never polled");
    service.abort(&id).await.unwrap();

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Aborted);
    for repo in ["lib-b", "lib-d"] {
        let step = exec.step(repo).unwrap();
        assert_eq!(step.status, StepStatus::Done, "{repo}");
        assert_eq!(step.ci_status, Some(CiStepStatus::Skipped), "{repo}");
        assert!(step.finished_at.is_some(), "{repo}");
    }
    assert_eq!(fx.ci.polls(), 1);

    let entries = fx.history.entries();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].document.to_string().contains("waiting-ci"));
}

#[tokio::test]
async fn test_no_ci_wait_leaves_ci_status_unset() {
    let fx = fixture(with_origin(ScriptedRunner::new()), ScriptedCiStatus::default());
    let service = service(&fx);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.step("lib-b").unwrap().ci_status, None);
    assert_eq!(fx.runner.count("git remote"), 0);
}

// ---------------------------------------------------------------------------
// Engine errors
// ---------------------------------------------------------------------------

struct PanickingRunner;

#[async_trait]
impl CommandRunner for PanickingRunner {
    async fn run(
        &self,
        _argv: &[String],
        _cwd: &Path,
        _cancel: Option<&CancellationToken>,
    ) -> CascadeResult<CommandOutput> {
        panic!("runner exploded");
    }
}

#[tokio::test]
async fn test_panicking_collaborator_fails_execution() {
    let fx = fixture(ScriptedRunner::new(), ScriptedCiStatus::default());
    let deps = Collaborators {
        runner: Arc::new(PanickingRunner),
        resolver: fx.resolver.clone(),
        ci: fx.ci.clone(),
        history: fx.history.clone(),
    };
    let service = CascadeService::new(test_config(), deps);
    let id = start(&service, &fx, "lib-a", CascadeOptions::default()).await;

    let exec = settle(&service, &id).await;
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert!(exec.error.as_deref().unwrap().contains("runner exploded"));
    assert_eq!(status_of(&exec, "lib-c"), StepStatus::Pending);

    let err = service.resume(&id).await.unwrap_err();
    assert!(matches!(err, CascadeError::InvalidState { .. }));
}
