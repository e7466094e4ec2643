//! Execution driver.
//!
//! One driver task owns every mutation of one execution: step statuses,
//! tallies and the resume point. Callers read snapshots of the shared
//! record and request transitions over the control channel; requests that
//! arrive mid-layer are serviced concurrently with the running steps and
//! take effect at the next safe point.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::Utc;
use futures::FutureExt;
use ripple_store::{FsHistoryStore, HistoryStore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapters::ci::{CiRunState, CiStatusSource, GhCliStatus};
use crate::adapters::registry::{NpmRegistry, VersionResolver};
use crate::adapters::runner::{failure_detail, run_checked, CommandRunner, ProcessRunner};
use crate::adapters::{git, manifest};
use crate::cascade::control::{ControlCommand, ControlMessage, ControlReceiver};
use crate::cascade::plan::{
    CascadeExecution, CiStepStatus, ExecutionStatus, LayerMode, StepStatus,
};
use crate::config::CascadeConfig;
use crate::error::{CascadeError, CascadeResult};
use crate::metrics::METRICS;
use crate::obs;
use crate::pool::{panic_message, BoundedExecutor};

/// External collaborators an execution talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub runner: Arc<dyn CommandRunner>,
    pub resolver: Arc<dyn VersionResolver>,
    pub ci: Arc<dyn CiStatusSource>,
    pub history: Arc<dyn HistoryStore>,
}

impl Collaborators {
    /// Real processes, the configured registry, `gh` and on-disk history.
    pub fn production(config: &CascadeConfig) -> CascadeResult<Self> {
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner::new());
        Ok(Self {
            resolver: Arc::new(NpmRegistry::new(config.registry_url.clone())?),
            ci: Arc::new(GhCliStatus::new(runner.clone())),
            history: Arc::new(FsHistoryStore::new(&config.history_dir)?),
            runner,
        })
    }
}

pub(crate) type SharedExecution = Arc<RwLock<CascadeExecution>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PauseReason {
    Requested,
    StepFailures,
}

impl PauseReason {
    fn as_str(self) -> &'static str {
        match self {
            PauseReason::Requested => "requested",
            PauseReason::StepFailures => "step_failures",
        }
    }
}

/// Why the layer loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LoopExit {
    Completed,
    Aborted,
    Paused(PauseReason),
}

/// How a step's work ended.
#[derive(Debug)]
enum StepEnd {
    /// Nothing to commit after staging.
    Unchanged,
    Pushed,
    Failed { stage: StepStatus, error: String },
}

pub(crate) struct ExecutionDriver {
    id: String,
    state: SharedExecution,
    deps: Collaborators,
    config: CascadeConfig,
    cancel: CancellationToken,
    pause_requested: AtomicBool,
    abort_requested: AtomicBool,
}

impl ExecutionDriver {
    pub(crate) fn new(state: SharedExecution, deps: Collaborators, config: CascadeConfig) -> Self {
        let id = state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .id
            .clone();
        Self {
            id,
            state,
            deps,
            config,
            cancel: CancellationToken::new(),
            pause_requested: AtomicBool::new(false),
            abort_requested: AtomicBool::new(false),
        }
    }

    fn read<R>(&self, f: impl FnOnce(&CascadeExecution) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    fn write<R>(&self, f: impl FnOnce(&mut CascadeExecution) -> R) -> R {
        let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
        f(&mut guard)
    }

    fn aborting(&self) -> bool {
        self.abort_requested.load(Ordering::SeqCst)
    }

    /// Drive the execution to a terminal or detached state.
    ///
    /// Engine errors and panics mark the execution `failed`.
    pub(crate) async fn run(self, mut rx: ControlReceiver) {
        let outcome = AssertUnwindSafe(self.drive(&mut rx)).catch_unwind().await;
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(payload) => Some(format!("engine panicked: {}", panic_message(payload.as_ref()))),
        };
        if let Some(message) = failure {
            error!(execution_id = %self.id, error = %message, "cascade engine error");
            self.finish(ExecutionStatus::Failed, Some(message)).await;
        }

        rx.close();
        while let Ok(msg) = rx.try_recv() {
            let err = self.read(|e| e.invalid_state("running or paused"));
            msg.respond(Err(err));
        }
    }

    async fn drive(&self, rx: &mut ControlReceiver) -> CascadeResult<()> {
        loop {
            match self.run_layers(rx).await? {
                LoopExit::Completed => {
                    self.finish(ExecutionStatus::Completed, None).await;
                    return Ok(());
                }
                LoopExit::Aborted => {
                    self.finish(ExecutionStatus::Aborted, None).await;
                    return Ok(());
                }
                LoopExit::Paused(reason) => {
                    let layer = self.write(|e| {
                        e.status = ExecutionStatus::Paused;
                        e.current_layer
                    });
                    obs::emit_cascade_paused(&self.id, layer, reason.as_str());
                    if !self.wait_while_paused(rx).await? {
                        return Ok(());
                    }
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Layer loop
    // -----------------------------------------------------------------------

    async fn run_layers(&self, rx: &mut ControlReceiver) -> CascadeResult<LoopExit> {
        loop {
            if self.aborting() {
                return Ok(LoopExit::Aborted);
            }

            let next = self.read(|e| {
                e.plan.layers.get(e.current_layer).map(|layer| {
                    let runnable: Vec<String> = layer
                        .steps
                        .iter()
                        .filter(|s| s.status.is_runnable())
                        .map(|s| s.repo_id.clone())
                        .collect();
                    (e.current_layer, layer.index, layer.mode, runnable)
                })
            });
            // A pause that lands during the final layer has nothing left to hold.
            let Some((position, layer_index, mode, runnable)) = next else {
                return Ok(LoopExit::Completed);
            };
            if self.pause_requested.swap(false, Ordering::SeqCst) {
                return Ok(LoopExit::Paused(PauseReason::Requested));
            }

            self.reset_failed(&runnable)?;
            let concurrency = match mode {
                LayerMode::Sequential => 1,
                LayerMode::Parallel => self.config.parallel_limit.min(runnable.len()),
            };
            debug!(layer = layer_index, steps = runnable.len(), concurrency, "running layer");

            let executor = BoundedExecutor::new(concurrency);
            let outcomes = self
                .service_while(executor.run(runnable, |repo_id| self.run_step(repo_id)), rx)
                .await;
            for outcome in &outcomes {
                if let Err(e) = &outcome.result {
                    return Err(CascadeError::Engine(format!("step {}: {e}", outcome.item)));
                }
            }

            let (done, failed) = self.read(|e| {
                let steps = &e.plan.layers[position].steps;
                let count = |want: &[StepStatus]| steps.iter().filter(|s| want.contains(&s.status)).count();
                (
                    count(&[StepStatus::Done, StepStatus::WaitingCi]),
                    count(&[StepStatus::Failed]),
                )
            });
            obs::emit_layer_finished(&self.id, layer_index, done, failed);

            if self.aborting() {
                return Ok(LoopExit::Aborted);
            }
            if failed > 0 {
                return Ok(LoopExit::Paused(PauseReason::StepFailures));
            }

            if self.read(|e| e.plan.options.wait_for_ci) {
                let waiting: Vec<String> = self.read(|e| {
                    e.plan.layers[position]
                        .steps
                        .iter()
                        .filter(|s| s.status == StepStatus::WaitingCi)
                        .map(|s| s.repo_id.clone())
                        .collect()
                });
                for repo_id in waiting {
                    if self.aborting() {
                        return Ok(LoopExit::Aborted);
                    }
                    self.service_while(self.wait_for_ci(&repo_id), rx).await?;
                }
                if self.aborting() {
                    return Ok(LoopExit::Aborted);
                }
            }

            self.write(|e| e.current_layer = position + 1);
        }
    }

    /// Give failed steps of a resumed layer another pass.
    fn reset_failed(&self, repo_ids: &[String]) -> CascadeResult<()> {
        self.write(|e| -> CascadeResult<()> {
            for repo_id in repo_ids {
                let step = e.step_mut(repo_id)?;
                if step.status == StepStatus::Failed {
                    step.transition(StepStatus::Pending)?;
                    step.error = None;
                    step.finished_at = None;
                    e.failed = e.failed.saturating_sub(1);
                }
            }
            Ok(())
        })
    }

    /// Await `fut` while answering control requests.
    async fn service_while<F: Future>(&self, fut: F, rx: &mut ControlReceiver) -> F::Output {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                biased;
                out = &mut fut => return out,
                Some(msg) = rx.recv() => self.handle_while_running(msg),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Steps
    // -----------------------------------------------------------------------

    async fn run_step(&self, repo_id: String) -> CascadeResult<()> {
        if self.cancel.is_cancelled() || self.aborting() {
            debug!(repo_id = %repo_id, "abort requested, step not started");
            return Ok(());
        }

        let (path, versions, message, run_tests, wait_for_ci) =
            self.read(|e| -> CascadeResult<_> {
                let step = e.step(&repo_id)?;
                Ok((
                    step.path.clone(),
                    e.plan.effective_versions(step),
                    step.commit_message.clone(),
                    e.plan.options.run_tests,
                    e.plan.options.wait_for_ci,
                ))
            })?;
        self.write(|e| -> CascadeResult<()> {
            e.step_mut(&repo_id)?.started_at = Some(Utc::now());
            Ok(())
        })?;

        let end = self
            .perform(&repo_id, &path, &versions, &message, run_tests)
            .await?;

        let next = match end {
            StepEnd::Unchanged => {
                debug!(repo_id = %repo_id, "no changes after staging, nothing to commit");
                StepStatus::Done
            }
            StepEnd::Pushed if wait_for_ci => StepStatus::WaitingCi,
            StepEnd::Pushed => StepStatus::Done,
            StepEnd::Failed { stage, error } => {
                self.write(|e| -> CascadeResult<()> {
                    let step = e.step_mut(&repo_id)?;
                    step.transition(StepStatus::Failed)?;
                    step.error = Some(error.clone());
                    step.finished_at = Some(Utc::now());
                    e.failed += 1;
                    Ok(())
                })?;
                METRICS.inc_steps_failed();
                obs::emit_step_failed(&self.id, &repo_id, stage.as_str(), &error);
                return Ok(());
            }
        };

        self.write(|e| -> CascadeResult<()> {
            let step = e.step_mut(&repo_id)?;
            step.transition(next)?;
            step.finished_at = Some(Utc::now());
            e.completed += 1;
            Ok(())
        })?;
        METRICS.inc_steps_completed();
        debug!(repo_id = %repo_id, status = %next, "step transition");
        Ok(())
    }

    fn advance(&self, repo_id: &str, next: StepStatus) -> CascadeResult<()> {
        self.write(|e| e.step_mut(repo_id)?.transition(next))?;
        debug!(repo_id, status = %next, "step transition");
        Ok(())
    }

    /// Sub-operation failures end the step; only engine errors escape.
    async fn perform(
        &self,
        repo_id: &str,
        path: &Path,
        versions: &[(String, String)],
        message: &str,
        run_tests: bool,
    ) -> CascadeResult<StepEnd> {
        macro_rules! attempt {
            ($stage:expr, $op:expr) => {
                match $op {
                    Ok(value) => value,
                    Err(err) => {
                        return Ok(StepEnd::Failed {
                            stage: $stage,
                            error: failure_detail(&err),
                        })
                    }
                }
            };
        }
        let runner = self.deps.runner.as_ref();

        self.advance(repo_id, StepStatus::UpdatingDeps)?;
        attempt!(
            StepStatus::UpdatingDeps,
            manifest::update_manifest(path, versions).await
        );

        self.advance(repo_id, StepStatus::Installing)?;
        attempt!(
            StepStatus::Installing,
            run_checked(runner, &self.config.install_command, path, None).await
        );

        if run_tests {
            self.advance(repo_id, StepStatus::Testing)?;
            attempt!(
                StepStatus::Testing,
                run_checked(runner, &self.config.test_command, path, None).await
            );
        }

        self.advance(repo_id, StepStatus::Committing)?;
        attempt!(StepStatus::Committing, git::stage_all(runner, path, None).await);
        let changed = attempt!(
            StepStatus::Committing,
            git::has_staged_changes(runner, path, None).await
        );
        if !changed {
            return Ok(StepEnd::Unchanged);
        }
        attempt!(
            StepStatus::Committing,
            git::commit(runner, path, message, None).await
        );

        self.advance(repo_id, StepStatus::Pushing)?;
        git::pull_rebase(runner, path, None).await;
        attempt!(StepStatus::Pushing, git::push(runner, path, None).await);

        Ok(StepEnd::Pushed)
    }

    // -----------------------------------------------------------------------
    // CI
    // -----------------------------------------------------------------------

    /// Poll CI for a pushed step, then mark it `done`.
    ///
    /// CI tooling problems degrade to a `skipped` CI status; a red build is
    /// recorded on the step without failing it.
    async fn wait_for_ci(&self, repo_id: &str) -> CascadeResult<()> {
        let (path, package): (PathBuf, String) = self.read(|e| {
            e.step(repo_id)
                .map(|s| (s.path.clone(), s.package_name.clone()))
        })?;
        self.set_ci(repo_id, CiStepStatus::Pending, None)?;

        let slug = match git::remote_slug(self.deps.runner.as_ref(), &path, None).await {
            Ok(Some(slug)) => slug,
            Ok(None) => {
                debug!(repo_id, "no hosting slug, skipping CI");
                return self.finish_ci(repo_id, Some(CiStepStatus::Skipped), None);
            }
            Err(e) => {
                debug!(repo_id, error = %e, "remote lookup failed, skipping CI");
                return self.finish_ci(repo_id, Some(CiStepStatus::Skipped), None);
            }
        };

        let max_attempts = self.config.ci.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            if self.cancel.is_cancelled() {
                return self.finish_ci(repo_id, Some(CiStepStatus::Skipped), None);
            }
            METRICS.inc_ci_polls();
            match self.deps.ci.latest_run(&slug).await {
                Err(e) => {
                    debug!(repo_id, error = %e, "CI status unavailable");
                    return self.finish_ci(repo_id, Some(CiStepStatus::Skipped), None);
                }
                Ok(None) => {}
                Ok(Some(run)) => match run.state {
                    CiRunState::Success => {
                        self.set_ci(repo_id, CiStepStatus::Success, run.url)?;
                        if let Some(version) = self.deps.resolver.latest_version(&package).await {
                            self.write(|e| e.set_published_version(repo_id, &version))?;
                        }
                        return self.finish_ci(repo_id, None, None);
                    }
                    CiRunState::Failure => {
                        let error = match &run.url {
                            Some(url) => format!("CI failed: {url}"),
                            None => "CI failed".to_string(),
                        };
                        self.set_ci(repo_id, CiStepStatus::Failure, run.url)?;
                        return self.finish_ci(repo_id, None, Some(error));
                    }
                    CiRunState::Running => self.set_ci(repo_id, CiStepStatus::Running, run.url)?,
                    CiRunState::Pending => self.set_ci(repo_id, CiStepStatus::Pending, run.url)?,
                },
            }

            if attempt < max_attempts {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.ci.poll_interval()) => {}
                    _ = self.cancel.cancelled() => {}
                }
            }
        }

        self.finish_ci(
            repo_id,
            Some(CiStepStatus::TimedOut),
            Some(format!("CI did not finish after {max_attempts} polls")),
        )
    }

    fn set_ci(&self, repo_id: &str, status: CiStepStatus, url: Option<String>) -> CascadeResult<()> {
        self.write(|e| -> CascadeResult<()> {
            let step = e.step_mut(repo_id)?;
            step.ci_status = Some(status);
            if url.is_some() {
                step.ci_url = url;
            }
            Ok(())
        })
    }

    fn finish_ci(
        &self,
        repo_id: &str,
        status: Option<CiStepStatus>,
        error: Option<String>,
    ) -> CascadeResult<()> {
        let (final_status, url) = self.write(|e| -> CascadeResult<_> {
            let step = e.step_mut(repo_id)?;
            if let Some(status) = status {
                step.ci_status = Some(status);
            }
            if error.is_some() {
                step.error = error;
            }
            step.transition(StepStatus::Done)?;
            step.finished_at = Some(Utc::now());
            Ok((step.ci_status, step.ci_url.clone()))
        })?;
        let label = final_status.map_or("unknown", CiStepStatus::as_str);
        obs::emit_ci_finished(&self.id, repo_id, label, url.as_deref());
        Ok(())
    }

    /// Close out steps still waiting on CI so a terminal snapshot holds no
    /// in-flight step.
    fn settle_waiting_ci(&self) {
        let waiting: Vec<String> = self.read(|e| {
            e.plan
                .steps()
                .filter(|s| s.status == StepStatus::WaitingCi)
                .map(|s| s.repo_id.clone())
                .collect()
        });
        for repo_id in waiting {
            if let Err(e) = self.finish_ci(&repo_id, Some(CiStepStatus::Skipped), None) {
                warn!(execution_id = %self.id, repo_id = %repo_id, error = %e, "could not settle CI wait");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Control
    // -----------------------------------------------------------------------

    fn handle_while_running(&self, msg: ControlMessage) {
        let command = msg.command.clone();
        let outcome = match &command {
            ControlCommand::Pause => {
                self.pause_requested.store(true, Ordering::SeqCst);
                debug!(execution_id = %self.id, "pause requested");
                Ok(())
            }
            ControlCommand::Resume => Err(self.read(|e| e.invalid_state("paused"))),
            ControlCommand::Abort => {
                self.abort_requested.store(true, Ordering::SeqCst);
                self.cancel.cancel();
                debug!(execution_id = %self.id, "abort requested");
                Ok(())
            }
            step_command => self.apply_step_command(step_command),
        };
        msg.respond(outcome);
    }

    /// Returns `true` on resume, `false` once the execution is finished or
    /// every handle to it is gone.
    async fn wait_while_paused(&self, rx: &mut ControlReceiver) -> CascadeResult<bool> {
        while let Some(msg) = rx.recv().await {
            let command = msg.command.clone();
            match &command {
                ControlCommand::Resume => {
                    self.pause_requested.store(false, Ordering::SeqCst);
                    let layer = self.write(|e| {
                        e.status = ExecutionStatus::Running;
                        e.current_layer
                    });
                    obs::emit_cascade_resumed(&self.id, layer);
                    msg.respond(Ok(()));
                    return Ok(true);
                }
                ControlCommand::Abort => {
                    self.abort_requested.store(true, Ordering::SeqCst);
                    self.cancel.cancel();
                    self.finish(ExecutionStatus::Aborted, None).await;
                    msg.respond(Ok(()));
                    return Ok(false);
                }
                ControlCommand::Pause => {
                    let err = self.read(|e| e.invalid_state("running"));
                    msg.respond(Err(err));
                }
                step_command => {
                    let outcome = self.apply_step_command(step_command);
                    msg.respond(outcome);
                }
            }
        }
        debug!(execution_id = %self.id, "control channel closed while paused");
        Ok(false)
    }

    fn apply_step_command(&self, command: &ControlCommand) -> CascadeResult<()> {
        match command {
            ControlCommand::SkipStep { repo_id } => {
                self.write(|e| e.skip_step(repo_id))?;
                METRICS.inc_steps_skipped();
                info!(execution_id = %self.id, repo_id = %repo_id, "step skipped");
                Ok(())
            }
            ControlCommand::SetPublishedVersion { repo_id, version } => {
                self.write(|e| e.set_published_version(repo_id, version))?;
                info!(execution_id = %self.id, repo_id = %repo_id, version = %version, "published version set");
                Ok(())
            }
            other => Err(CascadeError::Engine(format!(
                "{} is not a step command",
                other.name()
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Terminal states
    // -----------------------------------------------------------------------

    async fn finish(&self, status: ExecutionStatus, error: Option<String>) {
        self.settle_waiting_ci();
        let snapshot = self.write(|e| {
            e.status = status;
            e.finished_at = Some(Utc::now());
            if error.is_some() {
                e.error = error;
            }
            e.clone()
        });
        let duration_ms = snapshot
            .finished_at
            .map(|end| (end - snapshot.started_at).num_milliseconds().max(0) as u64)
            .unwrap_or_default();
        obs::emit_cascade_finished(
            &self.id,
            status.as_str(),
            snapshot.completed,
            snapshot.failed,
            snapshot.skipped,
            duration_ms,
        );
        METRICS.flush();

        if !matches!(status, ExecutionStatus::Completed | ExecutionStatus::Aborted) {
            return;
        }
        let saved = match snapshot.to_history_entry() {
            Ok(entry) => self.deps.history.save(entry).await.map_err(CascadeError::from),
            Err(e) => Err(e),
        };
        match saved {
            Ok(key) => debug!(execution_id = %self.id, key = %key, "history saved"),
            Err(e) => obs::emit_history_error(&self.id, &e),
        }
    }
}
