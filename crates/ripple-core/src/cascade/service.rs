//! Caller-facing cascade operations and the registry of live executions.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use ripple_store::HistoryPage;
use tracing::Instrument;

use crate::cascade::control::{self, ControlCommand, ControlSender};
use crate::cascade::engine::{Collaborators, ExecutionDriver, SharedExecution};
use crate::cascade::plan::{CascadeExecution, CascadePlan, ExecutionStatus, ExecutionSummary};
use crate::cascade::planner;
use crate::config::{CascadeConfig, CascadeOptions};
use crate::error::{CascadeError, CascadeResult};
use crate::graph::DependencyGraph;
use crate::metrics::METRICS;
use crate::obs;

struct ExecutionHandle {
    state: SharedExecution,
    control: ControlSender,
}

/// Owns every execution started through it, keyed by execution id.
///
/// Construct one per process and share it by reference (or `Arc`).
pub struct CascadeService {
    config: CascadeConfig,
    deps: Collaborators,
    executions: RwLock<HashMap<String, ExecutionHandle>>,
}

impl CascadeService {
    pub fn new(config: CascadeConfig, deps: Collaborators) -> Self {
        Self {
            config,
            deps,
            executions: RwLock::new(HashMap::new()),
        }
    }

    /// Service wired to real processes, the registry, `gh` and disk history.
    pub fn production(config: CascadeConfig) -> CascadeResult<Self> {
        let deps = Collaborators::production(&config)?;
        Ok(Self::new(config, deps))
    }

    pub fn config(&self) -> &CascadeConfig {
        &self.config
    }

    /// Default options for a new plan.
    pub fn default_options(&self) -> CascadeOptions {
        CascadeOptions::from_config(&self.config)
    }

    pub async fn create_plan(
        &self,
        source_id: &str,
        graph: &DependencyGraph,
        options: CascadeOptions,
    ) -> CascadeResult<CascadePlan> {
        planner::create_plan(source_id, graph, options, self.deps.resolver.as_ref()).await
    }

    /// Register the execution and hand it to a background driver task.
    ///
    /// Returns the execution id immediately. Must be called from within a
    /// Tokio runtime.
    pub fn start_execution(&self, plan: CascadePlan) -> String {
        let execution = CascadeExecution::new(plan);
        let id = execution.id.clone();
        METRICS.inc_cascades_started();
        obs::emit_cascade_started(
            &id,
            &execution.plan.source_id,
            execution.plan.layers.len(),
            execution.plan.total_repos,
        );

        let state: SharedExecution = Arc::new(RwLock::new(execution));
        let (control, rx) = control::channel();
        self.executions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                id.clone(),
                ExecutionHandle {
                    state: state.clone(),
                    control,
                },
            );

        let driver = ExecutionDriver::new(state, self.deps.clone(), self.config.clone());
        tokio::spawn(driver.run(rx).instrument(obs::execution_span(&id)));
        id
    }

    /// Snapshot of one execution.
    pub fn get_execution(&self, execution_id: &str) -> Option<CascadeExecution> {
        let executions = self.executions.read().unwrap_or_else(PoisonError::into_inner);
        executions.get(execution_id).map(|h| {
            h.state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        })
    }

    /// Every known execution, oldest first.
    pub fn list_executions(&self) -> Vec<ExecutionSummary> {
        let executions = self.executions.read().unwrap_or_else(PoisonError::into_inner);
        let mut summaries: Vec<ExecutionSummary> = executions
            .values()
            .map(|h| h.state.read().unwrap_or_else(PoisonError::into_inner).summary())
            .collect();
        summaries.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        summaries
    }

    /// Drop a finished execution from the registry and return its final
    /// snapshot. History on disk is untouched.
    pub fn forget(&self, execution_id: &str) -> CascadeResult<CascadeExecution> {
        let mut executions = self.executions.write().unwrap_or_else(PoisonError::into_inner);
        let handle = executions
            .get(execution_id)
            .ok_or_else(|| not_found(execution_id))?;
        let snapshot = handle
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if !snapshot.status.is_terminal() {
            return Err(snapshot.invalid_state("completed, failed or aborted"));
        }
        executions.remove(execution_id);
        Ok(snapshot)
    }

    /// Drop every finished execution from the registry. Returns how many
    /// were removed.
    pub fn prune_finished(&self) -> usize {
        let mut executions = self.executions.write().unwrap_or_else(PoisonError::into_inner);
        let before = executions.len();
        executions.retain(|_, h| {
            !h.state
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .status
                .is_terminal()
        });
        before - executions.len()
    }

    /// Request a pause at the next layer boundary.
    pub async fn pause(&self, execution_id: &str) -> CascadeResult<()> {
        self.control(execution_id, ControlCommand::Pause).await
    }

    /// Continue a paused execution from its retained layer.
    pub async fn resume(&self, execution_id: &str) -> CascadeResult<()> {
        self.control(execution_id, ControlCommand::Resume).await
    }

    /// Abort. A paused execution is aborted (and saved to history) before
    /// this returns; a running one stops at its next safe point.
    pub async fn abort(&self, execution_id: &str) -> CascadeResult<()> {
        self.control(execution_id, ControlCommand::Abort).await
    }

    /// Accept a failed step. Does not resume.
    pub async fn skip_step(&self, execution_id: &str, repo_id: &str) -> CascadeResult<()> {
        self.control(
            execution_id,
            ControlCommand::SkipStep {
                repo_id: repo_id.to_string(),
            },
        )
        .await
    }

    /// Manually supply a published version for later layers to use.
    pub async fn set_published_version(
        &self,
        execution_id: &str,
        repo_id: &str,
        version: &str,
    ) -> CascadeResult<()> {
        self.control(
            execution_id,
            ControlCommand::SetPublishedVersion {
                repo_id: repo_id.to_string(),
                version: version.to_string(),
            },
        )
        .await
    }

    /// Finished executions, newest first.
    pub async fn history(&self, offset: usize, limit: usize) -> CascadeResult<HistoryPage> {
        Ok(self.deps.history.list(offset, limit).await?)
    }

    /// Poll until the execution is no longer `running`.
    pub async fn wait_until_settled(
        &self,
        execution_id: &str,
        poll: Duration,
    ) -> CascadeResult<CascadeExecution> {
        loop {
            let snapshot = self
                .get_execution(execution_id)
                .ok_or_else(|| not_found(execution_id))?;
            if snapshot.status != ExecutionStatus::Running {
                return Ok(snapshot);
            }
            tokio::time::sleep(poll).await;
        }
    }

    async fn control(&self, execution_id: &str, command: ControlCommand) -> CascadeResult<()> {
        let (sender, state) = {
            let executions = self.executions.read().unwrap_or_else(PoisonError::into_inner);
            let handle = executions
                .get(execution_id)
                .ok_or_else(|| not_found(execution_id))?;
            (handle.control.clone(), handle.state.clone())
        };

        let current = state.read().unwrap_or_else(PoisonError::into_inner).status;
        if current.is_terminal() {
            return Err(terminal(&state));
        }
        match control::request(&sender, command).await? {
            Some(()) => Ok(()),
            None => Err(terminal(&state)),
        }
    }
}

fn not_found(execution_id: &str) -> CascadeError {
    CascadeError::ExecutionNotFound {
        execution_id: execution_id.to_string(),
    }
}

fn terminal(state: &SharedExecution) -> CascadeError {
    state
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .invalid_state("running or paused")
}
