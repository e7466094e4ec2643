//! Cascade plan, step state machine and execution records.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use ripple_store::HistoryEntry;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::CascadeOptions;
use crate::error::{CascadeError, CascadeResult};

/// Opaque id: millisecond timestamp plus a random suffix.
pub fn new_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().timestamp_millis(), &suffix[..8])
}

// ---------------------------------------------------------------------------
// Step state machine
// ---------------------------------------------------------------------------

/// Per-step state.
///
/// `pending → updating-deps → installing → [testing] → committing → pushing →
/// [waiting-ci] → done`, with `failed` reachable from any non-terminal state
/// and `skipped` only from `failed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    #[default]
    Pending,
    UpdatingDeps,
    Installing,
    Testing,
    Committing,
    Pushing,
    WaitingCi,
    Done,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::UpdatingDeps => "updating-deps",
            StepStatus::Installing => "installing",
            StepStatus::Testing => "testing",
            StepStatus::Committing => "committing",
            StepStatus::Pushing => "pushing",
            StepStatus::WaitingCi => "waiting-ci",
            StepStatus::Done => "done",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        }
    }

    /// `done`, `failed` or `skipped`.
    pub fn is_terminal(self) -> bool {
        matches!(self, StepStatus::Done | StepStatus::Failed | StepStatus::Skipped)
    }

    /// Whether a layer pass still has work to do for this step.
    pub fn is_runnable(self) -> bool {
        matches!(self, StepStatus::Pending | StepStatus::Failed)
    }

    pub fn can_transition_to(self, next: StepStatus) -> bool {
        use StepStatus::*;
        match (self, next) {
            (Pending, UpdatingDeps)
            | (UpdatingDeps, Installing)
            | (Installing, Testing | Committing)
            | (Testing, Committing)
            | (Committing, Pushing | Done)
            | (Pushing, WaitingCi | Done)
            | (WaitingCi, Done)
            | (Failed, Skipped | Pending) => true,
            (from, Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CI outcome recorded on a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CiStepStatus {
    Pending,
    Running,
    Success,
    Failure,
    Skipped,
    TimedOut,
}

impl CiStepStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CiStepStatus::Pending => "pending",
            CiStepStatus::Running => "running",
            CiStepStatus::Success => "success",
            CiStepStatus::Failure => "failure",
            CiStepStatus::Skipped => "skipped",
            CiStepStatus::TimedOut => "timed-out",
        }
    }
}

// ---------------------------------------------------------------------------
// Plan
// ---------------------------------------------------------------------------

/// Replace the constraint on `name` with `to_version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionSubstitution {
    pub name: String,
    pub from_spec: String,
    pub to_version: String,
}

/// One repo's work inside a plan. Mutated in place by the execution engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeStep {
    pub repo_id: String,
    pub package_name: String,
    pub path: PathBuf,
    pub status: StepStatus,
    pub commit_message: String,
    pub substitutions: Vec<VersionSubstitution>,
    #[serde(default)]
    pub published_version: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ci_status: Option<CiStepStatus>,
    #[serde(default)]
    pub ci_url: Option<String>,
}

impl CascadeStep {
    pub fn new(
        repo_id: impl Into<String>,
        package_name: impl Into<String>,
        path: impl Into<PathBuf>,
        commit_message: impl Into<String>,
        substitutions: Vec<VersionSubstitution>,
    ) -> Self {
        Self {
            repo_id: repo_id.into(),
            package_name: package_name.into(),
            path: path.into(),
            status: StepStatus::Pending,
            commit_message: commit_message.into(),
            substitutions,
            published_version: None,
            error: None,
            started_at: None,
            finished_at: None,
            ci_status: None,
            ci_url: None,
        }
    }

    /// Move to `next`, enforcing the state machine.
    pub fn transition(&mut self, next: StepStatus) -> CascadeResult<()> {
        if !self.status.can_transition_to(next) {
            return Err(CascadeError::InvalidStepTransition {
                repo_id: self.repo_id.clone(),
                from: self.status.to_string(),
                to: next.to_string(),
            });
        }
        self.status = next;
        Ok(())
    }
}

/// Advisory concurrency hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayerMode {
    Parallel,
    Sequential,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeLayer {
    /// Relative distance from the source (1 = direct dependents).
    pub index: usize,
    pub mode: LayerMode,
    pub steps: Vec<CascadeStep>,
}

impl CascadeLayer {
    pub fn new(index: usize, steps: Vec<CascadeStep>) -> Self {
        let mode = if steps.len() > 1 {
            LayerMode::Parallel
        } else {
            LayerMode::Sequential
        };
        Self { index, mode, steps }
    }
}

/// Snapshot produced by the planner. Re-plan instead of editing, except for
/// commit messages before the plan is started.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadePlan {
    pub id: String,
    pub source_id: String,
    pub source_package: String,
    /// Version downstream repos move to; `None` for a degenerate plan.
    pub source_version: Option<String>,
    pub source_message: Option<String>,
    pub layers: Vec<CascadeLayer>,
    pub total_repos: usize,
    pub options: CascadeOptions,
    pub created_at: DateTime<Utc>,
}

impl CascadePlan {
    /// True when nothing depends on the source.
    pub fn is_empty(&self) -> bool {
        self.total_repos == 0
    }

    pub fn steps(&self) -> impl Iterator<Item = &CascadeStep> {
        self.layers.iter().flat_map(|l| l.steps.iter())
    }

    pub fn step(&self, repo_id: &str) -> Option<&CascadeStep> {
        self.steps().find(|s| s.repo_id == repo_id)
    }

    pub fn step_mut(&mut self, repo_id: &str) -> Option<&mut CascadeStep> {
        self.layers
            .iter_mut()
            .flat_map(|l| l.steps.iter_mut())
            .find(|s| s.repo_id == repo_id)
    }

    /// Edit a step's generated commit message.
    pub fn set_commit_message(&mut self, repo_id: &str, message: impl Into<String>) -> CascadeResult<()> {
        let step = self.step_mut(repo_id).ok_or_else(|| CascadeError::RepoNotFound {
            repo: repo_id.to_string(),
        })?;
        step.commit_message = message.into();
        Ok(())
    }

    /// `(package, version)` pairs to write into `step`'s manifest. A version
    /// published by an earlier step (CI or manual override) beats the
    /// planned one.
    pub fn effective_versions(&self, step: &CascadeStep) -> Vec<(String, String)> {
        step.substitutions
            .iter()
            .map(|sub| {
                let published = self
                    .steps()
                    .find(|s| s.package_name == sub.name)
                    .and_then(|s| s.published_version.clone());
                (sub.name.clone(), published.unwrap_or_else(|| sub.to_version.clone()))
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Paused,
    Completed,
    /// Unexpected engine error; per-step failures pause instead.
    Failed,
    Aborted,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "running",
            ExecutionStatus::Paused => "paused",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Aborted
        )
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A running, paused or finished instance of a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CascadeExecution {
    pub id: String,
    pub plan: CascadePlan,
    pub status: ExecutionStatus,
    /// Position in `plan.layers` to run next (the resume point).
    pub current_layer: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CascadeExecution {
    pub fn new(plan: CascadePlan) -> Self {
        Self {
            id: new_id(),
            plan,
            status: ExecutionStatus::Running,
            current_layer: 0,
            completed: 0,
            failed: 0,
            skipped: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        }
    }

    pub fn step(&self, repo_id: &str) -> CascadeResult<&CascadeStep> {
        self.plan.step(repo_id).ok_or_else(|| self.step_not_found(repo_id))
    }

    pub fn step_mut(&mut self, repo_id: &str) -> CascadeResult<&mut CascadeStep> {
        if self.plan.step(repo_id).is_none() {
            return Err(self.step_not_found(repo_id));
        }
        self.plan
            .step_mut(repo_id)
            .ok_or_else(|| CascadeError::Engine(format!("step {repo_id} vanished")))
    }

    fn step_not_found(&self, repo_id: &str) -> CascadeError {
        CascadeError::StepNotFound {
            execution_id: self.id.clone(),
            repo_id: repo_id.to_string(),
        }
    }

    /// Accept a failed step and move on: `failed → skipped`.
    pub fn skip_step(&mut self, repo_id: &str) -> CascadeResult<()> {
        let step = self.step_mut(repo_id)?;
        step.transition(StepStatus::Skipped)?;
        step.finished_at = Some(Utc::now());
        self.failed = self.failed.saturating_sub(1);
        self.skipped += 1;
        Ok(())
    }

    /// Record a manually supplied published version.
    pub fn set_published_version(&mut self, repo_id: &str, version: &str) -> CascadeResult<()> {
        let step = self.step_mut(repo_id)?;
        step.published_version = Some(version.to_string());
        Ok(())
    }

    pub fn invalid_state(&self, expected: &str) -> CascadeError {
        CascadeError::InvalidState {
            execution_id: self.id.clone(),
            expected: expected.to_string(),
            actual: self.status.to_string(),
        }
    }

    pub fn summary(&self) -> ExecutionSummary {
        ExecutionSummary {
            id: self.id.clone(),
            source_id: self.plan.source_id.clone(),
            status: self.status,
            current_layer: self.current_layer,
            total_layers: self.plan.layers.len(),
            total_repos: self.plan.total_repos,
            completed: self.completed,
            failed: self.failed,
            skipped: self.skipped,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }

    /// History document for a finished execution.
    pub fn to_history_entry(&self) -> CascadeResult<HistoryEntry> {
        Ok(HistoryEntry {
            execution_id: self.id.clone(),
            source_id: self.plan.source_id.clone(),
            status: self.status.to_string(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            document: serde_json::to_value(self)?,
        })
    }
}

/// Listing row for an execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionSummary {
    pub id: String,
    pub source_id: String,
    pub status: ExecutionStatus,
    pub current_layer: usize,
    pub total_layers: usize,
    pub total_repos: usize,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}
