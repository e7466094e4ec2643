//! CI status collaborator backed by the GitHub CLI.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::adapters::runner::{argv, CommandRunner};
use crate::error::{CascadeError, CascadeResult};

/// Normalized state of a CI run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiRunState {
    Pending,
    Running,
    Success,
    Failure,
}

impl CiRunState {
    pub fn is_finished(self) -> bool {
        matches!(self, CiRunState::Success | CiRunState::Failure)
    }
}

/// Most recent run for a repo.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CiRun {
    pub state: CiRunState,
    pub url: Option<String>,
}

/// "Given a hosting slug, return the most recent run's status and URL."
///
/// `Ok(None)` means the repo has no runs yet. Errors mean the tooling itself
/// is unavailable.
#[async_trait]
pub trait CiStatusSource: Send + Sync {
    async fn latest_run(&self, slug: &str) -> CascadeResult<Option<CiRun>>;
}

#[derive(Debug, Deserialize)]
struct GhRun {
    #[serde(default)]
    status: String,
    #[serde(default)]
    conclusion: String,
    #[serde(default)]
    url: String,
}

impl GhRun {
    fn state(&self) -> CiRunState {
        match self.status.as_str() {
            "completed" => match self.conclusion.as_str() {
                "success" | "neutral" | "skipped" => CiRunState::Success,
                _ => CiRunState::Failure,
            },
            "in_progress" => CiRunState::Running,
            _ => CiRunState::Pending,
        }
    }
}

/// Parse `gh run list --json status,conclusion,url` output.
pub fn parse_gh_runs(stdout: &str) -> CascadeResult<Option<CiRun>> {
    let runs: Vec<GhRun> = serde_json::from_str(stdout.trim())
        .map_err(|e| CascadeError::CiUnavailable(format!("unexpected gh output: {e}")))?;
    Ok(runs.first().map(|run| CiRun {
        state: run.state(),
        url: Some(run.url.clone()).filter(|u| !u.is_empty()),
    }))
}

/// Queries `gh run list` through a [`CommandRunner`].
pub struct GhCliStatus {
    runner: Arc<dyn CommandRunner>,
    cwd: PathBuf,
}

impl GhCliStatus {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            runner,
            cwd: std::env::temp_dir(),
        }
    }
}

#[async_trait]
impl CiStatusSource for GhCliStatus {
    async fn latest_run(&self, slug: &str) -> CascadeResult<Option<CiRun>> {
        let cmd = argv([
            "gh",
            "run",
            "list",
            "--repo",
            slug,
            "--limit",
            "1",
            "--json",
            "status,conclusion,url",
        ]);
        let out = self
            .runner
            .run(&cmd, &self.cwd, None)
            .await
            .map_err(|e| CascadeError::CiUnavailable(e.to_string()))?;
        if !out.success() {
            return Err(CascadeError::CiUnavailable(format!(
                "gh exited with {}: {}",
                out.exit_code,
                out.stderr.trim()
            )));
        }
        parse_gh_runs(&out.stdout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completed_success() {
        let run = parse_gh_runs(
            r#"[{"status":"completed","conclusion":"success","url":"https://ci/run/1"}]"#,
        )
        .unwrap()
        .unwrap();
        assert_eq!(run.state, CiRunState::Success);
        assert_eq!(run.url.as_deref(), Some("https://ci/run/1"));
    }

    #[test]
    fn test_parse_states() {
        let state = |json: &str| parse_gh_runs(json).unwrap().unwrap().state;
        assert_eq!(
            state(r#"[{"status":"completed","conclusion":"failure","url":""}]"#),
            CiRunState::Failure
        );
        assert_eq!(
            state(r#"[{"status":"in_progress","conclusion":"","url":""}]"#),
            CiRunState::Running
        );
        assert_eq!(state(r#"[{"status":"queued"}]"#), CiRunState::Pending);
    }

    #[test]
    fn test_parse_no_runs() {
        assert_eq!(parse_gh_runs("[]\n").unwrap(), None);
    }

    #[test]
    fn test_parse_garbage_is_unavailable() {
        assert!(matches!(
            parse_gh_runs("gh: command not found"),
            Err(CascadeError::CiUnavailable(_))
        ));
    }
}
