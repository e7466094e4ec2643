//! Command runner collaborator and its `tokio::process` adapter.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{CascadeError, CascadeResult};

/// Captured result of one finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    /// Exit code (`-1` when the process was killed by a signal).
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Turn a non-zero exit into [`CascadeError::CommandFailed`].
    pub fn into_checked(self, argv: &[String]) -> CascadeResult<Self> {
        if self.success() {
            return Ok(self);
        }
        let stderr = if self.stderr.trim().is_empty() {
            self.stdout.trim().to_string()
        } else {
            self.stderr.trim().to_string()
        };
        Err(CascadeError::CommandFailed {
            command: display_command(argv),
            exit_code: self.exit_code,
            stderr,
        })
    }
}

/// Runs an argument vector to completion in a working directory.
///
/// A non-zero exit is *not* an error at this level; callers decide through
/// [`CommandOutput::into_checked`] or [`run_checked`].
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        cancel: Option<&CancellationToken>,
    ) -> CascadeResult<CommandOutput>;
}

/// Run and fail on a non-zero exit code.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    argv: &[String],
    cwd: &Path,
    cancel: Option<&CancellationToken>,
) -> CascadeResult<CommandOutput> {
    runner.run(argv, cwd, cancel).await?.into_checked(argv)
}

/// Build an owned argument vector.
pub fn argv<I, S>(parts: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    parts.into_iter().map(Into::into).collect()
}

pub fn display_command(argv: &[String]) -> String {
    argv.join(" ")
}

/// Text recorded on a failed step: the command's stderr when there is one.
pub fn failure_detail(err: &CascadeError) -> String {
    match err {
        CascadeError::CommandFailed { stderr, .. } if !stderr.trim().is_empty() => {
            stderr.trim().to_string()
        }
        other => other.to_string(),
    }
}

/// Spawns real processes with piped output.
///
/// The child is killed when its future is dropped, which is what happens on
/// timeout or when the cancellation token fires.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        cancel: Option<&CancellationToken>,
    ) -> CascadeResult<CommandOutput> {
        let (exe, args) = argv.split_first().ok_or_else(|| CascadeError::CommandSpawn {
            command: String::new(),
            reason: "empty command".to_string(),
        })?;
        let command = display_command(argv);
        let start = Instant::now();
        debug!(command = %command, cwd = %cwd.display(), "spawning");

        let child = Command::new(exe)
            .args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CascadeError::CommandSpawn {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        let wait = async {
            match self.timeout {
                Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                    .await
                    .map_err(|_| CascadeError::CommandFailed {
                        command: command.clone(),
                        exit_code: -1,
                        stderr: format!("timed out after {}ms", limit.as_millis()),
                    })?
                    .map_err(CascadeError::from),
                None => child.wait_with_output().await.map_err(CascadeError::from),
            }
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let output = tokio::select! {
            out = wait => out?,
            _ = cancelled => return Err(CascadeError::Cancelled),
        };

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }
}
