//! Git plumbing used by the `committing` and `pushing` steps.
//!
//! Everything goes through a [`CommandRunner`] so the engine can be driven
//! with scripted output in tests.

use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapters::runner::{argv, run_checked, CommandRunner};
use crate::error::CascadeResult;

/// `git add -A`
pub async fn stage_all(
    runner: &dyn CommandRunner,
    cwd: &Path,
    cancel: Option<&CancellationToken>,
) -> CascadeResult<()> {
    run_checked(runner, &argv(["git", "add", "-A"]), cwd, cancel).await?;
    Ok(())
}

/// Whether the index differs from `HEAD`.
///
/// `git diff --cached --quiet` exits 0 for no diff and 1 for a diff; any
/// other code is a failure.
pub async fn has_staged_changes(
    runner: &dyn CommandRunner,
    cwd: &Path,
    cancel: Option<&CancellationToken>,
) -> CascadeResult<bool> {
    let cmd = argv(["git", "diff", "--cached", "--quiet"]);
    let out = runner.run(&cmd, cwd, cancel).await?;
    match out.exit_code {
        0 => Ok(false),
        1 => Ok(true),
        _ => out.into_checked(&cmd).map(|_| false),
    }
}

pub async fn commit(
    runner: &dyn CommandRunner,
    cwd: &Path,
    message: &str,
    cancel: Option<&CancellationToken>,
) -> CascadeResult<()> {
    run_checked(runner, &argv(["git", "commit", "-m", message]), cwd, cancel).await?;
    Ok(())
}

/// `git pull --rebase`. Failures are logged and ignored; local-only branches
/// commonly have no upstream.
pub async fn pull_rebase(
    runner: &dyn CommandRunner,
    cwd: &Path,
    cancel: Option<&CancellationToken>,
) {
    let cmd = argv(["git", "pull", "--rebase"]);
    match run_checked(runner, &cmd, cwd, cancel).await {
        Ok(_) => {}
        Err(e) => debug!(cwd = %cwd.display(), error = %e, "pull --rebase failed, continuing"),
    }
}

pub async fn push(
    runner: &dyn CommandRunner,
    cwd: &Path,
    cancel: Option<&CancellationToken>,
) -> CascadeResult<()> {
    run_checked(runner, &argv(["git", "push"]), cwd, cancel).await?;
    Ok(())
}

/// URL of `origin`, or `None` when there is no such remote.
pub async fn remote_url(
    runner: &dyn CommandRunner,
    cwd: &Path,
    cancel: Option<&CancellationToken>,
) -> CascadeResult<Option<String>> {
    let out = runner
        .run(&argv(["git", "remote", "get-url", "origin"]), cwd, cancel)
        .await?;
    let url = out.stdout.trim();
    if !out.success() || url.is_empty() {
        return Ok(None);
    }
    Ok(Some(url.to_string()))
}

fn slug_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^(?:[a-z+]+://(?:[^@/]+@)?[^/]+/|[^@\s]+@[^:\s]+:)([^/\s]+)/([^/\s]+?)(?:\.git)?/?$")
            .unwrap_or_else(|e| panic!("invalid remote slug pattern: {e}"))
    })
}

/// `owner/repo` from an `https://host/owner/repo(.git)` or
/// `git@host:owner/repo(.git)` remote URL.
pub fn parse_remote_slug(url: &str) -> Option<String> {
    let caps = slug_pattern().captures(url.trim())?;
    Some(format!("{}/{}", &caps[1], &caps[2]))
}

/// Resolve the hosting slug for a repo checkout.
pub async fn remote_slug(
    runner: &dyn CommandRunner,
    cwd: &Path,
    cancel: Option<&CancellationToken>,
) -> CascadeResult<Option<String>> {
    Ok(remote_url(runner, cwd, cancel)
        .await?
        .as_deref()
        .and_then(parse_remote_slug))
}
