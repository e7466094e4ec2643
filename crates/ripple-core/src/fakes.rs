//! Scripted collaborators for driving the engine without processes,
//! network or CI (testing only).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::adapters::ci::{CiRun, CiStatusSource};
use crate::adapters::registry::VersionResolver;
use crate::adapters::runner::{CommandOutput, CommandRunner};
use crate::error::{CascadeError, CascadeResult};

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// What a scripted command does.
#[derive(Debug, Clone)]
pub enum Scripted {
    Output(CommandOutput),
    SpawnError(String),
    /// Wait until notified, then return the output.
    Blocked(Arc<Notify>, CommandOutput),
}

impl Scripted {
    pub fn ok(stdout: &str) -> Self {
        Scripted::Output(CommandOutput {
            stdout: stdout.to_string(),
            ..Default::default()
        })
    }

    pub fn fail(exit_code: i32, stderr: &str) -> Self {
        Scripted::Output(CommandOutput {
            exit_code,
            stderr: stderr.to_string(),
            ..Default::default()
        })
    }
}

#[derive(Debug, Clone)]
struct Rule {
    prefix: Vec<String>,
    cwd_contains: Option<String>,
    response: Scripted,
}

impl Rule {
    fn matches(&self, argv: &[String], cwd: &Path) -> bool {
        if !argv.starts_with(&self.prefix) {
            return false;
        }
        match &self.cwd_contains {
            Some(fragment) => cwd.to_string_lossy().contains(fragment.as_str()),
            None => true,
        }
    }
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub argv: Vec<String>,
    pub cwd: PathBuf,
}

impl RecordedCall {
    pub fn command(&self) -> String {
        self.argv.join(" ")
    }
}

/// Command runner answering from a rule list; the last matching rule wins.
///
/// Without a matching rule every command succeeds, except that
/// `git diff --cached --quiet` reports staged changes and
/// `git remote get-url origin` reports no remote.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<RecordedCall>>,
}

fn words(prefix: &str) -> Vec<String> {
    prefix.split_whitespace().map(str::to_string).collect()
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer every command starting with `prefix`.
    pub fn on(self, prefix: &str, response: Scripted) -> Self {
        self.push_rule(prefix, None, response);
        self
    }

    /// Answer commands starting with `prefix` whose working directory
    /// contains `cwd_fragment`.
    pub fn on_in(self, prefix: &str, cwd_fragment: &str, response: Scripted) -> Self {
        self.push_rule(prefix, Some(cwd_fragment.to_string()), response);
        self
    }

    /// Add a rule to a runner that is already shared.
    pub fn script(&self, prefix: &str, cwd_fragment: Option<&str>, response: Scripted) {
        self.push_rule(prefix, cwd_fragment.map(str::to_string), response);
    }

    fn push_rule(&self, prefix: &str, cwd_contains: Option<String>, response: Scripted) {
        self.rules.lock().unwrap().push(Rule {
            prefix: words(prefix),
            cwd_contains,
            response,
        });
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Calls whose argv starts with `prefix`.
    pub fn calls_matching(&self, prefix: &str) -> Vec<RecordedCall> {
        let prefix = words(prefix);
        self.calls()
            .into_iter()
            .filter(|c| c.argv.starts_with(&prefix))
            .collect()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.calls_matching(prefix).len()
    }

    fn default_response(argv: &[String]) -> Scripted {
        if argv.starts_with(&words("git diff --cached --quiet")) {
            return Scripted::fail(1, "");
        }
        if argv.starts_with(&words("git remote get-url origin")) {
            return Scripted::fail(2, "error: No such remote 'origin'");
        }
        Scripted::ok("")
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(
        &self,
        argv: &[String],
        cwd: &Path,
        cancel: Option<&CancellationToken>,
    ) -> CascadeResult<CommandOutput> {
        self.calls.lock().unwrap().push(RecordedCall {
            argv: argv.to_vec(),
            cwd: cwd.to_path_buf(),
        });
        let response = self
            .rules
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|r| r.matches(argv, cwd))
            .map(|r| r.response.clone())
            .unwrap_or_else(|| Self::default_response(argv));

        match response {
            Scripted::Output(out) => Ok(out),
            Scripted::SpawnError(reason) => Err(CascadeError::CommandSpawn {
                command: argv.join(" "),
                reason,
            }),
            Scripted::Blocked(gate, out) => {
                match cancel {
                    Some(token) => tokio::select! {
                        _ = gate.notified() => {}
                        _ = token.cancelled() => return Err(CascadeError::Cancelled),
                    },
                    None => gate.notified().await,
                }
                Ok(out)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// StaticResolver
// ---------------------------------------------------------------------------

/// Version resolver backed by a fixed map.
#[derive(Debug, Default)]
pub struct StaticResolver {
    versions: Mutex<HashMap<String, String>>,
    lookups: AtomicUsize,
}

impl StaticResolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(self, package: &str, version: &str) -> Self {
        self.set(package, version);
        self
    }

    pub fn set(&self, package: &str, version: &str) {
        self.versions
            .lock()
            .unwrap()
            .insert(package.to_string(), version.to_string());
    }

    /// Number of lookups performed.
    pub fn lookups(&self) -> usize {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VersionResolver for StaticResolver {
    async fn latest_version(&self, package: &str) -> Option<String> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        self.versions.lock().unwrap().get(package).cloned()
    }
}

// ---------------------------------------------------------------------------
// ScriptedCiStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum CiResponse {
    Run(CiRun),
    NoRuns,
    Unavailable(String),
}

/// CI source that walks through a response list; the last one repeats.
#[derive(Debug, Default)]
pub struct ScriptedCiStatus {
    responses: Vec<CiResponse>,
    polls: AtomicUsize,
}

impl ScriptedCiStatus {
    pub fn new(responses: Vec<CiResponse>) -> Self {
        Self {
            responses,
            polls: AtomicUsize::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CiStatusSource for ScriptedCiStatus {
    async fn latest_run(&self, _slug: &str) -> CascadeResult<Option<CiRun>> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst);
        let response = self
            .responses
            .get(n)
            .or_else(|| self.responses.last())
            .cloned()
            .unwrap_or(CiResponse::NoRuns);
        match response {
            CiResponse::Run(run) => Ok(Some(run)),
            CiResponse::NoRuns => Ok(None),
            CiResponse::Unavailable(reason) => Err(CascadeError::CiUnavailable(reason)),
        }
    }
}
