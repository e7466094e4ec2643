//! Error taxonomy for graph analysis and cascade orchestration.

use ripple_store::StorageError;
use thiserror::Error;

/// Errors produced by the graph engine, planner and execution engine.
#[derive(Debug, Error)]
pub enum CascadeError {
    /// A dependency cycle was detected in the repo graph.
    #[error("dependency cycle detected involving repos: {repos:?}")]
    DependencyCycle { repos: Vec<String> },

    /// A referenced repo was not found in the graph.
    #[error("repo not found in graph: {repo}")]
    RepoNotFound { repo: String },

    /// No execution is registered under the id.
    #[error("execution not found: {execution_id}")]
    ExecutionNotFound { execution_id: String },

    /// The execution has no step for the repo.
    #[error("execution {execution_id} has no step for repo {repo_id}")]
    StepNotFound {
        execution_id: String,
        repo_id: String,
    },

    /// A control request arrived while the execution was in the wrong state.
    #[error("execution {execution_id} is {actual}, expected {expected}")]
    InvalidState {
        execution_id: String,
        expected: String,
        actual: String,
    },

    /// A step transition that the step state machine does not allow.
    #[error("step {repo_id} cannot move from {from} to {to}")]
    InvalidStepTransition {
        repo_id: String,
        from: String,
        to: String,
    },

    /// An external command exited non-zero.
    #[error("`{command}` exited with code {exit_code}: {stderr}")]
    CommandFailed {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    /// An external command could not be started.
    #[error("failed to run `{command}`: {reason}")]
    CommandSpawn { command: String, reason: String },

    /// The operation was cancelled through its cancellation token.
    #[error("operation cancelled")]
    Cancelled,

    /// A package manifest could not be read or rewritten.
    #[error("manifest {path}: {reason}")]
    Manifest { path: String, reason: String },

    /// CI status tooling is missing or returned garbage.
    #[error("CI status unavailable: {0}")]
    CiUnavailable(String),

    /// Configuration could not be loaded.
    #[error("config error: {0}")]
    Config(String),

    /// Bubbled-up history storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Unexpected failure inside the orchestration loop itself.
    #[error("engine error: {0}")]
    Engine(String),
}

/// Convenience result alias.
pub type CascadeResult<T> = std::result::Result<T, CascadeError>;
