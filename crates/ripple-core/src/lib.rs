//! Ripple Core Library
//!
//! Dependency graph analysis and cascade orchestration for a multi-repo npm
//! ecosystem: compute layers and affected sets, plan a cascade of dependency
//! updates, and execute it layer by layer with pause, resume, skip and abort.

pub mod adapters;
pub mod cascade;
pub mod config;
pub mod error;
pub mod fakes;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod pool;
pub mod telemetry;

pub use adapters::{
    CiRun, CiRunState, CiStatusSource, CommandOutput, CommandRunner, GhCliStatus, NpmRegistry,
    ProcessRunner, VersionResolver,
};

pub use cascade::{
    create_plan, CascadeExecution, CascadeLayer, CascadePlan, CascadeService, CascadeStep,
    CiStepStatus, Collaborators, ControlCommand, ExecutionStatus, ExecutionSummary, LayerMode,
    StepStatus, VersionSubstitution,
};

pub use config::{CascadeConfig, CascadeOptions, CiConfig};
pub use error::{CascadeError, CascadeResult};

pub use graph::{
    build_graph, calculate_layers, topological_sort, AffectedNode, AffectedResult,
    DependencyGraph, DependencyKind, DependencyRef, Edge, Layering, RepoNode,
};

pub use pool::{BoundedExecutor, ItemError, ItemOutcome};

pub use ripple_store::{HistoryEntry, HistoryKey, HistoryPage, HistoryStore};
