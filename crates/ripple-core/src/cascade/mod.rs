//! Cascade planning and execution.
//!
//! A cascade propagates a change in one repo to every transitive dependent,
//! layer by layer: update manifests, install, test, commit, push and
//! optionally wait for CI, pausing for a decision whenever a step fails.

pub mod control;
pub mod engine;
pub mod plan;
pub mod planner;
pub mod service;

pub use control::ControlCommand;
pub use engine::Collaborators;
pub use plan::{
    new_id, CascadeExecution, CascadeLayer, CascadePlan, CascadeStep, CiStepStatus,
    ExecutionStatus, ExecutionSummary, LayerMode, StepStatus, VersionSubstitution,
};
pub use planner::create_plan;
pub use service::CascadeService;
