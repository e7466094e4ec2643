//! External collaborators consumed by the cascade engine, as traits plus one
//! production adapter each.

pub mod ci;
pub mod git;
pub mod manifest;
pub mod registry;
pub mod runner;

pub use ci::{CiRun, CiRunState, CiStatusSource, GhCliStatus};
pub use registry::{NpmRegistry, VersionResolver};
pub use runner::{CommandOutput, CommandRunner, ProcessRunner};
