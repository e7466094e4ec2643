//! Dependency graph engine.
//!
//! - [`model`]: repo nodes, dependency references, derived dependents
//! - [`layers`]: edge list, Kahn layering and flat topological order
//! - [`affected`]: transitive dependents of a changed repo

pub mod affected;
pub mod layers;
pub mod model;

pub use affected::{AffectedNode, AffectedResult};
pub use layers::{build_graph, calculate_layers, topological_sort, DependencyGraph, Edge, Layering};
pub use model::{derive_dependents, DependencyKind, DependencyRef, RepoNode};
