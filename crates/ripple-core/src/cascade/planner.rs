//! Cascade planning: affected set → layered steps with version substitutions.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::Utc;
use tracing::{debug, info};

use crate::adapters::registry::VersionResolver;
use crate::cascade::plan::{new_id, CascadeLayer, CascadePlan, CascadeStep, VersionSubstitution};
use crate::config::CascadeOptions;
use crate::error::{CascadeError, CascadeResult};
use crate::graph::{AffectedNode, DependencyGraph, RepoNode};

/// Build a plan for propagating a change in `source_id`.
///
/// The source version comes from the registry when it has one, otherwise
/// from the local manifest. An unknown source yields an empty plan. Fails
/// with [`CascadeError::DependencyCycle`] when the source or any affected
/// repo sits on a dependency cycle.
pub async fn create_plan(
    source_id: &str,
    graph: &DependencyGraph,
    options: CascadeOptions,
    resolver: &dyn VersionResolver,
) -> CascadeResult<CascadePlan> {
    let mut plan = CascadePlan {
        id: new_id(),
        source_id: source_id.to_string(),
        source_package: String::new(),
        source_version: None,
        source_message: options.source_message.clone(),
        layers: Vec::new(),
        total_repos: 0,
        options,
        created_at: Utc::now(),
    };

    let Some(source) = graph.node(source_id) else {
        debug!(source_id, "unknown source, nothing to cascade");
        return Ok(plan);
    };

    let affected = graph.get_affected(source_id);
    if affected.has_cycle() {
        return Err(CascadeError::DependencyCycle {
            repos: affected.cycle_members,
        });
    }

    let source_version = match resolver.latest_version(&source.package_name).await {
        Some(published) => published,
        None => {
            debug!(package = %source.package_name, "no published version, using local manifest");
            source.version.clone()
        }
    };

    let mut buckets: BTreeMap<usize, Vec<&AffectedNode>> = BTreeMap::new();
    for node in &affected.affected {
        buckets.entry(node.layer).or_default().push(node);
    }

    let mut known: HashMap<String, String> = HashMap::new();
    known.insert(source.package_name.clone(), source_version.clone());

    for (index, members) in buckets {
        let repos: Vec<&RepoNode> = members
            .iter()
            .filter_map(|a| graph.node(&a.id))
            .collect();
        let steps = repos
            .iter()
            .map(|repo| build_step(repo, &known, &plan.options.commit_prefix))
            .collect();
        plan.layers.push(CascadeLayer::new(index, steps));

        // Later layers see this layer's local versions; they are not
        // re-published yet at planning time.
        for repo in repos {
            known.insert(repo.package_name.clone(), repo.version.clone());
        }
    }

    plan.source_package = source.package_name.clone();
    plan.source_version = Some(source_version);
    plan.total_repos = affected.total_count;
    info!(
        source_id,
        layers = plan.layers.len(),
        repos = plan.total_repos,
        "cascade planned"
    );
    Ok(plan)
}

fn build_step(repo: &RepoNode, known: &HashMap<String, String>, prefix: &str) -> CascadeStep {
    let mut seen = HashSet::new();
    let substitutions: Vec<VersionSubstitution> = repo
        .dependencies
        .iter()
        .filter(|dep| seen.insert(dep.name.as_str()))
        .filter_map(|dep| {
            known.get(&dep.name).map(|version| VersionSubstitution {
                name: dep.name.clone(),
                from_spec: dep.version_spec.clone(),
                to_version: version.clone(),
            })
        })
        .collect();

    let message = commit_message(prefix, &repo.id, &substitutions);
    CascadeStep::new(
        repo.id.clone(),
        repo.package_name.clone(),
        repo.path.clone(),
        message,
        substitutions,
    )
}

/// `@acme/lib-a` → `lib-a`
fn short_name(package: &str) -> &str {
    package.rsplit('/').next().unwrap_or(package)
}

fn commit_message(prefix: &str, repo_id: &str, substitutions: &[VersionSubstitution]) -> String {
    let body = if substitutions.is_empty() {
        format!("update dependencies in {repo_id}")
    } else {
        let names: Vec<&str> = substitutions.iter().map(|s| short_name(&s.name)).collect();
        format!("update {}", names.join(", "))
    };
    let prefix = prefix.trim();
    if prefix.is_empty() {
        body
    } else {
        format!("{prefix} {body}")
    }
}
