//! Ripple - dependency-aware update cascades
//!
//! The `ripple` command reads a scanned repo set (a JSON array of nodes) and
//! propagates a change in one repo to everything downstream of it.
//!
//! ## Commands
//!
//! - `layers`: group repos into topological layers
//! - `affected`: list everything downstream of a repo
//! - `plan`: show the cascade plan for a change
//! - `run`: plan and execute a cascade
//! - `history`: list finished cascades
//! - `config`: print the effective configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};

use ripple_core::telemetry::{init_tracing, level_for};
use ripple_core::{
    build_graph, AffectedResult, CascadeConfig, CascadeExecution, CascadeOptions, CascadePlan,
    CascadeService, DependencyGraph, ExecutionStatus, LayerMode, RepoNode, StepStatus,
};
use ripple_store::HistoryPage;

const DEFAULT_CONFIG: &str = "ripple.toml";
const SETTLE_POLL: Duration = Duration::from_millis(200);

#[derive(Parser)]
#[command(name = "ripple")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Dependency-aware update cascades across a multi-repo package graph", long_about = None)]
struct Cli {
    /// Configuration file (default: ./ripple.toml when present)
    #[arg(short, long, global = true, env = "RIPPLE_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Text,
    Json,
}

#[derive(Args)]
struct GraphArgs {
    /// JSON array of repo nodes produced by the scanner
    #[arg(short, long)]
    nodes: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value_t = Format::Text)]
    format: Format,
}

#[derive(Args)]
struct PlanArgs {
    /// Repo whose change is being propagated
    source: String,

    #[command(flatten)]
    graph: GraphArgs,

    /// Wait for each pushed repo's CI before starting the next layer
    #[arg(long)]
    wait_for_ci: bool,

    /// Do not run the test command in updated repos
    #[arg(long)]
    skip_tests: bool,

    /// Commit message prefix (default: from configuration)
    #[arg(long)]
    prefix: Option<String>,

    /// Message of the source change, recorded on the plan
    #[arg(short, long)]
    message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OnFailure {
    /// Abort the cascade at the first failed layer
    Abort,
    /// Skip failed repos and keep going
    Skip,
}

#[derive(Subcommand)]
enum Commands {
    /// Group repos into topological layers
    Layers {
        #[command(flatten)]
        graph: GraphArgs,
    },

    /// List every repo downstream of a source repo
    Affected {
        /// Repo whose change is being propagated
        source: String,

        #[command(flatten)]
        graph: GraphArgs,
    },

    /// Show the cascade plan without executing it
    Plan {
        #[command(flatten)]
        plan: PlanArgs,
    },

    /// Plan and execute a cascade
    Run {
        #[command(flatten)]
        plan: PlanArgs,

        /// What to do when a layer has failed repos
        #[arg(long, value_enum, default_value_t = OnFailure::Abort)]
        on_failure: OnFailure,
    },

    /// Show finished cascades, newest first
    History {
        /// Entries to skip
        #[arg(long, default_value = "0")]
        offset: usize,

        /// Maximum number of entries to show
        #[arg(short, long, default_value = "20")]
        limit: usize,

        /// Output format
        #[arg(short, long, value_enum, default_value_t = Format::Text)]
        format: Format,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json, level_for(cli.verbose));

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Layers { graph } => {
            let deps = load_graph(&graph.nodes)?;
            emit(graph.format, &deps.layering(), || render_layers(&deps))
        }
        Commands::Affected { source, graph } => {
            let deps = load_graph(&graph.nodes)?;
            let affected = deps.get_affected(&source);
            emit(graph.format, &affected, || render_affected(&affected))
        }
        Commands::Plan { plan: args } => {
            let service = CascadeService::production(config)?;
            let deps = load_graph(&args.graph.nodes)?;
            let options = plan_options(service.config(), &args);
            let plan = service.create_plan(&args.source, &deps, options).await?;
            emit(args.graph.format, &plan, || render_plan(&plan))
        }
        Commands::Run {
            plan: args,
            on_failure,
        } => {
            let service = CascadeService::production(config)?;
            let deps = load_graph(&args.graph.nodes)?;
            let options = plan_options(service.config(), &args);
            let execution = cmd_run(&service, &deps, &args.source, options, on_failure).await?;
            emit(args.graph.format, &execution, || render_execution(&execution))?;
            if execution.status != ExecutionStatus::Completed {
                bail!("cascade {} ended {}", execution.id, execution.status);
            }
            Ok(())
        }
        Commands::History {
            offset,
            limit,
            format,
        } => {
            let service = CascadeService::production(config)?;
            let page = service.history(offset, limit).await?;
            emit(format, &page, || render_history(&page))
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Explicit path, then `./ripple.toml`, then built-in defaults.
fn load_config(path: Option<&Path>) -> Result<CascadeConfig> {
    match path {
        Some(path) => CascadeConfig::load(path)
            .with_context(|| format!("Failed to load config {:?}", path)),
        None if Path::new(DEFAULT_CONFIG).exists() => CascadeConfig::load(Path::new(DEFAULT_CONFIG))
            .with_context(|| format!("Failed to load config {DEFAULT_CONFIG}")),
        None => Ok(CascadeConfig::default()),
    }
}

/// Read scanner output. Relative repo paths resolve against the file's
/// directory; a missing path means `<dir>/<id>`.
fn load_nodes(path: &Path) -> Result<Vec<RepoNode>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read nodes file: {:?}", path))?;
    let mut nodes: Vec<RepoNode> =
        serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {:?}", path))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    for node in &mut nodes {
        if node.path.as_os_str().is_empty() {
            node.path = base.join(&node.id);
        } else if node.path.is_relative() {
            node.path = base.join(&node.path);
        }
    }
    Ok(nodes)
}

fn load_graph(path: &Path) -> Result<DependencyGraph> {
    let graph = build_graph(&load_nodes(path)?);
    if graph.has_cycle() {
        warn!(repos = ?graph.cycle_members(), "dependency cycle in repo set");
    }
    Ok(graph)
}

fn plan_options(config: &CascadeConfig, args: &PlanArgs) -> CascadeOptions {
    let mut options = CascadeOptions::from_config(config);
    options.wait_for_ci = args.wait_for_ci;
    options.run_tests = !args.skip_tests;
    if let Some(prefix) = &args.prefix {
        options.commit_prefix = prefix.clone();
    }
    options.source_message = args.message.clone();
    options
}

/// Plan, start and drive a cascade to a terminal state.
///
/// Ctrl-C requests an abort; the process waits for in-flight repos to finish.
async fn cmd_run(
    service: &CascadeService,
    graph: &DependencyGraph,
    source: &str,
    options: CascadeOptions,
    on_failure: OnFailure,
) -> Result<CascadeExecution> {
    let plan = service.create_plan(source, graph, options).await?;
    let id = service.start_execution(plan);
    info!(execution_id = %id, source, "cascade started");

    loop {
        let execution = tokio::select! {
            settled = service.wait_until_settled(&id, SETTLE_POLL) => settled?,
            _ = tokio::signal::ctrl_c() => {
                warn!(execution_id = %id, "interrupted, aborting cascade");
                if let Err(e) = service.abort(&id).await {
                    warn!(execution_id = %id, error = %e, "abort rejected");
                }
                continue;
            }
        };
        if execution.status != ExecutionStatus::Paused {
            return Ok(service.forget(&id)?);
        }

        let failed: Vec<String> = execution
            .plan
            .steps()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.repo_id.clone())
            .collect();
        for repo_id in &failed {
            let step = execution.step(repo_id)?;
            warn!(
                repo_id = %repo_id,
                error = step.error.as_deref().unwrap_or("unknown"),
                "repo failed"
            );
        }

        match on_failure {
            OnFailure::Skip => {
                for repo_id in &failed {
                    service.skip_step(&id, repo_id).await?;
                }
                service.resume(&id).await?;
            }
            OnFailure::Abort => service.abort(&id).await?,
        }
    }
}

// ---------------------------------------------------------------------------
// Output
// ---------------------------------------------------------------------------

fn emit<T: Serialize>(format: Format, value: &T, text: impl FnOnce() -> String) -> Result<()> {
    match format {
        Format::Json => println!("{}", serde_json::to_string_pretty(value)?),
        Format::Text => print!("{}", text()),
    }
    Ok(())
}

fn render_layers(graph: &DependencyGraph) -> String {
    let mut out = String::new();
    for (index, ids) in graph.layers() {
        out.push_str(&format!("layer {index}: {}\n", ids.join(", ")));
    }
    if graph.has_cycle() {
        out.push_str(&format!(
            "unlayered (cycle): {}\n",
            graph.cycle_members().join(", ")
        ));
    }
    out
}

fn render_affected(result: &AffectedResult) -> String {
    let mut out = format!(
        "{} repo(s) affected by {}\n",
        result.total_count, result.source_id
    );
    for node in &result.affected {
        out.push_str(&format!(
            "  [{}] {}  ({})\n",
            node.layer,
            node.id,
            node.dependency_path.join(" -> ")
        ));
    }
    if result.has_cycle() {
        out.push_str(&format!("  cycle: {}\n", result.cycle_members.join(", ")));
    }
    out
}

fn render_plan(plan: &CascadePlan) -> String {
    let version = plan.source_version.as_deref().unwrap_or("?");
    let mut out = format!(
        "plan {}: {} @ {} -> {} repo(s) in {} layer(s)\n",
        plan.id,
        plan.source_id,
        version,
        plan.total_repos,
        plan.layers.len()
    );
    for layer in &plan.layers {
        let mode = match layer.mode {
            LayerMode::Parallel => "parallel",
            LayerMode::Sequential => "sequential",
        };
        out.push_str(&format!("layer {} ({mode})\n", layer.index));
        for step in &layer.steps {
            out.push_str(&format!("  {}: {}\n", step.repo_id, step.commit_message));
            for sub in &step.substitutions {
                out.push_str(&format!(
                    "    {} {} -> {}\n",
                    sub.name, sub.from_spec, sub.to_version
                ));
            }
        }
    }
    out
}

fn render_execution(execution: &CascadeExecution) -> String {
    let mut out = format!(
        "cascade {} {}: {} done, {} failed, {} skipped\n",
        execution.id, execution.status, execution.completed, execution.failed, execution.skipped
    );
    for step in execution.plan.steps() {
        out.push_str(&format!("  {:<24} {}", step.repo_id, step.status));
        if let Some(ci) = step.ci_status {
            out.push_str(&format!("  ci={}", ci.as_str()));
        }
        if let Some(error) = &step.error {
            out.push_str(&format!("  {error}"));
        }
        out.push('\n');
    }
    if let Some(error) = &execution.error {
        out.push_str(&format!("error: {error}\n"));
    }
    out
}

fn render_history(page: &HistoryPage) -> String {
    if page.entries.is_empty() {
        return "No cascades recorded\n".to_string();
    }
    let mut out = String::new();
    for entry in &page.entries {
        out.push_str(&format!(
            "{}  {:<10} {:<24} {}\n",
            entry.execution_id,
            entry.status,
            entry.source_id,
            entry.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        ));
    }
    if page.has_more() {
        out.push_str(&format!(
            "... {} more\n",
            page.total - page.offset - page.entries.len()
        ));
    }
    out
}
