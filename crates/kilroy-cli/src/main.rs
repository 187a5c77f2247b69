//! CLI binary for the Kilroy attractor engine.

mod review;
mod stop;
mod version;

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};

use kilroy_pipeline::engine::{resume, run, RunOptions};
use kilroy_pipeline::inputs::InputMaterializationOptions;

#[derive(Parser)]
#[command(name = "kilroy", version, about = "DOT-described pipeline automation engine")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Attractor pipeline engine
    #[command(subcommand)]
    Attractor(AttractorCommands),
}

#[derive(Subcommand)]
enum AttractorCommands {
    /// Run a pipeline from a .dot file
    Run(RunArgs),

    /// Resume a checkpointed run from its logs root
    Resume {
        /// Logs root of the run to resume
        #[arg(long)]
        logs_root: PathBuf,
    },

    /// Stop a running engine safely
    Stop {
        /// Logs root of the run to stop
        #[arg(long)]
        logs_root: PathBuf,

        /// Graceful wait in milliseconds before giving up
        #[arg(long, default_value_t = 5000)]
        grace_ms: u64,

        /// Escalate to SIGKILL after the graceful window
        #[arg(long)]
        force: bool,
    },

    /// Parse and validate a pipeline .dot file
    Validate {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },

    /// Show information about a pipeline
    Info {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,

        /// Repository to check the build revision against
        #[arg(long)]
        repo: Option<PathBuf>,
    },

    /// Offline review: reachability, cycles, condition lint
    Review {
        /// Path to the pipeline .dot file
        pipeline: PathBuf,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Path to the pipeline .dot file
    pipeline: PathBuf,

    /// Source repository the run operates on
    #[arg(long)]
    repo: PathBuf,

    /// Logs root (defaults under $XDG_STATE_HOME/kilroy/attractor/runs)
    #[arg(long)]
    logs_root: Option<PathBuf>,

    /// Run identifier (defaults to a generated one)
    #[arg(long)]
    run_id: Option<String>,

    /// Run branch prefix for checkpoints and parallel branches
    #[arg(long, default_value = "attractor/run")]
    run_branch_prefix: String,

    /// Per-stage timeout in seconds (0 = no cap)
    #[arg(long)]
    stage_timeout_s: Option<u64>,

    /// Stall watchdog timeout in seconds (unset = disabled)
    #[arg(long)]
    stall_timeout_s: Option<u64>,

    /// Turn-database base URL (journal events remotely when set)
    #[arg(long)]
    cxdb_url: Option<String>,

    /// Parse, route, and journal without invoking workers
    #[arg(long)]
    dry_run: bool,

    /// Enable input materialization with these include globs
    #[arg(long = "include", value_name = "GLOB")]
    includes: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .init();

    match cli.command {
        Commands::Attractor(cmd) => match cmd {
            AttractorCommands::Run(args) => cmd_run(args).await,
            AttractorCommands::Resume { logs_root } => cmd_resume(&logs_root).await,
            AttractorCommands::Stop {
                logs_root,
                grace_ms,
                force,
            } => {
                let code = stop::run_stop(
                    &stop::StopArgs {
                        logs_root,
                        grace: Duration::from_millis(grace_ms),
                        force,
                    },
                    &mut std::io::stdout(),
                    &mut std::io::stderr(),
                );
                std::process::exit(code);
            }
            AttractorCommands::Validate { pipeline } => cmd_validate(&pipeline),
            AttractorCommands::Info { pipeline, repo } => cmd_info(&pipeline, repo.as_deref()),
            AttractorCommands::Review { pipeline } => cmd_review(&pipeline),
        },
    }
}

async fn cmd_run(args: RunArgs) -> anyhow::Result<()> {
    let dot_source = std::fs::read_to_string(&args.pipeline)?;

    let mut options = RunOptions::new(&args.repo);
    options.logs_root = args.logs_root;
    options.run_id = args.run_id.unwrap_or_default();
    options.run_branch_prefix = args.run_branch_prefix;
    options.stage_timeout = args
        .stage_timeout_s
        .filter(|s| *s > 0)
        .map(Duration::from_secs);
    options.stall_timeout = args.stall_timeout_s.map(Duration::from_secs);
    options.cxdb_url = args.cxdb_url;
    options.dry_run = args.dry_run;
    if !args.includes.is_empty() {
        options.inputs = InputMaterializationOptions {
            enabled: true,
            include: args.includes,
            ..Default::default()
        };
    }

    match run(&dot_source, options).await {
        Ok(result) => {
            println!("run_id={}", result.run_id);
            println!("logs_root={}", result.logs_root.display());
            println!("run_branch={}", result.run_branch);
            println!("status={}", result.final_outcome.status.as_str());
            Ok(())
        }
        Err(e) => {
            eprintln!("run failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn cmd_resume(logs_root: &std::path::Path) -> anyhow::Result<()> {
    match resume(logs_root).await {
        Ok(result) => {
            println!("run_id={}", result.run_id);
            println!("status={}", result.final_outcome.status.as_str());
            Ok(())
        }
        Err(e) => {
            eprintln!("resume failed: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_validate(pipeline: &std::path::Path) -> anyhow::Result<()> {
    let dot_source = std::fs::read_to_string(pipeline)?;
    match kilroy_pipeline::build_graph(&dot_source).and_then(|g| g.validate().map(|_| g)) {
        Ok(graph) => {
            println!(
                "ok: {} ({} nodes, {} edges)",
                graph.name,
                graph.node_count(),
                graph.all_edges().len()
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("invalid pipeline: {e}");
            std::process::exit(1);
        }
    }
}

fn cmd_info(pipeline: &std::path::Path, repo: Option<&std::path::Path>) -> anyhow::Result<()> {
    let dot_source = std::fs::read_to_string(pipeline)?;
    let graph = kilroy_pipeline::build_graph(&dot_source)?;

    println!("graph: {}", graph.name);
    if !graph.goal.is_empty() {
        println!("goal: {}", graph.goal);
    }
    println!("nodes: {}", graph.node_count());
    println!("edges: {}", graph.all_edges().len());

    let registry = kilroy_pipeline::default_registry();
    for node in graph.nodes_in_order() {
        println!(
            "  {} [{}] -> {}",
            node.id,
            node.shape,
            registry.resolve_type(node)
        );
    }

    if let Some(repo) = repo {
        if let Some(warning) = version::stale_build_warning(repo) {
            eprintln!("warning: {warning}");
        }
    }
    Ok(())
}

fn cmd_review(pipeline: &std::path::Path) -> anyhow::Result<()> {
    let dot_source = std::fs::read_to_string(pipeline)?;
    let graph = kilroy_pipeline::build_graph(&dot_source)?;
    let findings = review::review_graph(&graph);

    if findings.is_empty() {
        println!("no findings");
        return Ok(());
    }
    let mut has_error = false;
    for finding in &findings {
        let tag = match finding.severity {
            review::Severity::Error => {
                has_error = true;
                "error"
            }
            review::Severity::Warning => "warning",
            review::Severity::Info => "info",
        };
        println!("{tag}: {}", finding.message);
    }
    if has_error {
        std::process::exit(1);
    }
    Ok(())
}
