//! Engine driver: run options, the per-run engine state, the subgraph
//! driver, and the `run`/`resume` entry points.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use kilroy_types::{
    Checkpoint, Context, FinalOutcome, FinalStatus, KilroyError, Outcome, Result, StageStatus,
};

use crate::artifacts::ArtifactStore;
use crate::cancel::CancelToken;
use crate::edge_selection::{select_edges, select_next_edge, outcome_resolver, best_edge};
use crate::events::{CxdbSink, EventJournal};
use crate::executor::{execute_with_retry, stage_status_env};
use crate::graph::{build_graph, PipelineGraph, SHAPE_FAN_IN, SHAPE_PARALLEL};
use crate::handler::{default_registry, Execution, HandlerRegistry};
use crate::handlers::parallel::{ParallelJoinData, StopAt};
use crate::inputs::{InputMaterializationOptions, InputMaterializer, INPUTS_MANIFEST_ENV};
use crate::interviewer::{AutoApproveInterviewer, Interviewer};
use crate::progress::ProgressJournal;
use crate::runstate::pid_running;
use crate::vcs::{checkpoint_message, GitVcs};

// ---------------------------------------------------------------------------
// RunOptions
// ---------------------------------------------------------------------------

mod duration_ms {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

mod opt_duration_ms {
    use super::*;
    use serde::{Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        let ms = Option::<u64>::deserialize(d)?;
        Ok(ms.map(Duration::from_millis))
    }
}

fn default_run_branch_prefix() -> String {
    "attractor/run".to_string()
}

fn default_stall_check_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_max_steps() -> usize {
    1000
}

pub const DEFAULT_MAX_LLM_RETRIES: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOptions {
    pub repo_path: PathBuf,
    #[serde(default)]
    pub run_id: String,
    #[serde(default)]
    pub logs_root: Option<PathBuf>,
    #[serde(default)]
    pub worktree_dir: Option<PathBuf>,
    #[serde(default = "default_run_branch_prefix")]
    pub run_branch_prefix: String,
    #[serde(default, with = "opt_duration_ms")]
    pub stage_timeout: Option<Duration>,
    #[serde(default, with = "opt_duration_ms")]
    pub stall_timeout: Option<Duration>,
    #[serde(default = "default_stall_check_interval", with = "duration_ms")]
    pub stall_check_interval: Duration,
    #[serde(default = "default_heartbeat_interval", with = "duration_ms")]
    pub heartbeat_interval: Duration,
    /// `None` means "apply the default"; an explicit zero disables LLM
    /// retries and is preserved.
    #[serde(default)]
    pub max_llm_retries: Option<usize>,
    #[serde(default = "default_max_steps")]
    pub max_steps: usize,
    #[serde(default)]
    pub cxdb_url: Option<String>,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub inputs: InputMaterializationOptions,
}

impl RunOptions {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self {
            repo_path: repo_path.into(),
            run_id: String::new(),
            logs_root: None,
            worktree_dir: None,
            run_branch_prefix: default_run_branch_prefix(),
            stage_timeout: None,
            stall_timeout: None,
            stall_check_interval: default_stall_check_interval(),
            heartbeat_interval: default_heartbeat_interval(),
            max_llm_retries: None,
            max_steps: default_max_steps(),
            cxdb_url: None,
            dry_run: false,
            inputs: InputMaterializationOptions::default(),
        }
    }

    /// Fill in every unset field. The default logs root lives under
    /// `$XDG_STATE_HOME/kilroy/attractor/runs/<run_id>` — outside the repo —
    /// and the worktree directly beneath it.
    pub fn apply_defaults(&mut self) -> Result<()> {
        if self.repo_path.as_os_str().is_empty() {
            return Err(KilroyError::ConfigError("repo_path is required".into()));
        }
        if self.run_id.trim().is_empty() {
            self.run_id = generate_run_id();
        }
        if self.run_branch_prefix.trim().is_empty() {
            self.run_branch_prefix = default_run_branch_prefix();
        }
        if self.logs_root.is_none() {
            let state_home = std::env::var_os("XDG_STATE_HOME")
                .map(PathBuf::from)
                .filter(|p| !p.as_os_str().is_empty())
                .unwrap_or_else(|| {
                    let home = std::env::var_os("HOME")
                        .map(PathBuf::from)
                        .unwrap_or_else(|| PathBuf::from("/tmp"));
                    home.join(".local").join("state")
                });
            self.logs_root = Some(
                state_home
                    .join("kilroy")
                    .join("attractor")
                    .join("runs")
                    .join(&self.run_id),
            );
        }
        if self.worktree_dir.is_none() {
            if let Some(logs_root) = &self.logs_root {
                self.worktree_dir = Some(logs_root.join("worktree"));
            }
        }
        if self.max_llm_retries.is_none() {
            self.max_llm_retries = Some(DEFAULT_MAX_LLM_RETRIES);
        }
        Ok(())
    }
}

fn generate_run_id() -> String {
    format!(
        "{}-{:04x}",
        chrono::Utc::now().format("%Y%m%d%H%M%S"),
        rand::random::<u16>()
    )
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Per-run (or per-branch, or per-child-pipeline) engine state. Cloning
/// shares the journal, registry, and context handles; branch and child
/// engines are built through [`Engine::for_branch`] /
/// [`Engine::for_child_pipeline`], which replace the isolated parts.
#[derive(Clone)]
pub struct Engine {
    pub graph: Arc<PipelineGraph>,
    pub options: RunOptions,
    pub dot_source: String,
    pub logs_root: PathBuf,
    pub worktree_dir: PathBuf,
    pub run_branch: String,
    pub context: Context,
    pub registry: Arc<HandlerRegistry>,
    pub interviewer: Arc<dyn Interviewer>,
    pub journal: Arc<EventJournal>,
    pub artifacts: Arc<ArtifactStore>,
    pub vcs: Option<Arc<GitVcs>>,
    pub llm: Option<Arc<kilroy_llm::Client>>,
    pub materializer: Option<Arc<InputMaterializer>>,
    pub cancel: CancelToken,
    /// Checkpoints save from the root engine only; branches and children
    /// commit to their own git branches but never touch checkpoint.json.
    pub is_root: bool,
    current_sha: Arc<tokio::sync::Mutex<String>>,
    parallel_slot: Arc<tokio::sync::Mutex<Option<ParallelJoinData>>>,
}

impl Engine {
    /// Git SHA of the last checkpoint commit (the parent for new branch
    /// worktrees).
    pub async fn current_sha(&self) -> String {
        self.current_sha.lock().await.clone()
    }

    pub async fn set_current_sha(&self, sha: String) {
        *self.current_sha.lock().await = sha;
    }

    pub async fn park_parallel_results(&self, data: ParallelJoinData) {
        *self.parallel_slot.lock().await = Some(data);
    }

    pub async fn take_parallel_results(&self) -> Option<ParallelJoinData> {
        self.parallel_slot.lock().await.take()
    }

    /// Environment exposed to worker processes: the stage status contract,
    /// the inputs manifest, and pinned toolchain paths so nested HOME
    /// overrides cannot break resolution. Known-sticky variables are
    /// stripped by the handlers (`CLAUDECODE`).
    pub fn worker_env(&self, worktree: &Path, stage_logs_dir: &Path) -> Vec<(String, String)> {
        let mut env = stage_status_env(worktree, stage_logs_dir);

        if let Some(materializer) = &self.materializer {
            let stage_manifest = stage_logs_dir.join(crate::inputs::INPUT_MANIFEST_FILE);
            let manifest = if stage_manifest.is_file() {
                stage_manifest
            } else {
                materializer.run_manifest_path()
            };
            env.push((
                INPUTS_MANIFEST_ENV.to_string(),
                manifest.to_string_lossy().into_owned(),
            ));
        }

        let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
        let home = Path::new(&home);
        let pins: [(&str, PathBuf); 5] = [
            ("CARGO_TARGET_DIR", worktree.join("target")),
            ("CARGO_HOME", home.join(".cargo")),
            ("RUSTUP_HOME", home.join(".rustup")),
            ("GOPATH", home.join("go")),
            ("GOMODCACHE", home.join("go").join("pkg").join("mod")),
        ];
        for (key, pinned) in pins {
            let value = std::env::var(key).unwrap_or_else(|_| pinned.to_string_lossy().into_owned());
            env.push((key.to_string(), value));
        }
        env
    }

    /// Engine for one parallel branch: branch-local logs, worktree, and
    /// context; shared cxdb sink, registry, and options.
    pub fn for_branch(
        &self,
        branch_logs_root: &Path,
        branch_worktree: &Path,
        context: Context,
    ) -> Engine {
        let progress = ProgressJournal::new(branch_logs_root, &self.options.run_id);
        let journal = Arc::new(EventJournal::new(
            progress,
            self.journal.cxdb().cloned(),
            &self.options.run_id,
        ));
        Engine {
            graph: self.graph.clone(),
            options: self.options.clone(),
            dot_source: self.dot_source.clone(),
            logs_root: branch_logs_root.to_path_buf(),
            worktree_dir: branch_worktree.to_path_buf(),
            run_branch: self.run_branch.clone(),
            context,
            registry: self.registry.clone(),
            interviewer: self.interviewer.clone(),
            journal,
            artifacts: Arc::new(ArtifactStore::with_defaults(branch_logs_root)),
            vcs: self.vcs.clone(),
            llm: self.llm.clone(),
            materializer: self.materializer.clone(),
            cancel: self.cancel.child(),
            is_root: false,
            current_sha: Arc::new(tokio::sync::Mutex::new(String::new())),
            parallel_slot: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }

    /// Engine for a manager-loop child pipeline: a different graph, child
    /// logs root, the parent worktree, a forked context.
    pub fn for_child_pipeline(
        &self,
        graph: Arc<PipelineGraph>,
        child_logs_root: &Path,
        worktree: &Path,
        context: Context,
    ) -> Engine {
        let progress = ProgressJournal::new(child_logs_root, &self.options.run_id);
        let journal = Arc::new(EventJournal::new(
            progress,
            self.journal.cxdb().cloned(),
            &self.options.run_id,
        ));
        Engine {
            graph,
            options: self.options.clone(),
            dot_source: String::new(),
            logs_root: child_logs_root.to_path_buf(),
            worktree_dir: worktree.to_path_buf(),
            run_branch: self.run_branch.clone(),
            context,
            registry: self.registry.clone(),
            interviewer: self.interviewer.clone(),
            journal,
            artifacts: Arc::new(ArtifactStore::with_defaults(child_logs_root)),
            vcs: None,
            llm: self.llm.clone(),
            materializer: None,
            cancel: self.cancel.child(),
            is_root: false,
            current_sha: Arc::new(tokio::sync::Mutex::new(String::new())),
            parallel_slot: Arc::new(tokio::sync::Mutex::new(None)),
        }
    }
}

// ---------------------------------------------------------------------------
// Subgraph driver
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct SubgraphResult {
    /// Outcome of the last executed node.
    pub outcome: Outcome,
    /// The join node reached (unexecuted), for branch drivers.
    pub reached_join: Option<String>,
    pub completed_nodes: Vec<String>,
}

/// Walk the graph from `start_id`, applying the edge selector after every
/// node, until a terminal node executes (or, under
/// [`StopAt::JoinOrTerminal`], the walk arrives at a fan-in join). Each
/// completed node is committed to the engine's worktree branch; the root
/// engine also persists checkpoint.json.
pub async fn run_subgraph_until(
    engine: Arc<Engine>,
    start_id: String,
    stop_at: StopAt,
    cancel: CancelToken,
) -> Result<SubgraphResult> {
    let exec = Execution {
        engine: engine.clone(),
        worktree_dir: engine.worktree_dir.clone(),
        logs_root: engine.logs_root.clone(),
        cancel,
    };

    let mut retries: HashMap<String, usize> = HashMap::new();
    let mut completed_nodes: Vec<String> = Vec::new();
    let mut current_id = start_id;
    let mut last_outcome = Outcome::success("");
    let mut steps = 0usize;

    loop {
        steps += 1;
        if steps > engine.options.max_steps {
            return Err(KilroyError::Other(format!(
                "pipeline exceeded maximum step count ({})",
                engine.options.max_steps
            )));
        }
        if exec.cancel.is_cancelled() {
            return Err(KilroyError::Other(
                exec.cancel
                    .reason()
                    .unwrap_or_else(|| "run canceled".to_string()),
            ));
        }

        let node = engine
            .graph
            .node(&current_id)
            .ok_or_else(|| KilroyError::ValidationError(format!("unknown node '{current_id}'")))?
            .clone();

        if stop_at == StopAt::JoinOrTerminal && node.shape == SHAPE_FAN_IN {
            return Ok(SubgraphResult {
                outcome: last_outcome,
                reached_join: Some(current_id),
                completed_nodes,
            });
        }

        let outcome = execute_with_retry(&exec, &node, &mut retries).await?;
        completed_nodes.push(node.id.clone());

        // Apply context updates and the routing keys.
        engine
            .context
            .apply_updates(outcome.context_updates.clone())
            .await;
        engine
            .context
            .set("outcome", serde_json::json!(outcome.status.as_str()))
            .await;
        if let Some(label) = &outcome.preferred_label {
            engine
                .context
                .set("preferred_label", serde_json::json!(label))
                .await;
        }

        // Commit the checkpoint for this node.
        let mut commit_sha = engine.current_sha().await;
        if let Some(vcs) = &engine.vcs {
            match vcs
                .commit_all(
                    &engine.worktree_dir,
                    &checkpoint_message(&engine.options.run_id, &node.id, outcome.status.as_str()),
                )
                .await
            {
                Ok(sha) => {
                    commit_sha = sha.clone();
                    engine.set_current_sha(sha.clone()).await;
                    engine
                        .journal
                        .git_checkpoint(&node.id, outcome.status.as_str(), &sha)
                        .await;
                }
                Err(e) => {
                    tracing::warn!(node = %node.id, error = %e, "checkpoint commit failed");
                }
            }
        }

        last_outcome = outcome.clone();

        if node.is_terminal() {
            if engine.is_root {
                save_checkpoint(&engine, &node.id, &completed_nodes, &retries, &commit_sha).await;
            }
            return Ok(SubgraphResult {
                outcome: last_outcome,
                reached_join: None,
                completed_nodes,
            });
        }

        // A fan-out already ran its branches to the join; the driver jumps
        // there directly rather than walking a branch edge a second time.
        if node.shape == SHAPE_PARALLEL && outcome.status.is_success() {
            match outcome.suggested_next_ids.first() {
                Some(join_id) => {
                    engine.journal.edge_selected(&node.id, join_id, None).await;
                    if engine.is_root {
                        save_checkpoint(&engine, join_id, &completed_nodes, &retries, &commit_sha)
                            .await;
                    }
                    current_id = join_id.clone();
                    continue;
                }
                None => {
                    // Every branch ran to a terminal; the fan-out concludes
                    // the walk.
                    return Ok(SubgraphResult {
                        outcome: last_outcome,
                        reached_join: None,
                        completed_nodes,
                    });
                }
            }
        }

        // Route. A failed fan-in is terminal unless an explicit fail-routing
        // edge matched: unconditional downstream edges are NOT followed.
        let snapshot = engine.context.snapshot().await;
        let next_edge = if node.shape == SHAPE_FAN_IN && outcome.status == StageStatus::Fail {
            let resolve = outcome_resolver(&outcome, &snapshot);
            let winners: Vec<_> = engine
                .graph
                .outgoing_edges(&node.id)
                .iter()
                .filter(|e| {
                    e.condition.as_deref().is_some_and(|cond| {
                        crate::condition::check_condition(cond, &resolve).unwrap_or(false)
                    })
                })
                .collect();
            if winners.is_empty() {
                None
            } else {
                Some(best_edge(&winners))
            }
        } else {
            select_next_edge(&engine.graph, &node.id, &outcome, &snapshot)
        };

        let Some(edge) = next_edge else {
            if outcome.status == StageStatus::Fail {
                return Err(KilroyError::RunFailed {
                    node: node.id.clone(),
                    reason: outcome
                        .failure_reason
                        .clone()
                        .unwrap_or_else(|| "stage failed with no eligible edge".to_string()),
                });
            }
            // Dead end without failure: the walk is complete.
            return Ok(SubgraphResult {
                outcome: last_outcome,
                reached_join: None,
                completed_nodes,
            });
        };

        engine
            .journal
            .edge_selected(&edge.from, &edge.to, edge.label.as_deref())
            .await;

        // A restart edge wipes run history before looping back.
        if edge.loop_restart {
            completed_nodes.clear();
            retries.clear();
        }

        let next_id = edge.to.clone();
        if engine.is_root {
            save_checkpoint(&engine, &next_id, &completed_nodes, &retries, &commit_sha).await;
        }
        current_id = next_id;
    }
}

async fn save_checkpoint(
    engine: &Engine,
    current_node: &str,
    completed_nodes: &[String],
    retries: &HashMap<String, usize>,
    commit_sha: &str,
) {
    let checkpoint = Checkpoint {
        run_id: engine.options.run_id.clone(),
        current_node: current_node.to_string(),
        completed_nodes: completed_nodes.to_vec(),
        node_retries: retries.clone(),
        context_values: engine.context.snapshot().await,
        context_logs: engine.context.snapshot_logs().await,
        git_commit_sha: commit_sha.to_string(),
        timestamp: chrono::Utc::now(),
    };
    let path = engine.logs_root.join("checkpoint.json");
    if let Err(e) = checkpoint.save(&path) {
        tracing::warn!(error = %e, "checkpoint save failed");
        return;
    }
    engine
        .journal
        .checkpoint_saved(current_node, &path.to_string_lossy())
        .await;
}

// ---------------------------------------------------------------------------
// Run / resume entry points
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RunResult {
    pub run_id: String,
    pub logs_root: PathBuf,
    pub run_branch: String,
    pub final_outcome: FinalOutcome,
    pub completed_nodes: Vec<String>,
}

/// Everything pluggable about a run that is not plain data.
pub struct RunHooks {
    pub interviewer: Arc<dyn Interviewer>,
    pub registry: Arc<HandlerRegistry>,
    pub llm: Option<Arc<kilroy_llm::Client>>,
    pub inferer: Option<Arc<dyn crate::inputs::InputReferenceInferer>>,
}

impl Default for RunHooks {
    fn default() -> Self {
        Self {
            interviewer: Arc::new(AutoApproveInterviewer),
            registry: Arc::new(default_registry()),
            llm: None,
            inferer: None,
        }
    }
}

/// Execute a pipeline from DOT source. Returns `Ok` only when the run
/// reached a terminal success; terminal failures surface as
/// [`KilroyError::RunFailed`] after `final.json` and the failure events are
/// written.
pub async fn run(dot_source: &str, options: RunOptions) -> Result<RunResult> {
    run_with_hooks(dot_source, options, RunHooks::default()).await
}

pub async fn run_with_hooks(
    dot_source: &str,
    mut options: RunOptions,
    hooks: RunHooks,
) -> Result<RunResult> {
    options.apply_defaults()?;
    let graph = build_graph(dot_source)?;
    graph.validate()?;

    let logs_root = options
        .logs_root
        .clone()
        .ok_or_else(|| KilroyError::ConfigError("logs root not resolved".into()))?;
    std::fs::create_dir_all(&logs_root)?;
    claim_logs_root(&logs_root)?;

    // Run provenance.
    std::fs::write(logs_root.join("graph.dot"), dot_source)?;
    std::fs::write(
        logs_root.join("run_config.json"),
        serde_json::to_vec_pretty(&options)?,
    )?;
    std::fs::write(
        logs_root.join("manifest.json"),
        serde_json::to_vec_pretty(&serde_json::json!({
            "run_id": options.run_id,
            "graph_name": graph.name,
            "goal": graph.goal,
            "created_at": chrono::Utc::now().to_rfc3339(),
        }))?,
    )?;

    // VCS: run branch + worktree at the current HEAD.
    let vcs = Arc::new(GitVcs::new(&options.repo_path));
    let base_sha = vcs.head_sha().await?;
    let worktree_dir = options
        .worktree_dir
        .clone()
        .ok_or_else(|| KilroyError::ConfigError("worktree dir not resolved".into()))?;
    let run_branch = format!(
        "{}/{}",
        options.run_branch_prefix.trim_end_matches('/'),
        options.run_id
    );
    vcs.add_worktree(&worktree_dir, &base_sha, &run_branch).await?;

    let engine = build_engine(
        graph,
        options,
        dot_source.to_string(),
        logs_root,
        worktree_dir,
        run_branch,
        Some(vcs),
        base_sha.clone(),
        hooks,
        Context::new(),
    )
    .await?;

    // Seed the context from graph attributes.
    for (key, value) in &engine.graph.attrs {
        engine
            .context
            .set(key.clone(), attr_to_json(value))
            .await;
    }

    if let Some(materializer) = &engine.materializer {
        materializer
            .materialize_into(&engine.worktree_dir, None)
            .await?;
    }

    engine
        .journal
        .run_started(
            &engine.options.repo_path.to_string_lossy(),
            &base_sha,
            &engine.run_branch,
            &engine.logs_root.to_string_lossy(),
            &engine.worktree_dir.to_string_lossy(),
            &engine.graph.name,
            &engine.graph.goal,
            &engine.dot_source,
        )
        .await;

    let start_id = engine
        .graph
        .start_node()
        .ok_or_else(|| KilroyError::ValidationError("graph has no start node".into()))?
        .id
        .clone();
    drive_to_completion(engine, start_id).await
}

/// Resume a run from its checkpoint under `logs_root`.
pub async fn resume(logs_root: &Path) -> Result<RunResult> {
    resume_with_hooks(logs_root, RunHooks::default()).await
}

pub async fn resume_with_hooks(logs_root: &Path, hooks: RunHooks) -> Result<RunResult> {
    let checkpoint = Checkpoint::load(&logs_root.join("checkpoint.json"))?;
    let options: RunOptions =
        serde_json::from_str(&std::fs::read_to_string(logs_root.join("run_config.json"))?)?;
    let dot_source = std::fs::read_to_string(logs_root.join("graph.dot"))?;
    let graph = build_graph(&dot_source)?;
    graph.validate()?;

    // Parallel branch names are rebuilt from the configured prefix; a
    // missing prefix on resume is fatal.
    if options.run_branch_prefix.trim().is_empty() {
        return Err(KilroyError::ConfigError(
            "run branch prefix missing on resume".into(),
        ));
    }

    claim_logs_root(logs_root)?;

    let vcs = Arc::new(GitVcs::new(&options.repo_path));
    let worktree_dir = options
        .worktree_dir
        .clone()
        .unwrap_or_else(|| logs_root.join("worktree"));
    let run_branch = format!(
        "{}/{}",
        options.run_branch_prefix.trim_end_matches('/'),
        options.run_id
    );

    let context = Context::new();
    context
        .replace_snapshot(
            checkpoint.context_values.clone(),
            checkpoint.context_logs.clone(),
        )
        .await;

    // Rewind the worktree to the checkpointed commit so execution continues
    // from exactly the persisted state.
    if !checkpoint.git_commit_sha.trim().is_empty() {
        vcs.reset_hard(&worktree_dir, &checkpoint.git_commit_sha)
            .await?;
    }

    let engine = build_engine(
        graph,
        options,
        dot_source,
        logs_root.to_path_buf(),
        worktree_dir,
        run_branch,
        Some(vcs),
        checkpoint.git_commit_sha.clone(),
        hooks,
        context,
    )
    .await?;

    if let Some(materializer) = &engine.materializer {
        // Hydrates from the snapshot directory when the source is gone.
        materializer
            .materialize_into(&engine.worktree_dir, None)
            .await?;
    }

    drive_to_completion(engine, checkpoint.current_node.clone()).await
}

async fn drive_to_completion(engine: Arc<Engine>, start_id: String) -> Result<RunResult> {
    let cancel = engine.cancel.clone();
    let result = run_subgraph_until(engine.clone(), start_id, StopAt::Terminal, cancel).await;

    match result {
        Ok(sub) => {
            let final_outcome = FinalOutcome {
                status: FinalStatus::Success,
                run_id: engine.options.run_id.clone(),
                failure_reason: None,
                git_commit_sha: Some(engine.current_sha().await),
                completed_at: chrono::Utc::now(),
            };
            write_final(&engine, &final_outcome);
            engine
                .journal
                .run_completed(&engine.current_sha().await)
                .await;
            Ok(RunResult {
                run_id: engine.options.run_id.clone(),
                logs_root: engine.logs_root.clone(),
                run_branch: engine.run_branch.clone(),
                final_outcome,
                completed_nodes: sub.completed_nodes,
            })
        }
        Err(e) => {
            let (node, reason) = match &e {
                KilroyError::RunFailed { node, reason } => (node.clone(), reason.clone()),
                other => (String::new(), other.to_string()),
            };
            let final_outcome = FinalOutcome {
                status: FinalStatus::Fail,
                run_id: engine.options.run_id.clone(),
                failure_reason: Some(reason.clone()),
                git_commit_sha: Some(engine.current_sha().await),
                completed_at: chrono::Utc::now(),
            };
            write_final(&engine, &final_outcome);
            engine
                .journal
                .run_failed(&node, &engine.current_sha().await, &reason)
                .await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn build_engine(
    graph: PipelineGraph,
    options: RunOptions,
    dot_source: String,
    logs_root: PathBuf,
    worktree_dir: PathBuf,
    run_branch: String,
    vcs: Option<Arc<GitVcs>>,
    base_sha: String,
    hooks: RunHooks,
    context: Context,
) -> Result<Arc<Engine>> {
    let cxdb = match options.cxdb_url.as_deref().filter(|u| !u.trim().is_empty()) {
        Some(url) => match CxdbSink::create(url).await {
            Ok(sink) => Some(Arc::new(sink)),
            Err(e) => {
                // The turn database is observability, not correctness.
                tracing::warn!(error = %e, "cxdb unavailable; continuing with local journal only");
                None
            }
        },
        None => None,
    };

    let journal = Arc::new(EventJournal::new(
        ProgressJournal::new(&logs_root, &options.run_id),
        cxdb,
        &options.run_id,
    ));

    let materializer = if options.inputs.enabled {
        let inferer = if options.inputs.infer_with_llm {
            match (&hooks.inferer, &hooks.llm) {
                (Some(custom), _) => Some(custom.clone()),
                (None, Some(client)) => Some(Arc::new(crate::inputs::LlmInputReferenceInferer::new(
                    client.clone(),
                    options.inputs.inference_provider.clone(),
                    options.inputs.inference_model.clone(),
                ))
                    as Arc<dyn crate::inputs::InputReferenceInferer>),
                (None, None) => None,
            }
        } else {
            None
        };
        Some(Arc::new(InputMaterializer::new(
            &options.repo_path,
            &logs_root,
            &options.run_id,
            options.inputs.clone(),
            inferer,
        )))
    } else {
        None
    };

    Ok(Arc::new(Engine {
        graph: Arc::new(graph),
        options,
        dot_source,
        logs_root: logs_root.clone(),
        worktree_dir,
        run_branch,
        context,
        registry: hooks.registry,
        interviewer: hooks.interviewer,
        journal,
        artifacts: Arc::new(ArtifactStore::with_defaults(&logs_root)),
        vcs,
        llm: hooks.llm,
        materializer,
        cancel: CancelToken::new(),
        is_root: true,
        current_sha: Arc::new(tokio::sync::Mutex::new(base_sha)),
        parallel_slot: Arc::new(tokio::sync::Mutex::new(None)),
    }))
}

/// The logs root is owned by one run: a live `run.pid` from another process
/// refuses the claim; anything else is overwritten with our own PID.
fn claim_logs_root(logs_root: &Path) -> Result<()> {
    let pid_path = logs_root.join("run.pid");
    if let Ok(raw) = std::fs::read_to_string(&pid_path) {
        if let Ok(pid) = raw.trim().parse::<i32>() {
            if pid > 0 && pid != std::process::id() as i32 && pid_running(pid) {
                return Err(KilroyError::ConfigError(format!(
                    "logs root is owned by a live run (pid {pid}); separate runs must use separate roots"
                )));
            }
        }
    }
    std::fs::write(&pid_path, format!("{}\n", std::process::id()))?;
    Ok(())
}

fn write_final(engine: &Engine, final_outcome: &FinalOutcome) {
    match serde_json::to_vec_pretty(final_outcome) {
        Ok(json) => {
            if let Err(e) = std::fs::write(engine.logs_root.join("final.json"), json) {
                tracing::warn!(error = %e, "final.json write failed");
            }
        }
        Err(e) => tracing::warn!(error = %e, "final.json serialize failed"),
    }
}

fn attr_to_json(value: &kilroy_dot::AttributeValue) -> serde_json::Value {
    match value {
        kilroy_dot::AttributeValue::String(s) => serde_json::json!(s),
        kilroy_dot::AttributeValue::Integer(i) => serde_json::json!(i),
        kilroy_dot::AttributeValue::Float(f) => serde_json::json!(f),
        kilroy_dot::AttributeValue::Boolean(b) => serde_json::json!(b),
        kilroy_dot::AttributeValue::Duration(d) => serde_json::json!(d.as_millis() as u64),
    }
}

/// Edge-selection preview used by the review tooling: the candidate set for
/// a hypothetical outcome at a node.
pub fn preview_edges<'a>(
    graph: &'a PipelineGraph,
    node_id: &str,
    outcome: &Outcome,
    snapshot: &HashMap<String, serde_json::Value>,
) -> Vec<&'a crate::graph::PipelineEdge> {
    let resolve = outcome_resolver(outcome, snapshot);
    select_edges(graph, node_id, outcome, &resolve)
}

// ---------------------------------------------------------------------------
// Test support
// ---------------------------------------------------------------------------


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_defaults_uses_xdg_state_home_outside_repo() {
        let state = tempfile::tempdir().unwrap();
        let repo = tempfile::tempdir().unwrap();
        std::env::set_var("XDG_STATE_HOME", state.path());

        let mut opts = RunOptions::new(repo.path());
        opts.run_id = "01HZZZZZZZZZZZZZZZZZZZZZZZZ".into();
        opts.apply_defaults().unwrap();

        let logs_root = opts.logs_root.clone().unwrap();
        let want_prefix = state
            .path()
            .join("kilroy")
            .join("attractor")
            .join("runs")
            .join(&opts.run_id);
        assert!(logs_root.starts_with(&want_prefix), "logs_root={logs_root:?}");
        assert!(!logs_root.starts_with(repo.path()));
        assert_eq!(opts.worktree_dir.unwrap(), logs_root.join("worktree"));
        std::env::remove_var("XDG_STATE_HOME");
    }

    #[test]
    fn apply_defaults_sets_max_llm_retries_when_unset() {
        let mut opts = RunOptions::new("/tmp/repo");
        opts.apply_defaults().unwrap();
        assert_eq!(opts.max_llm_retries, Some(DEFAULT_MAX_LLM_RETRIES));
    }

    #[test]
    fn apply_defaults_preserves_explicit_zero_max_llm_retries() {
        let mut opts = RunOptions::new("/tmp/repo");
        opts.max_llm_retries = Some(0);
        opts.apply_defaults().unwrap();
        assert_eq!(opts.max_llm_retries, Some(0));
    }

    #[test]
    fn apply_defaults_generates_run_id() {
        let mut opts = RunOptions::new("/tmp/repo");
        opts.apply_defaults().unwrap();
        assert!(!opts.run_id.is_empty());

        let mut second = RunOptions::new("/tmp/repo");
        second.apply_defaults().unwrap();
        // Run IDs carry a random suffix.
        assert!(opts.run_id.len() >= 15);
        let _ = second;
    }

    #[test]
    fn run_options_round_trip_through_json() {
        let mut opts = RunOptions::new("/tmp/repo");
        opts.run_id = "r1".into();
        opts.stage_timeout = Some(Duration::from_secs(90));
        opts.stall_timeout = Some(Duration::from_millis(150));
        opts.apply_defaults().unwrap();

        let json = serde_json::to_string(&opts).unwrap();
        let back: RunOptions = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, "r1");
        assert_eq!(back.stage_timeout, Some(Duration::from_secs(90)));
        assert_eq!(back.stall_timeout, Some(Duration::from_millis(150)));
        assert_eq!(back.run_branch_prefix, "attractor/run");
    }

    #[test]
    fn claim_logs_root_refuses_live_foreign_owner() {
        let dir = tempfile::tempdir().unwrap();
        // PID 1 is always alive and never us.
        std::fs::write(dir.path().join("run.pid"), "1\n").unwrap();
        let err = claim_logs_root(dir.path()).unwrap_err();
        assert!(err.to_string().contains("separate roots"));
    }

    #[test]
    fn claim_logs_root_overwrites_dead_owner() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run.pid"), "999999999\n").unwrap();
        claim_logs_root(dir.path()).unwrap();
        let raw = std::fs::read_to_string(dir.path().join("run.pid")).unwrap();
        assert_eq!(raw.trim().parse::<u32>().unwrap(), std::process::id());
    }
}
