//! Graph execution engine for Kilroy attractor pipelines.
//!
//! The engine takes a parsed DOT pipeline description plus a configuration
//! and drives it from entry to exit: shape-keyed handler dispatch, a
//! deterministic edge-selection cascade, retry/escalation policy with stall
//! watchdogs, parallel fan-out onto per-branch git worktrees, an
//! observe/wait manager loop, checkpoint/resume, and a dual event journal
//! (local ndjson + remote turn database).

pub mod artifacts;
pub mod cancel;
pub mod condition;
pub mod edge_selection;
pub mod engine;
pub mod events;
pub mod executor;
pub mod failure;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod inputs;
pub mod interviewer;
pub mod progress;
pub mod runstate;
pub mod vcs;

pub use artifacts::{ArtifactInfo, ArtifactStore, DEFAULT_FILE_BACKING_THRESHOLD};
pub use cancel::CancelToken;
pub use condition::{check_condition, evaluate_condition, parse_condition, ConditionExpr};
pub use edge_selection::{best_edge, select_all_eligible_edges, select_edges, select_next_edge};
pub use engine::{
    resume, resume_with_hooks, run, run_with_hooks, preview_edges, Engine, RunHooks, RunOptions,
    RunResult,
};
pub use events::EventJournal;
pub use executor::{execute_with_retry, effective_timeout, parse_escalation_models};
pub use failure::{classify_failure, extract_missing_executables, FailureClass};
pub use graph::{build_graph, PipelineEdge, PipelineGraph, PipelineNode};
pub use handler::{default_registry, Execution, Handler, HandlerRegistry};
pub use inputs::{InputManifest, InputMaterializationOptions, InputMaterializer};
pub use interviewer::{
    Answer, AutoApproveInterviewer, CallbackInterviewer, ConsoleInterviewer, Interviewer,
    Question, QueueInterviewer, RecordingInterviewer,
};
pub use runstate::{load_snapshot, pid_running, read_pid_cmdline, RunState, RunStateSnapshot};
