//! Node handler trait, execution scope, and the shape-keyed registry.
//!
//! Handlers expose a single capability — `execute` — and the engine never
//! branches on concrete handler type outside the registry.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use kilroy_types::{Outcome, Result};

use crate::cancel::CancelToken;
use crate::engine::Engine;
use crate::graph::{self, PipelineNode};

// ---------------------------------------------------------------------------
// Execution — the per-scope environment a handler runs in
// ---------------------------------------------------------------------------

/// Everything a handler needs: the owning engine, the worktree and logs root
/// for this scope (branch-specific under parallel fan-out), and the
/// cancelable scope it must poll.
#[derive(Clone)]
pub struct Execution {
    pub engine: Arc<Engine>,
    pub worktree_dir: PathBuf,
    pub logs_root: PathBuf,
    pub cancel: CancelToken,
}

impl Execution {
    /// Per-stage logs directory `<logs_root>/<node_id>/`, created on demand.
    pub fn stage_logs_dir(&self, node_id: &str) -> PathBuf {
        let dir = self.logs_root.join(node_id);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            tracing::warn!(error = %e, node = node_id, "stage logs dir create failed");
        }
        dir
    }
}

// ---------------------------------------------------------------------------
// Handler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait Handler: Send + Sync {
    /// The handler type identifier (e.g. "start", "tool", "codergen").
    fn handler_type(&self) -> &str;

    async fn execute(&self, exec: &Execution, node: &PipelineNode) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
    shape_to_type: HashMap<String, String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut shape_to_type = HashMap::new();
        shape_to_type.insert(graph::SHAPE_START.into(), "start".into());
        shape_to_type.insert(graph::SHAPE_EXIT.into(), "exit".into());
        shape_to_type.insert(graph::SHAPE_LLM.into(), "codergen".into());
        shape_to_type.insert(graph::SHAPE_TOOL.into(), "tool".into());
        shape_to_type.insert(graph::SHAPE_DECISION.into(), "conditional".into());
        shape_to_type.insert(graph::SHAPE_PARALLEL.into(), "parallel".into());
        shape_to_type.insert(graph::SHAPE_FAN_IN.into(), "parallel.fan_in".into());
        shape_to_type.insert(graph::SHAPE_MANAGER_LOOP.into(), "stack.manager_loop".into());
        shape_to_type.insert(graph::SHAPE_WAIT_HUMAN.into(), "wait.human".into());

        Self {
            handlers: HashMap::new(),
            shape_to_type,
        }
    }

    pub fn register(&mut self, handler: impl Handler + 'static) {
        let t = handler.handler_type().to_string();
        self.handlers.insert(t, Arc::new(handler));
    }

    /// Resolve a node to its handler type:
    /// 1. Explicit `type` attribute on the node.
    /// 2. Shape-based mapping.
    /// 3. Default: `"codergen"`.
    ///
    /// A decision node carrying a prompt routes to `"codergen"` so the
    /// prompt actually runs; the conditional handler is a pass-through for
    /// pure routing nodes.
    pub fn resolve_type(&self, node: &PipelineNode) -> String {
        let resolved = if let Some(t) = &node.node_type {
            t.clone()
        } else if let Some(t) = self.shape_to_type.get(&node.shape) {
            t.clone()
        } else {
            "codergen".to_string()
        };
        if resolved == "conditional" && node.prompt.is_some() {
            return "codergen".to_string();
        }
        resolved
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn has(&self, handler_type: &str) -> bool {
        self.handlers.contains_key(handler_type)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Built-in bookkeeping handlers
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl Handler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(&self, _exec: &Execution, _node: &PipelineNode) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline started"))
    }
}

pub struct ExitHandler;

#[async_trait]
impl Handler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(&self, _exec: &Execution, _node: &PipelineNode) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline completed"))
    }
}

/// Pure routing; no worker invocation. The routing itself happens in edge
/// selection after this outcome is recorded.
pub struct ConditionalHandler;

#[async_trait]
impl Handler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    async fn execute(&self, _exec: &Execution, _node: &PipelineNode) -> Result<Outcome> {
        Ok(Outcome::success("Decision pass-through"))
    }
}

/// Registry pre-loaded with every built-in handler.
pub fn default_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(ConditionalHandler);
    reg.register(crate::handlers::CodergenHandler);
    reg.register(crate::handlers::ToolHandler);
    reg.register(crate::handlers::ParallelHandler);
    reg.register(crate::handlers::FanInHandler);
    reg.register(crate::handlers::ManagerLoopHandler);
    reg.register(crate::handlers::WaitHumanHandler);
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
