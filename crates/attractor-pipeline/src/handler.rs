//! Node handler trait, dynamic dispatch wrapper, and handler registry.

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;

use attractor_types::{CancellationToken, Context, Outcome, Result};

use crate::graph::{PipelineGraph, PipelineNode};

// ---------------------------------------------------------------------------
// NodeHandler trait
// ---------------------------------------------------------------------------

#[async_trait]
pub trait NodeHandler: Send + Sync {
    /// The handler type identifier (e.g. "start", "exit", "codergen").
    fn handler_type(&self) -> &str;

    /// Execute this handler for a given node.
    ///
    /// `logs_root` is the run's artifact directory; handlers that write
    /// per-attempt artifacts (codergen, tool, workspace) create a
    /// `logs_root/<node_id>/` subdirectory of their own. `cancel` is
    /// observed by handlers that perform long-running work (subprocess
    /// execution, LLM calls) so a cancelled run unwinds promptly.
    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome>;
}

// ---------------------------------------------------------------------------
// DynHandler — object-safe wrapper
// ---------------------------------------------------------------------------

pub struct DynHandler(Box<dyn NodeHandler>);

impl DynHandler {
    pub fn new(handler: impl NodeHandler + 'static) -> Self {
        Self(Box::new(handler))
    }

    pub fn handler_type(&self) -> &str {
        self.0.handler_type()
    }

    pub async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        self.0.execute(node, context, graph, logs_root, cancel).await
    }
}

// ---------------------------------------------------------------------------
// HandlerRegistry
// ---------------------------------------------------------------------------

pub struct HandlerRegistry {
    handlers: HashMap<String, DynHandler>,
    shape_to_type: HashMap<String, String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        let mut shape_to_type = HashMap::new();
        shape_to_type.insert("Mdiamond".into(), "start".into());
        shape_to_type.insert("Msquare".into(), "exit".into());
        shape_to_type.insert("box".into(), "codergen".into());
        shape_to_type.insert("hexagon".into(), "wait.human".into());
        shape_to_type.insert("diamond".into(), "conditional".into());
        shape_to_type.insert("parallelogram".into(), "tool".into());

        Self {
            handlers: HashMap::new(),
            shape_to_type,
        }
    }

    pub fn register(&mut self, handler: impl NodeHandler + 'static) {
        let t = handler.handler_type().to_string();
        self.handlers.insert(t, DynHandler::new(handler));
    }

    /// Resolve a node to its handler type using 3-step priority:
    /// 1. Explicit `type` attribute on the node
    /// 2. Shape-based mapping
    /// 3. Default: `"codergen"`
    ///
    /// Special case: conditional nodes with a prompt are routed to `"codergen"`
    /// so the prompt actually gets executed via Claude. The `ConditionalHandler`
    /// is a pass-through for pure routing nodes with no prompt.
    pub fn resolve_type(&self, node: &PipelineNode) -> String {
        if let Some(ref t) = node.node_type {
            if t == "conditional" && node.prompt.is_some() {
                return "codergen".to_string();
            }
            return t.clone();
        }
        if let Some(t) = self.shape_to_type.get(&node.shape) {
            if t == "conditional" && node.prompt.is_some() {
                return "codergen".to_string();
            }
            return t.clone();
        }
        "codergen".to_string()
    }

    pub fn get(&self, handler_type: &str) -> Option<&DynHandler> {
        self.handlers.get(handler_type)
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
// Built-in handlers
// ---------------------------------------------------------------------------

pub struct StartHandler;

#[async_trait]
impl NodeHandler for StartHandler {
    fn handler_type(&self) -> &str {
        "start"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _graph: &PipelineGraph,
        _logs_root: &Path,
        _cancel: &CancellationToken,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline started"))
    }
}

pub struct ExitHandler;

#[async_trait]
impl NodeHandler for ExitHandler {
    fn handler_type(&self) -> &str {
        "exit"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _graph: &PipelineGraph,
        _logs_root: &Path,
        _cancel: &CancellationToken,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Pipeline completed"))
    }
}

pub struct ConditionalHandler;

#[async_trait]
impl NodeHandler for ConditionalHandler {
    fn handler_type(&self) -> &str {
        "conditional"
    }

    async fn execute(
        &self,
        _node: &PipelineNode,
        _ctx: &Context,
        _graph: &PipelineGraph,
        _logs_root: &Path,
        _cancel: &CancellationToken,
    ) -> Result<Outcome> {
        Ok(Outcome::success("Conditional pass-through"))
    }
}

// ---------------------------------------------------------------------------
// Default registry factory
// ---------------------------------------------------------------------------

pub fn default_registry() -> HandlerRegistry {
    let mut reg = HandlerRegistry::new();
    reg.register(StartHandler);
    reg.register(ExitHandler);
    reg.register(ConditionalHandler);
    reg.register(crate::handlers::ToolHandler);
    reg.register(crate::handlers::WorkspaceCreateHandler);
    reg.register(crate::handlers::WorkspaceMergeHandler);
    reg.register(crate::handlers::WorkspaceCleanupHandler);
    reg
}

/// Create the default handler registry with WaitHumanHandler registered.
///
/// This factory function creates a registry with all the standard handlers
/// plus WaitHumanHandler configured with the provided interviewer.
/// Use this when you need to support hexagon (human review) nodes in pipelines.
pub fn default_registry_with_interviewer(
    interviewer: std::sync::Arc<dyn crate::interviewer::Interviewer>,
) -> HandlerRegistry {
    let mut reg = default_registry();
    reg.register(crate::handlers::wait_human::WaitHumanHandler::new(interviewer));
    reg
}

/// Create the default handler registry with CodergenHandler registered against
/// the given LLM backend. Box/cds-shaped (and prompt-bearing conditional) nodes
/// resolve to this handler.
pub fn default_registry_with_llm(
    backend: std::sync::Arc<dyn crate::handlers::codergen_handler::LlmBackend>,
) -> HandlerRegistry {
    let mut reg = default_registry();
    reg.register(crate::handlers::CodergenHandler::new(backend));
    reg
}

/// Create a fully wired registry: codergen backed by `backend`, human review
/// gates backed by `interviewer`.
pub fn full_registry(
    backend: std::sync::Arc<dyn crate::handlers::codergen_handler::LlmBackend>,
    interviewer: std::sync::Arc<dyn crate::interviewer::Interviewer>,
) -> HandlerRegistry {
    let mut reg = default_registry_with_llm(backend);
    reg.register(crate::handlers::wait_human::WaitHumanHandler::new(interviewer));
    reg
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
