//! Pipeline execution engine, node handlers, validation, and edge selection.
//!
//! This crate implements the core Attractor pipeline runner: DOT graph traversal,
//! handler dispatch, edge selection, goal gate enforcement, checkpoint/resume,
//! and the built-in lint rules.

pub mod checkpoint;
pub mod condition;
pub mod edge_selection;
pub mod engine;
pub mod events;
pub mod expr_compiler;
pub mod goal_gate;
pub mod graph;
pub mod handler;
pub mod handlers;
pub mod interviewer;
pub mod jj_runner;
pub mod retry;
pub mod stylesheet;
pub mod tool_failure;
pub mod transforms;
pub mod usage;
pub mod validation;
pub mod workflow;

pub use checkpoint::{clear_checkpoint, load_checkpoint, save_checkpoint};
pub use condition::{evaluate_condition, parse_condition, Clause, ConditionExpr, Operator};
pub use edge_selection::select_edge;
pub use events::{EventEmitter, PipelineEvent};
pub use expr_compiler::{compile, stage_refs, CompiledGuard, StageRef, StageRefKind, MAX_DISJUNCTS};
pub use goal_gate::{check_goal_gates, enforce_goal_gates, GoalGateResult};
pub use graph::{PipelineEdge, PipelineGraph, PipelineNode};
pub use handler::{
    default_registry, default_registry_with_interviewer, default_registry_with_llm, full_registry,
    ConditionalHandler, DynHandler, ExitHandler, HandlerRegistry, NodeHandler, StartHandler,
};
pub use handlers::codergen_handler::LlmBackend;
pub use handlers::wait_human::WaitHumanHandler;
pub use handlers::{
    CodergenHandler, ToolHandler, WorkspaceCleanupHandler, WorkspaceCreateHandler,
    WorkspaceMergeHandler,
};
pub use interviewer::{
    Answer, AutoApproveInterviewer, ConsoleInterviewer, Interviewer, Question, RecordingInterviewer,
};
pub use engine::{PipelineConfig, PipelineExecutor, PipelineOutcome, RunStatus};
pub use jj_runner::{JjRunner, Runner};
pub use retry::{execute_with_retry, BackoffPolicy};
pub use stylesheet::{apply_stylesheet, parse_stylesheet, Declaration, Rule, Selector, Stylesheet};
pub use tool_failure::build as build_tool_failure;
pub use transforms::{apply_transforms, expand_variables, expand_runtime_vars};
pub use usage::UsageTotals;
pub use validation::{validate, validate_or_raise, Diagnostic, LintRule, Severity};
pub use workflow::{
    load as load_workflow, lower_to_graph, parse_workflow, validate_workflow,
    validate_workflow_or_raise, DecisionRoute, HumanOption, ModelProfile, Stage, StageKind,
    Transition, WorkflowDefinition,
};
