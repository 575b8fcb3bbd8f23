//! Pipeline execution engine — the core traversal loop.
//!
//! Single-threaded and cooperative: handler I/O yields the executor, nothing
//! runs concurrently within one run. See the module-level steps mirrored in
//! [`PipelineExecutor::run`]'s doc comment for the full lifecycle.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use attractor_dot::AttributeValue;
use attractor_types::{
    AttractorError, CancellationToken, Checkpoint, Context, Outcome, Result, StageStatus,
};

use crate::checkpoint::{clear_checkpoint, save_checkpoint};
use crate::edge_selection::select_edge;
use crate::events::{EventEmitter, PipelineEvent};
use crate::goal_gate::enforce_goal_gates;
use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::{default_registry, HandlerRegistry};
use crate::handlers::wait_human::PENDING_RE_REVIEWS_KEY;
use crate::handlers::workspace::emergency_cleanup;
use crate::jj_runner::{JjRunner, Runner};
use crate::retry::BackoffPolicy;
use crate::usage::UsageTotals;
use crate::validation::validate_or_raise;

/// Protocol/transient failure classes that the retry policy treats the same
/// as an explicit `retry` status (spec's "missing_status_marker",
/// "tool_result_skipped", "empty_response").
const TRANSIENT_FAILURE_CLASSES: &[&str] =
    &["missing_status_marker", "tool_result_skipped", "empty_response"];

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

/// The core pipeline executor. Owns a handler registry and drives graph traversal.
pub struct PipelineExecutor {
    registry: HandlerRegistry,
}

/// Configuration for a single pipeline run.
pub struct PipelineConfig {
    /// Directory artifacts and checkpoints are written under.
    pub logs_root: PathBuf,
    /// Resume from a previously-saved checkpoint.
    pub checkpoint: Option<Checkpoint>,
    /// Cooperative cancellation signal, checked at the top of every loop
    /// iteration and passed through to handlers.
    pub abort_signal: CancellationToken,
    /// Observability sink; events are dropped if nothing subscribes.
    pub events: EventEmitter,
    /// Whether a catastrophic failure with no matching edge should trigger
    /// emergency workspace teardown before returning.
    pub cleanup_workspace_on_failure: bool,
    /// Source-control runner used by the emergency cleanup hook.
    pub jj_runner: Arc<dyn Runner>,
    /// Fallback retry ceiling for nodes that don't set `max_retries` and
    /// whose graph has no `default_max_retry` attribute.
    pub default_max_retries: usize,
    pub backoff: BackoffPolicy,
    /// Initial key/value pairs seeded into Context before the graph's own
    /// attrs are layered in (e.g. `workdir`, `dry_run`, CLI-provided budgets).
    pub initial_context: HashMap<String, serde_json::Value>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            logs_root: PathBuf::from("./logs"),
            checkpoint: None,
            abort_signal: CancellationToken::new(),
            events: EventEmitter::default(),
            cleanup_workspace_on_failure: false,
            jj_runner: Arc::new(JjRunner::new()),
            default_max_retries: 0,
            backoff: BackoffPolicy::default(),
            initial_context: HashMap::new(),
        }
    }
}

/// Terminal status of a completed, failed, or cancelled run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Success,
    Fail,
    Cancelled,
}

/// The result of a pipeline execution.
#[derive(Debug, Clone)]
pub struct PipelineOutcome {
    pub status: RunStatus,
    pub completed_nodes: Vec<String>,
    pub last_outcome: Option<Outcome>,
    pub failure_summary: Option<String>,
    pub usage_summary: UsageTotals,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Convert an `attractor_dot::AttributeValue` to a `serde_json::Value`.
fn attr_to_json(val: &AttributeValue) -> serde_json::Value {
    match val {
        AttributeValue::String(s) => serde_json::Value::String(s.clone()),
        AttributeValue::Integer(i) => serde_json::json!(*i),
        AttributeValue::Float(f) => serde_json::json!(*f),
        AttributeValue::Boolean(b) => serde_json::Value::Bool(*b),
        AttributeValue::Duration(d) => serde_json::json!(d.as_millis() as u64),
    }
}

/// Map a `StageStatus` to the lowercase string used in edge conditions.
fn status_to_string(status: StageStatus) -> String {
    match status {
        StageStatus::Success => "success".to_string(),
        StageStatus::PartialSuccess => "partial_success".to_string(),
        StageStatus::Retry => "retry".to_string(),
        StageStatus::Fail => "fail".to_string(),
        StageStatus::Skipped => "skipped".to_string(),
        StageStatus::Cancelled => "cancelled".to_string(),
    }
}

/// `node.attrs.max_retries ?? graph.attrs.default_max_retry ?? 0`. Reads the
/// raw attribute maps directly since `PipelineNode::max_retries` already
/// defaults absence to `0`, collapsing the distinction this fallback needs.
fn max_retries_for(node: &PipelineNode, graph: &PipelineGraph) -> usize {
    if let Some(AttributeValue::Integer(i)) = node.raw_attrs.get("max_retries") {
        return (*i).max(0) as usize;
    }
    if let Some(AttributeValue::Integer(i)) = graph.attrs.get("default_max_retry") {
        return (*i).max(0) as usize;
    }
    0
}

/// Stringify a context value the way edge guard clauses compare it: raw
/// string contents unquoted, everything else via its JSON text form.
fn json_value_to_plain_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn is_transient(outcome: &Outcome) -> bool {
    matches!(outcome.status, StageStatus::Fail | StageStatus::PartialSuccess)
        && outcome
            .failure_class
            .as_deref()
            .map(|c| TRANSIENT_FAILURE_CLASSES.contains(&c))
            .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// PipelineExecutor
// ---------------------------------------------------------------------------

impl PipelineExecutor {
    /// Create an executor with the given handler registry.
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Create an executor pre-loaded with the default built-in handlers.
    pub fn with_default_registry() -> Self {
        Self {
            registry: default_registry(),
        }
    }

    /// Run a node's handler to completion, retrying on `retry`-status
    /// outcomes, transient failure classes, and retryable errors, up to
    /// `max_retries` additional attempts with cancellable backoff.
    async fn execute_with_retry(
        &self,
        handler: &crate::handler::DynHandler,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: &std::path::Path,
        cancel: &CancellationToken,
        max_retries: usize,
        backoff: &BackoffPolicy,
        events: &EventEmitter,
    ) -> Result<Outcome> {
        let mut attempt = 0usize;
        loop {
            if cancel.is_cancelled() {
                return Ok(Outcome::cancelled());
            }
            match handler.execute(node, context, graph, logs_root, cancel).await {
                Ok(outcome) => {
                    let retry_eligible =
                        outcome.status == StageStatus::Retry || is_transient(&outcome);
                    if !retry_eligible || attempt >= max_retries {
                        return Ok(outcome);
                    }
                    events.emit(PipelineEvent::StageRetrying {
                        node_id: node.id.clone(),
                        attempt: attempt + 1,
                    });
                    let delay = backoff.delay_for_attempt(attempt);
                    if !cancel.sleep_or_cancel(delay).await {
                        return Ok(Outcome::cancelled());
                    }
                }
                Err(e) => {
                    if e.is_retryable() && attempt < max_retries {
                        events.emit(PipelineEvent::StageRetrying {
                            node_id: node.id.clone(),
                            attempt: attempt + 1,
                        });
                        let delay = backoff.delay_for_attempt(attempt);
                        if !cancel.sleep_or_cancel(delay).await {
                            return Err(e);
                        }
                    } else {
                        return Err(e);
                    }
                }
            }
            attempt += 1;
        }
    }

    /// Run the full engine loop on `graph` starting from `config`.
    pub async fn run(&self, graph: &PipelineGraph, config: PipelineConfig) -> Result<PipelineOutcome> {
        validate_or_raise(graph)?;

        let context = Context::new();
        for (key, value) in &config.initial_context {
            context.set(key.clone(), value.clone()).await;
        }
        for (key, val) in &graph.attrs {
            context.set(key.clone(), attr_to_json(val)).await;
        }

        let mut completed_nodes: Vec<String> = Vec::new();
        let mut node_outcomes: HashMap<String, Outcome> = HashMap::new();
        let mut usage_summary = UsageTotals::new();

        // Step 1: hydrate from checkpoint, or start fresh.
        let start_id = if let Some(ref cp) = config.checkpoint {
            for (key, value) in &cp.context_values {
                context.set(key.clone(), value.clone()).await;
            }
            for entry in &cp.logs {
                context.append_log(entry.clone()).await;
            }
            completed_nodes = cp.completed_nodes.clone();
            let resume_id = cp
                .next_node
                .clone()
                .or_else(|| cp.resume_at.clone())
                .unwrap_or_else(|| cp.current_node.clone());
            config.events.emit(PipelineEvent::PipelineResumed {
                pipeline_name: graph.name.clone(),
                resume_at: resume_id.clone(),
            });
            resume_id
        } else {
            let start = graph.start_node().ok_or_else(|| {
                AttractorError::ValidationError("No start node found".into())
            })?;
            config.events.emit(PipelineEvent::PipelineStarted {
                pipeline_name: graph.name.clone(),
                node_count: graph.all_nodes().count(),
            });
            start.id.clone()
        };

        let mut current_id = start_id;

        loop {
            // Step 2: abort check.
            if config.abort_signal.is_cancelled() {
                config.events.emit(PipelineEvent::PipelineCancelled {
                    pipeline_name: graph.name.clone(),
                    node_id: current_id.clone(),
                });
                let checkpoint = Checkpoint {
                    timestamp: chrono::Utc::now(),
                    current_node: current_id.clone(),
                    resume_at: None,
                    next_node: None,
                    completed_nodes: completed_nodes.clone(),
                    node_retries: HashMap::new(),
                    context_values: context.snapshot().await,
                    logs: Vec::new(),
                };
                let _ = save_checkpoint(&checkpoint, &config.logs_root).await;
                return Ok(PipelineOutcome {
                    status: RunStatus::Cancelled,
                    completed_nodes,
                    last_outcome: None,
                    failure_summary: None,
                    usage_summary,
                });
            }

            let current_node = graph.node(&current_id).ok_or_else(|| {
                AttractorError::Other(format!("Node '{current_id}' not found", ))
            })?;

            // Step 3: resolve handler.
            let handler_type = self.registry.resolve_type(current_node);
            let handler = self.registry.get(&handler_type).ok_or_else(|| {
                AttractorError::HandlerError {
                    handler: handler_type.clone(),
                    node: current_node.id.clone(),
                    message: format!("No handler registered for type '{handler_type}'"),
                }
            })?;
            config.events.emit(PipelineEvent::StageStarted {
                node_id: current_node.id.clone(),
                handler_type: handler_type.clone(),
            });

            let stage_start = std::time::Instant::now();

            // Step 4: execute with retry policy.
            let max_retries = max_retries_for(current_node, graph);
            let outcome = self
                .execute_with_retry(
                    handler,
                    current_node,
                    &context,
                    graph,
                    &config.logs_root,
                    &config.abort_signal,
                    max_retries,
                    &config.backoff,
                    &config.events,
                )
                .await?;

            if outcome.status == StageStatus::Cancelled {
                config.events.emit(PipelineEvent::PipelineCancelled {
                    pipeline_name: graph.name.clone(),
                    node_id: current_node.id.clone(),
                });
                let checkpoint = Checkpoint {
                    timestamp: chrono::Utc::now(),
                    current_node: current_node.id.clone(),
                    resume_at: None,
                    next_node: None,
                    completed_nodes: completed_nodes.clone(),
                    node_retries: HashMap::new(),
                    context_values: context.snapshot().await,
                    logs: Vec::new(),
                };
                let _ = save_checkpoint(&checkpoint, &config.logs_root).await;
                return Ok(PipelineOutcome {
                    status: RunStatus::Cancelled,
                    completed_nodes,
                    last_outcome: Some(outcome),
                    failure_summary: None,
                    usage_summary,
                });
            }

            // Usage accounting.
            if let Some(usage) = outcome.usage.clone() {
                usage_summary.record(current_node.id.clone(), max_retries + 1, usage.clone());
                config.events.emit(PipelineEvent::UsageUpdate {
                    node_id: current_node.id.clone(),
                    usage,
                    total: usage_summary.totals,
                });
            }

            // Step 5: merge context_updates, reserved keys.
            context.apply_updates(outcome.context_updates.clone()).await;
            context
                .set("outcome", serde_json::Value::String(status_to_string(outcome.status)))
                .await;
            context.set("last_stage", serde_json::Value::String(current_node.id.clone())).await;
            context
                .set(
                    "last_response",
                    serde_json::Value::String(
                        outcome
                            .failure_reason
                            .clone()
                            .unwrap_or_else(|| outcome.notes.clone()),
                    ),
                )
                .await;
            if let Some(ref label) = outcome.preferred_label {
                context
                    .set("preferred_label", serde_json::Value::String(label.clone()))
                    .await;
            }
            if matches!(outcome.status, StageStatus::Fail | StageStatus::PartialSuccess) {
                let mut findings: Vec<serde_json::Value> = context
                    .get("review.findings")
                    .await
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                findings.push(serde_json::json!({
                    "node": current_node.id,
                    "status": status_to_string(outcome.status),
                    "reason": outcome.failure_reason.clone(),
                    "notes": outcome.notes,
                }));
                context
                    .set("review.findings", serde_json::to_value(&findings).unwrap_or_default())
                    .await;
            }

            completed_nodes.push(current_node.id.clone());
            node_outcomes.insert(current_node.id.clone(), outcome.clone());

            let duration_ms = stage_start.elapsed().as_millis() as u64;

            // Step 6: stage_completed / stage_failed.
            if outcome.status == StageStatus::Fail {
                config.events.emit(PipelineEvent::StageFailed {
                    node_id: current_node.id.clone(),
                    error: outcome.failure_reason.clone().unwrap_or_default(),
                });
            } else {
                config.events.emit(PipelineEvent::StageCompleted {
                    node_id: current_node.id.clone(),
                    status: status_to_string(outcome.status),
                    duration_ms,
                });
            }

            // Step 7: select next edge.
            let resolve_outcome = outcome.clone();
            let resolve_preferred = outcome.preferred_label.clone().unwrap_or_default();
            let context_snapshot = context.snapshot().await;
            let resolve = |key: &str| -> String {
                match key {
                    "outcome" => status_to_string(resolve_outcome.status),
                    "preferred_label" => resolve_preferred.clone(),
                    _ => {
                        let lookup = key.strip_prefix("context.").unwrap_or(key);
                        context_snapshot
                            .get(lookup)
                            .map(json_value_to_plain_string)
                            .unwrap_or_default()
                    }
                }
            };
            let next_edge = select_edge(&current_node.id, &outcome, &resolve, graph);

            // Step 7f: re-review redirection. If a human gate recorded this
            // edge's target as pending re-review, the run must pass back
            // through that gate before reaching it again.
            let mut redirect_to: Option<String> = None;
            if let Some(edge) = next_edge {
                let pending: HashMap<String, Vec<String>> = context
                    .get(PENDING_RE_REVIEWS_KEY)
                    .await
                    .and_then(|v| serde_json::from_value(v).ok())
                    .unwrap_or_default();
                for (gate_id, targets) in &pending {
                    if gate_id != &current_node.id && targets.contains(&edge.to) {
                        redirect_to = Some(gate_id.clone());
                        break;
                    }
                }
            }

            // Step 7g / exit handling.
            let is_exit = current_node.shape == "Msquare";
            if is_exit {
                let gate_result = enforce_goal_gates(graph, &node_outcomes)?;
                if !gate_result.all_satisfied {
                    if let Some(target) = gate_result.retry_target {
                        current_id = target;
                        continue;
                    }
                }
                clear_checkpoint(&config.logs_root).await.ok();
                config.events.emit(PipelineEvent::PipelineCompleted {
                    pipeline_name: graph.name.clone(),
                    completed_nodes: completed_nodes.clone(),
                    duration_ms,
                });
                return Ok(PipelineOutcome {
                    status: RunStatus::Success,
                    completed_nodes,
                    last_outcome: Some(outcome),
                    failure_summary: None,
                    usage_summary,
                });
            }

            match next_edge {
                Some(edge) => {
                    let next_id = redirect_to.unwrap_or_else(|| edge.to.clone());

                    config.events.emit(PipelineEvent::EdgeSelected {
                        from_node: current_node.id.clone(),
                        to_node: next_id.clone(),
                        edge_label: edge.label.clone(),
                    });

                    if edge.loop_restart {
                        completed_nodes.clear();
                        node_outcomes.clear();
                    }
                    if graph.node(&next_id).is_none() {
                        return Err(AttractorError::Other(format!(
                            "Edge target '{next_id}' not found"
                        )));
                    }

                    // Step 9: persist checkpoint, then advance.
                    let checkpoint = Checkpoint {
                        timestamp: chrono::Utc::now(),
                        current_node: current_node.id.clone(),
                        resume_at: None,
                        next_node: Some(next_id.clone()),
                        completed_nodes: completed_nodes.clone(),
                        node_retries: HashMap::new(),
                        context_values: context.snapshot().await,
                        logs: Vec::new(),
                    };
                    save_checkpoint(&checkpoint, &config.logs_root).await?;
                    config.events.emit(PipelineEvent::CheckpointSaved {
                        node_id: current_node.id.clone(),
                    });

                    current_id = next_id;
                }
                None => {
                    if current_node.goal_gate && outcome.status != StageStatus::Success {
                        let gate_result = enforce_goal_gates(graph, &node_outcomes)?;
                        if let Some(target) = gate_result.retry_target {
                            current_id = target;
                            continue;
                        }
                    }

                    if outcome.status == StageStatus::Fail {
                        if config.cleanup_workspace_on_failure {
                            if let Some(name) = context
                                .get("workspace.name")
                                .await
                                .and_then(|v| v.as_str().map(String::from))
                            {
                                if let Some(repo_root) = context
                                    .get("workspace.repo_root")
                                    .await
                                    .and_then(|v| v.as_str().map(PathBuf::from))
                                {
                                    let path = context
                                        .get("workspace.path")
                                        .await
                                        .and_then(|v| v.as_str().map(PathBuf::from));
                                    let warnings = emergency_cleanup(
                                        config.jj_runner.as_ref(),
                                        &repo_root,
                                        &name,
                                        path.as_deref(),
                                    )
                                    .await;
                                    for warning in warnings {
                                        tracing::warn!(%warning, "emergency workspace cleanup");
                                    }
                                }
                            }
                        }

                        config.events.emit(PipelineEvent::PipelineFailed {
                            pipeline_name: graph.name.clone(),
                            error: outcome.failure_reason.clone().unwrap_or_default(),
                        });
                        return Ok(PipelineOutcome {
                            status: RunStatus::Fail,
                            completed_nodes,
                            failure_summary: outcome.failure_reason.clone(),
                            last_outcome: Some(outcome),
                            usage_summary,
                        });
                    }
                    // No outgoing edge, terminal-ish success: treat as completion.
                    clear_checkpoint(&config.logs_root).await.ok();
                    config.events.emit(PipelineEvent::PipelineCompleted {
                        pipeline_name: graph.name.clone(),
                        completed_nodes: completed_nodes.clone(),
                        duration_ms,
                    });
                    return Ok(PipelineOutcome {
                        status: RunStatus::Success,
                        completed_nodes,
                        last_outcome: Some(outcome),
                        failure_summary: None,
                        usage_summary,
                    });
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
