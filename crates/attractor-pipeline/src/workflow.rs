//! Declarative v2 workflow surface: the KDL document format, its in-memory
//! [`WorkflowDefinition`] model, and the loader that lowers it to a
//! [`PipelineGraph`].
//!
//! A workflow document declares stages (`llm | tool | human | decision |
//! exit | workspace.*`) and transitions between them. Lowering maps each
//! stage to a node shape/type per the fixed table `llm->box`,
//! `tool->parallelogram`, `human->hexagon`, `decision->diamond`,
//! `exit->Msquare`, `workspace.*->workspace.*`, and synthesizes a leading
//! `Mdiamond` start node pointing at the declared `start` stage. Human
//! options and decision routes become stage-local edges; top-level
//! transitions become global edges. Edge guards are compiled through
//! [`crate::expr_compiler`]; a guard with N DNF disjuncts produces N edges
//! sharing one weight.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use attractor_dot::AttributeValue;
use attractor_types::AttractorError;
use kdl::{KdlDocument, KdlNode, KdlValue};

use crate::expr_compiler::{self, CompiledGuard};
use crate::graph::{PipelineEdge, PipelineGraph, PipelineNode};
use crate::validation::{Diagnostic, Severity};

pub const WORKFLOW_VERSION: i64 = 2;

// ---------------------------------------------------------------------------
// Data model
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum StageKind {
    Llm,
    Tool,
    Human,
    Decision,
    Exit,
    WorkspaceCreate,
    WorkspaceMerge,
    WorkspaceCleanup,
}

impl StageKind {
    fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "llm" => StageKind::Llm,
            "tool" => StageKind::Tool,
            "human" => StageKind::Human,
            "decision" => StageKind::Decision,
            "exit" => StageKind::Exit,
            "workspace.create" => StageKind::WorkspaceCreate,
            "workspace.merge" => StageKind::WorkspaceMerge,
            "workspace.cleanup" => StageKind::WorkspaceCleanup,
            _ => return None,
        })
    }

    /// Node `shape` this stage kind lowers to.
    pub fn shape(&self) -> &'static str {
        match self {
            StageKind::Llm => "box",
            StageKind::Tool => "parallelogram",
            StageKind::Human => "hexagon",
            StageKind::Decision => "diamond",
            StageKind::Exit => "Msquare",
            StageKind::WorkspaceCreate | StageKind::WorkspaceMerge | StageKind::WorkspaceCleanup => {
                "box"
            }
        }
    }

    /// Explicit handler `type` override, set for stages the shape table
    /// alone can't disambiguate (the three workspace kinds all map to the
    /// same generic shape).
    pub fn handler_type(&self) -> Option<&'static str> {
        match self {
            StageKind::WorkspaceCreate => Some("workspace.create"),
            StageKind::WorkspaceMerge => Some("workspace.merge"),
            StageKind::WorkspaceCleanup => Some("workspace.cleanup"),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: i64,
    pub backoff: String,
    pub delay: Option<Duration>,
    pub max_delay: Option<Duration>,
}

#[derive(Debug, Clone)]
pub struct HumanOption {
    pub key: String,
    pub label: String,
    pub to: String,
}

#[derive(Debug, Clone)]
pub struct DecisionRoute {
    pub when: Option<String>,
    pub to: String,
    pub priority: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub from: String,
    pub to: String,
    pub when: Option<String>,
    pub priority: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct ModelProfile {
    pub name: String,
    pub model: Option<String>,
    pub provider: Option<String>,
    pub reasoning_effort: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub id: String,
    pub kind: StageKind,
    pub prompt: Option<String>,
    pub prompt_file: Option<String>,
    pub tool_command: Option<String>,
    pub options: Vec<HumanOption>,
    pub routes: Vec<DecisionRoute>,
    pub retry: Option<RetryPolicy>,
    pub model_profile: Option<String>,
    pub llm_model: Option<String>,
    /// Every other string/bool/int attribute set directly on the stage node
    /// (`goal_gate`, `max_retries`, `timeout`, `workspace_name`, `re_review`,
    /// `auto_status`, ...), carried through to the lowered node untouched.
    pub attrs: HashMap<String, AttributeValue>,
}

#[derive(Debug, Clone, Default)]
pub struct ModelsBlock {
    pub default: Option<String>,
    pub profiles: Vec<ModelProfile>,
}

#[derive(Debug, Clone)]
pub struct WorkflowDefinition {
    pub version: i64,
    pub name: String,
    pub description: Option<String>,
    pub goal: Option<String>,
    pub start: String,
    pub models: ModelsBlock,
    pub stages: Vec<Stage>,
    pub transitions: Vec<Transition>,
}

impl WorkflowDefinition {
    pub fn stage(&self, id: &str) -> Option<&Stage> {
        self.stages.iter().find(|s| s.id == id)
    }
}

// ---------------------------------------------------------------------------
// KDL parsing
// ---------------------------------------------------------------------------

fn parse_err(message: impl Into<String>) -> AttractorError {
    AttractorError::ParseError {
        line: 0,
        col: 0,
        message: message.into(),
        source_snippet: None,
    }
}

fn entry_string(node: &KdlNode, name: &str) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(name))
        .and_then(|e| e.value().as_string().map(String::from))
}

fn entry_int(node: &KdlNode, name: &str) -> Option<i64> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(name))
        .and_then(|e| e.value().as_integer().map(|i| i as i64))
}

fn entry_bool(node: &KdlNode, name: &str) -> Option<bool> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(name))
        .and_then(|e| e.value().as_bool())
}

/// First positional (unnamed) argument on a node, as a string.
fn positional_string(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string().map(String::from))
}

fn kdl_value_to_attr(value: &KdlValue) -> AttributeValue {
    if let Some(s) = value.as_string() {
        AttributeValue::String(s.to_string())
    } else if let Some(b) = value.as_bool() {
        AttributeValue::Boolean(b)
    } else if let Some(i) = value.as_integer() {
        AttributeValue::Integer(i as i64)
    } else if let Some(f) = value.as_float() {
        AttributeValue::Float(f)
    } else {
        AttributeValue::String(value.to_string())
    }
}

/// Every named property on a node, collected as raw attrs for pass-through
/// into the lowered `PipelineNode`. Known keys (`kind`, `to`, `when`,
/// `priority`, ...) are harmless duplicates here; the lowering step reads
/// them through the typed accessors above and this map covers everything
/// else (`goal_gate`, `timeout`, `max_retries`, `workspace_name`, ...).
fn node_attrs(node: &KdlNode) -> HashMap<String, AttributeValue> {
    node.entries()
        .iter()
        .filter_map(|e| {
            let name = e.name()?.value().to_string();
            Some((name, kdl_value_to_attr(e.value())))
        })
        .collect()
}

fn children<'a>(node: &'a KdlNode) -> &'a [KdlNode] {
    node.children().map(|d| d.nodes()).unwrap_or(&[])
}

fn parse_models_block(node: &KdlNode) -> ModelsBlock {
    let mut block = ModelsBlock::default();
    for child in children(node) {
        match child.name().value() {
            "default" => block.default = positional_string(child),
            "profile" => {
                let Some(name) = positional_string(child) else {
                    continue;
                };
                block.profiles.push(ModelProfile {
                    name,
                    model: entry_string(child, "model"),
                    provider: entry_string(child, "provider"),
                    reasoning_effort: entry_string(child, "reasoning_effort"),
                });
            }
            _ => {}
        }
    }
    block
}

fn parse_retry(node: &KdlNode) -> RetryPolicy {
    RetryPolicy {
        max_attempts: entry_int(node, "max_attempts").unwrap_or(0),
        backoff: entry_string(node, "backoff").unwrap_or_else(|| "none".to_string()),
        delay: entry_string(node, "delay").as_deref().and_then(parse_duration_str),
        max_delay: entry_string(node, "max_delay").as_deref().and_then(parse_duration_str),
    }
}

fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(v) = s.strip_suffix("ms") {
        return v.parse::<u64>().ok().map(Duration::from_millis);
    }
    if let Some(v) = s.strip_suffix('s') {
        return v.parse::<f64>().ok().map(Duration::from_secs_f64);
    }
    if let Some(v) = s.strip_suffix('m') {
        return v.parse::<f64>().ok().map(|m| Duration::from_secs_f64(m * 60.0));
    }
    s.parse::<u64>().ok().map(Duration::from_secs)
}

fn parse_stage(node: &KdlNode) -> Result<Stage, AttractorError> {
    let id = positional_string(node)
        .ok_or_else(|| parse_err(format!("stage node '{}' is missing its id argument", node.name().value())))?;
    let kind_str = entry_string(node, "kind")
        .ok_or_else(|| parse_err(format!("stage '{id}' is missing a kind= attribute")))?;
    let kind = StageKind::parse(&kind_str)
        .ok_or_else(|| parse_err(format!("stage '{id}' has unknown kind '{kind_str}'")))?;

    let mut prompt = None;
    let mut prompt_file = None;
    let mut tool_command = entry_string(node, "tool_command");
    let mut options = Vec::new();
    let mut routes = Vec::new();
    let mut retry = None;

    for child in children(node) {
        match child.name().value() {
            "prompt" => prompt = positional_string(child),
            "prompt_file" => prompt_file = positional_string(child),
            "tool_command" => tool_command = positional_string(child).or(tool_command),
            "option" => {
                let Some(key) = positional_string(child) else {
                    continue;
                };
                options.push(HumanOption {
                    label: entry_string(child, "label").unwrap_or_else(|| key.clone()),
                    to: entry_string(child, "to").unwrap_or_default(),
                    key,
                });
            }
            "route" => {
                routes.push(DecisionRoute {
                    when: entry_string(child, "when"),
                    to: entry_string(child, "to").unwrap_or_default(),
                    priority: entry_int(child, "priority"),
                });
            }
            "retry" => retry = Some(parse_retry(child)),
            _ => {}
        }
    }

    let model_profile = entry_string(node, "model_profile");
    let llm_model = entry_string(node, "llm_model").or_else(|| entry_string(node, "model"));

    Ok(Stage {
        id,
        kind,
        prompt,
        prompt_file,
        tool_command,
        options,
        routes,
        retry,
        model_profile,
        llm_model,
        attrs: node_attrs(node),
    })
}

fn parse_transition(node: &KdlNode) -> Transition {
    Transition {
        from: entry_string(node, "from").unwrap_or_default(),
        to: entry_string(node, "to").unwrap_or_default(),
        when: entry_string(node, "when"),
        priority: entry_int(node, "priority"),
    }
}

/// Parse a KDL-encoded workflow document (the `workflow "<name>" { ... }`
/// surface syntax from the system's declarative v2 format) into a
/// [`WorkflowDefinition`].
pub fn parse_workflow(source: &str) -> Result<WorkflowDefinition, AttractorError> {
    let doc: KdlDocument = source
        .parse()
        .map_err(|e| parse_err(format!("KDL syntax error: {e}")))?;

    let workflow_node = doc
        .nodes()
        .iter()
        .find(|n| n.name().value() == "workflow")
        .ok_or_else(|| parse_err("document has no top-level `workflow` node"))?;

    let name = positional_string(workflow_node).unwrap_or_default();
    let mut version = 0;
    let mut description = None;
    let mut goal = None;
    let mut start = None;
    let mut models = ModelsBlock::default();
    let mut stages = Vec::new();
    let mut transitions = Vec::new();

    for child in children(workflow_node) {
        match child.name().value() {
            "version" => {
                version = entry_int(child, "").or_else(|| {
                    child
                        .entries()
                        .first()
                        .and_then(|e| e.value().as_integer())
                        .map(|i| i as i64)
                }).unwrap_or(0);
            }
            "start" => start = positional_string(child),
            "description" => description = positional_string(child),
            "goal" => goal = positional_string(child),
            "models" => models = parse_models_block(child),
            "stage" => stages.push(parse_stage(child)?),
            "transition" => transitions.push(parse_transition(child)),
            _ => {}
        }
    }

    let start = start.ok_or_else(|| parse_err("workflow has no `start` declaration"))?;

    Ok(WorkflowDefinition {
        version,
        name,
        description,
        goal,
        start,
        models,
        stages,
        transitions,
    })
}

// ---------------------------------------------------------------------------
// Validation (workflow_* rules, run before lowering)
// ---------------------------------------------------------------------------

/// Validate a [`WorkflowDefinition`] against the `workflow_*` rule set.
/// These catch malformed declarative documents before they're ever lowered
/// to a graph (duplicate ids, dangling transition endpoints, missing
/// catch-all decision routes, and so on); structural graph properties
/// (reachability, single start/exit, ...) are checked post-lowering by
/// [`crate::validation::validate`].
pub fn validate_workflow(def: &WorkflowDefinition) -> Vec<Diagnostic> {
    let mut diags = Vec::new();
    let diag = |rule: &str, severity: Severity, message: String, node_id: Option<String>| Diagnostic {
        rule: rule.to_string(),
        severity,
        message,
        node_id,
        edge: None,
        fix: None,
    };

    if def.version != WORKFLOW_VERSION {
        diags.push(diag(
            "workflow_version",
            Severity::Error,
            format!("workflow version must be {WORKFLOW_VERSION}, found {}", def.version),
            None,
        ));
    }

    let mut seen_ids = HashSet::new();
    for stage in &def.stages {
        if !seen_ids.insert(stage.id.clone()) {
            diags.push(diag(
                "workflow_duplicate_stage",
                Severity::Error,
                format!("duplicate stage id '{}'", stage.id),
                Some(stage.id.clone()),
            ));
        }
    }

    if !def.stages.iter().any(|s| s.id == def.start) {
        diags.push(diag(
            "workflow_start_exists",
            Severity::Error,
            format!("start references unknown stage '{}'", def.start),
            None,
        ));
    }

    let stage_ids: HashSet<&str> = def.stages.iter().map(|s| s.id.as_str()).collect();

    for t in &def.transitions {
        if !stage_ids.contains(t.from.as_str()) {
            diags.push(diag(
                "workflow_transition_from",
                Severity::Error,
                format!("transition references unknown source stage '{}'", t.from),
                None,
            ));
        }
        if !stage_ids.contains(t.to.as_str()) {
            diags.push(diag(
                "workflow_transition_to",
                Severity::Error,
                format!("transition references unknown target stage '{}'", t.to),
                None,
            ));
        }
        if def.stage(&t.from).map(|s| s.kind == StageKind::Human).unwrap_or(false) {
            diags.push(diag(
                "workflow_routing_partition",
                Severity::Error,
                format!(
                    "global transition originates at human stage '{}'; use stage-local options instead",
                    t.from
                ),
                Some(t.from.clone()),
            ));
        }
        if let Some(ref when) = t.when {
            if let Err(e) = expr_compiler::compile(when) {
                diags.push(diag(
                    "workflow_expression_syntax",
                    Severity::Error,
                    format!("transition {} -> {} has malformed `when`: {e}", t.from, t.to),
                    None,
                ));
            } else if let Ok(refs) = expr_compiler::stage_refs(when) {
                for r in refs {
                    if !stage_ids.contains(r.stage_id.as_str()) {
                        diags.push(diag(
                            "workflow_expression_stage_ref",
                            Severity::Error,
                            format!(
                                "transition {} -> {} references unknown stage '{}'",
                                t.from, t.to, r.stage_id
                            ),
                            None,
                        ));
                    }
                }
            }
        }
    }

    for stage in &def.stages {
        match stage.kind {
            StageKind::Human => {
                if stage.options.len() < 2 {
                    diags.push(diag(
                        "workflow_human_options",
                        Severity::Error,
                        format!("human stage '{}' has fewer than 2 options", stage.id),
                        Some(stage.id.clone()),
                    ));
                }
                for opt in &stage.options {
                    if !stage_ids.contains(opt.to.as_str()) {
                        diags.push(diag(
                            "workflow_transition_to",
                            Severity::Error,
                            format!("option '{}' on stage '{}' targets unknown stage '{}'", opt.key, stage.id, opt.to),
                            Some(stage.id.clone()),
                        ));
                    }
                }
            }
            StageKind::Decision => {
                if !stage.routes.iter().any(|r| r.when.is_none()) {
                    diags.push(diag(
                        "workflow_decision_catch_all",
                        Severity::Error,
                        format!("decision stage '{}' has no unconditional (catch-all) route", stage.id),
                        Some(stage.id.clone()),
                    ));
                }
                for route in &stage.routes {
                    if !stage_ids.contains(route.to.as_str()) {
                        diags.push(diag(
                            "workflow_transition_to",
                            Severity::Error,
                            format!("route on stage '{}' targets unknown stage '{}'", stage.id, route.to),
                            Some(stage.id.clone()),
                        ));
                    }
                    if let Some(ref when) = route.when {
                        if let Err(e) = expr_compiler::compile(when) {
                            diags.push(diag(
                                "workflow_expression_syntax",
                                Severity::Error,
                                format!("route on stage '{}' has malformed `when`: {e}", stage.id),
                                Some(stage.id.clone()),
                            ));
                        } else if let Ok(refs) = expr_compiler::stage_refs(when) {
                            for r in refs {
                                if !stage_ids.contains(r.stage_id.as_str()) {
                                    diags.push(diag(
                                        "workflow_expression_stage_ref",
                                        Severity::Error,
                                        format!(
                                            "route on stage '{}' references unknown stage '{}'",
                                            stage.id, r.stage_id
                                        ),
                                        Some(stage.id.clone()),
                                    ));
                                }
                            }
                        }
                    }
                }
            }
            StageKind::Tool => {
                if stage.tool_command.as_deref().unwrap_or("").trim().is_empty() {
                    diags.push(diag(
                        "workflow_tool_command",
                        Severity::Error,
                        format!("tool stage '{}' has a blank command", stage.id),
                        Some(stage.id.clone()),
                    ));
                }
            }
            StageKind::Llm => {
                if stage.prompt.is_some() && stage.prompt_file.is_some() {
                    diags.push(diag(
                        "workflow_llm_prompt",
                        Severity::Error,
                        format!("llm stage '{}' sets both prompt and prompt_file", stage.id),
                        Some(stage.id.clone()),
                    ));
                }
                if let Some(ref path) = stage.prompt_file {
                    if let Err(msg) = check_prompt_file_path(path) {
                        diags.push(diag(
                            "workflow_prompt_file_path",
                            Severity::Error,
                            format!("llm stage '{}' prompt_file {msg}", stage.id),
                            Some(stage.id.clone()),
                        ));
                    }
                }
            }
            _ => {}
        }

        if let Some(ref profile_name) = stage.model_profile {
            if !def.models.profiles.iter().any(|p| &p.name == profile_name) {
                diags.push(diag(
                    "workflow_model_profile",
                    Severity::Error,
                    format!("stage '{}' references undefined model profile '{}'", stage.id, profile_name),
                    Some(stage.id.clone()),
                ));
            }
        }

        if let Some(ref retry) = stage.retry {
            if retry.max_attempts <= 0 {
                diags.push(diag(
                    "workflow_retry_max_attempts",
                    Severity::Error,
                    format!("stage '{}' retry max_attempts must be a positive integer", stage.id),
                    Some(stage.id.clone()),
                ));
            }
        }
    }

    // workflow_reachable_exit: every exit stage must be reachable by some
    // path of transitions/options/routes starting at `start`.
    if def.stages.iter().any(|s| s.kind == StageKind::Exit) {
        let reachable = reachable_stage_ids(def);
        for stage in def.stages.iter().filter(|s| s.kind == StageKind::Exit) {
            if !reachable.contains(stage.id.as_str()) {
                diags.push(diag(
                    "workflow_reachable_exit",
                    Severity::Error,
                    format!("exit stage '{}' is not reachable from '{}'", stage.id, def.start),
                    Some(stage.id.clone()),
                ));
            }
        }
    }

    diags
}

fn check_prompt_file_path(path: &str) -> Result<(), String> {
    if path.starts_with('/') {
        return Err("must be a relative path".to_string());
    }
    if path.split('/').any(|seg| seg == "..") {
        return Err("must not contain '..'".to_string());
    }
    Ok(())
}

fn reachable_stage_ids(def: &WorkflowDefinition) -> HashSet<&str> {
    let mut adj: HashMap<&str, Vec<&str>> = HashMap::new();
    for t in &def.transitions {
        adj.entry(t.from.as_str()).or_default().push(t.to.as_str());
    }
    for stage in &def.stages {
        for opt in &stage.options {
            adj.entry(stage.id.as_str()).or_default().push(opt.to.as_str());
        }
        for route in &stage.routes {
            adj.entry(stage.id.as_str()).or_default().push(route.to.as_str());
        }
    }
    let mut visited = HashSet::new();
    let mut queue = vec![def.start.as_str()];
    visited.insert(def.start.as_str());
    while let Some(cur) = queue.pop() {
        for &next in adj.get(cur).map(|v| v.as_slice()).unwrap_or(&[]) {
            if visited.insert(next) {
                queue.push(next);
            }
        }
    }
    visited
}

/// Raise on the first `workflow_*` error-severity diagnostic.
pub fn validate_workflow_or_raise(def: &WorkflowDefinition) -> Result<Vec<Diagnostic>, AttractorError> {
    let diags = validate_workflow(def);
    let errors: Vec<_> = diags.iter().filter(|d| d.severity == Severity::Error).collect();
    if !errors.is_empty() {
        let messages: Vec<_> = errors.iter().map(|d| d.message.clone()).collect();
        return Err(AttractorError::ValidationError(messages.join("; ")));
    }
    Ok(diags)
}

// ---------------------------------------------------------------------------
// Lowering: WorkflowDefinition -> PipelineGraph
// ---------------------------------------------------------------------------

const SYNTHETIC_START_ID: &str = "__start__";

/// Weight encoding from §4.1: `priority * 10^6 + (N - index)`, where `N` is
/// the size of the routing group (the stage's options/routes, or the
/// workflow's global transitions) and `index` is this entry's position
/// within that group. Priority dominates; position breaks ties among equal
/// priorities so earlier entries edge out later ones.
fn group_weight(priority: Option<i64>, total: usize, index: usize) -> i32 {
    let p = priority.unwrap_or(0);
    let tiebreak = (total - index) as i64;
    (p * 1_000_000 + tiebreak) as i32
}

fn push_guarded_edges(
    edges: &mut Vec<PipelineEdge>,
    from: &str,
    to: &str,
    when: Option<&str>,
    weight: i32,
) -> Result<(), AttractorError> {
    let guard = match when {
        None | Some("") => CompiledGuard::Unconditional,
        Some(expr) => expr_compiler::compile(expr)?,
    };
    match guard {
        CompiledGuard::Unsatisfiable => {}
        CompiledGuard::Unconditional => {
            edges.push(PipelineEdge {
                from: from.to_string(),
                to: to.to_string(),
                label: None,
                condition: None,
                weight,
                fidelity: None,
                thread_id: None,
                loop_restart: false,
            });
        }
        CompiledGuard::Disjunction(clauses) => {
            for clause in clauses {
                edges.push(PipelineEdge {
                    from: from.to_string(),
                    to: to.to_string(),
                    label: None,
                    condition: Some(clause),
                    weight,
                    fidelity: None,
                    thread_id: None,
                    loop_restart: false,
                });
            }
        }
    }
    Ok(())
}

fn attr_int(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<i64> {
    match attrs.get(key) {
        Some(AttributeValue::Integer(i)) => Some(*i),
        _ => None,
    }
}

fn attr_bool(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<bool> {
    match attrs.get(key) {
        Some(AttributeValue::Boolean(b)) => Some(*b),
        _ => None,
    }
}

fn attr_string(attrs: &HashMap<String, AttributeValue>, key: &str) -> Option<String> {
    match attrs.get(key) {
        Some(AttributeValue::String(s)) => Some(s.clone()),
        _ => None,
    }
}

fn stage_to_node(stage: &Stage, def: &WorkflowDefinition) -> PipelineNode {
    let mut attrs = stage.attrs.clone();
    if let Some(ref prompt) = stage.prompt {
        attrs.insert("prompt".into(), AttributeValue::String(prompt.clone()));
    }
    if let Some(ref pf) = stage.prompt_file {
        attrs.insert("prompt_file".into(), AttributeValue::String(pf.clone()));
    }
    if let Some(ref cmd) = stage.tool_command {
        attrs.insert("tool_command".into(), AttributeValue::String(cmd.clone()));
    }

    // Resolve `model_profile` into concrete llm_model/llm_provider/reasoning_effort
    // at lowering time so the handler only ever sees plain attrs.
    let mut llm_model = stage.llm_model.clone();
    let mut llm_provider = attr_string(&stage.attrs, "llm_provider");
    let mut reasoning_effort = attr_string(&stage.attrs, "reasoning_effort");
    if let Some(ref profile_name) = stage.model_profile {
        if let Some(profile) = def.models.profiles.iter().find(|p| &p.name == profile_name) {
            llm_model = llm_model.or_else(|| profile.model.clone());
            llm_provider = llm_provider.or_else(|| profile.provider.clone());
            reasoning_effort = reasoning_effort.or_else(|| profile.reasoning_effort.clone());
        }
    }
    llm_model = llm_model.or_else(|| def.models.default.clone());

    PipelineNode {
        id: stage.id.clone(),
        label: attr_string(&attrs, "label").unwrap_or_else(|| stage.id.clone()),
        shape: stage.kind.shape().to_string(),
        node_type: stage.kind.handler_type().map(String::from),
        prompt: stage.prompt.clone(),
        max_retries: stage
            .retry
            .as_ref()
            .map(|r| r.max_attempts.max(0) as usize)
            .or_else(|| attr_int(&attrs, "max_retries").map(|v| v.max(0) as usize))
            .unwrap_or(0),
        goal_gate: attr_bool(&attrs, "goal_gate").unwrap_or(false),
        retry_target: attr_string(&attrs, "retry_target"),
        fallback_retry_target: attr_string(&attrs, "fallback_retry_target"),
        fidelity: attr_string(&attrs, "fidelity"),
        thread_id: attr_string(&attrs, "thread_id"),
        classes: Vec::new(),
        timeout: attr_string(&attrs, "timeout").as_deref().and_then(parse_duration_str),
        llm_model,
        llm_provider,
        reasoning_effort,
        auto_status: attr_bool(&attrs, "auto_status").unwrap_or(true),
        allow_partial: attr_bool(&attrs, "allow_partial").unwrap_or(false),
        raw_attrs: attrs,
    }
}

/// Lower a [`WorkflowDefinition`] to the internal [`PipelineGraph`] the
/// engine executes. Adds the synthetic `Mdiamond` start node described in
/// §4.1, one node per stage, and one edge per transition/option/route
/// (after DNF-expanding any guarded routing into multiple edges).
pub fn lower_to_graph(def: &WorkflowDefinition) -> Result<PipelineGraph, AttractorError> {
    let mut nodes = Vec::new();
    let mut edges = Vec::new();

    nodes.push(PipelineNode {
        id: SYNTHETIC_START_ID.to_string(),
        label: "Start".to_string(),
        shape: "Mdiamond".to_string(),
        node_type: Some("start".to_string()),
        prompt: None,
        max_retries: 0,
        goal_gate: false,
        retry_target: None,
        fallback_retry_target: None,
        fidelity: None,
        thread_id: None,
        classes: Vec::new(),
        timeout: None,
        llm_model: None,
        llm_provider: None,
        reasoning_effort: None,
        auto_status: true,
        allow_partial: false,
        raw_attrs: HashMap::new(),
    });
    edges.push(PipelineEdge {
        from: SYNTHETIC_START_ID.to_string(),
        to: def.start.clone(),
        label: None,
        condition: None,
        weight: 0,
        fidelity: None,
        thread_id: None,
        loop_restart: false,
    });

    for stage in &def.stages {
        nodes.push(stage_to_node(stage, def));

        match stage.kind {
            StageKind::Human => {
                let n = stage.options.len();
                for (i, opt) in stage.options.iter().enumerate() {
                    edges.push(PipelineEdge {
                        from: stage.id.clone(),
                        to: opt.to.clone(),
                        label: Some(opt.label.clone()),
                        condition: None,
                        weight: group_weight(None, n, i),
                        fidelity: None,
                        thread_id: None,
                        loop_restart: false,
                    });
                }
            }
            StageKind::Decision => {
                let n = stage.routes.len();
                for (i, route) in stage.routes.iter().enumerate() {
                    let weight = group_weight(route.priority, n, i);
                    push_guarded_edges(&mut edges, &stage.id, &route.to, route.when.as_deref(), weight)?;
                }
            }
            _ => {}
        }
    }

    let n = def.transitions.len();
    for (i, t) in def.transitions.iter().enumerate() {
        let weight = group_weight(t.priority, n, i);
        push_guarded_edges(&mut edges, &t.from, &t.to, t.when.as_deref(), weight)?;
    }

    let mut attrs = HashMap::new();
    if let Some(ref goal) = def.goal {
        attrs.insert("goal".to_string(), AttributeValue::String(goal.clone()));
    }

    Ok(PipelineGraph::from_parts(
        def.name.clone(),
        def.goal.clone().unwrap_or_default(),
        attrs,
        nodes,
        edges,
    ))
}

/// Parse and lower a KDL workflow document in one step.
pub fn load(source: &str) -> Result<PipelineGraph, AttractorError> {
    let def = parse_workflow(source)?;
    lower_to_graph(&def)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const LINEAR: &str = r#"
workflow "demo" {
    version 2
    start "work"
    goal "Ship the feature"
    stage "work" kind="llm" {
        prompt "Do the work"
    }
    stage "done" kind="exit"
    transition from="work" to="done"
}
"#;

    #[test]
    fn parses_minimal_linear_workflow() {
        let def = parse_workflow(LINEAR).unwrap();
        assert_eq!(def.version, 2);
        assert_eq!(def.name, "demo");
        assert_eq!(def.start, "work");
        assert_eq!(def.stages.len(), 2);
        assert_eq!(def.transitions.len(), 1);
    }

    #[test]
    fn lowers_linear_workflow_with_synthetic_start() {
        let def = parse_workflow(LINEAR).unwrap();
        let graph = lower_to_graph(&def).unwrap();
        assert!(graph.start_node().is_some());
        assert_eq!(graph.start_node().unwrap().id, SYNTHETIC_START_ID);
        let work = graph.node("work").unwrap();
        assert_eq!(work.shape, "box");
        assert_eq!(work.prompt.as_deref(), Some("Do the work"));
        let done = graph.node("done").unwrap();
        assert_eq!(done.shape, "Msquare");
        let edges = graph.outgoing_edges("work");
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to, "done");
    }

    #[test]
    fn validate_workflow_flags_missing_version() {
        let mut def = parse_workflow(LINEAR).unwrap();
        def.version = 1;
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_version" && d.severity == Severity::Error));
    }

    #[test]
    fn validate_workflow_flags_duplicate_stage() {
        let mut def = parse_workflow(LINEAR).unwrap();
        let dup = def.stages[0].clone();
        def.stages.push(dup);
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_duplicate_stage"));
    }

    #[test]
    fn validate_workflow_flags_missing_start() {
        let mut def = parse_workflow(LINEAR).unwrap();
        def.start = "nope".to_string();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_start_exists"));
    }

    const WITH_HUMAN_AND_DECISION: &str = r#"
workflow "review-flow" {
    version 2
    start "plan"
    stage "plan" kind="llm" {
        prompt "Plan the change"
    }
    stage "gate" kind="human" {
        option "approve" label="Approve" to="ship"
        option "revise" label="Revise" to="plan"
    }
    stage "check" kind="decision" {
        route when="outcome(\"plan\") == \"success\"" to="gate" priority=1
        route to="plan"
    }
    stage "ship" kind="exit"
    transition from="plan" to="check"
}
"#;

    #[test]
    fn human_options_become_labeled_edges() {
        let def = parse_workflow(WITH_HUMAN_AND_DECISION).unwrap();
        let graph = lower_to_graph(&def).unwrap();
        let edges = graph.outgoing_edges("gate");
        assert_eq!(edges.len(), 2);
        assert!(edges.iter().any(|e| e.to == "ship" && e.label.as_deref() == Some("Approve")));
        assert!(edges.iter().any(|e| e.to == "plan" && e.label.as_deref() == Some("Revise")));
    }

    #[test]
    fn decision_routes_compile_guards_and_catch_all() {
        let def = parse_workflow(WITH_HUMAN_AND_DECISION).unwrap();
        let diags = validate_workflow(&def);
        assert!(
            !diags.iter().any(|d| d.rule == "workflow_decision_catch_all"),
            "expected no catch-all diagnostic, got {diags:?}"
        );
        let graph = lower_to_graph(&def).unwrap();
        let edges = graph.outgoing_edges("check");
        assert_eq!(edges.len(), 2);
        let guarded = edges.iter().find(|e| e.to == "gate").unwrap();
        assert!(guarded.condition.is_some());
        let catch_all = edges.iter().find(|e| e.to == "plan").unwrap();
        assert!(catch_all.condition.is_none());
    }

    #[test]
    fn decision_without_catch_all_is_flagged() {
        let src = r#"
workflow "no-catch-all" {
    version 2
    start "check"
    stage "check" kind="decision" {
        route when="outcome(\"check\") == \"success\"" to="done"
    }
    stage "done" kind="exit"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_decision_catch_all"));
    }

    #[test]
    fn human_stage_under_two_options_is_flagged() {
        let src = r#"
workflow "bad-gate" {
    version 2
    start "gate"
    stage "gate" kind="human" {
        option "ok" label="OK" to="done"
    }
    stage "done" kind="exit"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_human_options"));
    }

    #[test]
    fn tool_stage_blank_command_is_flagged() {
        let src = r#"
workflow "bad-tool" {
    version 2
    start "t"
    stage "t" kind="tool"
    stage "done" kind="exit"
    transition from="t" to="done"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_tool_command"));
    }

    #[test]
    fn llm_stage_with_both_prompt_forms_is_flagged() {
        let src = r#"
workflow "bad-llm" {
    version 2
    start "w"
    stage "w" kind="llm" {
        prompt "inline"
        prompt_file "prompts/w.md"
    }
    stage "done" kind="exit"
    transition from="w" to="done"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_llm_prompt"));
    }

    #[test]
    fn prompt_file_path_traversal_is_flagged() {
        let src = r#"
workflow "bad-path" {
    version 2
    start "w"
    stage "w" kind="llm" {
        prompt_file "../secrets.md"
    }
    stage "done" kind="exit"
    transition from="w" to="done"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_prompt_file_path"));
    }

    #[test]
    fn model_profile_resolution() {
        let src = r#"
workflow "with-models" {
    version 2
    start "w"
    models {
        default "claude-sonnet"
        profile "fast" model="claude-haiku" provider="anthropic" reasoning_effort="low"
    }
    stage "w" kind="llm" model_profile="fast" {
        prompt "Go"
    }
    stage "done" kind="exit"
    transition from="w" to="done"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(!diags.iter().any(|d| d.rule == "workflow_model_profile"));
        let graph = lower_to_graph(&def).unwrap();
        let node = graph.node("w").unwrap();
        assert_eq!(node.llm_model.as_deref(), Some("claude-haiku"));
        assert_eq!(node.llm_provider.as_deref(), Some("anthropic"));
        assert_eq!(node.reasoning_effort.as_deref(), Some("low"));
    }

    #[test]
    fn undefined_model_profile_is_flagged() {
        let src = r#"
workflow "bad-profile" {
    version 2
    start "w"
    stage "w" kind="llm" model_profile="ghost" {
        prompt "Go"
    }
    stage "done" kind="exit"
    transition from="w" to="done"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_model_profile"));
    }

    #[test]
    fn unreachable_exit_is_flagged() {
        let src = r#"
workflow "stranded-exit" {
    version 2
    start "w"
    stage "w" kind="llm" {
        prompt "Go"
    }
    stage "done" kind="exit"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_reachable_exit"));
    }

    #[test]
    fn global_transition_from_human_stage_is_flagged() {
        let src = r#"
workflow "bad-routing" {
    version 2
    start "gate"
    stage "gate" kind="human" {
        option "a" label="A" to="done"
        option "b" label="B" to="done"
    }
    stage "done" kind="exit"
    transition from="gate" to="done"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_routing_partition"));
    }

    #[test]
    fn retry_policy_lowers_to_max_retries() {
        let src = r#"
workflow "retry-demo" {
    version 2
    start "w"
    stage "w" kind="llm" {
        prompt "Go"
        retry max_attempts=3 backoff="exponential" delay="1s" max_delay="30s"
    }
    stage "done" kind="exit"
    transition from="w" to="done"
}
"#;
        let def = parse_workflow(src).unwrap();
        let graph = lower_to_graph(&def).unwrap();
        assert_eq!(graph.node("w").unwrap().max_retries, 3);
    }

    #[test]
    fn zero_max_attempts_is_flagged() {
        let src = r#"
workflow "bad-retry" {
    version 2
    start "w"
    stage "w" kind="llm" {
        prompt "Go"
        retry max_attempts=0
    }
    stage "done" kind="exit"
    transition from="w" to="done"
}
"#;
        let def = parse_workflow(src).unwrap();
        let diags = validate_workflow(&def);
        assert!(diags.iter().any(|d| d.rule == "workflow_retry_max_attempts"));
    }
}
