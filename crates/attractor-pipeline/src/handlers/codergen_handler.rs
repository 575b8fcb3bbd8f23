//! CodergenHandler — drives an LLM backend for coding/authoring stages.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use attractor_dot::AttributeValue;
use attractor_types::{CancellationToken, Context, Outcome, Result, StageStatus, Usage};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;
use crate::transforms::expand_runtime_vars;

/// What an [`LlmBackend`] run produced: plain text (parsed by the handler for
/// status markers) or an [`Outcome`] the backend has already fully formed.
pub enum LlmRunResult {
    Text(String),
    Outcome(Box<Outcome>),
}

/// Options threaded through to a backend invocation.
pub struct LlmRunOptions<'a> {
    pub signal: &'a CancellationToken,
}

/// Abstract LLM invocation capability. Implementations wrap a concrete
/// provider (see `attractor_llm::DynProvider`) and may stream intermediate
/// agent events out-of-band; the handler only consumes the final result.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    async fn run(
        &self,
        node: &PipelineNode,
        prompt: &str,
        context: &Context,
        opts: LlmRunOptions<'_>,
    ) -> Result<LlmRunResult>;
}

pub struct CodergenHandler {
    backend: Arc<dyn LlmBackend>,
}

impl CodergenHandler {
    pub fn new(backend: Arc<dyn LlmBackend>) -> Self {
        Self { backend }
    }

    fn prompt_file_paths(node: &PipelineNode) -> Vec<String> {
        node.raw_attrs
            .get("prompt_file")
            .and_then(|v| match v {
                AttributeValue::String(s) => Some(s.clone()),
                _ => None,
            })
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn load_prompt_files(paths: &[String]) -> String {
        let mut out = String::new();
        for path in paths {
            match std::fs::read_to_string(path) {
                Ok(contents) => {
                    out.push_str(&contents);
                    if !out.ends_with('\n') {
                        out.push('\n');
                    }
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "Failed to load prompt file");
                }
            }
        }
        out
    }
}

/// Parsed status markers stripped from the tail of a response.
struct ParsedStatus {
    status: Option<StageStatus>,
    failure_reason: Option<String>,
    preferred_label: Option<String>,
    next_ids: Vec<String>,
    /// The response text with the trailing marker block removed.
    body: String,
}

fn parse_status_markers(text: &str) -> ParsedStatus {
    let status_re = regex::Regex::new(r"(?m)^\s*\[STATUS:\s*(success|fail|partial_success)\s*\]\s*$").unwrap();
    let reason_re = regex::Regex::new(r"(?m)^\s*\[FAILURE_REASON:\s*(.*?)\s*\]\s*$").unwrap();
    let label_re = regex::Regex::new(r"(?m)^\s*\[PREFERRED_LABEL:\s*(.*?)\s*\]\s*$").unwrap();
    let next_re = regex::Regex::new(r"(?m)^\s*\[NEXT:\s*(.*?)\s*\]\s*$").unwrap();

    let status = status_re.captures(text).map(|c| match &c[1] {
        "success" => StageStatus::Success,
        "fail" => StageStatus::Fail,
        "partial_success" => StageStatus::PartialSuccess,
        _ => unreachable!(),
    });
    let failure_reason = reason_re.captures(text).map(|c| c[1].to_string());
    let preferred_label = label_re.captures(text).map(|c| c[1].to_string());
    let next_ids: Vec<String> = next_re
        .captures_iter(text)
        .map(|c| c[1].to_string())
        .collect();

    let mut body = text.to_string();
    for re in [&status_re, &reason_re, &label_re, &next_re] {
        body = re.replace_all(&body, "").to_string();
    }
    let body = body.trim_end().to_string();

    ParsedStatus {
        status,
        failure_reason,
        preferred_label,
        next_ids,
        body,
    }
}

#[async_trait]
impl NodeHandler for CodergenHandler {
    fn handler_type(&self) -> &str {
        "codergen"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::cancelled());
        }

        let base_prompt = node.prompt.clone().unwrap_or_default();
        let expanded = expand_runtime_vars(&base_prompt, &graph.goal, context).await;

        let file_paths = Self::prompt_file_paths(node);
        let file_contents = Self::load_prompt_files(&file_paths);
        let prompt = if file_contents.is_empty() {
            expanded
        } else {
            format!("{file_contents}\n{expanded}")
        };

        let node_dir = logs_root.join(&node.id);
        std::fs::create_dir_all(&node_dir).map_err(|e| attractor_types::AttractorError::HandlerError {
            handler: "codergen".into(),
            node: node.id.clone(),
            message: format!("Failed to prepare log directory: {e}"),
        })?;
        let _ = std::fs::write(node_dir.join("prompt.md"), &prompt);

        let run_result = self
            .backend
            .run(
                node,
                &prompt,
                context,
                crate::handlers::codergen_handler::LlmRunOptions { signal: cancel },
            )
            .await?;

        let outcome = match run_result {
            LlmRunResult::Outcome(outcome) => *outcome,
            LlmRunResult::Text(text) => {
                let _ = std::fs::write(node_dir.join("response.md"), &text);

                let parse_enabled = node.auto_status;
                if !parse_enabled {
                    Outcome::success(text)
                } else {
                    let parsed = parse_status_markers(&text);
                    let status = parsed.status.unwrap_or(StageStatus::Fail);
                    let failure_reason = match status {
                        StageStatus::Fail | StageStatus::PartialSuccess => {
                            Some(parsed.failure_reason.clone().unwrap_or_else(|| {
                                if parsed.status.is_none() {
                                    "Response missing [STATUS: ...] marker".to_string()
                                } else {
                                    "Codergen stage reported failure".to_string()
                                }
                            }))
                        }
                        _ => None,
                    };
                    let failure_class = if parsed.status.is_none() {
                        Some("missing_status_marker".to_string())
                    } else {
                        None
                    };

                    let status_json = serde_json::json!({
                        "status": format!("{:?}", status),
                        "failure_reason": failure_reason,
                        "preferred_label": parsed.preferred_label,
                        "next_ids": parsed.next_ids,
                    });
                    let _ = std::fs::write(
                        node_dir.join("status.json"),
                        serde_json::to_string_pretty(&status_json).unwrap_or_default(),
                    );

                    let mut context_updates = HashMap::new();
                    context_updates.insert(
                        format!("{}.response", node.id),
                        serde_json::Value::String(parsed.body.clone()),
                    );

                    Outcome {
                        status,
                        preferred_label: parsed.preferred_label,
                        suggested_next_ids: parsed.next_ids,
                        context_updates,
                        notes: parsed.body,
                        failure_reason,
                        failure_class,
                        tool_failure: None,
                        usage: None,
                    }
                }
            }
        };

        Ok(outcome)
    }
}

#[allow(unused)]
fn _assert_usage_type_in_scope(_: Usage) {}
