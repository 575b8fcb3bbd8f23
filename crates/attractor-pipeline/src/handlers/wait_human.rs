//! WaitHumanHandler — pauses pipeline execution for human input.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;

use attractor_types::{CancellationToken, Context, Outcome, Result, StageStatus};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;
use crate::interviewer::{Interviewer, Question};

/// Context key holding the map of `{gateId: [targetId, ...]}` re-review
/// bookkeeping consulted by the engine at edge-selection time.
pub const PENDING_RE_REVIEWS_KEY: &str = "human.gate.pending_re_reviews";

pub struct WaitHumanHandler {
    interviewer: Arc<dyn Interviewer>,
}

impl WaitHumanHandler {
    pub fn new(interviewer: Arc<dyn Interviewer>) -> Self {
        Self { interviewer }
    }
}

/// Labels matching a "revise"/"reject" style decision, checked case-insensitively
/// against the normalized label text (accelerator prefix already assumed stripped
/// by the caller).
fn is_revise_label(label: &str) -> bool {
    let l = label.to_lowercase();
    l.contains("revise") || l.contains("reject")
}

#[async_trait]
impl NodeHandler for WaitHumanHandler {
    fn handler_type(&self) -> &str {
        "wait.human"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        ctx: &Context,
        graph: &PipelineGraph,
        _logs_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::cancelled());
        }

        let edges = graph.outgoing_edges(&node.id);
        let choices: Vec<String> = edges.iter().filter_map(|e| e.label.clone()).collect();

        let prompt = node.prompt.clone().unwrap_or_else(|| node.label.clone());

        let question = Question {
            prompt,
            choices: if choices.is_empty() {
                vec!["Continue".into()]
            } else {
                choices
            },
            default: None,
            timeout: node.timeout,
        };

        let answer = self.interviewer.ask(&question).await?;

        if answer.choice == "timeout" {
            return Ok(Outcome::with_label(StageStatus::Retry, "timeout"));
        }
        if answer.choice == "skipped" {
            return Ok(Outcome::fail("Human gate skipped"));
        }

        let re_review_enabled = node
            .raw_attrs
            .get("re_review")
            .map(|v| !matches!(v, attractor_dot::AttributeValue::Boolean(false)))
            .unwrap_or(true);

        let mut context_updates = HashMap::new();
        if re_review_enabled {
            let mut pending: HashMap<String, Vec<String>> = ctx
                .get(PENDING_RE_REVIEWS_KEY)
                .await
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();

            if is_revise_label(&answer.choice) {
                let approve_targets: Vec<String> = edges
                    .iter()
                    .filter(|e| {
                        e.label
                            .as_deref()
                            .map(|l| !is_revise_label(l))
                            .unwrap_or(true)
                    })
                    .map(|e| e.to.clone())
                    .collect();
                pending.insert(node.id.clone(), approve_targets);
            } else {
                pending.remove(&node.id);
            }
            context_updates.insert(
                PENDING_RE_REVIEWS_KEY.to_string(),
                serde_json::to_value(&pending).unwrap_or_default(),
            );
        }

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: Some(answer.choice),
            suggested_next_ids: vec![],
            context_updates,
            notes: "Human responded".into(),
            failure_reason: None,
            failure_class: None,
            tool_failure: None,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{make_cancel, make_logs_root};
    use crate::interviewer::{Answer, RecordingInterviewer};

    fn make_node(id: &str, label: &str, prompt: Option<&str>) -> PipelineNode {
        PipelineNode {
            id: id.to_string(),
            label: label.to_string(),
            shape: "hexagon".to_string(),
            node_type: Some("wait.human".to_string()),
            prompt: prompt.map(String::from),
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
        }
    }

    fn make_graph_with_labeled_edges(node_id: &str, labels: &[&str]) -> PipelineGraph {
        let mut dot = String::from("digraph G {\n");
        dot.push_str(&format!("  {} [shape=\"hexagon\"]\n", node_id));
        for (i, label) in labels.iter().enumerate() {
            let target = format!("target_{}", i);
            dot.push_str(&format!("  {} [shape=\"box\"]\n", target));
            dot.push_str(&format!(
                "  {} -> {} [label=\"{}\"]\n",
                node_id, target, label
            ));
        }
        dot.push_str("}\n");
        let parsed = attractor_dot::parse(&dot).unwrap();
        PipelineGraph::from_dot(parsed).unwrap()
    }

    #[tokio::test]
    async fn derives_choices_from_edges() {
        let answers = vec![Answer {
            choice: "Approve".into(),
            custom_text: None,
        }];
        let interviewer = Arc::new(RecordingInterviewer::new(answers));
        let handler = WaitHumanHandler::new(interviewer.clone());

        let node = make_node("review", "Review Step", Some("Please review"));
        let graph = make_graph_with_labeled_edges("review", &["Approve", "Reject"]);

        let ctx = Context::default();
        let logs_root = make_logs_root();
        let cancel = make_cancel();
        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(outcome.preferred_label, Some("Approve".into()));
        assert_eq!(outcome.notes, "Human responded");

        let questions = interviewer.questions();
        assert_eq!(questions.len(), 1);
        assert_eq!(questions[0].prompt, "Please review");
        assert!(questions[0].choices.contains(&"Approve".to_string()));
        assert!(questions[0].choices.contains(&"Reject".to_string()));
    }

    #[tokio::test]
    async fn returns_preferred_label_from_answer() {
        let answers = vec![Answer {
            choice: "Reject".into(),
            custom_text: Some("Not ready".into()),
        }];
        let interviewer = Arc::new(RecordingInterviewer::new(answers));
        let handler = WaitHumanHandler::new(interviewer);

        let node = make_node("gate", "Gate", None);
        let graph = make_graph_with_labeled_edges("gate", &["Approve", "Reject"]);

        let ctx = Context::default();
        let logs_root = make_logs_root();
        let cancel = make_cancel();
        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.preferred_label, Some("Reject".into()));
    }

    #[tokio::test]
    async fn uses_continue_when_no_edge_labels() {
        let answers = vec![Answer {
            choice: "Continue".into(),
            custom_text: None,
        }];
        let interviewer = Arc::new(RecordingInterviewer::new(answers));
        let handler = WaitHumanHandler::new(interviewer.clone());

        let dot = r#"digraph G {
            gate [shape="hexagon"]
            next [shape="box"]
            gate -> next
        }"#;
        let parsed = attractor_dot::parse(dot).unwrap();
        let graph = PipelineGraph::from_dot(parsed).unwrap();

        let node = make_node("gate", "Gate", None);
        let ctx = Context::default();
        let logs_root = make_logs_root();
        let cancel = make_cancel();
        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.preferred_label, Some("Continue".into()));

        let questions = interviewer.questions();
        assert_eq!(questions[0].choices, vec!["Continue".to_string()]);
    }

    #[tokio::test]
    async fn uses_label_as_prompt_fallback() {
        let answers = vec![Answer {
            choice: "OK".into(),
            custom_text: None,
        }];
        let interviewer = Arc::new(RecordingInterviewer::new(answers));
        let handler = WaitHumanHandler::new(interviewer.clone());

        let node = make_node("confirm", "Confirm Deployment", None);
        let graph = make_graph_with_labeled_edges("confirm", &["OK"]);

        let ctx = Context::default();
        let logs_root = make_logs_root();
        let cancel = make_cancel();
        handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();

        let questions = interviewer.questions();
        assert_eq!(questions[0].prompt, "Confirm Deployment");
    }

    #[tokio::test]
    async fn timeout_answer_becomes_retry() {
        let answers = vec![Answer {
            choice: "timeout".into(),
            custom_text: None,
        }];
        let interviewer = Arc::new(RecordingInterviewer::new(answers));
        let handler = WaitHumanHandler::new(interviewer);

        let node = make_node("gate", "Gate", None);
        let graph = make_graph_with_labeled_edges("gate", &["Approve"]);
        let ctx = Context::default();
        let logs_root = make_logs_root();
        let cancel = make_cancel();
        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Retry);
    }

    #[tokio::test]
    async fn skipped_answer_becomes_fail() {
        let answers = vec![Answer {
            choice: "skipped".into(),
            custom_text: None,
        }];
        let interviewer = Arc::new(RecordingInterviewer::new(answers));
        let handler = WaitHumanHandler::new(interviewer);

        let node = make_node("gate", "Gate", None);
        let graph = make_graph_with_labeled_edges("gate", &["Approve"]);
        let ctx = Context::default();
        let logs_root = make_logs_root();
        let cancel = make_cancel();
        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();

        assert_eq!(outcome.status, StageStatus::Fail);
    }

    #[tokio::test]
    async fn revise_choice_records_pending_re_review() {
        let answers = vec![Answer {
            choice: "Revise".into(),
            custom_text: None,
        }];
        let interviewer = Arc::new(RecordingInterviewer::new(answers));
        let handler = WaitHumanHandler::new(interviewer);

        let node = make_node("review", "Review", None);
        let graph = make_graph_with_labeled_edges("review", &["Approve", "Revise"]);
        let ctx = Context::default();
        let logs_root = make_logs_root();
        let cancel = make_cancel();
        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();

        let pending = outcome
            .context_updates
            .get(PENDING_RE_REVIEWS_KEY)
            .expect("pending re-reviews recorded");
        let map: HashMap<String, Vec<String>> = serde_json::from_value(pending.clone()).unwrap();
        assert_eq!(map.get("review").unwrap(), &vec!["target_0".to_string()]);
    }

    #[tokio::test]
    async fn accept_choice_clears_pending_re_review() {
        let answers = vec![Answer {
            choice: "Approve".into(),
            custom_text: None,
        }];
        let interviewer = Arc::new(RecordingInterviewer::new(answers));
        let handler = WaitHumanHandler::new(interviewer);

        let node = make_node("review", "Review", None);
        let graph = make_graph_with_labeled_edges("review", &["Approve", "Revise"]);
        let ctx = Context::default();
        let mut seeded = HashMap::new();
        seeded.insert("review".to_string(), vec!["target_0".to_string()]);
        ctx.set(
            PENDING_RE_REVIEWS_KEY,
            serde_json::to_value(&seeded).unwrap(),
        )
        .await;

        let logs_root = make_logs_root();
        let cancel = make_cancel();
        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();

        let pending = outcome
            .context_updates
            .get(PENDING_RE_REVIEWS_KEY)
            .expect("pending re-reviews updated");
        let map: HashMap<String, Vec<String>> = serde_json::from_value(pending.clone()).unwrap();
        assert!(!map.contains_key("review"));
    }
}
