//! Edge selection algorithm (per-node, after a stage completes).
//!
//! Cascade, in order: filter by `suggested_next_ids` if set, evaluate each
//! remaining edge's guard and keep truthful ones, prefer a `preferred_label`
//! match, otherwise prefer guarded edges over unguarded ones, then highest
//! weight, then source order.

use crate::condition::{evaluate_condition, parse_condition};
use crate::graph::{PipelineEdge, PipelineGraph};

/// Select the next edge to follow after a node completes.
///
/// Returns `None` if the node has no out-edges at all (terminal node).
/// Returns `None` also when `suggested_next_ids` is set but matches no
/// out-edge, or when every remaining edge's guard evaluates false — callers
/// should treat that as `NoMatchingEdge`, not as a terminal node.
pub fn select_edge<'a>(
    node_id: &str,
    outcome: &attractor_types::Outcome,
    resolve: &dyn Fn(&str) -> String,
    graph: &'a PipelineGraph,
) -> Option<&'a PipelineEdge> {
    let edges = graph.outgoing_edges(node_id);
    if edges.is_empty() {
        return None;
    }

    // Step b: suggested_next_ids filters the candidate set, if non-empty.
    let candidates: Vec<&PipelineEdge> = if outcome.suggested_next_ids.is_empty() {
        edges.iter().collect()
    } else {
        edges
            .iter()
            .filter(|e| outcome.suggested_next_ids.iter().any(|s| *s == e.to))
            .collect()
    };
    if candidates.is_empty() {
        return None;
    }

    // Step c: evaluate each candidate's guard (empty guard = true); keep truthful.
    let guarded: Vec<&PipelineEdge> = candidates
        .iter()
        .copied()
        .filter(|e| match &e.condition {
            None => true,
            Some(cond) => match parse_condition(cond) {
                Ok(expr) => evaluate_condition(&expr, resolve),
                Err(_) => false,
            },
        })
        .collect();
    if guarded.is_empty() {
        return None;
    }

    // Step d: preferred-label override.
    if let Some(ref label) = outcome.preferred_label {
        let normalized = normalize_label(label);
        if let Some(edge) = guarded
            .iter()
            .find(|e| e.label.as_deref().map(|l| normalize_label(l) == normalized).unwrap_or(false))
        {
            return Some(edge);
        }
    }

    // Step e: guarded edges beat unguarded; then highest weight; then source order.
    let with_condition: Vec<_> = guarded.iter().copied().filter(|e| e.condition.is_some()).collect();
    if !with_condition.is_empty() {
        return Some(best_by_weight_then_lexical(&with_condition));
    }
    Some(best_by_weight_then_lexical(&guarded))
}

/// Normalize a label for comparison: lowercase, strip accelerator prefixes like
/// `[Y]`, `Y)`, `Y-`.
fn normalize_label(label: &str) -> String {
    let s = label.trim().to_lowercase();
    // Strip accelerator prefixes: [Y] , Y) , Y-
    // Only match if there's an actual accelerator pattern followed by content.
    regex::Regex::new(r"^(?:\[\w\]\s*|\w\)\s*|\w-\s*)")
        .unwrap()
        .replace(&s, "")
        .to_string()
}

/// Pick the edge with the highest weight; break ties by source-declaration
/// order (the earliest-declared out-edge among the tied candidates wins).
fn best_by_weight_then_lexical<'a>(edges: &[&'a PipelineEdge]) -> &'a PipelineEdge {
    edges
        .iter()
        .copied()
        .enumerate()
        .max_by(|(ia, a), (ib, b)| {
            a.weight
                .cmp(&b.weight)
                .then(ib.cmp(ia)) // earlier index wins ties
        })
        .map(|(_, edge)| edge)
        .unwrap()
}
