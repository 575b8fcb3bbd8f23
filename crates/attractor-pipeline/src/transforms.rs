//! AST transforms for pipeline graphs.
//!
//! Processes the pipeline graph after parsing: applies stylesheets, expands
//! variables in prompts, and performs other AST-level transformations.

use std::collections::HashMap;

use crate::graph::PipelineGraph;
use crate::stylesheet::{apply_stylesheet, parse_stylesheet};

/// Apply all transforms to a pipeline graph in the correct order.
pub fn apply_transforms(graph: &mut PipelineGraph) -> attractor_types::Result<()> {
    // 1. Apply model stylesheet (if present in graph attrs)
    apply_model_stylesheet(graph)?;

    // 2. Expand variables in prompts
    expand_prompt_variables(graph);

    Ok(())
}

/// Apply model stylesheet from graph attributes.
fn apply_model_stylesheet(graph: &mut PipelineGraph) -> attractor_types::Result<()> {
    let stylesheet_str = graph
        .attrs
        .get("model_stylesheet")
        .and_then(|v| match v {
            attractor_dot::AttributeValue::String(s) => Some(s.clone()),
            _ => None,
        });

    if let Some(css) = stylesheet_str {
        let stylesheet = parse_stylesheet(&css)?;
        apply_stylesheet(graph, &stylesheet);
    }

    Ok(())
}

/// Expand `${variable}` references in node prompts using graph-level attributes.
fn expand_prompt_variables(graph: &mut PipelineGraph) {
    // Collect graph-level attribute values for substitution
    let vars: HashMap<String, String> = graph
        .attrs
        .iter()
        .filter_map(|(k, v)| match v {
            attractor_dot::AttributeValue::String(s) => Some((k.clone(), s.clone())),
            attractor_dot::AttributeValue::Integer(i) => Some((k.clone(), i.to_string())),
            attractor_dot::AttributeValue::Boolean(b) => Some((k.clone(), b.to_string())),
            attractor_dot::AttributeValue::Float(f) => Some((k.clone(), f.to_string())),
            attractor_dot::AttributeValue::Duration(_) => None,
        })
        .collect();

    for node in graph.all_nodes_mut() {
        if let Some(ref prompt) = node.prompt {
            let expanded = expand_variables(prompt, &vars);
            if expanded != *prompt {
                node.prompt = Some(expanded);
            }
        }
    }
}

/// Expand `${variable}` patterns in a string.
///
/// Replaces each occurrence of `${key}` with the corresponding value from `vars`.
/// Variables that do not appear in `vars` are left as-is.
pub fn expand_variables(template: &str, vars: &HashMap<String, String>) -> String {
    let mut result = template.to_string();
    for (key, value) in vars {
        let pattern = format!("${{{}}}", key);
        result = result.replace(&pattern, value);
    }
    result
}

/// Expand bash-style `$goal` and `$context.key` tokens at execution time.
///
/// This is distinct from [`expand_variables`]'s `${...}` graph-load-time
/// substitution: it runs once per handler invocation, resolves `$goal`
/// against the pipeline goal and `$context.<dotted.key>` against the live
/// [`attractor_types::Context`], and leaves any other `$NAME` token
/// (including genuinely unknown ones) untouched.
pub async fn expand_runtime_vars(
    template: &str,
    goal: &str,
    context: &attractor_types::Context,
) -> String {
    let mut out = String::with_capacity(template.len());
    let bytes = template.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'$' {
            let start = i + 1;
            let mut j = start;
            while j < bytes.len() && (bytes[j] == b'_' || bytes[j] == b'.' || bytes[j].is_ascii_alphanumeric())
            {
                j += 1;
            }
            if j > start {
                let name = &template[start..j];
                if name == "goal" {
                    out.push_str(goal);
                    i = j;
                    continue;
                }
                if let Some(key) = name.strip_prefix("context.") {
                    if let Some(value) = context.get(key).await {
                        out.push_str(&json_value_to_plain_string(&value));
                        i = j;
                        continue;
                    }
                }
                // Unknown $NAME: leave intact, including the `$`.
                out.push_str(&template[i..j]);
                i = j;
                continue;
            }
        }
        // Advance by one full UTF-8 char.
        let ch = template[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

fn json_value_to_plain_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
