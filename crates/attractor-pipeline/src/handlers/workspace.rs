//! Workspace lifecycle handlers: `workspace.create`, `workspace.merge`,
//! `workspace.cleanup`.
//!
//! These back the folder-shaped nodes a workflow uses to fan work out into
//! an isolated source-control workspace, merge its result back into the
//! default workspace, and tear it down afterward. All three go through a
//! [`Runner`](crate::jj_runner::Runner) rather than shelling out directly,
//! the same seam `ToolHandler` and `CodergenHandler` use for their own
//! external-process boundaries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use attractor_dot::AttributeValue;
use attractor_types::{AttractorError, CancellationToken, Context, Outcome, Result, StageStatus};
use serde::{Deserialize, Serialize};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;
use crate::jj_runner::{JjRunner, Runner};

/// Marker jj inserts into rebase/merge output when a rebase lands on a conflict.
const CONFLICT_MARKER: &str = "conflict";

/// Safety marker required in a workspace directory name before `cleanup`
/// will ever remove it from disk.
const WORKSPACE_DIR_MARKER: &str = "-ws-";

const MAX_NAME_LEN: usize = 48;
const MAX_NAME_COLLISION_RETRIES: u32 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RegistryEntry {
    path: String,
    created: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Registry {
    #[serde(default)]
    workspaces: HashMap<String, RegistryEntry>,
}

fn registry_path(repo_root: &Path) -> PathBuf {
    repo_root.join(".jj").join("workspace-registry.json")
}

fn load_registry(repo_root: &Path) -> Registry {
    let path = registry_path(repo_root);
    std::fs::read_to_string(&path)
        .ok()
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default()
}

fn save_registry(repo_root: &Path, registry: &Registry) -> std::io::Result<()> {
    let path = registry_path(repo_root);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(registry).unwrap_or_default();
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;
    std::fs::rename(&tmp_path, path)?;
    Ok(())
}

/// Lowercase, collapse non-alphanumerics to `-`, trim to `MAX_NAME_LEN`.
/// Falls back to `"pipeline"` when the result would be empty.
fn sanitize_name(raw: &str) -> String {
    let mut out = String::new();
    let mut last_was_dash = false;
    for ch in raw.trim().to_lowercase().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch);
            last_was_dash = false;
        } else if !last_was_dash && !out.is_empty() {
            out.push('-');
            last_was_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    out.truncate(MAX_NAME_LEN);
    if out.is_empty() {
        "pipeline".to_string()
    } else {
        out
    }
}

fn node_attr(node: &PipelineNode, key: &str) -> Option<String> {
    node.raw_attrs.get(key).and_then(|v| match v {
        AttributeValue::String(s) => Some(s.clone()),
        _ => None,
    })
}

async fn resolve_repo_root(context: &Context) -> Result<PathBuf> {
    if let Some(dir) = context.get("workdir").await.and_then(|v| v.as_str().map(String::from)) {
        return Ok(PathBuf::from(dir));
    }
    std::env::current_dir().map_err(|e| AttractorError::WorkspaceError {
        name: String::new(),
        message: format!("could not determine repo root: {e}"),
    })
}

fn write_artifact(dir: &Path, file_name: &str, value: &serde_json::Value) {
    let _ = std::fs::create_dir_all(dir);
    let _ = std::fs::write(
        dir.join(file_name),
        serde_json::to_string_pretty(value).unwrap_or_default(),
    );
}

fn extract_commit_ids(log_output: &str) -> Vec<String> {
    log_output
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}

/// Tears down a workspace on a catastrophic engine failure, best-effort.
/// Every step's errors are swallowed into the returned warning list — this
/// is a last resort, not a reportable stage outcome.
pub async fn emergency_cleanup(
    runner: &dyn Runner,
    repo_root: &Path,
    workspace_name: &str,
    workspace_path: Option<&Path>,
) -> Vec<String> {
    let mut warnings = Vec::new();
    if workspace_name == "default" {
        return warnings;
    }
    if let Err(e) = runner
        .run(
            &["workspace".to_string(), "forget".to_string(), workspace_name.to_string()],
            Some(repo_root),
        )
        .await
    {
        let msg = e.to_string();
        if !is_benign_forget_error(&msg) {
            warnings.push(format!("emergency forget failed: {msg}"));
        }
    }
    if let Some(path) = workspace_path {
        if safe_to_remove(path, repo_root) {
            if let Err(e) = std::fs::remove_dir_all(path) {
                if path.exists() {
                    warnings.push(format!("emergency removal of {path:?} failed: {e}"));
                }
            }
        }
    }
    let mut registry = load_registry(repo_root);
    registry.workspaces.remove(workspace_name);
    let _ = save_registry(repo_root, &registry);
    warnings
}

fn is_benign_forget_error(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    lower.contains("not found") || lower.contains("doesn't exist") || lower.contains("does not exist")
}

/// A directory is only ever removed by `cleanup` if its name carries the
/// `-ws-` marker created workspaces always get, and it isn't an ancestor of
/// the repo root (which would otherwise nuke the whole checkout).
fn safe_to_remove(path: &Path, repo_root: &Path) -> bool {
    let name_has_marker = path
        .file_name()
        .map(|n| n.to_string_lossy().contains(WORKSPACE_DIR_MARKER))
        .unwrap_or(false);
    if !name_has_marker {
        return false;
    }
    !repo_root.starts_with(path)
}

// ---------------------------------------------------------------------------
// WorkspaceCreateHandler
// ---------------------------------------------------------------------------

pub struct WorkspaceCreateHandler;

impl WorkspaceCreateHandler {
    fn runner(&self) -> JjRunner {
        JjRunner::new()
    }

    async fn run(&self, node: &PipelineNode, context: &Context, logs_root: &Path) -> Result<Outcome> {
        self.run_with(node, context, logs_root, &self.runner()).await
    }

    async fn run_with(
        &self,
        node: &PipelineNode,
        context: &Context,
        logs_root: &Path,
        runner: &dyn Runner,
    ) -> Result<Outcome> {
        let repo_root = resolve_repo_root(context).await?;
        let requested = node_attr(node, "workspace_name").unwrap_or_else(|| node.id.clone());
        let sanitized = sanitize_name(&requested);

        let existing = list_workspace_names(runner, &repo_root).await;

        let mut name = sanitized.clone();
        let mut attempt = 0u32;
        while existing.contains(&name) && attempt < MAX_NAME_COLLISION_RETRIES {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            name = format!("{sanitized}-{}", &suffix[..8]);
            attempt += 1;
        }

        let repo_parent = repo_root.parent().unwrap_or(&repo_root);
        let repo_name = repo_root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "repo".to_string());
        let workspace_path = repo_parent.join(format!("{repo_name}{WORKSPACE_DIR_MARKER}{name}"));

        runner
            .run(
                &[
                    "workspace".to_string(),
                    "add".to_string(),
                    workspace_path.to_string_lossy().into_owned(),
                    name.clone(),
                ],
                Some(&repo_root),
            )
            .await?;

        let base_commit = runner
            .run(
                &[
                    "log".to_string(),
                    "--no-graph".to_string(),
                    "-r".to_string(),
                    "@".to_string(),
                    "-T".to_string(),
                    "commit_id".to_string(),
                ],
                Some(&workspace_path),
            )
            .await
            .unwrap_or_default()
            .trim()
            .to_string();

        let mut registry = load_registry(&repo_root);
        registry.workspaces.insert(
            name.clone(),
            RegistryEntry {
                path: workspace_path.to_string_lossy().into_owned(),
                created: base_commit.clone(),
            },
        );
        if let Err(e) = save_registry(&repo_root, &registry) {
            tracing::warn!(error = %e, "failed to persist workspace registry");
        }

        write_artifact(
            &logs_root.join(&node.id),
            "workspace.json",
            &serde_json::json!({
                "name": name,
                "path": workspace_path.to_string_lossy(),
                "base_commit": base_commit,
                "repo_root": repo_root.to_string_lossy(),
            }),
        );

        let mut updates = HashMap::new();
        updates.insert("workspace.name".into(), serde_json::Value::String(name.clone()));
        updates.insert(
            "workspace.path".into(),
            serde_json::Value::String(workspace_path.to_string_lossy().into_owned()),
        );
        updates.insert("workspace.base_commit".into(), serde_json::Value::String(base_commit));
        updates.insert(
            "workspace.repo_root".into(),
            serde_json::Value::String(repo_root.to_string_lossy().into_owned()),
        );

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates: updates,
            notes: format!("Created workspace '{name}' at {}", workspace_path.display()),
            failure_reason: None,
            failure_class: None,
            tool_failure: None,
            usage: None,
        })
    }
}

async fn list_workspace_names(runner: &dyn Runner, repo_root: &Path) -> Vec<String> {
    let out = runner
        .run(&["workspace".to_string(), "list".to_string()], Some(repo_root))
        .await
        .unwrap_or_default();
    out.lines()
        .filter_map(|line| line.split(':').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[async_trait]
impl NodeHandler for WorkspaceCreateHandler {
    fn handler_type(&self) -> &str {
        "workspace.create"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        logs_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::cancelled());
        }
        self.run(node, context, logs_root).await
    }
}

// ---------------------------------------------------------------------------
// WorkspaceMergeHandler
// ---------------------------------------------------------------------------

pub struct WorkspaceMergeHandler;

impl WorkspaceMergeHandler {
    fn runner(&self) -> JjRunner {
        JjRunner::new()
    }

    async fn run_with(
        &self,
        node: &PipelineNode,
        context: &Context,
        logs_root: &Path,
        runner: &dyn Runner,
    ) -> Result<Outcome> {
        let name = context
            .get("workspace.name")
            .await
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| AttractorError::HandlerError {
                handler: "workspace.merge".into(),
                node: node.id.clone(),
                message: "missing workspace.name in context".into(),
            })?;
        let repo_root = context
            .get("workspace.repo_root")
            .await
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| AttractorError::HandlerError {
                handler: "workspace.merge".into(),
                node: node.id.clone(),
                message: "missing workspace.repo_root in context".into(),
            })?;
        let repo_root = PathBuf::from(repo_root);

        let default_head = runner
            .run(
                &[
                    "log".to_string(),
                    "--no-graph".to_string(),
                    "-r".to_string(),
                    "@".to_string(),
                    "-T".to_string(),
                    "commit_id".to_string(),
                ],
                Some(&repo_root),
            )
            .await
            .unwrap_or_default()
            .trim()
            .to_string();

        let revset = format!("reachable(@, {name}) & mutable() & ~::{{'{default_head}'}}");
        let log_out = runner
            .run(
                &[
                    "log".to_string(),
                    "--no-graph".to_string(),
                    "-r".to_string(),
                    revset,
                    "-T".to_string(),
                    "commit_id ++ \"\\n\"".to_string(),
                ],
                Some(&repo_root),
            )
            .await?;
        let commit_ids = extract_commit_ids(&log_out);

        let Some(oldest) = commit_ids.last().cloned() else {
            let mut updates = HashMap::new();
            updates.insert("workspace.merge_conflicts".into(), serde_json::Value::Bool(false));
            return Ok(Outcome {
                status: StageStatus::Success,
                preferred_label: None,
                suggested_next_ids: vec![],
                context_updates: updates,
                notes: "No mutable commits to merge from workspace".into(),
                failure_reason: None,
                failure_class: None,
                tool_failure: None,
                usage: None,
            });
        };

        let rebase_out = runner
            .run(
                &[
                    "rebase".to_string(),
                    "-s".to_string(),
                    oldest.clone(),
                    "-d".to_string(),
                    default_head.clone(),
                ],
                Some(&repo_root),
            )
            .await?;

        let log_dir = logs_root.join(&node.id);
        if rebase_out.to_lowercase().contains(CONFLICT_MARKER) {
            write_artifact(
                &log_dir,
                "merge.json",
                &serde_json::json!({
                    "workspace": name,
                    "default_head_before": default_head,
                    "rebased_commit": oldest,
                    "conflicts": true,
                    "output": rebase_out,
                }),
            );
            let mut updates = HashMap::new();
            updates.insert("workspace.merge_conflicts".into(), serde_json::Value::Bool(true));
            return Ok(Outcome {
                status: StageStatus::Fail,
                preferred_label: None,
                suggested_next_ids: vec![],
                context_updates: updates,
                notes: "Rebase produced conflicts".into(),
                failure_reason: Some("merge conflicts detected during rebase".into()),
                failure_class: Some("merge_conflict".into()),
                tool_failure: None,
                usage: None,
            });
        }

        let tip_revset = format!(
            "heads(descendants({default_head}) & mutable() & ~{default_head})"
        );
        let tip_out = runner
            .run(
                &[
                    "log".to_string(),
                    "--no-graph".to_string(),
                    "-r".to_string(),
                    tip_revset,
                    "-T".to_string(),
                    "commit_id".to_string(),
                ],
                Some(&repo_root),
            )
            .await
            .unwrap_or_default();
        let merged_tip = tip_out.trim().to_string();
        let merged_tip = if merged_tip.is_empty() { oldest.clone() } else { merged_tip };

        let final_rebase_out = runner
            .run(
                &[
                    "rebase".to_string(),
                    "-s".to_string(),
                    "@".to_string(),
                    "-d".to_string(),
                    merged_tip.clone(),
                ],
                Some(&repo_root),
            )
            .await;

        if let Err(e) = final_rebase_out {
            let msg = e.to_string();
            if msg.to_lowercase().contains("cannot rebase onto descendant") {
                runner
                    .run(&["edit".to_string(), merged_tip.clone()], Some(&repo_root))
                    .await?;
            } else {
                return Err(e);
            }
        }

        write_artifact(
            &log_dir,
            "merge.json",
            &serde_json::json!({
                "workspace": name,
                "default_head_before": default_head,
                "rebased_commit": oldest,
                "merged_tip": merged_tip,
                "conflicts": false,
            }),
        );

        let mut updates = HashMap::new();
        updates.insert("workspace.merge_conflicts".into(), serde_json::Value::Bool(false));
        updates.insert("workspace.merged_tip".into(), serde_json::Value::String(merged_tip.clone()));

        Ok(Outcome {
            status: StageStatus::Success,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates: updates,
            notes: format!("Merged workspace '{name}' onto {merged_tip}"),
            failure_reason: None,
            failure_class: None,
            tool_failure: None,
            usage: None,
        })
    }
}

#[async_trait]
impl NodeHandler for WorkspaceMergeHandler {
    fn handler_type(&self) -> &str {
        "workspace.merge"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        logs_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::cancelled());
        }
        self.run_with(node, context, logs_root, &self.runner()).await
    }
}

// ---------------------------------------------------------------------------
// WorkspaceCleanupHandler
// ---------------------------------------------------------------------------

pub struct WorkspaceCleanupHandler;

impl WorkspaceCleanupHandler {
    fn runner(&self) -> JjRunner {
        JjRunner::new()
    }

    async fn run_with(
        &self,
        node: &PipelineNode,
        context: &Context,
        logs_root: &Path,
        runner: &dyn Runner,
    ) -> Result<Outcome> {
        let name = context
            .get("workspace.name")
            .await
            .and_then(|v| v.as_str().map(String::from))
            .ok_or_else(|| AttractorError::HandlerError {
                handler: "workspace.cleanup".into(),
                node: node.id.clone(),
                message: "missing workspace.name in context".into(),
            })?;

        let mut warnings = Vec::new();

        if name == "default" {
            return Err(AttractorError::WorkspaceError {
                name,
                message: "refusing to clean up the default workspace".into(),
            });
        }

        let repo_root = context
            .get("workspace.repo_root")
            .await
            .and_then(|v| v.as_str().map(PathBuf::from))
            .unwrap_or(resolve_repo_root(context).await?);

        let workspace_path = context
            .get("workspace.path")
            .await
            .and_then(|v| v.as_str().map(PathBuf::from));

        let mut forgot_ok = true;
        if let Err(e) = runner
            .run(
                &["workspace".to_string(), "forget".to_string(), name.clone()],
                Some(&repo_root),
            )
            .await
        {
            let msg = e.to_string();
            if is_benign_forget_error(&msg) {
                warnings.push(format!("workspace '{name}' was already forgotten: {msg}"));
            } else {
                forgot_ok = false;
                warnings.push(format!("workspace forget failed: {msg}"));
            }
        }

        let mut removed_ok = true;
        if let Some(ref path) = workspace_path {
            if safe_to_remove(path, &repo_root) {
                if let Err(e) = std::fs::remove_dir_all(path) {
                    if path.exists() {
                        removed_ok = false;
                        warnings.push(format!("failed to remove {}: {e}", path.display()));
                    }
                }
                if path.exists() {
                    removed_ok = false;
                    warnings.push(format!("{} still exists after removal attempt", path.display()));
                }
            } else {
                removed_ok = false;
                warnings.push(format!(
                    "refusing to remove {} — missing '{WORKSPACE_DIR_MARKER}' marker or is an ancestor of the repo root",
                    path.display()
                ));
            }
        }

        let mut registry = load_registry(&repo_root);
        registry.workspaces.remove(&name);
        if let Err(e) = save_registry(&repo_root, &registry) {
            warnings.push(format!("failed to update workspace registry: {e}"));
        }

        write_artifact(
            &logs_root.join(&node.id),
            "cleanup.json",
            &serde_json::json!({
                "name": name,
                "path": workspace_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
                "forgot_ok": forgot_ok,
                "removed_ok": removed_ok,
                "warnings": warnings,
            }),
        );

        let status = if forgot_ok && removed_ok {
            StageStatus::Success
        } else {
            StageStatus::PartialSuccess
        };

        Ok(Outcome {
            status,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates: HashMap::new(),
            notes: if warnings.is_empty() {
                format!("Cleaned up workspace '{name}'")
            } else {
                warnings.join("; ")
            },
            failure_reason: None,
            failure_class: None,
            tool_failure: None,
            usage: None,
        })
    }
}

#[async_trait]
impl NodeHandler for WorkspaceCleanupHandler {
    fn handler_type(&self) -> &str {
        "workspace.cleanup"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        _graph: &PipelineGraph,
        logs_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        if cancel.is_cancelled() {
            return Ok(Outcome::cancelled());
        }
        self.run_with(node, context, logs_root, &self.runner()).await
    }
}
