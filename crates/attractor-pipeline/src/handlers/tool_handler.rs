use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use attractor_dot::AttributeValue;
use attractor_types::{
    AttractorError, CancellationToken, Context, Outcome, Result, StageStatus, ToolFailureClass,
};

use crate::graph::{PipelineGraph, PipelineNode};
use crate::handler::NodeHandler;
use crate::tool_failure;
use crate::transforms::expand_runtime_vars;

/// Default command timeout when a node has no explicit `timeout` attribute.
const DEFAULT_TOOL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(30);

// ---------------------------------------------------------------------------
// ToolHandler — executes a shell command (parallelogram shape)
// ---------------------------------------------------------------------------

pub struct ToolHandler;

impl ToolHandler {
    /// The attempt directory for this invocation, `<logs_root>/<node_id>/attempt-<n>`,
    /// where `n` is one past however many attempt dirs already exist.
    fn attempt_dir(logs_root: &Path, node_id: &str) -> std::io::Result<std::path::PathBuf> {
        let node_dir = logs_root.join(node_id);
        std::fs::create_dir_all(&node_dir)?;
        let mut attempt = 1usize;
        if let Ok(entries) = std::fs::read_dir(&node_dir) {
            for entry in entries.flatten() {
                if entry
                    .file_name()
                    .to_string_lossy()
                    .starts_with("attempt-")
                {
                    attempt += 1;
                }
            }
        }
        let dir = node_dir.join(format!("attempt-{attempt}"));
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    fn write_artifacts(
        dir: &Path,
        command: &str,
        stdout: &str,
        stderr: &str,
        exit_code: Option<i32>,
        timed_out: bool,
        duration_ms: u64,
    ) -> (String, String, String) {
        let stdout_path = dir.join("stdout.log");
        let stderr_path = dir.join("stderr.log");
        let meta_path = dir.join("meta.json");
        let _ = std::fs::write(&stdout_path, stdout);
        let _ = std::fs::write(&stderr_path, stderr);
        let meta = serde_json::json!({
            "command": command,
            "exit_code": exit_code,
            "timed_out": timed_out,
            "duration_ms": duration_ms,
        });
        let _ = std::fs::write(
            &meta_path,
            serde_json::to_string_pretty(&meta).unwrap_or_default(),
        );
        (
            stdout_path.to_string_lossy().into_owned(),
            stderr_path.to_string_lossy().into_owned(),
            meta_path.to_string_lossy().into_owned(),
        )
    }
}

#[async_trait]
impl NodeHandler for ToolHandler {
    fn handler_type(&self) -> &str {
        "tool"
    }

    async fn execute(
        &self,
        node: &PipelineNode,
        context: &Context,
        graph: &PipelineGraph,
        logs_root: &Path,
        cancel: &CancellationToken,
    ) -> Result<Outcome> {
        let command = node
            .raw_attrs
            .get("tool_command")
            .and_then(|v| match v {
                AttributeValue::String(s) => Some(s.clone()),
                _ => None,
            })
            .ok_or_else(|| AttractorError::HandlerError {
                handler: "tool".into(),
                node: node.id.clone(),
                message: "Missing tool_command attribute".into(),
            })?;
        let command = expand_runtime_vars(&command, &graph.goal, context).await;

        tracing::info!(node = %node.id, label = %node.label, command = %command, "Executing tool command");

        if cancel.is_cancelled() {
            return Ok(Outcome::cancelled());
        }

        // Check if dry_run is set in context
        let dry_run = context
            .get("dry_run")
            .await
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        if dry_run {
            tracing::info!(node = %node.id, "Dry run — skipping command execution");
            return Ok(Outcome {
                status: StageStatus::Success,
                preferred_label: None,
                suggested_next_ids: vec![],
                context_updates: {
                    let mut m = HashMap::new();
                    m.insert(
                        "last_tool_command".into(),
                        serde_json::Value::String(command.clone()),
                    );
                    m.insert(
                        format!("{}.completed", node.id),
                        serde_json::Value::Bool(true),
                    );
                    m.insert(
                        format!("{}.dry_run", node.id),
                        serde_json::Value::Bool(true),
                    );
                    m
                },
                notes: format!("Dry run — command not executed: {}", command),
                failure_reason: None,
                failure_class: None,
                tool_failure: None,
                usage: None,
            });
        }

        // Build the shell command
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&command);
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());

        // Set working directory from context
        let snapshot = context.snapshot().await;
        let cwd = if let Some(serde_json::Value::String(dir)) = snapshot.get("workdir") {
            cmd.current_dir(dir);
            Some(dir.clone())
        } else {
            None
        };

        let attempt_dir = Self::attempt_dir(logs_root, &node.id).map_err(|e| {
            AttractorError::HandlerError {
                handler: "tool".into(),
                node: node.id.clone(),
                message: format!("Failed to prepare attempt directory: {e}"),
            }
        })?;

        let start = std::time::Instant::now();
        let child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                let mut failure = tool_failure::build(
                    ToolFailureClass::SpawnError,
                    &command,
                    cwd,
                    None,
                    None,
                    duration_ms,
                    "",
                    &e.to_string(),
                );
                let (out, err, meta) = Self::write_artifacts(
                    &attempt_dir,
                    &command,
                    "",
                    &e.to_string(),
                    None,
                    false,
                    duration_ms,
                );
                failure.artifact_stdout = out;
                failure.artifact_stderr = err;
                failure.artifact_meta = meta;
                return Ok(Outcome {
                    status: StageStatus::Fail,
                    preferred_label: None,
                    suggested_next_ids: vec![],
                    context_updates: HashMap::new(),
                    notes: failure.digest.clone(),
                    failure_reason: Some(format!("Failed to spawn command: {e}")),
                    failure_class: None,
                    tool_failure: Some(failure),
                    usage: None,
                });
            }
        };

        // Apply timeout if configured on the node, default 30s.
        let timeout_dur = node.timeout.unwrap_or(DEFAULT_TOOL_TIMEOUT);
        let wait = child.wait_with_output();
        tokio::pin!(wait);

        let output = tokio::select! {
            res = &mut wait => {
                match res {
                    Ok(o) => o,
                    Err(e) => {
                        return Err(AttractorError::HandlerError {
                            handler: "tool".into(),
                            node: node.id.clone(),
                            message: format!("Command execution failed: {}", e),
                        });
                    }
                }
            }
            _ = tokio::time::sleep(timeout_dur) => {
                let duration_ms = start.elapsed().as_millis() as u64;
                let mut failure = tool_failure::build(
                    ToolFailureClass::Timeout,
                    &command,
                    cwd,
                    None,
                    None,
                    duration_ms,
                    "",
                    "",
                );
                let (out, err, meta) = Self::write_artifacts(
                    &attempt_dir, &command, "", "", None, true, duration_ms,
                );
                failure.artifact_stdout = out;
                failure.artifact_stderr = err;
                failure.artifact_meta = meta;
                return Ok(Outcome {
                    status: StageStatus::Fail,
                    preferred_label: None,
                    suggested_next_ids: vec![],
                    context_updates: HashMap::new(),
                    notes: failure.digest.clone(),
                    failure_reason: Some(format!("Command timed out after {}ms", timeout_dur.as_millis())),
                    failure_class: Some("timeout".into()),
                    tool_failure: Some(failure),
                    usage: None,
                });
            }
            _ = cancel.cancelled() => {
                return Ok(Outcome::cancelled());
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let exit_code = output.status.code().unwrap_or(-1);

        tracing::info!(
            node = %node.id,
            exit_code = exit_code,
            stdout_len = stdout.len(),
            stderr_len = stderr.len(),
            "Tool command completed"
        );

        let (artifact_stdout, artifact_stderr, artifact_meta) = Self::write_artifacts(
            &attempt_dir,
            &command,
            &stdout,
            &stderr,
            Some(exit_code),
            false,
            duration_ms,
        );

        let status = if output.status.success() {
            StageStatus::Success
        } else {
            StageStatus::Fail
        };

        let mut updates = HashMap::new();
        updates.insert(
            "last_tool_command".into(),
            serde_json::Value::String(command.clone()),
        );
        updates.insert(
            format!("{}.completed", node.id),
            serde_json::Value::Bool(true),
        );
        updates.insert(
            format!("{}.exit_code", node.id),
            serde_json::json!(exit_code),
        );
        updates.insert(
            format!("{}.stdout", node.id),
            serde_json::Value::String(stdout.clone()),
        );
        if !stderr.is_empty() {
            updates.insert(
                format!("{}.stderr", node.id),
                serde_json::Value::String(stderr.clone()),
            );
        }

        // Combine stdout + stderr for notes, truncating if very long
        let combined = if stderr.is_empty() {
            stdout.clone()
        } else {
            format!("{}\n--- stderr ---\n{}", stdout, stderr)
        };
        let notes = if combined.len() > 4096 {
            let truncate_at = combined
                .char_indices()
                .map(|(i, _)| i)
                .take_while(|&i| i <= 4096)
                .last()
                .unwrap_or(0);
            format!("{}...(truncated)", &combined[..truncate_at])
        } else {
            combined
        };

        let tool_failure = if status == StageStatus::Fail {
            let mut failure = tool_failure::build(
                ToolFailureClass::ExitNonzero,
                &command,
                cwd,
                Some(exit_code),
                None,
                duration_ms,
                &stdout,
                &stderr,
            );
            failure.artifact_stdout = artifact_stdout;
            failure.artifact_stderr = artifact_stderr;
            failure.artifact_meta = artifact_meta;
            Some(failure)
        } else {
            None
        };

        Ok(Outcome {
            status,
            preferred_label: None,
            suggested_next_ids: vec![],
            context_updates: updates,
            notes,
            failure_reason: if status == StageStatus::Fail {
                Some(format!("Command exited with code {}", exit_code))
            } else {
                None
            },
            failure_class: None,
            tool_failure,
            usage: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handlers::tests::{make_cancel, make_logs_root, make_minimal_graph, make_node};

    #[tokio::test]
    async fn tool_handler_dry_run_skips_execution() {
        let handler = ToolHandler;
        let mut attrs = HashMap::new();
        attrs.insert(
            "tool_command".into(),
            AttributeValue::String("cargo test".into()),
        );
        let node = make_node("t", "parallelogram", None, attrs);
        let ctx = Context::default();
        ctx.set("dry_run", serde_json::Value::Bool(true)).await;
        let graph = make_minimal_graph();
        let logs_root = make_logs_root();
        let cancel = make_cancel();

        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert_eq!(
            outcome.context_updates.get("last_tool_command"),
            Some(&serde_json::Value::String("cargo test".into()))
        );
        assert_eq!(
            outcome.context_updates.get("t.completed"),
            Some(&serde_json::Value::Bool(true))
        );
        assert_eq!(
            outcome.context_updates.get("t.dry_run"),
            Some(&serde_json::Value::Bool(true))
        );
        assert!(outcome.notes.contains("Dry run"));
    }

    #[tokio::test]
    async fn tool_handler_errors_on_missing_command() {
        let handler = ToolHandler;
        let node = make_node("t", "parallelogram", None, HashMap::new());
        let ctx = Context::default();
        let graph = make_minimal_graph();
        let logs_root = make_logs_root();
        let cancel = make_cancel();

        let result = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await;
        assert!(result.is_err());
        let err = result.unwrap_err();
        assert!(
            err.to_string().contains("Missing tool_command"),
            "Expected error about missing tool_command, got: {err}"
        );
    }

    #[tokio::test]
    async fn tool_handler_executes_command() {
        let handler = ToolHandler;
        let mut attrs = HashMap::new();
        attrs.insert(
            "tool_command".into(),
            AttributeValue::String("echo hello".into()),
        );
        let node = make_node("run_echo", "parallelogram", None, attrs);
        let ctx = Context::default();
        let graph = make_minimal_graph();
        let logs_root = make_logs_root();
        let cancel = make_cancel();

        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Success);
        assert!(outcome.failure_reason.is_none());
        assert!(outcome.notes.contains("hello"));
        assert_eq!(
            outcome.context_updates.get("run_echo.exit_code"),
            Some(&serde_json::json!(0))
        );
        assert!(outcome
            .context_updates
            .get("run_echo.stdout")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("hello"));
        assert!(logs_root.path().join("run_echo").join("attempt-1").join("stdout.log").exists());
    }

    #[tokio::test]
    async fn tool_handler_captures_failure() {
        let handler = ToolHandler;
        let mut attrs = HashMap::new();
        attrs.insert(
            "tool_command".into(),
            AttributeValue::String("exit 42".into()),
        );
        let node = make_node("fail_cmd", "parallelogram", None, attrs);
        let ctx = Context::default();
        let graph = make_minimal_graph();
        let logs_root = make_logs_root();
        let cancel = make_cancel();

        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        assert!(outcome.failure_reason.is_some());
        assert!(outcome.failure_reason.unwrap().contains("42"));
        assert_eq!(
            outcome.context_updates.get("fail_cmd.exit_code"),
            Some(&serde_json::json!(42))
        );
        let failure = outcome.tool_failure.expect("tool_failure populated on exit != 0");
        assert_eq!(failure.failure_class, ToolFailureClass::ExitNonzero);
        assert_eq!(failure.exit_code, Some(42));
    }

    #[tokio::test]
    async fn tool_handler_times_out() {
        let handler = ToolHandler;
        let mut attrs = HashMap::new();
        attrs.insert(
            "tool_command".into(),
            AttributeValue::String("sleep 5".into()),
        );
        let mut node = make_node("slow", "parallelogram", None, attrs);
        node.timeout = Some(std::time::Duration::from_millis(50));
        let ctx = Context::default();
        let graph = make_minimal_graph();
        let logs_root = make_logs_root();
        let cancel = make_cancel();

        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Fail);
        let failure = outcome.tool_failure.expect("tool_failure populated on timeout");
        assert_eq!(failure.failure_class, ToolFailureClass::Timeout);
    }

    #[tokio::test]
    async fn tool_handler_respects_cancellation() {
        let handler = ToolHandler;
        let mut attrs = HashMap::new();
        attrs.insert(
            "tool_command".into(),
            AttributeValue::String("echo hi".into()),
        );
        let node = make_node("c", "parallelogram", None, attrs);
        let ctx = Context::default();
        let graph = make_minimal_graph();
        let logs_root = make_logs_root();
        let cancel = make_cancel();
        cancel.cancel();

        let outcome = handler
            .execute(&node, &ctx, &graph, logs_root.path(), &cancel)
            .await
            .unwrap();
        assert_eq!(outcome.status, StageStatus::Cancelled);
    }
}
