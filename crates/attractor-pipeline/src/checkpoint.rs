//! Checkpoint save/restore and crash recovery for pipeline execution.
//!
//! The engine persists an [`attractor_types::Checkpoint`] after every completed
//! node (and, on cancellation, mid-stage). On restart [`load_checkpoint`]
//! discovers the latest snapshot so the pipeline resumes instead of starting
//! over. Writes go through `Checkpoint::save`, which uses a temp-file-then-rename
//! so a crash mid-write never leaves a truncated `checkpoint.json` behind.

use std::path::{Path, PathBuf};

use attractor_types::{Checkpoint, Result};

fn checkpoint_path(logs_root: &Path) -> PathBuf {
    logs_root.join("checkpoint.json")
}

/// Save a checkpoint to `<logs_root>/checkpoint.json`, creating the directory
/// if needed.
pub async fn save_checkpoint(checkpoint: &Checkpoint, logs_root: &Path) -> Result<PathBuf> {
    tokio::fs::create_dir_all(logs_root).await?;
    let path = checkpoint_path(logs_root);
    checkpoint.save(&path)?;
    tracing::debug!(path = %path.display(), "Checkpoint saved");
    Ok(path)
}

/// Load the latest checkpoint from a directory.
///
/// Returns `Ok(None)` when no checkpoint file exists (i.e. first run or after
/// [`clear_checkpoint`]).
pub async fn load_checkpoint(logs_root: &Path) -> Result<Option<Checkpoint>> {
    let path = checkpoint_path(logs_root);
    if !tokio::fs::try_exists(&path).await? {
        return Ok(None);
    }
    Ok(Some(Checkpoint::load(&path)?))
}

/// Delete checkpoint after successful pipeline completion.
pub async fn clear_checkpoint(logs_root: &Path) -> Result<()> {
    let path = checkpoint_path(logs_root);
    if tokio::fs::try_exists(&path).await? {
        tokio::fs::remove_file(&path).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sample_checkpoint() -> Checkpoint {
        let mut context_values = HashMap::new();
        context_values.insert("key".to_string(), serde_json::json!("value"));
        Checkpoint {
            timestamp: chrono::Utc::now(),
            current_node: "node_b".into(),
            resume_at: None,
            next_node: None,
            completed_nodes: vec!["node_a".into()],
            node_retries: HashMap::new(),
            context_values,
            logs: vec!["started node_a".into()],
        }
    }

    #[tokio::test]
    async fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cp = sample_checkpoint();

        let path = save_checkpoint(&cp, dir.path()).await.unwrap();
        assert!(path.exists());

        let loaded = load_checkpoint(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.current_node, "node_b");
        assert_eq!(loaded.completed_nodes, vec!["node_a".to_string()]);
        assert_eq!(loaded.context_values.get("key").unwrap(), "value");
    }

    #[tokio::test]
    async fn load_from_nonexistent_directory_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does_not_exist");

        let result = load_checkpoint(&missing).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn clear_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let cp = sample_checkpoint();

        save_checkpoint(&cp, dir.path()).await.unwrap();
        assert!(dir.path().join("checkpoint.json").exists());

        clear_checkpoint(dir.path()).await.unwrap();
        assert!(!dir.path().join("checkpoint.json").exists());
    }

    #[tokio::test]
    async fn no_tmp_file_left_behind_after_save() {
        let dir = tempfile::tempdir().unwrap();
        let cp = sample_checkpoint();
        save_checkpoint(&cp, dir.path()).await.unwrap();
        assert!(!dir.path().join("checkpoint.json.tmp").exists());
    }

    #[tokio::test]
    async fn resume_at_and_next_node_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut cp = sample_checkpoint();
        cp.resume_at = Some("work".into());
        cp.next_node = Some("review".into());
        save_checkpoint(&cp, dir.path()).await.unwrap();

        let loaded = load_checkpoint(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.resume_at.as_deref(), Some("work"));
        assert_eq!(loaded.next_node.as_deref(), Some("review"));
    }
}
