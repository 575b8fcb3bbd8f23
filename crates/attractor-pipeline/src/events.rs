//! Pipeline event system for observability.
//!
//! Emits [`PipelineEvent`]s via a [`tokio::sync::broadcast`] channel so that
//! external observers (loggers, metrics collectors, UI, etc.) can subscribe to
//! pipeline execution progress without coupling to the engine internals.

use serde::{Deserialize, Serialize};

/// Events emitted during pipeline execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PipelineEvent {
    PipelineStarted {
        pipeline_name: String,
        node_count: usize,
    },
    PipelineCompleted {
        pipeline_name: String,
        completed_nodes: Vec<String>,
        duration_ms: u64,
    },
    PipelineFailed {
        pipeline_name: String,
        error: String,
    },
    StageStarted {
        node_id: String,
        handler_type: String,
    },
    StageCompleted {
        node_id: String,
        status: String,
        duration_ms: u64,
    },
    StageFailed {
        node_id: String,
        error: String,
    },
    StageRetrying {
        node_id: String,
        attempt: usize,
    },
    EdgeSelected {
        from_node: String,
        to_node: String,
        edge_label: Option<String>,
    },
    GoalGateChecked {
        node_id: String,
        satisfied: bool,
    },
    CheckpointSaved {
        node_id: String,
    },
    ContextUpdated {
        node_id: String,
        keys: Vec<String>,
    },
    PipelineResumed {
        pipeline_name: String,
        resume_at: String,
    },
    PipelineCancelled {
        pipeline_name: String,
        node_id: String,
    },
    InterviewStarted {
        node_id: String,
        prompt: String,
    },
    InterviewCompleted {
        node_id: String,
        choice: String,
    },
    InterviewTimeout {
        node_id: String,
    },
    UsageUpdate {
        node_id: String,
        usage: attractor_types::Usage,
        total: attractor_types::Usage,
    },
    AgentText {
        node_id: String,
        delta: String,
    },
    AgentToolStart {
        node_id: String,
        tool: String,
    },
    AgentToolUpdate {
        node_id: String,
        tool: String,
        detail: String,
    },
    AgentToolEnd {
        node_id: String,
        tool: String,
        success: bool,
    },
}

/// Event emitter wrapping a broadcast sender.
#[derive(Clone)]
pub struct EventEmitter {
    sender: tokio::sync::broadcast::Sender<PipelineEvent>,
}

impl EventEmitter {
    /// Create a new emitter with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = tokio::sync::broadcast::channel(capacity);
        Self { sender }
    }

    /// Emit an event to all current subscribers.
    ///
    /// If there are no active receivers the event is silently dropped.
    pub fn emit(&self, event: PipelineEvent) {
        let _ = self.sender.send(event);
    }

    /// Subscribe to events. Returns a broadcast receiver.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventEmitter {
    fn default() -> Self {
        Self::new(256)
    }
}
