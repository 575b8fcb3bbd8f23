//! Per-attempt token/cost accounting, accumulated by the engine across a run.

use attractor_types::Usage;

/// One stage attempt's reported usage, tagged with the node that produced it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct UsageAttempt {
    pub node_id: String,
    pub attempt: usize,
    pub usage: Usage,
}

/// Rolling usage totals for a pipeline run: the full per-attempt history plus
/// a running sum, matching spec §4.6's `stages[]` + `totals`.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct UsageTotals {
    pub stages: Vec<UsageAttempt>,
    pub totals: Usage,
}

impl UsageTotals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one stage attempt's usage, folding it into `totals`.
    pub fn record(&mut self, node_id: impl Into<String>, attempt: usize, usage: Usage) {
        self.totals = self.totals.clone() + usage.clone();
        self.stages.push(UsageAttempt {
            node_id: node_id.into(),
            attempt,
            usage,
        });
    }
}
