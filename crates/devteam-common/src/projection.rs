use crate::execution::ExecutionStatus;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    pub completed: u32,
    pub total: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactsView {
    pub repo_path: Option<String>,
    pub branch: Option<String>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
}

/// A read model derived from `TaskContext` and the task list. Never
/// authoritative, never persisted beyond an optional read cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusProjection {
    pub execution_id: Uuid,
    pub project_id: String,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub current_task: Option<TaskId>,
    pub totals: Totals,
    pub branch: Option<String>,
    pub artifacts: ArtifactsView,
    pub started_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusProjection {
    /// `progress = 100 * completed / max(total, 1)`, rounded to one decimal
    /// place (invariant 3).
    pub fn compute_progress(totals: Totals) -> f64 {
        let total = totals.total.max(1) as f64;
        let raw = 100.0 * totals.completed as f64 / total;
        (raw * 10.0).round() / 10.0
    }
}
