use crate::outcome::NodeOutcome;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Artifacts produced by the Code-Change Executor or the Build Verifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionArtifact {
    pub diff: Option<String>,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
    pub files_modified: Vec<String>,
    pub commit_hash: Option<String>,
    pub tool_version: Option<String>,
    pub durations_ms: HashMap<String, u64>,
}

/// The recorded outcome of a single workflow node's `run(context) -> context`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    pub status: NodeOutcome,
    #[serde(default)]
    pub event_data: serde_json::Value,
    pub artifacts: Option<ExecutionArtifact>,
}

impl NodeRecord {
    pub fn success(event_data: serde_json::Value, artifacts: Option<ExecutionArtifact>) -> Self {
        Self {
            status: NodeOutcome::Success,
            event_data,
            artifacts,
        }
    }

    pub fn retryable(event_data: serde_json::Value, artifacts: Option<ExecutionArtifact>) -> Self {
        Self {
            status: NodeOutcome::Retryable,
            event_data,
            artifacts,
        }
    }

    pub fn fatal(event_data: serde_json::Value, artifacts: Option<ExecutionArtifact>) -> Self {
        Self {
            status: NodeOutcome::Fatal,
            event_data,
            artifacts,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContextMetadata {
    pub task_id: Option<TaskId>,
    pub project_id: String,
    pub repo_path: Option<String>,
    pub branch: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub logs: Vec<String>,
    #[serde(default)]
    pub files_modified: Vec<String>,
    /// A short, redacted summary of the most recent fatal node outcome.
    /// Read by ERROR_INJECT to synthesize a remediation task (§4.F).
    #[serde(default)]
    pub last_error: Option<String>,
}

/// The canonical, monotonically growing state carried through workflow
/// nodes. Persisted via snapshot replace (not append) after every node
/// transition — see invariant 4: a node never observes a `TaskContext`
/// newer than the one passed to it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskContext {
    pub metadata: TaskContextMetadata,
    #[serde(default)]
    pub nodes: HashMap<String, NodeRecord>,
}

impl TaskContext {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            metadata: TaskContextMetadata {
                project_id: project_id.into(),
                started_at: Some(Utc::now()),
                ..Default::default()
            },
            nodes: HashMap::new(),
        }
    }

    pub fn record_node(&mut self, node_name: impl Into<String>, record: NodeRecord) {
        self.nodes.insert(node_name.into(), record);
    }

    pub fn push_log(&mut self, line: impl Into<String>) {
        self.metadata.logs.push(line.into());
    }

    pub fn node(&self, node_name: &str) -> Option<&NodeRecord> {
        self.nodes.get(node_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_node_and_read_back() {
        let mut ctx = TaskContext::new("acme/app");
        ctx.record_node("PREP", NodeRecord::success(serde_json::json!({}), None));
        assert_eq!(ctx.node("PREP").unwrap().status, NodeOutcome::Success);
        assert!(ctx.node("VERIFY").is_none());
    }

    #[test]
    fn push_log_appends() {
        let mut ctx = TaskContext::new("acme/app");
        ctx.push_log("starting SELECT");
        ctx.push_log("picked 1.1.1");
        assert_eq!(ctx.metadata.logs.len(), 2);
    }

    #[test]
    fn json_round_trip() {
        let mut ctx = TaskContext::new("acme/app");
        ctx.metadata.task_id = Some("1.1.1".parse().unwrap());
        ctx.record_node(
            "IMPLEMENT",
            NodeRecord::success(
                serde_json::json!({"note": "ok"}),
                Some(ExecutionArtifact {
                    exit_code: Some(0),
                    ..Default::default()
                }),
            ),
        );
        let json = serde_json::to_string(&ctx).unwrap();
        let parsed: TaskContext = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, ctx);
    }
}
