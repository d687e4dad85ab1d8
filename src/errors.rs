//! Typed error hierarchy for the DevTeam Runner.
//!
//! One enum per subsystem rather than a single grab-bag type — the same
//! split the orchestrator this replaces used for its three subsystems.
//! `ApiError` is the only variant that knows how to turn itself into an HTTP
//! response; every other enum is a plain `thiserror` type propagated with
//! `?` and converted at the boundary where it's handled (retried, escalated
//! to `ERROR_INJECT`, or surfaced to a caller).

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Failures from the Repository Cache Manager (§4.A): clone, fetch, checkout.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("clone failed for project {project_id}: {source}")]
    Clone {
        project_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("fetch failed for project {project_id}: {source}")]
    Fetch {
        project_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("checkout of branch {branch} failed for project {project_id}: {source}")]
    Checkout {
        project_id: String,
        branch: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("merge of branch {branch} into default failed for project {project_id}: {source}")]
    Merge {
        project_id: String,
        branch: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("push of branch {branch} failed for project {project_id}: {source}")]
    Push {
        project_id: String,
        branch: String,
        #[source]
        source: anyhow::Error,
    },
}

impl RepoError {
    /// Clone and fetch are retried with bounded backoff; checkout, merge,
    /// and push are fatal at this layer — MERGE escalates via `ERROR_INJECT`
    /// straight away, PUSH's own bounded retry lives one layer up in the
    /// state machine's PUSH node (§4.A, §4.F).
    pub fn retryable(&self) -> bool {
        matches!(self, RepoError::Clone { .. } | RepoError::Fetch { .. })
    }

    /// Distinguishes a real merge conflict from any other merge failure
    /// (dirty tree, I/O error) so the state machine can route only the
    /// former straight to `ERROR_INJECT` (§4.F MERGE).
    pub fn is_conflict(&self) -> bool {
        matches!(self, RepoError::Merge { source, .. } if source.to_string().contains("merge conflict"))
    }
}

/// Failures from the Per-Project Container Manager (§4.B).
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("failed to create container for project {project_id}: {source}")]
    Create {
        project_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("exec failed in project {project_id} container: {source}")]
    Exec {
        project_id: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("container for project {project_id} failed its health check after one restart")]
    Unhealthy { project_id: String },

    #[error("exec in project {project_id} container timed out after {timeout_secs}s")]
    Timeout {
        project_id: String,
        timeout_secs: u64,
    },
}

impl ContainerError {
    /// Distinguishes a genuinely absent binary (the container runtime's own
    /// "executable file not found" on exec) from any other exec failure, so
    /// the executor can map only the former to `ExecutionError::MissingTool`
    /// (§7: everything else — timeout, a flaky exec, an unhealthy container —
    /// escalates via `ERROR_INJECT` instead of halting the whole execution).
    pub fn is_missing_binary(&self) -> bool {
        matches!(self, ContainerError::Exec { source, .. } if {
            let message = source.to_string().to_ascii_lowercase();
            message.contains("executable file not found") || message.contains("no such file or directory")
        })
    }
}

/// Failures from the Event Store & Idempotency Layer (§4.C).
#[derive(Debug, Error)]
pub enum EventStoreError {
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),

    #[error("event {id} not found")]
    NotFound { id: uuid::Uuid },

    #[error("request failed validation: {0}")]
    Validation(String),
}

/// Failures from the Workflow Engine (§4.E): unknown workflow names and
/// fatal node outcomes. Retryable/fatal node failures from the subsystems a
/// node drives convert in via `#[from]` rather than being re-wrapped by
/// hand at every call site.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("unknown workflow '{name}'")]
    UnknownWorkflow { name: String },

    #[error("node '{node}' returned a fatal outcome: {message}")]
    NodeFatal { node: String, message: String },

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Failures from the Code-Change Executor (§4.G).
#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("code-change tool exited non-zero: {exit_code}")]
    Tool { exit_code: i32 },

    /// Fatal: halts the whole execution rather than escalating via
    /// `ERROR_INJECT` (§7 — there is no point retrying a task against a
    /// tool binary that was never there).
    #[error("code-change tool binary not found at {path}")]
    MissingTool { path: String },

    /// A transient container failure (timeout, flaky exec, unhealthy
    /// container) surfaced while running the tool. Recoverable via
    /// `ERROR_INJECT` (§7), unlike `MissingTool`.
    #[error(transparent)]
    Container(#[from] ContainerError),
}

/// Failures from the Build Verifier (§4.H). The verifier's own retry loop
/// (2 attempts total per step) is exhausted by the time this is raised.
#[derive(Debug, Error)]
#[error("build failed at stage {stage} (exit {exit_code}): {stderr_tail}")]
pub struct VerifyError {
    pub stage: String,
    pub exit_code: i32,
    pub stderr_tail: String,
}

/// Failures from the Task Execution State Machine (§4.F): merge, push, and
/// per-node timeouts, plus whatever the nodes it drives escalate.
#[derive(Debug, Error)]
pub enum StateMachineError {
    #[error("illegal control command '{command}' from state {state}")]
    IllegalTransition { state: String, command: &'static str },

    #[error("merge conflict in project {project_id} on branch {branch}")]
    MergeConflict { project_id: String, branch: String },

    #[error("push to remote failed after {attempts} attempts: {source}")]
    PushFailed {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("stage {stage} exceeded its timeout")]
    Timeout { stage: String },

    #[error("execution exceeded {limit} node transitions without reaching DONE or STOPPED")]
    TransitionLimitExceeded { limit: usize },

    #[error(transparent)]
    Execution(#[from] ExecutionError),

    #[error(transparent)]
    Verify(#[from] VerifyError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),
}

/// Errors surfaced by the Automation API (§4.J), mapped to
/// `{error:{code,message,details?}}` per §6.1.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::NotFound(_) => "not_found",
            ApiError::Conflict(_) => "conflict",
            ApiError::Internal(_) => "internal_error",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(json!({
            "error": {
                "code": self.code(),
                "message": self.to_string(),
            }
        }));
        (status, body).into_response()
    }
}

impl From<EventStoreError> for ApiError {
    fn from(err: EventStoreError) -> Self {
        match err {
            EventStoreError::Validation(msg) => ApiError::Validation(msg),
            other => ApiError::Internal(other.into()),
        }
    }
}

impl From<StateMachineError> for ApiError {
    fn from(err: StateMachineError) -> Self {
        match err {
            StateMachineError::IllegalTransition { state, command } => ApiError::Conflict(
                format!("cannot apply '{command}' from state '{state}'"),
            ),
            other => ApiError::Internal(other.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn repo_error_merge_with_conflict_message_is_a_conflict() {
        let err = RepoError::Merge {
            project_id: "acme/app".into(),
            branch: "task/1-1-1".into(),
            source: anyhow::anyhow!("merge conflict between main and task/1-1-1"),
        };
        assert!(err.is_conflict());
    }

    #[test]
    fn repo_error_merge_without_conflict_message_is_not_a_conflict() {
        let err = RepoError::Merge {
            project_id: "acme/app".into(),
            branch: "task/1-1-1".into(),
            source: anyhow::anyhow!("disk full"),
        };
        assert!(!err.is_conflict());
    }

    #[test]
    fn repo_error_checkout_is_not_retryable() {
        let err = RepoError::Checkout {
            project_id: "acme/app".into(),
            branch: "task/1-1-1".into(),
            source: anyhow::anyhow!("dirty working tree"),
        };
        assert!(!err.retryable());
    }

    #[test]
    fn repo_error_clone_and_fetch_are_retryable() {
        let clone_err = RepoError::Clone {
            project_id: "acme/app".into(),
            source: anyhow::anyhow!("network unreachable"),
        };
        let fetch_err = RepoError::Fetch {
            project_id: "acme/app".into(),
            source: anyhow::anyhow!("network unreachable"),
        };
        assert!(clone_err.retryable());
        assert!(fetch_err.retryable());
    }

    #[test]
    fn container_error_unhealthy_carries_project_id() {
        let err = ContainerError::Unhealthy {
            project_id: "acme/app".into(),
        };
        match &err {
            ContainerError::Unhealthy { project_id } => assert_eq!(project_id, "acme/app"),
            _ => panic!("expected Unhealthy"),
        }
    }

    #[test]
    fn container_error_exec_with_missing_executable_message_is_missing_binary() {
        let err = ContainerError::Exec {
            project_id: "acme/app".into(),
            source: anyhow::anyhow!("OCI runtime exec failed: exec failed: unable to start container process: exec: \"claude-code\": executable file not found in $PATH"),
        };
        assert!(err.is_missing_binary());
    }

    #[test]
    fn container_error_exec_with_other_message_is_not_missing_binary() {
        let err = ContainerError::Exec {
            project_id: "acme/app".into(),
            source: anyhow::anyhow!("connection reset by peer"),
        };
        assert!(!err.is_missing_binary());
    }

    #[test]
    fn container_error_timeout_is_not_missing_binary() {
        let err = ContainerError::Timeout { project_id: "acme/app".into(), timeout_secs: 30 };
        assert!(!err.is_missing_binary());
    }

    #[test]
    fn workflow_error_converts_from_repo_error() {
        let inner = RepoError::Checkout {
            project_id: "acme/app".into(),
            branch: "task/1-1-1".into(),
            source: anyhow::anyhow!("conflict"),
        };
        let wf_err: WorkflowError = inner.into();
        assert!(matches!(wf_err, WorkflowError::Repo(RepoError::Checkout { .. })));
    }

    #[test]
    fn state_machine_error_wraps_verify_error() {
        let verify_err = VerifyError {
            stage: "npm run build".into(),
            exit_code: 1,
            stderr_tail: "SyntaxError: unexpected token".into(),
        };
        let sm_err: StateMachineError = verify_err.into();
        match &sm_err {
            StateMachineError::Verify(v) => assert_eq!(v.exit_code, 1),
            _ => panic!("expected Verify"),
        }
        assert!(sm_err.to_string().contains("SyntaxError"));
    }

    #[test]
    fn state_machine_error_merge_conflict_carries_branch() {
        let err = StateMachineError::MergeConflict {
            project_id: "acme/app".into(),
            branch: "task/1-1-1".into(),
        };
        assert!(err.to_string().contains("task/1-1-1"));
    }

    #[test]
    fn api_error_validation_maps_to_422() {
        let err = ApiError::Validation("id must match [A-Za-z0-9_-]+".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn api_error_conflict_maps_to_409() {
        let err = ApiError::Conflict("live execution already exists".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn api_error_not_found_maps_to_404() {
        let err = ApiError::NotFound("project acme/app".into());
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn illegal_transition_converts_to_conflict() {
        let sm_err = StateMachineError::IllegalTransition {
            state: "stopped".into(),
            command: "resume",
        };
        let api_err: ApiError = sm_err.into();
        assert!(matches!(api_err, ApiError::Conflict(_)));
        assert_eq!(api_err.status(), StatusCode::CONFLICT);
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&ContainerError::Unhealthy {
            project_id: "acme/app".into(),
        });
        assert_std_error(&ExecutionError::Tool { exit_code: 1 });
        assert_std_error(&VerifyError {
            stage: "npm ci".into(),
            exit_code: 1,
            stderr_tail: String::new(),
        });
        assert_std_error(&EventStoreError::Validation("bad".into()));
    }
}
