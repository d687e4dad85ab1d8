//! Workflow Engine (§4.E).
//!
//! Generalizes the teacher's DAG scheduler (`src/dag/{mod,builder,scheduler,
//! executor,state}.rs`: wave computation over a `phases.json` dependency
//! graph) into a compile-time node registry keyed by string name, where
//! edges are chosen by tagged outcome (`NodeOutcome::{Success,Retryable,
//! Fatal}`) rather than by wave membership. The teacher's DAG is built once
//! from static phase dependencies and executed breadth-first; this registry
//! is built once at startup (§4.F wires up SELECT..DONE) and walked
//! depth-first, one node at a time, following whichever edge the node's
//! outcome selects — including back-edges, which the teacher's acyclic
//! scheduler could never express (ERROR_INJECT/INJECT_TASK loop back to
//! SELECT, §4.F).
//!
//! A single execution's nodes always run on the caller's task — concurrency
//! across executions belongs to the caller (§5: serial per project,
//! parallel across projects), not to this engine.

use crate::errors::WorkflowError;
use async_trait::async_trait;
use devteam_common::{NodeOutcome, TaskContext};
use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{instrument, warn};

/// A single workflow node: takes ownership of the context, returns the
/// updated context plus its outcome. The node is responsible for calling
/// `TaskContext::record_node` with its own result before returning (§3
/// invariant: a node never observes a context newer than the one passed to
/// it — so each node's own record is the last thing written into it).
#[async_trait]
pub trait WorkflowNode: Send + Sync {
    async fn run(&self, ctx: TaskContext) -> (TaskContext, NodeOutcome);
}

type RouteFn = Arc<dyn Fn(&TaskContext) -> Option<String> + Send + Sync>;

/// How a named entry in the registry behaves.
pub enum NodeKind {
    /// Runs one node, then follows the edge matching its outcome.
    Compute {
        node: Arc<dyn WorkflowNode>,
        on_success: Option<String>,
        on_retryable: Option<String>,
        on_fatal: Option<String>,
    },
    /// Runs a pure routing function over the context and jumps directly to
    /// whatever node name it returns (`None` halts). Used for conditional
    /// edges that don't correspond to a subsystem outcome — e.g. PUSH's
    /// "is this the final task?" branch to UPDATE_TASKLIST vs DONE.
    Route { route: RouteFn },
    /// Runs several nodes concurrently and merges their outcomes: fatal
    /// beats retryable beats success. Not used by the SELECT..DONE chain
    /// today (§4.F is strictly sequential) but kept available for
    /// independent verification substeps a future workflow might add.
    Concurrent {
        nodes: Vec<Arc<dyn WorkflowNode>>,
        on_success: Option<String>,
        on_retryable: Option<String>,
        on_fatal: Option<String>,
    },
}

/// A compile-time-assembled, name-keyed workflow definition.
pub struct WorkflowRegistry {
    name: String,
    entry: String,
    nodes: HashMap<String, NodeKind>,
}

pub struct WorkflowRegistryBuilder {
    name: String,
    entry: String,
    nodes: HashMap<String, NodeKind>,
}

impl WorkflowRegistry {
    pub fn builder(name: impl Into<String>, entry: impl Into<String>) -> WorkflowRegistryBuilder {
        WorkflowRegistryBuilder {
            name: name.into(),
            entry: entry.into(),
            nodes: HashMap::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl WorkflowRegistryBuilder {
    pub fn node(mut self, name: impl Into<String>, kind: NodeKind) -> Self {
        self.nodes.insert(name.into(), kind);
        self
    }

    pub fn build(self) -> WorkflowRegistry {
        WorkflowRegistry {
            name: self.name,
            entry: self.entry,
            nodes: self.nodes,
        }
    }
}

fn merge_outcomes(outcomes: &[NodeOutcome]) -> NodeOutcome {
    if outcomes.iter().any(|o| o.is_fatal()) {
        NodeOutcome::Fatal
    } else if outcomes.iter().any(|o| o.is_retryable()) {
        NodeOutcome::Retryable
    } else {
        NodeOutcome::Success
    }
}

/// Runs `registry` starting from its entry node until a halting edge (`None`)
/// is reached, calling `persist` with the context after every transition
/// (§4.E: "a durable write follows every node", generalized from the
/// teacher's DB-then-broadcast update pairing in `factory/pipeline.rs`).
#[instrument(skip(registry, ctx, persist))]
pub async fn run_workflow(
    registry: &WorkflowRegistry,
    mut ctx: TaskContext,
    mut persist: impl FnMut(&TaskContext),
) -> Result<TaskContext, WorkflowError> {
    let mut current = registry.entry.clone();

    loop {
        let kind = registry
            .nodes
            .get(&current)
            .ok_or_else(|| WorkflowError::UnknownWorkflow { name: current.clone() })?;

        let next = match kind {
            NodeKind::Compute { node, on_success, on_retryable, on_fatal } => {
                let (updated, outcome) = node.run(ctx).await;
                ctx = updated;
                persist(&ctx);
                pick_edge(&current, outcome, on_success, on_retryable, on_fatal)?
            }
            NodeKind::Route { route } => {
                persist(&ctx);
                route(&ctx)
            }
            NodeKind::Concurrent { nodes, on_success, on_retryable, on_fatal } => {
                let results = join_all(nodes.iter().map(|n| n.run(ctx.clone()))).await;
                let outcomes: Vec<NodeOutcome> = results.iter().map(|(_, o)| *o).collect();
                for (updated, _) in results {
                    for (name, record) in updated.nodes {
                        ctx.nodes.insert(name, record);
                    }
                }
                persist(&ctx);
                let merged = merge_outcomes(&outcomes);
                pick_edge(&current, merged, on_success, on_retryable, on_fatal)?
            }
        };

        match next {
            Some(name) => current = name,
            None => {
                warn!(node = %current, "workflow halted");
                return Ok(ctx);
            }
        }
    }
}

fn pick_edge(
    node: &str,
    outcome: NodeOutcome,
    on_success: &Option<String>,
    on_retryable: &Option<String>,
    on_fatal: &Option<String>,
) -> Result<Option<String>, WorkflowError> {
    match outcome {
        NodeOutcome::Success => Ok(on_success.clone()),
        NodeOutcome::Retryable => Ok(on_retryable.clone()),
        NodeOutcome::Fatal => match on_fatal {
            Some(next) => Ok(Some(next.clone())),
            None => Err(WorkflowError::NodeFatal {
                node: node.to_string(),
                message: "no fatal edge defined".to_string(),
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use devteam_common::NodeRecord;

    struct AlwaysSucceeds(&'static str);
    #[async_trait]
    impl WorkflowNode for AlwaysSucceeds {
        async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
            ctx.record_node(self.0, NodeRecord::success(serde_json::json!({}), None));
            (ctx, NodeOutcome::Success)
        }
    }

    struct AlwaysFatal(&'static str);
    #[async_trait]
    impl WorkflowNode for AlwaysFatal {
        async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
            ctx.record_node(self.0, NodeRecord::fatal(serde_json::json!({}), None));
            (ctx, NodeOutcome::Fatal)
        }
    }

    #[tokio::test]
    async fn runs_two_nodes_in_sequence_then_halts() {
        let registry = WorkflowRegistry::builder("test", "A")
            .node(
                "A",
                NodeKind::Compute {
                    node: Arc::new(AlwaysSucceeds("A")),
                    on_success: Some("B".to_string()),
                    on_retryable: None,
                    on_fatal: None,
                },
            )
            .node(
                "B",
                NodeKind::Compute {
                    node: Arc::new(AlwaysSucceeds("B")),
                    on_success: None,
                    on_retryable: None,
                    on_fatal: None,
                },
            )
            .build();

        let mut writes = Vec::new();
        let ctx = TaskContext::new("acme/app");
        let result = run_workflow(&registry, ctx, |c| writes.push(c.clone())).await.unwrap();

        assert!(result.node("A").is_some());
        assert!(result.node("B").is_some());
        assert_eq!(writes.len(), 2);
    }

    #[tokio::test]
    async fn fatal_outcome_without_edge_is_an_error() {
        let registry = WorkflowRegistry::builder("test", "A")
            .node(
                "A",
                NodeKind::Compute {
                    node: Arc::new(AlwaysFatal("A")),
                    on_success: Some("B".to_string()),
                    on_retryable: None,
                    on_fatal: None,
                },
            )
            .build();

        let ctx = TaskContext::new("acme/app");
        let err = run_workflow(&registry, ctx, |_| {}).await.unwrap_err();
        assert!(matches!(err, WorkflowError::NodeFatal { .. }));
    }

    #[tokio::test]
    async fn fatal_outcome_with_edge_routes_there() {
        let registry = WorkflowRegistry::builder("test", "A")
            .node(
                "A",
                NodeKind::Compute {
                    node: Arc::new(AlwaysFatal("A")),
                    on_success: None,
                    on_retryable: None,
                    on_fatal: Some("RECOVER".to_string()),
                },
            )
            .node(
                "RECOVER",
                NodeKind::Compute {
                    node: Arc::new(AlwaysSucceeds("RECOVER")),
                    on_success: None,
                    on_retryable: None,
                    on_fatal: None,
                },
            )
            .build();

        let ctx = TaskContext::new("acme/app");
        let result = run_workflow(&registry, ctx, |_| {}).await.unwrap();
        assert!(result.node("RECOVER").is_some());
    }

    #[tokio::test]
    async fn unknown_node_name_is_an_error() {
        let registry = WorkflowRegistry::builder("test", "MISSING").build();
        let ctx = TaskContext::new("acme/app");
        let err = run_workflow(&registry, ctx, |_| {}).await.unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownWorkflow { .. }));
    }

    #[tokio::test]
    async fn route_node_jumps_directly_by_predicate() {
        let registry = WorkflowRegistry::builder("test", "BRANCH")
            .node(
                "BRANCH",
                NodeKind::Route {
                    route: Arc::new(|ctx| {
                        if ctx.metadata.project_id == "acme/app" {
                            Some("YES".to_string())
                        } else {
                            None
                        }
                    }),
                },
            )
            .node(
                "YES",
                NodeKind::Compute {
                    node: Arc::new(AlwaysSucceeds("YES")),
                    on_success: None,
                    on_retryable: None,
                    on_fatal: None,
                },
            )
            .build();

        let ctx = TaskContext::new("acme/app");
        let result = run_workflow(&registry, ctx, |_| {}).await.unwrap();
        assert!(result.node("YES").is_some());
    }

    #[tokio::test]
    async fn concurrent_node_merges_to_worst_outcome() {
        let registry = WorkflowRegistry::builder("test", "PAR")
            .node(
                "PAR",
                NodeKind::Concurrent {
                    nodes: vec![Arc::new(AlwaysSucceeds("ok")), Arc::new(AlwaysFatal("bad"))],
                    on_success: Some("NEVER".to_string()),
                    on_retryable: None,
                    on_fatal: Some("RECOVER".to_string()),
                },
            )
            .node(
                "RECOVER",
                NodeKind::Compute {
                    node: Arc::new(AlwaysSucceeds("RECOVER")),
                    on_success: None,
                    on_retryable: None,
                    on_fatal: None,
                },
            )
            .build();

        let ctx = TaskContext::new("acme/app");
        let result = run_workflow(&registry, ctx, |_| {}).await.unwrap();
        assert!(result.node("ok").is_some());
        assert!(result.node("bad").is_some());
        assert!(result.node("RECOVER").is_some());
    }
}
