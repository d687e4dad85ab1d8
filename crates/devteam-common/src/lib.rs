//! Shared domain types for the DevTeam Runner.
//!
//! These are the entities of the data model (events, executions, task
//! contexts, projections) that cross the boundary between the HTTP/WS
//! surface, the workflow engine, and the persistence layer. Keeping them in
//! their own crate lets the wire format and the internal execution model
//! evolve without a circular dependency on the server binary.

mod container;
mod context;
mod event;
mod execution;
mod outcome;
mod projection;
mod task;

pub use container::{ContainerHandle, RepoCacheEntry, ResourceLimits};
pub use context::{ExecutionArtifact, NodeRecord, TaskContext, TaskContextMetadata};
pub use event::Event;
pub use execution::{Execution, ExecutionStatus};
pub use outcome::NodeOutcome;
pub use projection::{ArtifactsView, StatusProjection, Totals};
pub use task::{TaskId, TaskListEntry};
