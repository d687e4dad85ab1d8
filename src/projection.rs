//! Status Projection (§4.I).
//!
//! Generalizes the teacher's `DagSummary` (`dag/state.rs`: fold node
//! results into totals and a completion percentage) into a pure function
//! from `TaskContext` + task list to `StatusProjection` — no query against
//! history, so reads stay constant-time regardless of how many nodes have
//! run (§4.I: "constant-time with respect to history size").

use crate::tasklist::TaskList;
use devteam_common::{ArtifactsView, Execution, ExecutionStatus, StatusProjection, TaskContext, Totals};

/// Derives the external read model. `execution` supplies identity/status/
/// timestamps; `ctx` and `tasks` supply everything else.
pub fn project(execution: &Execution, ctx: &TaskContext, tasks: &TaskList) -> StatusProjection {
    let totals = Totals {
        completed: tasks.completed_count() as u32,
        total: tasks.total() as u32,
    };

    let current_task = if execution.status == ExecutionStatus::Done {
        None
    } else {
        ctx.metadata.task_id.clone()
    };

    StatusProjection {
        execution_id: execution.execution_id,
        project_id: execution.project_id.clone(),
        status: execution.status,
        progress: StatusProjection::compute_progress(totals),
        current_task,
        totals,
        branch: ctx.metadata.branch.clone(),
        artifacts: ArtifactsView {
            repo_path: ctx.metadata.repo_path.clone(),
            branch: ctx.metadata.branch.clone(),
            logs: ctx.metadata.logs.clone(),
            files_modified: ctx.metadata.files_modified.clone(),
        },
        started_at: ctx.metadata.started_at,
        updated_at: Some(execution.updated_at),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasklist;
    use devteam_common::TaskId;
    use uuid::Uuid;

    fn execution(status: ExecutionStatus) -> Execution {
        let mut execution = Execution::new("acme/app", Uuid::new_v4());
        execution.status = status;
        execution
    }

    #[test]
    fn progress_matches_task_list_totals() {
        let markdown = "\
## 1.1.1: A\nStatus: done\nDo a thing.\n\n## 1.1.2: B\nStatus: pending\nDo another thing.\n";
        let tasks = tasklist::parse(markdown);
        let mut ctx = TaskContext::new("acme/app");
        ctx.metadata.task_id = Some("1.1.2".parse::<TaskId>().unwrap());
        let execution = execution(ExecutionStatus::Running);

        let projection = project(&execution, &ctx, &tasks);
        assert_eq!(projection.totals.completed, 1);
        assert_eq!(projection.totals.total, 2);
        assert_eq!(projection.progress, 50.0);
        assert_eq!(projection.current_task, Some("1.1.2".parse().unwrap()));
    }

    #[test]
    fn done_execution_has_no_current_task() {
        let tasks = tasklist::parse("## 1.1.1: A\nStatus: done\nDo a thing.\n");
        let ctx = TaskContext::new("acme/app");
        let execution = execution(ExecutionStatus::Done);

        let projection = project(&execution, &ctx, &tasks);
        assert!(projection.current_task.is_none());
        assert_eq!(projection.progress, 100.0);
    }

    #[test]
    fn empty_task_list_does_not_divide_by_zero() {
        let tasks = tasklist::parse("");
        let ctx = TaskContext::new("acme/app");
        let execution = execution(ExecutionStatus::Initializing);

        let projection = project(&execution, &ctx, &tasks);
        assert_eq!(projection.progress, 0.0);
    }
}
