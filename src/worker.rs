//! Background worker: drains the Job Queue, runs the Task Execution State
//! Machine for each delivery, and fans the result out to persistence and the
//! WebSocket Fabric.
//!
//! Grounded on the teacher's `factory/pipeline.rs::start_run` (spawn one
//! background task per run, persist-then-broadcast at every step) and
//! `factory/server.rs`'s dispatch loop, generalized from "one run per HTTP
//! request" to "one run per queued delivery", each bounded by the global
//! concurrency semaphore rather than run unconditionally.

use crate::app::AppState;
use crate::queue::Delivery;
use crate::statemachine::{RunOutcome, StateMachine};
use crate::tasklist::{self, TaskList};
use crate::ws;
use devteam_common::{ExecutionStatus, TaskContext};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};

const TASK_LIST_FILE: &str = "task_lists.md";

/// Runs until the queue's sender side is dropped. Intended to be spawned
/// once at startup and left to run for the process lifetime.
pub async fn run(app: Arc<AppState>, mut receiver: crate::queue::JobQueueReceiver) {
    while let Some(delivery) = receiver.recv().await {
        let app = app.clone();
        let permit = app.execution_permits.clone().acquire_owned().await;
        tokio::spawn(async move {
            let _permit = permit;
            process_delivery(app, delivery).await;
        });
    }
}

#[instrument(skip(app, delivery), fields(execution_id = %delivery.execution_id, event_id = %delivery.event.id))]
async fn process_delivery(app: Arc<AppState>, delivery: Delivery) {
    let Delivery { execution_id, event, .. } = delivery;
    let project_id = event.project_id.clone();

    let execution = match app.events.get_execution(execution_id) {
        Ok(execution) => execution,
        Err(err) => {
            error!(%err, "delivery names an execution that no longer exists");
            return;
        }
    };

    if execution.status.is_terminal() {
        info!("skipping delivery for an execution already in a terminal state (resume no-op)");
        return;
    }

    let repo_url = event
        .payload
        .get("repoUrl")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_default();

    let mut ctx = app.events.load_context(execution_id).unwrap_or(None).unwrap_or_else(|| TaskContext::new(&project_id));
    let control = app.control_for(&project_id);

    if let Err(err) = app.events.update_execution_status(execution_id, ExecutionStatus::Initializing) {
        error!(%err, "failed to mark execution initializing");
        return;
    }

    let repo_path = match app.repo.ensure(&project_id, &repo_url).await {
        Ok(path) => path,
        Err(err) => {
            warn!(%err, "failed to prepare repo cache, aborting run");
            let _ = app.events.update_execution_status(execution_id, ExecutionStatus::Error);
            ws::broadcast_error(&app, &project_id, "repo_unavailable", &err.to_string());
            ws::broadcast_completion(&app, &project_id, "error");
            return;
        }
    };

    let tasks = read_tasklist(&repo_path);

    let _ = app.events.update_execution_status(execution_id, ExecutionStatus::Running);

    let state_machine = StateMachine::new(app.repo.clone(), app.containers.clone(), app.config.clone());
    let app_for_persist = app.clone();
    let project_for_persist = project_id.clone();
    let repo_path_for_persist = repo_path.clone();

    let (ctx, tasks, outcome) = state_machine
        .run(&project_id, &repo_url, std::mem::take(&mut ctx), tasks, control.clone(), move |ctx, tasks| {
            persist_and_broadcast(&app_for_persist, &project_for_persist, execution_id, &repo_path_for_persist, ctx, tasks);
        })
        .await;

    let _ = ctx;

    match outcome {
        RunOutcome::Done => {
            let _ = app.events.update_execution_status(execution_id, ExecutionStatus::Done);
            ws::broadcast_completion(&app, &project_id, "done");
        }
        RunOutcome::Stopped => {
            let _ = app.events.update_execution_status(execution_id, ExecutionStatus::Stopped);
            ws::broadcast_completion(&app, &project_id, "stopped");
        }
        RunOutcome::Failed(err) => {
            error!(%err, "execution failed");
            let _ = app.events.update_execution_status(execution_id, ExecutionStatus::Error);
            ws::broadcast_error(&app, &project_id, "execution_failed", &err.to_string());
            ws::broadcast_completion(&app, &project_id, "error");
        }
    }

    app.clear_control(&project_id);
    let _ = tasks;
}

fn read_tasklist(repo_path: &std::path::Path) -> TaskList {
    match std::fs::read_to_string(repo_path.join(TASK_LIST_FILE)) {
        Ok(markdown) => tasklist::parse(&markdown),
        Err(_) => tasklist::parse(""),
    }
}

/// §4.F's "every state transition is persisted as a TaskContext snapshot
/// replace, plus one tracing event, plus one WS broadcast" — this closure is
/// that ambient addition's other half (the state machine itself only calls
/// it, it never writes storage or sockets directly).
fn persist_and_broadcast(
    app: &Arc<AppState>,
    project_id: &str,
    execution_id: uuid::Uuid,
    repo_path: &std::path::Path,
    ctx: &TaskContext,
    tasks: &TaskList,
) {
    if let Err(err) = app.events.save_context(execution_id, ctx) {
        error!(%err, "failed to persist task context snapshot");
    }

    if let Err(err) = std::fs::write(repo_path.join(TASK_LIST_FILE), tasklist::render(tasks)) {
        warn!(%err, "failed to write task_lists.md back to the repo working copy");
    }

    if let Ok(execution) = app.events.get_execution(execution_id) {
        let projection = crate::projection::project(&execution, ctx, tasks);
        ws::broadcast_execution_update(app, project_id, &projection);
    }

    if let Some(last_log) = ctx.metadata.logs.last() {
        ws::queue_log(app.clone(), app.log_coalescer(), project_id, "info", last_log, None);
    }
}
