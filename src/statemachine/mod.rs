//! Task Execution State Machine (§4.F).
//!
//! Drives one execution through SELECT→PREP→IMPLEMENT→VERIFY→MERGE→PUSH→
//! UPDATE_TASKLIST→(SELECT|DONE), with ERROR_INJECT→INJECT_TASK as the
//! back-edge every stage's recoverable failure routes through. Grounded on
//! the teacher's `orchestrator/state.rs` (a linear per-phase driver with its
//! own persisted state, distinct from the DAG scheduler) and
//! `factory/pipeline.rs`'s run loop (persist-then-broadcast after every
//! step); the per-stage logic below (`prep`/`implement`/`verify`/`merge`/
//! `push`/`inject_remediation`) stays a plain async method per stage, same
//! shape as the teacher's `ClaudeRunner` phase methods, but the control flow
//! stitching them into SELECT..DONE is the generic Workflow Engine
//! (`crate::workflow`) itself: each stage is one `WorkflowNode`, `Retryable`
//! is the ERROR_INJECT back-edge to SELECT, and `Fatal` is the halt edge to
//! a terminal `HALT` node, with the actual reason (`Stopped`/`MissingTool`/
//! `TransitionLimitExceeded`) recorded on the side in `Shared::halt` since
//! the engine's tagged outcome alone can't carry it.

use crate::config::RunnerConfig;
use crate::container::ContainerManager;
use crate::errors::{ExecutionError, StateMachineError};
use crate::executor;
use crate::redact::redact;
use crate::repo::RepoCacheManager;
use crate::tasklist::TaskList;
use crate::verify;
use crate::workflow::{self, NodeKind, WorkflowNode, WorkflowRegistry};
use async_trait::async_trait;
use devteam_common::{NodeOutcome, NodeRecord, TaskContext, TaskId, TaskListEntry};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, instrument, warn};

/// Node transitions a single execution may make before the driver gives up
/// rather than loop forever injecting remediation tasks that never resolve
/// — the same bounded-attempt idiom as `repo::MAX_RETRYABLE_ATTEMPTS` and
/// `verify::MAX_ATTEMPTS`.
const MAX_TRANSITIONS: usize = 500;

/// PUSH's own bounded retry (§4.F: "retries up to 3 times with exponential
/// backoff"), distinct from `RepoCacheManager`'s internal clone/fetch retry.
const MAX_PUSH_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ControlState {
    Running,
    Paused,
    Stopped,
}

/// Cooperative pause/resume/stop signal, observed between stages (§5:
/// "pause is cooperative and applies at node boundaries only"). IMPLEMENT
/// and VERIFY additionally race `wait_stopped` against their own future so a
/// stop mid-stage takes effect well inside the 5s grace window instead of
/// waiting out a 30s/60s budget.
pub struct ExecutionControl {
    state: StdMutex<ControlState>,
    notify: Notify,
}

impl Default for ExecutionControl {
    fn default() -> Self {
        Self {
            state: StdMutex::new(ControlState::Running),
            notify: Notify::new(),
        }
    }
}

impl ExecutionControl {
    pub fn new() -> Self {
        Self::default()
    }

    fn set(&self, state: ControlState) {
        *self.state.lock().expect("control state poisoned") = state;
    }

    fn current(&self) -> ControlState {
        *self.state.lock().expect("control state poisoned")
    }

    pub fn pause(&self) {
        self.set(ControlState::Paused);
    }

    pub fn resume(&self) {
        self.set(ControlState::Running);
        self.notify.notify_waiters();
    }

    pub fn stop(&self) {
        self.set(ControlState::Stopped);
        self.notify.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.current() == ControlState::Paused
    }

    pub fn is_stopped(&self) -> bool {
        self.current() == ControlState::Stopped
    }

    /// Blocks while paused. Returns `false` once stopped, `true` once
    /// (still or again) running. Called at every stage boundary.
    pub async fn checkpoint(&self) -> bool {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            match self.current() {
                ControlState::Running => return true,
                ControlState::Stopped => return false,
                ControlState::Paused => notified.await,
            }
        }
    }

    /// Resolves as soon as `stop` is called, ignoring pause. Raced against a
    /// long-running stage's own future rather than waiting for that stage's
    /// node boundary.
    pub async fn wait_stopped(&self) {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }
}

/// How `StateMachine::run` ended.
pub enum RunOutcome {
    Done,
    Stopped,
    Failed(StateMachineError),
}

struct StageFailure {
    message: String,
    /// `true` only for failures §4.F says are fatal to the whole execution
    /// rather than recoverable via ERROR_INJECT (`ExecutionError::MissingTool`).
    halt: bool,
}

impl StageFailure {
    fn recoverable(message: impl Into<String>) -> Self {
        Self { message: message.into(), halt: false }
    }

    fn halting(message: impl Into<String>) -> Self {
        Self { message: message.into(), halt: true }
    }
}

enum StageResult {
    Ok,
    Failed(StageFailure),
    Stopped,
}

/// Drives SELECT..DONE for a single execution. Holds `Arc` handles onto the
/// shared subsystems rather than borrowing them, so its per-stage work can be
/// split across `WorkflowNode` trait objects (which the engine requires to
/// be `'static`) the way the teacher's `ClaudeRunner` holds an `Arc<Config>`
/// and reaches out to the filesystem/process APIs it needs per call.
pub struct StateMachine {
    repo: Arc<RepoCacheManager>,
    containers: Option<Arc<ContainerManager>>,
    config: Arc<RunnerConfig>,
}

impl StateMachine {
    pub fn new(
        repo: Arc<RepoCacheManager>,
        containers: Option<Arc<ContainerManager>>,
        config: Arc<RunnerConfig>,
    ) -> Self {
        Self { repo, containers, config }
    }

    /// Runs `ctx`/`tasks` to completion by building a `WorkflowRegistry`
    /// (SELECT→PREP→IMPLEMENT→VERIFY→MERGE→PUSH→UPDATE_TASKLIST, looping
    /// back to SELECT on `Retryable` and halting on `Fatal`) and driving it
    /// with `workflow::run_workflow`, calling `persist` after every
    /// transition (§4.F ambient addition: "every state transition is
    /// persisted as a TaskContext snapshot replace, plus one tracing event,
    /// plus one WS broadcast" — the broadcast half is the caller's `persist`
    /// closure's job, not this driver's).
    #[instrument(skip(self, ctx, tasks, control, persist))]
    pub async fn run(
        &self,
        project_id: &str,
        repo_url: &str,
        mut ctx: TaskContext,
        tasks: TaskList,
        control: Arc<ExecutionControl>,
        mut persist: impl FnMut(&TaskContext, &TaskList),
    ) -> (TaskContext, TaskList, RunOutcome) {
        let shared = Arc::new(Shared {
            repo: self.repo.clone(),
            containers: self.containers.clone(),
            config: self.config.clone(),
            project_id: project_id.to_string(),
            repo_url: repo_url.to_string(),
            tasks: StdMutex::new(tasks),
            control,
            transitions: AtomicUsize::new(0),
            halt: StdMutex::new(None),
        });

        {
            let registry = build_registry(shared.clone());
            ctx = match workflow::run_workflow(&registry, ctx, |c| {
                let tasks = shared.tasks.lock().expect("task list lock poisoned");
                persist(c, &tasks);
            })
            .await
            {
                Ok(ctx) => ctx,
                Err(err) => {
                    // Unreachable given the registry `build_registry` assembles (every
                    // node name it references is declared, every `Fatal` outcome has
                    // a `HALT` edge) — fail closed rather than panic if that ever drifts.
                    // `run_workflow` consumed the original context on entry and an `Err`
                    // carries none back, so the best we can return here is a fresh one.
                    let tasks = shared.tasks.lock().expect("task list lock poisoned").clone();
                    let ctx = TaskContext::new(project_id);
                    return (ctx, tasks, RunOutcome::Failed(StateMachineError::Workflow(err)));
                }
            };
        }

        let shared = Arc::try_unwrap(shared).unwrap_or_else(|arc| {
            warn!("Shared still referenced after run_workflow returned; cloning state instead");
            Shared {
                repo: arc.repo.clone(),
                containers: arc.containers.clone(),
                config: arc.config.clone(),
                project_id: arc.project_id.clone(),
                repo_url: arc.repo_url.clone(),
                tasks: StdMutex::new(arc.tasks.lock().expect("task list lock poisoned").clone()),
                control: arc.control.clone(),
                transitions: AtomicUsize::new(arc.transitions.load(Ordering::SeqCst)),
                halt: StdMutex::new(arc.halt.lock().expect("halt lock poisoned").clone()),
            }
        });
        let tasks = shared.tasks.into_inner().expect("task list lock poisoned");
        let halt = shared.halt.into_inner().expect("halt lock poisoned");

        let outcome = match halt {
            Some(Halt::Stopped) => RunOutcome::Stopped,
            Some(Halt::MissingTool { path }) => {
                RunOutcome::Failed(StateMachineError::Execution(ExecutionError::MissingTool { path }))
            }
            Some(Halt::TransitionLimitExceeded) => {
                RunOutcome::Failed(StateMachineError::TransitionLimitExceeded { limit: MAX_TRANSITIONS })
            }
            None => RunOutcome::Done,
        };

        (ctx, tasks, outcome)
    }

    async fn prep(
        &self,
        project_id: &str,
        repo_url: &str,
        task_id: &TaskId,
        title: &str,
        ctx: &mut TaskContext,
    ) -> StageResult {
        let timeout = Duration::from_secs(self.config.prep_timeout_seconds);
        let attempt = async {
            let repo_path = self.repo.ensure(project_id, repo_url).await?;
            let branch = self.repo.checkout_task_branch(project_id, task_id, title).await?;
            if let Some(containers) = self.containers.as_ref() {
                containers.ensure_container(project_id).await?;
            }
            ctx.metadata.repo_path = Some(repo_path.display().to_string());
            ctx.metadata.branch = Some(branch);
            Ok::<(), anyhow::Error>(())
        };

        let result = match tokio::time::timeout(timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(anyhow::anyhow!("PREP exceeded its {}s timeout", self.config.prep_timeout_seconds)),
        };

        match result {
            Ok(()) => {
                ctx.record_node("PREP", NodeRecord::success(serde_json::json!({}), None));
                StageResult::Ok
            }
            Err(err) => {
                let message = redact(&err.to_string());
                ctx.record_node("PREP", NodeRecord::fatal(serde_json::json!({"error": message}), None));
                ctx.metadata.last_error = Some(message.clone());
                StageResult::Failed(StageFailure::recoverable(message))
            }
        }
    }

    async fn implement(
        &self,
        project_id: &str,
        entry: &TaskListEntry,
        ctx: &mut TaskContext,
        control: &ExecutionControl,
    ) -> StageResult {
        let Some(containers) = self.containers.as_ref() else {
            let message = "container manager unavailable".to_string();
            ctx.record_node("IMPLEMENT", NodeRecord::fatal(serde_json::json!({"error": message}), None));
            ctx.metadata.last_error = Some(message.clone());
            return StageResult::Failed(StageFailure::recoverable(message));
        };
        let Some(tool_binary_path) = self.config.tool_binary_path.clone() else {
            let message = "TOOL_BINARY_PATH is not configured".to_string();
            ctx.record_node("IMPLEMENT", NodeRecord::fatal(serde_json::json!({"error": message}), None));
            ctx.metadata.last_error = Some(message.clone());
            return StageResult::Failed(StageFailure::halting(message));
        };
        let Some(repo_path) = ctx.metadata.repo_path.clone() else {
            return StageResult::Failed(StageFailure::recoverable("PREP never recorded a repo path"));
        };
        let timeout = Duration::from_secs(self.config.implement_timeout_seconds);

        let outcome = tokio::select! {
            _ = control.wait_stopped() => return StageResult::Stopped,
            result = executor::implement(containers, project_id, &repo_path, &tool_binary_path, entry, timeout) => result,
        };

        match outcome {
            Ok(outcome) => {
                ctx.metadata.files_modified = outcome.artifact.files_modified.clone();
                ctx.record_node("IMPLEMENT", NodeRecord::success(serde_json::json!({}), Some(outcome.artifact)));
                StageResult::Ok
            }
            Err(err) => {
                let halt = matches!(err, ExecutionError::MissingTool { .. });
                let message = redact(&err.to_string());
                ctx.record_node("IMPLEMENT", NodeRecord::fatal(serde_json::json!({"error": message}), None));
                ctx.metadata.last_error = Some(message.clone());
                if halt {
                    StageResult::Failed(StageFailure::halting(message))
                } else {
                    StageResult::Failed(StageFailure::recoverable(message))
                }
            }
        }
    }

    async fn verify(&self, project_id: &str, ctx: &mut TaskContext, control: &ExecutionControl) -> StageResult {
        let Some(containers) = self.containers.as_ref() else {
            let message = "container manager unavailable".to_string();
            ctx.record_node("VERIFY", NodeRecord::fatal(serde_json::json!({"error": message}), None));
            ctx.metadata.last_error = Some(message.clone());
            return StageResult::Failed(StageFailure::recoverable(message));
        };
        let Some(repo_path) = ctx.metadata.repo_path.clone() else {
            return StageResult::Failed(StageFailure::recoverable("PREP never recorded a repo path"));
        };
        let budget = Duration::from_secs(self.config.verify_timeout_seconds);

        let outcome = tokio::select! {
            _ = control.wait_stopped() => return StageResult::Stopped,
            result = verify::verify(containers, project_id, &repo_path, budget) => result,
        };

        match outcome {
            Ok(outcome) => {
                ctx.record_node(
                    "VERIFY",
                    NodeRecord::success(
                        serde_json::json!({"buildOutputDirs": outcome.build_output_dirs, "npmVersion": outcome.npm_version}),
                        Some(outcome.artifact),
                    ),
                );
                StageResult::Ok
            }
            Err(err) => {
                let message = redact(&format!("build failed at {} (exit {}): {}", err.stage, err.exit_code, err.stderr_tail));
                ctx.record_node("VERIFY", NodeRecord::fatal(serde_json::json!({"error": message}), None));
                ctx.metadata.last_error = Some(message.clone());
                StageResult::Failed(StageFailure::recoverable(message))
            }
        }
    }

    async fn merge(&self, project_id: &str, ctx: &mut TaskContext) -> StageResult {
        let Some(branch) = ctx.metadata.branch.clone() else {
            return StageResult::Failed(StageFailure::recoverable("PREP never recorded a branch"));
        };
        match self.repo.merge_task_branch(project_id, &branch).await {
            Ok(commit_hash) => {
                ctx.record_node("MERGE", NodeRecord::success(serde_json::json!({"commitHash": commit_hash}), None));
                StageResult::Ok
            }
            Err(err) => {
                let message = if err.is_conflict() {
                    format!("merge conflict on branch {branch}")
                } else {
                    redact(&err.to_string())
                };
                ctx.record_node("MERGE", NodeRecord::fatal(serde_json::json!({"error": message}), None));
                ctx.metadata.last_error = Some(message.clone());
                StageResult::Failed(StageFailure::recoverable(message))
            }
        }
    }

    async fn push(&self, project_id: &str, ctx: &mut TaskContext) -> StageResult {
        let mut last_message = String::new();
        for attempt in 1..=MAX_PUSH_ATTEMPTS {
            match self.repo.push_default_branch(project_id).await {
                Ok(branch) => {
                    ctx.record_node(
                        "PUSH",
                        NodeRecord::success(serde_json::json!({"branch": branch, "attempt": attempt}), None),
                    );
                    return StageResult::Ok;
                }
                Err(err) => {
                    last_message = redact(&err.to_string());
                    warn!(attempt, project_id, error = %last_message, "PUSH failed, retrying");
                    if attempt < MAX_PUSH_ATTEMPTS {
                        tokio::time::sleep(Duration::from_millis(200 * 2u64.pow(attempt - 1))).await;
                    }
                }
            }
        }
        ctx.record_node("PUSH", NodeRecord::fatal(serde_json::json!({"error": last_message}), None));
        ctx.metadata.last_error = Some(last_message.clone());
        StageResult::Failed(StageFailure::recoverable(last_message))
    }

    /// ERROR_INJECT → INJECT_TASK: synthesizes a remediation task from the
    /// failing stage's redacted summary and hands control back to SELECT.
    /// Marks `failed_task` failed (not completed) so it is never reselected
    /// while still satisfying the remediation task's back-dependency on it.
    fn inject_remediation(
        &self,
        ctx: &mut TaskContext,
        tasks: &mut TaskList,
        failed_task: &TaskId,
        entry: &TaskListEntry,
        stage: &str,
        message: &str,
    ) {
        let summary = redact(message);
        let title = format!("Resolve {stage} failure in task {failed_task}");
        let description = format!("{stage} failed for task {failed_task} (\"{}\"): {summary}", entry.title);
        let injected = tasks.inject_remediation(failed_task, title, description, entry.files.clone());
        tasks.mark_failed(failed_task);

        ctx.record_node(
            "ERROR_INJECT",
            NodeRecord::fatal(
                serde_json::json!({"stage": stage, "summary": summary, "injectedTask": injected.to_string()}),
                None,
            ),
        );
        ctx.record_node(
            "INJECT_TASK",
            NodeRecord::success(serde_json::json!({"taskId": injected.to_string()}), None),
        );
        info!(%failed_task, injected = %injected, stage, "ERROR_INJECT synthesized a remediation task");
    }
}

/// Why a run halted, set by whichever node drove it to the `HALT` node.
/// The engine's `NodeOutcome::Fatal` tag alone can't distinguish these, so
/// it rides along in `Shared` instead.
#[derive(Debug, Clone)]
enum Halt {
    Stopped,
    MissingTool { path: String },
    TransitionLimitExceeded,
}

/// State shared by every node in one execution's registry: the mutable
/// `TaskList` (not part of `TaskContext`, so it can't travel through
/// `run_workflow`'s by-value context the way everything else does),
/// the cooperative pause/stop signal, and the halt reason a node sets
/// right before routing to `HALT`.
struct Shared {
    repo: Arc<RepoCacheManager>,
    containers: Option<Arc<ContainerManager>>,
    config: Arc<RunnerConfig>,
    project_id: String,
    repo_url: String,
    tasks: StdMutex<TaskList>,
    control: Arc<ExecutionControl>,
    transitions: AtomicUsize,
    halt: StdMutex<Option<Halt>>,
}

impl Shared {
    fn state_machine(&self) -> StateMachine {
        StateMachine::new(self.repo.clone(), self.containers.clone(), self.config.clone())
    }

    fn set_halt(&self, halt: Halt) {
        *self.halt.lock().expect("halt lock poisoned") = Some(halt);
    }

    fn inject_remediation(&self, ctx: &mut TaskContext, failed_task: &TaskId, entry: &TaskListEntry, stage: &str, message: &str) {
        let sm = self.state_machine();
        let mut tasks = self.tasks.lock().expect("task list lock poisoned");
        sm.inject_remediation(ctx, &mut tasks, failed_task, entry, stage, message);
    }
}

/// SELECT: picks the next task (or signals DONE) and counts this transition
/// against `MAX_TRANSITIONS`.
struct SelectNode {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkflowNode for SelectNode {
    async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
        if !self.shared.control.checkpoint().await {
            self.shared.set_halt(Halt::Stopped);
            return (ctx, NodeOutcome::Fatal);
        }

        let transitions = self.shared.transitions.fetch_add(1, Ordering::SeqCst) + 1;
        if transitions > MAX_TRANSITIONS {
            self.shared.set_halt(Halt::TransitionLimitExceeded);
            return (ctx, NodeOutcome::Fatal);
        }

        let task_id = self.shared.tasks.lock().expect("task list lock poisoned").select_next();
        match task_id {
            None => {
                ctx.metadata.task_id = None;
                ctx.record_node("SELECT", NodeRecord::success(serde_json::json!({"done": true}), None));
            }
            Some(id) => {
                info!(task_id = %id, "SELECT");
                ctx.metadata.task_id = Some(id.clone());
                ctx.record_node(
                    "SELECT",
                    NodeRecord::success(serde_json::json!({"taskId": id.to_string()}), None),
                );
            }
        }
        (ctx, NodeOutcome::Success)
    }
}

/// PREP: looks up the entry SELECT just named and runs the PREP stage.
struct PrepNode {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkflowNode for PrepNode {
    async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
        if !self.shared.control.checkpoint().await {
            self.shared.set_halt(Halt::Stopped);
            return (ctx, NodeOutcome::Fatal);
        }

        // SELECT_BRANCH only routes here when `task_id` is `Some`.
        let Some(task_id) = ctx.metadata.task_id.clone() else {
            return (ctx, NodeOutcome::Fatal);
        };
        let entry = self.shared.tasks.lock().expect("task list lock poisoned").entry(&task_id).cloned();
        let Some(entry) = entry else {
            warn!(%task_id, "select_next named a task absent from the list");
            return (ctx, NodeOutcome::Fatal);
        };

        let sm = self.shared.state_machine();
        match sm.prep(&self.shared.project_id, &self.shared.repo_url, &task_id, &entry.title, &mut ctx).await {
            StageResult::Ok => (ctx, NodeOutcome::Success),
            StageResult::Stopped => {
                self.shared.set_halt(Halt::Stopped);
                (ctx, NodeOutcome::Fatal)
            }
            StageResult::Failed(failure) => {
                self.shared.inject_remediation(&mut ctx, &task_id, &entry, "PREP", &failure.message);
                (ctx, NodeOutcome::Retryable)
            }
        }
    }
}

/// IMPLEMENT: the one stage whose failure can be fatal to the whole
/// execution rather than recoverable via ERROR_INJECT (`MissingTool`).
struct ImplementNode {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkflowNode for ImplementNode {
    async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
        if !self.shared.control.checkpoint().await {
            self.shared.set_halt(Halt::Stopped);
            return (ctx, NodeOutcome::Fatal);
        }
        let Some(task_id) = ctx.metadata.task_id.clone() else {
            return (ctx, NodeOutcome::Fatal);
        };
        let entry = self.shared.tasks.lock().expect("task list lock poisoned").entry(&task_id).cloned();
        let Some(entry) = entry else {
            return (ctx, NodeOutcome::Fatal);
        };

        let sm = self.shared.state_machine();
        match sm.implement(&self.shared.project_id, &entry, &mut ctx, &self.shared.control).await {
            StageResult::Ok => (ctx, NodeOutcome::Success),
            StageResult::Stopped => {
                self.shared.set_halt(Halt::Stopped);
                (ctx, NodeOutcome::Fatal)
            }
            StageResult::Failed(failure) if failure.halt => {
                self.shared.set_halt(Halt::MissingTool {
                    path: self.shared.config.tool_binary_path.clone().unwrap_or_default(),
                });
                (ctx, NodeOutcome::Fatal)
            }
            StageResult::Failed(failure) => {
                self.shared.inject_remediation(&mut ctx, &task_id, &entry, "IMPLEMENT", &failure.message);
                (ctx, NodeOutcome::Retryable)
            }
        }
    }
}

/// VERIFY: runs the build verifier; any failure is recoverable via
/// ERROR_INJECT.
struct VerifyNode {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkflowNode for VerifyNode {
    async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
        if !self.shared.control.checkpoint().await {
            self.shared.set_halt(Halt::Stopped);
            return (ctx, NodeOutcome::Fatal);
        }
        let Some(task_id) = ctx.metadata.task_id.clone() else {
            return (ctx, NodeOutcome::Fatal);
        };
        let entry = self.shared.tasks.lock().expect("task list lock poisoned").entry(&task_id).cloned();
        let Some(entry) = entry else {
            return (ctx, NodeOutcome::Fatal);
        };

        let sm = self.shared.state_machine();
        match sm.verify(&self.shared.project_id, &mut ctx, &self.shared.control).await {
            StageResult::Ok => (ctx, NodeOutcome::Success),
            StageResult::Stopped => {
                self.shared.set_halt(Halt::Stopped);
                (ctx, NodeOutcome::Fatal)
            }
            StageResult::Failed(failure) => {
                self.shared.inject_remediation(&mut ctx, &task_id, &entry, "VERIFY", &failure.message);
                (ctx, NodeOutcome::Retryable)
            }
        }
    }
}

/// MERGE: merges the task branch; a conflict is recoverable via
/// ERROR_INJECT, not fatal (§4.F MERGE).
struct MergeNode {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkflowNode for MergeNode {
    async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
        if !self.shared.control.checkpoint().await {
            self.shared.set_halt(Halt::Stopped);
            return (ctx, NodeOutcome::Fatal);
        }
        let Some(task_id) = ctx.metadata.task_id.clone() else {
            return (ctx, NodeOutcome::Fatal);
        };
        let entry = self.shared.tasks.lock().expect("task list lock poisoned").entry(&task_id).cloned();
        let Some(entry) = entry else {
            return (ctx, NodeOutcome::Fatal);
        };

        let sm = self.shared.state_machine();
        match sm.merge(&self.shared.project_id, &mut ctx).await {
            StageResult::Ok => (ctx, NodeOutcome::Success),
            StageResult::Stopped => {
                self.shared.set_halt(Halt::Stopped);
                (ctx, NodeOutcome::Fatal)
            }
            StageResult::Failed(failure) => {
                self.shared.inject_remediation(&mut ctx, &task_id, &entry, "MERGE", &failure.message);
                (ctx, NodeOutcome::Retryable)
            }
        }
    }
}

/// PUSH: pushes the merged default branch, with its own bounded retry
/// internal to `StateMachine::push`.
struct PushNode {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkflowNode for PushNode {
    async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
        if !self.shared.control.checkpoint().await {
            self.shared.set_halt(Halt::Stopped);
            return (ctx, NodeOutcome::Fatal);
        }
        let Some(task_id) = ctx.metadata.task_id.clone() else {
            return (ctx, NodeOutcome::Fatal);
        };
        let entry = self.shared.tasks.lock().expect("task list lock poisoned").entry(&task_id).cloned();
        let Some(entry) = entry else {
            return (ctx, NodeOutcome::Fatal);
        };

        let sm = self.shared.state_machine();
        match sm.push(&self.shared.project_id, &mut ctx).await {
            StageResult::Ok => (ctx, NodeOutcome::Success),
            StageResult::Stopped => {
                self.shared.set_halt(Halt::Stopped);
                (ctx, NodeOutcome::Fatal)
            }
            StageResult::Failed(failure) => {
                self.shared.inject_remediation(&mut ctx, &task_id, &entry, "PUSH", &failure.message);
                (ctx, NodeOutcome::Retryable)
            }
        }
    }
}

/// UPDATE_TASKLIST: marks the task complete and loops back to SELECT.
struct UpdateTasklistNode {
    shared: Arc<Shared>,
}

#[async_trait]
impl WorkflowNode for UpdateTasklistNode {
    async fn run(&self, mut ctx: TaskContext) -> (TaskContext, NodeOutcome) {
        let Some(task_id) = ctx.metadata.task_id.clone() else {
            return (ctx, NodeOutcome::Fatal);
        };
        self.shared.tasks.lock().expect("task list lock poisoned").mark_complete(&task_id);
        ctx.record_node(
            "UPDATE_TASKLIST",
            NodeRecord::success(serde_json::json!({"taskId": task_id.to_string()}), None),
        );
        (ctx, NodeOutcome::Success)
    }
}

/// Assembles the per-execution registry: SELECT branches to PREP or halts
/// DONE; each stage loops back to SELECT on `Retryable` (ERROR_INJECT having
/// already run) or routes to `HALT` on `Fatal`; `UPDATE_TASKLIST` loops back
/// to SELECT on success.
fn build_registry(shared: Arc<Shared>) -> WorkflowRegistry {
    WorkflowRegistry::builder("devteam-runner-execution", "SELECT")
        .node(
            "SELECT",
            NodeKind::Compute {
                node: Arc::new(SelectNode { shared: shared.clone() }),
                on_success: Some("SELECT_BRANCH".to_string()),
                on_retryable: None,
                on_fatal: Some("HALT".to_string()),
            },
        )
        .node(
            "SELECT_BRANCH",
            NodeKind::Route {
                route: Arc::new(|ctx| {
                    if ctx.metadata.task_id.is_some() {
                        Some("PREP".to_string())
                    } else {
                        None
                    }
                }),
            },
        )
        .node(
            "PREP",
            NodeKind::Compute {
                node: Arc::new(PrepNode { shared: shared.clone() }),
                on_success: Some("IMPLEMENT".to_string()),
                on_retryable: Some("SELECT".to_string()),
                on_fatal: Some("HALT".to_string()),
            },
        )
        .node(
            "IMPLEMENT",
            NodeKind::Compute {
                node: Arc::new(ImplementNode { shared: shared.clone() }),
                on_success: Some("VERIFY".to_string()),
                on_retryable: Some("SELECT".to_string()),
                on_fatal: Some("HALT".to_string()),
            },
        )
        .node(
            "VERIFY",
            NodeKind::Compute {
                node: Arc::new(VerifyNode { shared: shared.clone() }),
                on_success: Some("MERGE".to_string()),
                on_retryable: Some("SELECT".to_string()),
                on_fatal: Some("HALT".to_string()),
            },
        )
        .node(
            "MERGE",
            NodeKind::Compute {
                node: Arc::new(MergeNode { shared: shared.clone() }),
                on_success: Some("PUSH".to_string()),
                on_retryable: Some("SELECT".to_string()),
                on_fatal: Some("HALT".to_string()),
            },
        )
        .node(
            "PUSH",
            NodeKind::Compute {
                node: Arc::new(PushNode { shared: shared.clone() }),
                on_success: Some("UPDATE_TASKLIST".to_string()),
                on_retryable: Some("SELECT".to_string()),
                on_fatal: Some("HALT".to_string()),
            },
        )
        .node(
            "UPDATE_TASKLIST",
            NodeKind::Compute {
                node: Arc::new(UpdateTasklistNode { shared }),
                on_success: Some("SELECT".to_string()),
                on_retryable: None,
                on_fatal: Some("HALT".to_string()),
            },
        )
        .node("HALT", NodeKind::Route { route: Arc::new(|_ctx| None) })
        .build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasklist;
    use std::time::Duration as StdDuration;

    #[tokio::test]
    async fn checkpoint_passes_through_when_running() {
        let control = ExecutionControl::new();
        assert!(control.checkpoint().await);
    }

    #[tokio::test]
    async fn checkpoint_returns_false_once_stopped() {
        let control = ExecutionControl::new();
        control.stop();
        assert!(!control.checkpoint().await);
        assert!(control.is_stopped());
    }

    #[tokio::test]
    async fn checkpoint_blocks_while_paused_then_unblocks_on_resume() {
        let control = Arc::new(ExecutionControl::new());
        control.pause();
        assert!(control.is_paused());

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.checkpoint().await })
        };

        tokio::time::sleep(StdDuration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        let result = tokio::time::timeout(StdDuration::from_secs(1), waiter).await;
        assert!(result.expect("checkpoint should resolve after resume").unwrap());
    }

    #[tokio::test]
    async fn wait_stopped_resolves_immediately_if_already_stopped() {
        let control = ExecutionControl::new();
        control.stop();
        tokio::time::timeout(StdDuration::from_millis(50), control.wait_stopped())
            .await
            .expect("wait_stopped should resolve without blocking");
    }

    #[tokio::test]
    async fn wait_stopped_unblocks_a_concurrently_issued_stop() {
        let control = Arc::new(ExecutionControl::new());
        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_stopped().await })
        };
        tokio::time::sleep(StdDuration::from_millis(20)).await;
        control.stop();
        tokio::time::timeout(StdDuration::from_secs(1), waiter)
            .await
            .expect("join should not time out")
            .expect("task should not panic");
    }

    #[tokio::test]
    async fn run_reaches_done_immediately_on_an_empty_task_list() {
        let cache_dir = tempfile::tempdir().unwrap();
        let repo = RepoCacheManager::new(cache_dir.path());
        let config = RunnerConfig::default();
        let sm = StateMachine::new(Arc::new(repo), None, Arc::new(config));

        let ctx = TaskContext::new("acme/app");
        let tasks = tasklist::parse("");
        let control = Arc::new(ExecutionControl::new());
        let mut writes = 0;

        let (_, _, outcome) = sm
            .run("acme/app", "https://example.invalid/acme/app.git", ctx, tasks, control, |_, _| writes += 1)
            .await;

        assert!(matches!(outcome, RunOutcome::Done));
        assert!(writes >= 1);
    }

    #[tokio::test]
    async fn run_stops_immediately_when_control_is_pre_stopped() {
        let cache_dir = tempfile::tempdir().unwrap();
        let repo = RepoCacheManager::new(cache_dir.path());
        let config = RunnerConfig::default();
        let sm = StateMachine::new(Arc::new(repo), None, Arc::new(config));

        let ctx = TaskContext::new("acme/app");
        let tasks = tasklist::parse("## 1.1.1: A\nStatus: pending\nDo a thing.\n");
        let control = Arc::new(ExecutionControl::new());
        control.stop();

        let (_, _, outcome) = sm
            .run("acme/app", "https://example.invalid/acme/app.git", ctx, tasks, control, |_, _| {})
            .await;

        assert!(matches!(outcome, RunOutcome::Stopped));
    }

    fn init_upstream() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let repo = git2::Repository::init(dir.path()).unwrap();
        std::fs::write(dir.path().join("README.md"), "hello").unwrap();
        let mut index = repo.index().unwrap();
        index.add_path(std::path::Path::new("README.md")).unwrap();
        index.write().unwrap();
        let tree_id = index.write_tree().unwrap();
        let tree = repo.find_tree(tree_id).unwrap();
        let sig = git2::Signature::now("Test", "test@example.com").unwrap();
        repo.commit(Some("HEAD"), &sig, &sig, "initial commit", &tree, &[]).unwrap();
        dir
    }

    #[tokio::test]
    async fn run_without_a_container_manager_injects_remediation_until_the_transition_limit() {
        let upstream = init_upstream();
        let cache_dir = tempfile::tempdir().unwrap();
        let repo = RepoCacheManager::new(cache_dir.path());
        let config = RunnerConfig::default();
        let sm = StateMachine::new(Arc::new(repo), None, Arc::new(config));

        let ctx = TaskContext::new("acme/app");
        let tasks = tasklist::parse("## 1.1.1: A\nStatus: pending\nDo a thing.\n");
        let control = Arc::new(ExecutionControl::new());
        let repo_url = upstream.path().to_str().unwrap().to_string();

        // PREP succeeds against the local fixture but IMPLEMENT always
        // fails with no container manager configured; after enough
        // transitions the loop gives up rather than spin forever, which is
        // itself the property under test.
        let (ctx, tasks, outcome) = sm
            .run("acme/app", &repo_url, ctx, tasks, control, |_, _| {})
            .await;

        assert!(matches!(outcome, RunOutcome::Failed(StateMachineError::TransitionLimitExceeded { .. })));
        assert!(tasks.total() > 1, "ERROR_INJECT should have grown the task list");
        assert!(ctx.metadata.last_error.is_some());
    }
}
