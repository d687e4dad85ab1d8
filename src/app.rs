//! Process-wide shared state (§5 concurrency model, §6 external interfaces).
//!
//! Generalizes the teacher's `AppState` (`factory/api.rs`: one struct
//! holding the DB handle, the WS broadcast sender, and the pipeline runner,
//! shared behind an `Arc` across every Axum handler) to the DevTeam
//! Runner's own collaborators: the event store, the job queue, the repo
//! cache, the optional container manager, a global concurrency semaphore
//! (§5: "a global semaphore bounds concurrent executions"), and one
//! `ExecutionControl` per project currently running (§4.F pause/resume/
//! stop).

use crate::config::RunnerConfig;
use crate::container::ContainerManager;
use crate::events::EventStore;
use crate::queue::JobQueue;
use crate::statemachine::ExecutionControl;
use crate::ws::LogCoalescer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, Semaphore};

/// Everything an Axum handler or the background worker needs, shared
/// behind a single `Arc` (mirrors the teacher's `Arc<AppState>` pattern).
pub struct AppState {
    pub config: Arc<RunnerConfig>,
    pub events: EventStore,
    pub queue: JobQueue,
    pub repo: Arc<crate::repo::RepoCacheManager>,
    pub containers: Option<Arc<ContainerManager>>,
    /// §5: "a global semaphore bounds concurrent executions (default 5)".
    pub execution_permits: Arc<Semaphore>,
    /// Per-project cooperative pause/resume/stop control for whichever
    /// execution is currently live on that project (§4.F, §5).
    controls: StdMutex<HashMap<String, Arc<ExecutionControl>>>,
    /// Per-project broadcast channel for the WebSocket fabric (§4.K):
    /// "a single endpoint multiplexes per-project subscriptions".
    ws_channels: StdMutex<HashMap<String, broadcast::Sender<String>>>,
    /// Shared log-coalescing buffer for `execution-log` frames (§4.K: "a
    /// 50 ms window, preserving order within a project").
    log_coalescer: Arc<LogCoalescer>,
}

impl AppState {
    pub fn new(
        config: RunnerConfig,
        events: EventStore,
        queue: JobQueue,
        repo: crate::repo::RepoCacheManager,
        containers: Option<ContainerManager>,
    ) -> Self {
        let execution_permits = Arc::new(Semaphore::new(config.global_concurrency.max(1)));
        Self {
            config: Arc::new(config),
            events,
            queue,
            repo: Arc::new(repo),
            containers: containers.map(Arc::new),
            execution_permits,
            controls: StdMutex::new(HashMap::new()),
            ws_channels: StdMutex::new(HashMap::new()),
            log_coalescer: Arc::new(LogCoalescer::new()),
        }
    }

    pub fn log_coalescer(&self) -> Arc<LogCoalescer> {
        self.log_coalescer.clone()
    }

    pub fn control_for(&self, project_id: &str) -> Arc<ExecutionControl> {
        self.controls
            .lock()
            .expect("execution control map poisoned")
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(ExecutionControl::new()))
            .clone()
    }

    pub fn existing_control(&self, project_id: &str) -> Option<Arc<ExecutionControl>> {
        self.controls.lock().expect("execution control map poisoned").get(project_id).cloned()
    }

    /// Drops the control handle once an execution reaches a terminal state,
    /// so a later `initialize` for the same project starts with a fresh,
    /// unpaused, unstopped control rather than inheriting the old one.
    pub fn clear_control(&self, project_id: &str) {
        self.controls.lock().expect("execution control map poisoned").remove(project_id);
    }

    /// Per-project WebSocket broadcast sender, created lazily on first
    /// subscribe or first frame (§4.K).
    pub fn ws_sender(&self, project_id: &str) -> broadcast::Sender<String> {
        let mut channels = self.ws_channels.lock().expect("ws channel map poisoned");
        channels
            .entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(256).0)
            .clone()
    }
}
