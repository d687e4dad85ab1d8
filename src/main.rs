//! DevTeam Runner server entrypoint.
//!
//! Mirrors the teacher's `factory` server startup shape (load config, open
//! the DB, optionally connect Docker, build the router, serve) rather than
//! the CLI subcommand dispatch this binary used to be: the runner has one
//! job, run as a long-lived service, not a multi-command developer tool.

use anyhow::{Context, Result};
use clap::Parser;
use devteam_runner::app::AppState;
use devteam_runner::config::RunnerConfig;
use devteam_runner::container::ContainerManager;
use devteam_runner::events::EventStore;
use devteam_runner::queue::JobQueue;
use devteam_runner::repo::RepoCacheManager;
use devteam_runner::{server, telemetry, worker};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Control-plane HTTP surface for autonomously executing a project's task
/// list against its Git repository (§1-§6).
#[derive(Parser)]
#[command(name = "devteam-runner")]
#[command(version, about = "DevTeam Runner: HTTP control plane for autonomous task execution")]
struct Cli {
    /// Project root to load `.devteam/runner.toml` and the event store from.
    #[arg(long, env = "DEVTEAM_PROJECT_DIR", default_value = ".")]
    project_dir: PathBuf,

    /// Queue capacity before `enqueue` backpressures (§4.D).
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 256)]
    queue_capacity: usize,

    /// Docker image used for the per-project container (§4.B).
    #[arg(long, env = "CONTAINER_IMAGE", default_value = "devteam-runner:latest")]
    container_image: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry_guard = telemetry::init();
    let cli = Cli::parse();

    let config = RunnerConfig::load(&cli.project_dir).context("failed to load runner configuration")?;
    info!(global_concurrency = config.global_concurrency, port = config.port, "configuration loaded");

    let db_path = cli.project_dir.join(".devteam").join("runner.db");
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let events = EventStore::open(&db_path, config.idempotency_ttl_hours as u64).context("failed to open event store")?;

    let (queue, receiver) = JobQueue::new(cli.queue_capacity);

    let cache_root = cli.project_dir.join(".devteam").join("cache");
    let repo = RepoCacheManager::new(cache_root);

    let containers = ContainerManager::connect(
        cli.container_image.clone(),
        config.container_cpu,
        config.container_mem_mib,
        config.global_concurrency,
    )
    .await;
    match &containers {
        Some(_) => info!(image = %cli.container_image, "connected to Docker for per-project containers"),
        None => warn!("Docker unavailable; IMPLEMENT and VERIFY stages will fail until it is"),
    }

    let port = config.port;
    let state = Arc::new(AppState::new(config, events, queue, repo, containers));

    let worker_state = state.clone();
    tokio::spawn(async move { worker::run(worker_state, receiver).await });

    server::start(state, port).await
}
