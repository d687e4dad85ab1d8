//! Build Verifier (§4.H).
//!
//! Generalizes the teacher's `DockerSandbox::run_pipeline` shape
//! (`factory/sandbox.rs`: spawn a command in the container, stream output,
//! wait, clean up) into a fixed two-step sequence (`npm ci`, `npm run
//! build`) with its own attempt/retry bookkeeping — the gate/progress-
//! tracking idiom in `gates/mod.rs` inspired keeping a small in-memory
//! counter rather than reaching for an external scheduler.

use crate::container::{ContainerManager, ExecOptions};
use crate::errors::VerifyError;
use devteam_common::ExecutionArtifact;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

const BUILD_OUTPUT_CANDIDATES: &[&str] = &["dist", "build", "out", "public", ".next", "lib", "es"];
const MAX_ATTEMPTS: u32 = 2;

pub struct VerifyOutcome {
    pub artifact: ExecutionArtifact,
    pub npm_version: Option<String>,
    pub build_output_dirs: Vec<String>,
}

struct StepOutcome {
    skipped_reason: Option<&'static str>,
    success: bool,
    stdout: String,
    stderr: String,
    exit_code: i32,
    duration: Duration,
}

/// Runs `npm ci` then `npm run build` at `repo_path`, retrying the whole
/// attempt up to `MAX_ATTEMPTS` times, cleaning `node_modules` between
/// retries so the next attempt starts from the same state (§4.H).
#[instrument(skip(containers))]
pub async fn verify(
    containers: &ContainerManager,
    project_id: &str,
    repo_path: &str,
    total_budget: Duration,
) -> Result<VerifyOutcome, VerifyError> {
    let started = Instant::now();
    let mut durations_ms = HashMap::new();
    let mut last_stdout = String::new();
    let mut last_stderr = String::new();
    let mut last_stage = "npm ci".to_string();
    let mut last_exit = 0;

    for attempt in 1..=MAX_ATTEMPTS {
        if started.elapsed() >= total_budget {
            return Err(VerifyError {
                stage: last_stage,
                exit_code: last_exit,
                stderr_tail: tail(&last_stderr),
            });
        }

        if attempt > 1 {
            clean_node_modules(containers, project_id, repo_path).await;
        }

        let remaining = total_budget.saturating_sub(started.elapsed());
        let ci = run_step(
            containers,
            project_id,
            repo_path,
            "test -f package.json",
            vec!["npm", "ci"],
            remaining,
        )
        .await;
        durations_ms.insert(format!("npm_ci_attempt_{attempt}"), ci.duration.as_millis() as u64);
        last_stdout = ci.stdout.clone();
        last_stderr = ci.stderr.clone();
        last_exit = ci.exit_code;
        last_stage = "npm ci".to_string();

        if ci.skipped_reason.is_none() && !ci.success {
            info!(attempt, "npm ci failed");
            continue;
        }

        let remaining = total_budget.saturating_sub(started.elapsed());
        let build = run_step(
            containers,
            project_id,
            repo_path,
            "grep -q '\"build\"' package.json",
            vec!["npm", "run", "build"],
            remaining,
        )
        .await;
        durations_ms.insert(format!("npm_build_attempt_{attempt}"), build.duration.as_millis() as u64);
        last_stdout = build.stdout.clone();
        last_stderr = build.stderr.clone();
        last_exit = build.exit_code;
        last_stage = "npm run build".to_string();

        if build.skipped_reason.is_none() && !build.success {
            info!(attempt, "npm run build failed");
            continue;
        }

        let npm_version = run_capture(containers, project_id, repo_path, vec!["npm", "--version"]).await;
        let build_output_dirs = find_build_output_dirs(containers, project_id, repo_path).await;

        return Ok(VerifyOutcome {
            artifact: ExecutionArtifact {
                diff: None,
                stdout: last_stdout,
                stderr: last_stderr,
                exit_code: Some(0),
                files_modified: Vec::new(),
                commit_hash: None,
                tool_version: npm_version.clone(),
                durations_ms,
            },
            npm_version,
            build_output_dirs,
        });
    }

    warn!(project_id, stage = %last_stage, "build verification exhausted all attempts");
    Err(VerifyError {
        stage: last_stage,
        exit_code: last_exit,
        stderr_tail: tail(&last_stderr),
    })
}

async fn run_step(
    containers: &ContainerManager,
    project_id: &str,
    repo_path: &str,
    presence_check: &str,
    cmd: Vec<&str>,
    timeout: Duration,
) -> StepOutcome {
    let started = Instant::now();

    let present = containers
        .exec(
            project_id,
            vec!["sh".to_string(), "-c".to_string(), presence_check.to_string()],
            ExecOptions { cwd: Some(repo_path.to_string()), timeout: Some(Duration::from_secs(5)), env: HashMap::new() },
        )
        .await
        .map(|o| o.success())
        .unwrap_or(false);

    if !present {
        let reason = if cmd == vec!["npm", "ci"] { "no_package_json" } else { "no_build_script" };
        return StepOutcome {
            skipped_reason: Some(reason),
            success: true,
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            duration: started.elapsed(),
        };
    }

    let output = containers
        .exec(
            project_id,
            cmd.iter().map(|s| s.to_string()).collect(),
            ExecOptions { cwd: Some(repo_path.to_string()), timeout: Some(timeout), env: HashMap::new() },
        )
        .await;

    match output {
        Ok(output) => StepOutcome {
            skipped_reason: None,
            success: output.success(),
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code as i32,
            duration: started.elapsed(),
        },
        Err(_) => StepOutcome {
            skipped_reason: None,
            success: false,
            stdout: String::new(),
            stderr: "exec timed out or failed".to_string(),
            exit_code: -1,
            duration: started.elapsed(),
        },
    }
}

async fn clean_node_modules(containers: &ContainerManager, project_id: &str, repo_path: &str) {
    let _ = containers
        .exec(
            project_id,
            vec!["rm".to_string(), "-rf".to_string(), "node_modules".to_string()],
            ExecOptions { cwd: Some(repo_path.to_string()), timeout: Some(Duration::from_secs(10)), env: HashMap::new() },
        )
        .await;
}

async fn run_capture(containers: &ContainerManager, project_id: &str, repo_path: &str, cmd: Vec<&str>) -> Option<String> {
    containers
        .exec(
            project_id,
            cmd.iter().map(|s| s.to_string()).collect(),
            ExecOptions { cwd: Some(repo_path.to_string()), timeout: Some(Duration::from_secs(5)), env: HashMap::new() },
        )
        .await
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout.trim().to_string())
}

async fn find_build_output_dirs(containers: &ContainerManager, project_id: &str, repo_path: &str) -> Vec<String> {
    let candidates = BUILD_OUTPUT_CANDIDATES.join(" ");
    let script = format!("for d in {candidates}; do [ -d \"$d\" ] && echo \"$d\"; done");
    containers
        .exec(
            project_id,
            vec!["sh".to_string(), "-c".to_string(), script],
            ExecOptions { cwd: Some(repo_path.to_string()), timeout: Some(Duration::from_secs(5)), env: HashMap::new() },
        )
        .await
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Keeps the last `MAX_CHARS` chars of `stderr`. Walks `char_indices` from
/// the end rather than slicing on a raw byte offset, which can land inside a
/// multi-byte UTF-8 sequence and panic on non-ASCII build output.
fn tail(stderr: &str) -> String {
    const MAX_CHARS: usize = 2000;
    match stderr.char_indices().rev().nth(MAX_CHARS - 1) {
        Some((start, _)) => stderr[start..].to_string(),
        None => stderr.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_truncates_long_stderr_to_trailing_window() {
        let long = "x".repeat(3000);
        let truncated = tail(&long);
        assert_eq!(truncated.len(), 2000);
    }

    #[test]
    fn tail_keeps_short_stderr_unchanged() {
        assert_eq!(tail("SyntaxError: unexpected token"), "SyntaxError: unexpected token");
    }

    #[test]
    fn tail_does_not_panic_on_a_multibyte_boundary() {
        // Every char is 3 bytes, so a raw `len() - MAX_CHARS` byte slice
        // would land mid-character for most lengths; this must still
        // produce exactly the trailing 2000 chars without panicking.
        let long: String = std::iter::repeat('\u{2603}').take(2500).collect();
        let truncated = tail(&long);
        assert_eq!(truncated.chars().count(), 2000);
        assert!(truncated.chars().all(|c| c == '\u{2603}'));
    }

    #[tokio::test]
    async fn verify_degrades_gracefully_without_docker() {
        let containers = ContainerManager::connect("node:20".to_string(), 1.0, 1024, 5).await;
        if let Some(containers) = containers {
            let _ = verify(&containers, "acme/app", "/workspace", Duration::from_secs(1)).await;
        }
    }
}
