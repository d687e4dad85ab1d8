//! Code-Change Executor (§4.G).
//!
//! Generalizes the teacher's `ClaudeRunner` (`orchestrator/runner.rs`):
//! build a prompt, invoke an external tool, capture its streamed output
//! into an artifact. The subprocess-on-the-host model (`tokio::process::
//! Command`, stdin/stdout piping) becomes an in-container `exec` via
//! `ContainerManager`; the "generate_prompt is a pure function of inputs"
//! property the teacher already had (no clock/random reads inside it) is
//! kept verbatim — §4.G requires it explicitly ("deterministic prompt"),
//! where the teacher's version only happened to have that property.

use crate::container::{ContainerManager, ExecOptions};
use crate::errors::ExecutionError;
use devteam_common::{ExecutionArtifact, TaskListEntry};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::instrument;

/// Fixed template: every field interpolated is drawn from `entry` or static
/// text, never from wall-clock time or randomness (§9 glossary:
/// "deterministic prompt").
pub fn generate_prompt(entry: &TaskListEntry) -> String {
    let deps = if entry.dependencies.is_empty() {
        "none".to_string()
    } else {
        entry
            .dependencies
            .iter()
            .map(|d| d.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    };
    let files = if entry.files.is_empty() {
        "unspecified — determine from the task description".to_string()
    } else {
        entry.files.join(", ")
    };

    format!(
        "## TASK {}\n{}\n\n### Description\n{}\n\n### Dependencies\n{}\n\n### Files in scope\n{}\n\nImplement this task against the checked-out working tree. Make only the changes necessary to satisfy the description above.",
        entry.task_id, entry.title, entry.description, deps, files,
    )
}

pub struct ExecutionOutcome {
    pub artifact: ExecutionArtifact,
}

/// Runs the code-change tool inside the project's container at `repo_path`,
/// then corroborates the tool's reported file list against
/// `git status --porcelain` (§4.G).
#[instrument(skip(containers, entry))]
pub async fn implement(
    containers: &ContainerManager,
    project_id: &str,
    repo_path: &str,
    tool_binary_path: &str,
    entry: &TaskListEntry,
    timeout: Duration,
) -> Result<ExecutionOutcome, ExecutionError> {
    let prompt = generate_prompt(entry);
    let started = Instant::now();

    let mut env = HashMap::new();
    env.insert("DEVTEAM_PROMPT".to_string(), prompt);

    let exec_result = containers
        .exec(
            project_id,
            vec![tool_binary_path.to_string()],
            ExecOptions {
                cwd: Some(repo_path.to_string()),
                timeout: Some(timeout),
                env,
            },
        )
        .await;

    let output = match exec_result {
        Ok(output) => output,
        // Only a container-confirmed "no such executable" halts the whole
        // execution; a timeout or a flaky exec is recoverable via
        // ERROR_INJECT, not a reason to conclude the tool is missing (§7).
        Err(err) if err.is_missing_binary() => {
            return Err(ExecutionError::MissingTool { path: tool_binary_path.to_string() })
        }
        Err(err) => return Err(ExecutionError::Container(err)),
    };

    if !output.success() {
        return Err(ExecutionError::Tool { exit_code: output.exit_code as i32 });
    }

    let diff = containers
        .exec(
            project_id,
            vec!["git".to_string(), "diff".to_string(), "HEAD~1".to_string()],
            ExecOptions { cwd: Some(repo_path.to_string()), timeout: Some(Duration::from_secs(10)), env: HashMap::new() },
        )
        .await
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout);

    let status = containers
        .exec(
            project_id,
            vec!["git".to_string(), "status".to_string(), "--porcelain".to_string()],
            ExecOptions { cwd: Some(repo_path.to_string()), timeout: Some(Duration::from_secs(10)), env: HashMap::new() },
        )
        .await
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout)
        .unwrap_or_default();

    let files_modified = parse_porcelain_status(&status);

    let tool_version = containers
        .exec(
            project_id,
            vec![tool_binary_path.to_string(), "--version".to_string()],
            ExecOptions { cwd: Some(repo_path.to_string()), timeout: Some(Duration::from_secs(5)), env: HashMap::new() },
        )
        .await
        .ok()
        .filter(|o| o.success())
        .map(|o| o.stdout.trim().to_string());

    let mut durations_ms = HashMap::new();
    durations_ms.insert("implement".to_string(), started.elapsed().as_millis() as u64);

    Ok(ExecutionOutcome {
        artifact: ExecutionArtifact {
            diff,
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: Some(output.exit_code as i32),
            files_modified,
            commit_hash: None,
            tool_version,
            durations_ms,
        },
    })
}

fn parse_porcelain_status(status: &str) -> Vec<String> {
    status
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim_start();
            trimmed.split_once(' ').map(|(_, path)| path.trim().to_string())
        })
        .filter(|p| !p.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use devteam_common::TaskId;

    fn entry() -> TaskListEntry {
        TaskListEntry {
            task_id: "1.1.1".parse::<TaskId>().unwrap(),
            title: "Add DEVTEAM_ENABLED flag".to_string(),
            description: "Introduce a feature flag gating the new automation path.".to_string(),
            dependencies: vec![],
            files: vec!["src/config.js".to_string()],
            criteria: serde_json::Map::new(),
        }
    }

    #[test]
    fn prompt_is_deterministic_given_same_entry() {
        let e = entry();
        assert_eq!(generate_prompt(&e), generate_prompt(&e));
    }

    #[test]
    fn prompt_includes_task_fields() {
        let e = entry();
        let prompt = generate_prompt(&e);
        assert!(prompt.contains("1.1.1"));
        assert!(prompt.contains("Add DEVTEAM_ENABLED flag"));
        assert!(prompt.contains("src/config.js"));
    }

    #[test]
    fn prompt_reports_no_dependencies_explicitly() {
        let e = entry();
        let prompt = generate_prompt(&e);
        assert!(prompt.contains("none"));
    }

    #[test]
    fn parses_porcelain_status_into_file_list() {
        let status = " M src/config.js\n?? src/new_file.js\n";
        let files = parse_porcelain_status(status);
        assert_eq!(files, vec!["src/config.js".to_string(), "src/new_file.js".to_string()]);
    }

    #[test]
    fn empty_status_yields_no_files() {
        assert!(parse_porcelain_status("").is_empty());
    }
}
