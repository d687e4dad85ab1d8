//! Lenient `task_lists.md` parsing and canonicalization (§3 TaskListEntry, §4.F SELECT).
//!
//! Generalizes the teacher's `phases.json` loading (`phase.rs`): the same
//! "missing optional fields fall back to defaults" idiom, applied to a
//! markdown task list instead of a JSON phases file. Each task is a `##`
//! heading block; `Dependencies`/`Files` are comma-separated key: value
//! lines; anything else in the block is free-text description. Fields the
//! source omits are filled with defaults and recorded as a warning rather
//! than rejected (§3 TaskListEntry: "parsing is lenient").

use devteam_common::{TaskId, TaskListEntry};
use std::collections::HashSet;

/// The result of a lenient parse: the entries found, which are already
/// marked complete or failed, and warnings for anything defaulted.
#[derive(Debug, Clone, Default)]
pub struct TaskList {
    pub entries: Vec<TaskListEntry>,
    pub completed: HashSet<TaskId>,
    /// Tasks ERROR_INJECT has already synthesized a remediation task for.
    /// Excluded from `select_next` (retrying the same failure forever would
    /// just re-inject the same remediation task) but satisfies dependencies
    /// of the task injected against it, so that task becomes selectable.
    pub failed: HashSet<TaskId>,
    pub warnings: Vec<String>,
}

impl TaskList {
    pub fn total(&self) -> usize {
        self.entries.len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.len()
    }

    pub fn is_complete(&self, id: &TaskId) -> bool {
        self.completed.contains(id)
    }

    pub fn is_failed(&self, id: &TaskId) -> bool {
        self.failed.contains(id)
    }

    pub fn entry(&self, id: &TaskId) -> Option<&TaskListEntry> {
        self.entries.iter().find(|e| &e.task_id == id)
    }

    fn dependencies_satisfied(&self, entry: &TaskListEntry) -> bool {
        entry
            .dependencies
            .iter()
            .all(|dep| self.completed.contains(dep) || self.failed.contains(dep))
    }

    /// SELECT (§4.F): the lowest-numbered (part-wise numeric) unfinished,
    /// unfailed task whose dependencies are all complete or failed. `None`
    /// means the pipeline is DONE.
    pub fn select_next(&self) -> Option<TaskId> {
        self.entries
            .iter()
            .filter(|e| !self.completed.contains(&e.task_id))
            .filter(|e| !self.failed.contains(&e.task_id))
            .filter(|e| self.dependencies_satisfied(e))
            .map(|e| e.task_id.clone())
            .min()
    }

    /// UPDATE_TASKLIST (§4.F): marks a task complete.
    pub fn mark_complete(&mut self, id: &TaskId) {
        self.completed.insert(id.clone());
    }

    /// ERROR_INJECT (§4.F): marks a task failed so it is never reselected
    /// and so the remediation task injected against it becomes selectable.
    pub fn mark_failed(&mut self, id: &TaskId) {
        self.failed.insert(id.clone());
    }

    /// ERROR_INJECT → INJECT_TASK (§4.F): inserts a remediation task
    /// immediately after `failed_task` with a new dotted identifier
    /// (numeric-suffix insertion, §9 Open Question) and a dependency back
    /// to the failed task.
    pub fn inject_remediation(
        &mut self,
        failed_task: &TaskId,
        title: impl Into<String>,
        description: impl Into<String>,
        files: Vec<String>,
    ) -> TaskId {
        let new_id = failed_task.remediation_child();
        let entry = TaskListEntry {
            task_id: new_id.clone(),
            title: title.into(),
            description: description.into(),
            dependencies: vec![failed_task.clone()],
            files,
            criteria: serde_json::Map::new(),
        };
        let insert_at = self
            .entries
            .iter()
            .position(|e| &e.task_id == failed_task)
            .map(|pos| pos + 1)
            .unwrap_or(self.entries.len());
        self.entries.insert(insert_at, entry);
        new_id
    }

    pub fn entries_by_id(&self) -> impl Iterator<Item = &TaskListEntry> {
        self.entries.iter()
    }
}

/// The tri-state `Status:` line: a task is pending, done, or already failed
/// with a remediation task injected against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskStatus {
    Pending,
    Done,
    Failed,
}

/// Parses a `task_lists.md` document. Never fails: malformed blocks are
/// dropped with a warning rather than aborting the whole parse.
pub fn parse(markdown: &str) -> TaskList {
    let mut list = TaskList::default();

    for block in split_blocks(markdown) {
        match parse_block(&block) {
            Ok((entry, status, warnings)) => {
                list.warnings.extend(warnings);
                match status {
                    TaskStatus::Done => {
                        list.completed.insert(entry.task_id.clone());
                    }
                    TaskStatus::Failed => {
                        list.failed.insert(entry.task_id.clone());
                    }
                    TaskStatus::Pending => {}
                }
                list.entries.push(entry);
            }
            Err(reason) => list.warnings.push(reason),
        }
    }

    list
}

fn split_blocks(markdown: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    for line in markdown.lines() {
        if line.starts_with("## ") && !current.trim().is_empty() {
            blocks.push(std::mem::take(&mut current));
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        blocks.push(current);
    }
    blocks
}

/// `## 1.1.1: Add DEVTEAM_ENABLED flag` followed by optional
/// `Status:`/`Dependencies:`/`Files:` lines and free-text description.
fn parse_block(block: &str) -> Result<(TaskListEntry, TaskStatus, Vec<String>), String> {
    let mut lines = block.lines();
    let heading = lines.next().ok_or("empty task block")?;
    let heading = heading.trim_start_matches('#').trim();
    let (id_part, title) = heading
        .split_once(':')
        .ok_or_else(|| format!("task heading '{heading}' missing ': title'"))?;
    let task_id: TaskId = id_part
        .trim()
        .parse()
        .map_err(|e| format!("task heading '{heading}': {e}"))?;
    let title = title.trim().to_string();

    let mut warnings = Vec::new();
    let mut status = TaskStatus::Pending;
    let mut dependencies = Vec::new();
    let mut files = Vec::new();
    let mut description_lines = Vec::new();

    for line in lines {
        let trimmed = line.trim();
        if let Some(rest) = trimmed.strip_prefix("Status:") {
            status = match rest.trim().to_ascii_lowercase().as_str() {
                "done" => TaskStatus::Done,
                "failed" => TaskStatus::Failed,
                _ => TaskStatus::Pending,
            };
        } else if let Some(rest) = trimmed.strip_prefix("Dependencies:") {
            dependencies = rest
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .filter_map(|s| match s.parse::<TaskId>() {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warnings.push(format!("task {id_part}: bad dependency '{s}': {e}"));
                        None
                    }
                })
                .collect();
        } else if let Some(rest) = trimmed.strip_prefix("Files:") {
            files = rest
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        } else if !trimmed.is_empty() {
            description_lines.push(trimmed.to_string());
        }
    }

    if description_lines.is_empty() {
        warnings.push(format!("task {id_part}: no description, defaulting to empty"));
    }

    let entry = TaskListEntry {
        task_id,
        title,
        description: description_lines.join(" "),
        dependencies,
        files,
        criteria: serde_json::Map::new(),
    };

    Ok((entry, status, warnings))
}

/// Canonicalizes a `TaskList` back into markdown. Re-parsing this output
/// is a fixed point: the same entries, completion marks, and zero new
/// warnings (every field canonicalization emits is one `parse` recognizes).
pub fn render(list: &TaskList) -> String {
    let mut out = String::new();
    for entry in &list.entries {
        out.push_str(&format!("## {}: {}\n", entry.task_id, entry.title));
        let status = if list.completed.contains(&entry.task_id) {
            "done"
        } else if list.failed.contains(&entry.task_id) {
            "failed"
        } else {
            "pending"
        };
        out.push_str(&format!("Status: {status}\n"));
        if !entry.dependencies.is_empty() {
            let deps = entry
                .dependencies
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            out.push_str(&format!("Dependencies: {deps}\n"));
        }
        if !entry.files.is_empty() {
            out.push_str(&format!("Files: {}\n", entry.files.join(", ")));
        }
        if !entry.description.is_empty() {
            out.push_str(&entry.description);
            out.push('\n');
        }
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
## 1.1.1: Add DEVTEAM_ENABLED flag
Status: pending
Files: src/config.js
Introduce a feature flag gating the new automation path.

## 1.1.2: Wire flag into bootstrap
Status: pending
Dependencies: 1.1.1
Files: src/bootstrap.js
Read the flag at startup.
";

    #[test]
    fn parses_two_tasks_with_one_dependency() {
        let list = parse(SAMPLE);
        assert_eq!(list.total(), 2);
        let second = list.entry(&"1.1.2".parse().unwrap()).unwrap();
        assert_eq!(second.dependencies, vec!["1.1.1".parse::<TaskId>().unwrap()]);
    }

    #[test]
    fn select_next_respects_dependencies() {
        let list = parse(SAMPLE);
        assert_eq!(list.select_next(), Some("1.1.1".parse().unwrap()));
    }

    #[test]
    fn select_next_skips_completed_and_unmet_dependencies() {
        let mut list = parse(SAMPLE);
        list.mark_complete(&"1.1.1".parse().unwrap());
        assert_eq!(list.select_next(), Some("1.1.2".parse().unwrap()));
        list.mark_complete(&"1.1.2".parse().unwrap());
        assert_eq!(list.select_next(), None);
    }

    #[test]
    fn missing_optional_fields_default_with_warning() {
        let list = parse("## 2.1: Minimal task\n");
        assert_eq!(list.total(), 1);
        let entry = &list.entries[0];
        assert!(entry.description.is_empty());
        assert!(entry.dependencies.is_empty());
        assert!(!list.warnings.is_empty());
    }

    #[test]
    fn inject_remediation_inserts_after_failed_task_with_back_dependency() {
        let mut list = parse(SAMPLE);
        let new_id = list.inject_remediation(
            &"1.1.1".parse().unwrap(),
            "Resolve build error in src/config.js",
            "SyntaxError: unexpected token",
            vec!["src/config.js".to_string()],
        );
        assert_eq!(new_id.to_string(), "1.1.1.1");
        assert_eq!(list.total(), 3);
        assert_eq!(list.entries[1].task_id, new_id);
        assert_eq!(list.entries[1].dependencies, vec!["1.1.1".parse::<TaskId>().unwrap()]);
    }

    #[test]
    fn canonicalize_then_reparse_is_fixed_point() {
        let mut list = parse(SAMPLE);
        list.mark_complete(&"1.1.1".parse().unwrap());
        let rendered = render(&list);
        let reparsed = parse(&rendered);

        assert_eq!(reparsed.total(), list.total());
        assert_eq!(reparsed.completed, list.completed);
        for (a, b) in list.entries.iter().zip(reparsed.entries.iter()) {
            assert_eq!(a.task_id, b.task_id);
            assert_eq!(a.title, b.title);
            assert_eq!(a.dependencies, b.dependencies);
            assert_eq!(a.files, b.files);
        }

        let rendered_again = render(&reparsed);
        assert_eq!(rendered, rendered_again);
    }

    #[test]
    fn mark_failed_unblocks_a_task_depending_on_it() {
        let mut list = parse(SAMPLE);
        let injected = list.inject_remediation(
            &"1.1.1".parse().unwrap(),
            "Resolve build error",
            "SyntaxError: unexpected token",
            vec!["src/config.js".to_string()],
        );
        list.mark_failed(&"1.1.1".parse().unwrap());

        assert_eq!(list.select_next(), Some(injected));
        assert_eq!(list.completed_count(), 0, "a failed task is not a completed one");
    }

    #[test]
    fn failed_task_is_never_reselected() {
        let mut list = parse("## 1.1.1: A\nStatus: pending\nDo a thing.\n");
        list.mark_failed(&"1.1.1".parse().unwrap());
        assert_eq!(list.select_next(), None);
    }

    #[test]
    fn status_failed_round_trips_through_render_and_reparse() {
        let mut list = parse(SAMPLE);
        list.mark_failed(&"1.1.1".parse().unwrap());
        let rendered = render(&list);
        assert!(rendered.contains("Status: failed"));

        let reparsed = parse(&rendered);
        assert!(reparsed.is_failed(&"1.1.1".parse().unwrap()));
        assert!(!reparsed.is_complete(&"1.1.1".parse().unwrap()));
    }

    #[test]
    fn dotted_id_ordering_picks_numeric_minimum() {
        let markdown = "\
## 1.10.1: Later numerically but not lexicographically\nStatus: pending\nDescribes nothing.\n\n## 1.2.3: Earlier numerically\nStatus: pending\nDescribes nothing.\n";
        let list = parse(markdown);
        assert_eq!(list.select_next(), Some("1.2.3".parse().unwrap()));
    }
}
