use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A dotted numeric task identifier, e.g. `1.2.3`.
///
/// Ordering is part-wise numeric, not lexicographic: `1.2.3 < 1.10.1`
/// because `2 < 10` at the second part, even though `"1.2.3" > "1.10.1"`
/// as a byte string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(Vec<u64>);

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid task id '{0}': expected dotted numeric identifier like '1.2.3'")]
pub struct InvalidTaskId(String);

impl TaskId {
    pub fn parts(&self) -> &[u64] {
        &self.0
    }

    /// The remediation task id inserted immediately after this one on
    /// `ERROR_INJECT`, via numeric-suffix insertion: `1.1.1` -> `1.1.1.1`.
    pub fn remediation_child(&self) -> TaskId {
        let mut parts = self.0.clone();
        parts.push(1);
        TaskId(parts)
    }
}

impl FromStr for TaskId {
    type Err = InvalidTaskId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(InvalidTaskId(s.to_string()));
        }
        let mut parts = Vec::new();
        for segment in s.split('.') {
            if segment.is_empty() {
                return Err(InvalidTaskId(s.to_string()));
            }
            parts.push(segment.parse::<u64>().map_err(|_| InvalidTaskId(s.to_string()))?);
        }
        Ok(TaskId(parts))
    }
}

impl TryFrom<String> for TaskId {
    type Error = InvalidTaskId;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> String {
        id.to_string()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined = self
            .0
            .iter()
            .map(|p| p.to_string())
            .collect::<Vec<_>>()
            .join(".");
        write!(f, "{joined}")
    }
}

impl PartialOrd for TaskId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TaskId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

/// A leaf entry in `task_lists.md`, read with lenient parsing: missing
/// optional fields are filled with defaults rather than rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskListEntry {
    pub task_id: TaskId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<TaskId>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub criteria: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_wise_ordering_beats_lexicographic() {
        let a: TaskId = "1.2.3".parse().unwrap();
        let b: TaskId = "1.10.1".parse().unwrap();
        assert!(a < b, "1.2.3 should sort before 1.10.1 numerically");
    }

    #[test]
    fn display_round_trips() {
        let id: TaskId = "1.2.3".parse().unwrap();
        assert_eq!(id.to_string(), "1.2.3");
    }

    #[test]
    fn rejects_non_numeric_segments() {
        assert!("1.a.3".parse::<TaskId>().is_err());
        assert!("".parse::<TaskId>().is_err());
        assert!("1..3".parse::<TaskId>().is_err());
    }

    #[test]
    fn remediation_child_appends_numeric_suffix() {
        let id: TaskId = "1.1.1".parse().unwrap();
        assert_eq!(id.remediation_child().to_string(), "1.1.1.1");
    }

    #[test]
    fn deserializes_entry_with_defaults() {
        let json = serde_json::json!({ "taskId": "1.1.1", "title": "Add a flag" });
        let entry: TaskListEntry = serde_json::from_value(json).unwrap();
        assert_eq!(entry.description, "");
        assert!(entry.dependencies.is_empty());
        assert!(entry.files.is_empty());
    }
}
