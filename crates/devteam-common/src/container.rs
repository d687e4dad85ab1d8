use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// CPU/memory limits applied to a project's long-lived container.
/// Defaults match the per-project container defaults (1 vCPU, 1GiB).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    pub cpus: f64,
    pub mem_mib: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpus: 1.0,
            mem_mib: 1024,
        }
    }
}

/// Tracks the one long-lived Docker container owned by a project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerHandle {
    pub project_id: String,
    pub container_id: String,
    pub created_at: DateTime<Utc>,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub resource_limits: ResourceLimits,
}

impl ContainerHandle {
    pub fn new(project_id: impl Into<String>, container_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            container_id: container_id.into(),
            created_at: Utc::now(),
            last_healthy_at: None,
            resource_limits: ResourceLimits::default(),
        }
    }

    pub fn mark_healthy(&mut self) {
        self.last_healthy_at = Some(Utc::now());
    }
}

/// Tracks the single working-tree clone a project's container reuses
/// across executions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoCacheEntry {
    pub project_id: String,
    pub local_path: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub current_branch: Option<String>,
}

impl RepoCacheEntry {
    pub fn new(project_id: impl Into<String>, local_path: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            local_path: local_path.into(),
            last_fetched_at: None,
            current_branch: None,
        }
    }

    pub fn record_fetch(&mut self, branch: impl Into<String>) {
        self.last_fetched_at = Some(Utc::now());
        self.current_branch = Some(branch.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_resource_limits_match_container_defaults() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.cpus, 1.0);
        assert_eq!(limits.mem_mib, 1024);
    }

    #[test]
    fn new_container_handle_has_no_health_timestamp() {
        let handle = ContainerHandle::new("acme/app", "c123");
        assert!(handle.last_healthy_at.is_none());
    }

    #[test]
    fn record_fetch_sets_branch_and_timestamp() {
        let mut entry = RepoCacheEntry::new("acme/app", "/var/cache/acme-app");
        entry.record_fetch("task/1.1.1");
        assert_eq!(entry.current_branch.as_deref(), Some("task/1.1.1"));
        assert!(entry.last_fetched_at.is_some());
    }
}
