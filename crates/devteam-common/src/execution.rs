use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Status of an `Execution`. A "live" execution is any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Queued,
    Initializing,
    Running,
    Paused,
    Stopped,
    Done,
    Error,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Done => "done",
            Self::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Result<Self, String> {
        match s {
            "queued" => Ok(Self::Queued),
            "initializing" => Ok(Self::Initializing),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "stopped" => Ok(Self::Stopped),
            "done" => Ok(Self::Done),
            "error" => Ok(Self::Error),
            _ => Err(format!("invalid execution status: {s}")),
        }
    }

    /// A "live" execution is one not yet in a terminal state.
    /// Exactly one live execution is permitted per project.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Queued | Self::Initializing | Self::Running | Self::Paused
        )
    }

    pub fn is_terminal(&self) -> bool {
        !self.is_live()
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Execution {
    pub execution_id: Uuid,
    pub project_id: String,
    pub event_id: Uuid,
    pub status: ExecutionStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn new(project_id: impl Into<String>, event_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            execution_id: Uuid::new_v4(),
            project_id: project_id.into(),
            event_id,
            status: ExecutionStatus::Queued,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_statuses() {
        assert!(ExecutionStatus::Queued.is_live());
        assert!(ExecutionStatus::Initializing.is_live());
        assert!(ExecutionStatus::Running.is_live());
        assert!(ExecutionStatus::Paused.is_live());
        assert!(!ExecutionStatus::Done.is_live());
        assert!(!ExecutionStatus::Stopped.is_live());
        assert!(!ExecutionStatus::Error.is_live());
    }

    #[test]
    fn round_trips_through_str() {
        for status in [
            ExecutionStatus::Queued,
            ExecutionStatus::Initializing,
            ExecutionStatus::Running,
            ExecutionStatus::Paused,
            ExecutionStatus::Stopped,
            ExecutionStatus::Done,
            ExecutionStatus::Error,
        ] {
            let s = status.as_str();
            assert_eq!(ExecutionStatus::from_str(s).unwrap(), status);
        }
    }

    #[test]
    fn rejects_unknown_status() {
        assert!(ExecutionStatus::from_str("bogus").is_err());
    }
}
