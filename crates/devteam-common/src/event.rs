use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An inbound control-plane event. Immutable once written.
///
/// Unique on `(projectId, idempotencyKey)` while `idempotencyKey` is present
/// and within the retention window (see `IDEMPOTENCY_TTL_HOURS`); the event
/// store enforces that constraint, not this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub project_id: String,
    pub correlation_id: Option<String>,
    pub idempotency_key: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(
        event_type: impl Into<String>,
        project_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            project_id: project_id.into(),
            correlation_id: None,
            idempotency_key: None,
            payload,
            created_at: Utc::now(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_has_no_idempotency_key_by_default() {
        let event = Event::new("DEVTEAM_AUTOMATION", "acme/app", serde_json::json!({}));
        assert!(event.idempotency_key.is_none());
        assert_eq!(event.project_id, "acme/app");
    }

    #[test]
    fn serializes_camel_case() {
        let event = Event::new("DEVTEAM_AUTOMATION", "acme/app", serde_json::json!({}))
            .with_idempotency_key("k1");
        let json = serde_json::to_value(&event).unwrap();
        assert!(json.get("projectId").is_some());
        assert!(json.get("idempotencyKey").is_some());
        assert!(json.get("project_id").is_none());
    }
}
