//! Event Store & Idempotency Layer (§4.C).
//!
//! Generalizes the teacher's `FactoryDb` (`factory/db.rs`): the same
//! open-or-create-then-migrate shape, `execute_batch` with
//! `CREATE TABLE IF NOT EXISTS`/`CREATE INDEX IF NOT EXISTS`, and
//! `.context(...)`-annotated CRUD, applied to two tables instead of four
//! (`events`, `executions`) and with an idempotency window instead of
//! foreign-key-scoped child rows.

use crate::errors::EventStoreError;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use devteam_common::{Event, Execution, ExecutionStatus, TaskContext};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex as StdMutex;
use tracing::instrument;
use uuid::Uuid;

/// Outcome of `append`: whether the event was newly stored, or an existing
/// event was returned because of an idempotency-key collision within the
/// TTL window (§4.C: "replays return the original, never double-store").
#[derive(Debug, Clone)]
pub enum AppendOutcome {
    Stored(Event),
    Replayed(Event),
}

impl AppendOutcome {
    pub fn event(&self) -> &Event {
        match self {
            AppendOutcome::Stored(e) | AppendOutcome::Replayed(e) => e,
        }
    }

    pub fn was_replayed(&self) -> bool {
        matches!(self, AppendOutcome::Replayed(_))
    }
}

pub struct EventStore {
    conn: StdMutex<Connection>,
    idempotency_ttl: ChronoDuration,
}

impl EventStore {
    pub fn open(path: &Path, idempotency_ttl_hours: u64) -> Result<Self, EventStoreError> {
        let conn = Connection::open(path)
            .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("open event store")))?;
        let store = Self {
            conn: StdMutex::new(conn),
            idempotency_ttl: ChronoDuration::hours(idempotency_ttl_hours as i64),
        };
        store.init()?;
        Ok(store)
    }

    pub fn open_in_memory(idempotency_ttl_hours: u64) -> Result<Self, EventStoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("open in-memory event store")))?;
        let store = Self {
            conn: StdMutex::new(conn),
            idempotency_ttl: ChronoDuration::hours(idempotency_ttl_hours as i64),
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<(), EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS events (
                id TEXT PRIMARY KEY,
                event_type TEXT NOT NULL,
                project_id TEXT NOT NULL,
                correlation_id TEXT,
                idempotency_key TEXT,
                payload TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_idempotency
                ON events(project_id, idempotency_key, created_at);

            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                project_id TEXT NOT NULL,
                event_id TEXT NOT NULL REFERENCES events(id),
                status TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_executions_project ON executions(project_id, status);

            CREATE TABLE IF NOT EXISTS task_contexts (
                execution_id TEXT PRIMARY KEY REFERENCES executions(execution_id),
                updated_at TEXT NOT NULL,
                data TEXT NOT NULL
            );
            ",
        )
        .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("run event store migrations")))
    }

    /// Snapshot-replaces the persisted `TaskContext` for `execution_id`
    /// (§6.3: "writes are snapshot replace, not append").
    #[instrument(skip(self, ctx))]
    pub fn save_context(&self, execution_id: Uuid, ctx: &TaskContext) -> Result<(), EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        let data = serde_json::to_string(ctx)
            .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("serialize task context")))?;
        conn.execute(
            "INSERT INTO task_contexts (execution_id, updated_at, data) VALUES (?1, ?2, ?3)
             ON CONFLICT(execution_id) DO UPDATE SET updated_at = excluded.updated_at, data = excluded.data",
            params![execution_id.to_string(), Utc::now().to_rfc3339(), data],
        )
        .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("save task context")))?;
        Ok(())
    }

    pub fn load_context(&self, execution_id: Uuid) -> Result<Option<TaskContext>, EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM task_contexts WHERE execution_id = ?1",
                params![execution_id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("load task context")))?;
        data.map(|raw| {
            serde_json::from_str(&raw)
                .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("deserialize task context")))
        })
        .transpose()
    }

    /// Appends an inbound event, deduplicating on `(projectId, idempotencyKey)`
    /// within the configured TTL window (§4.C, §9 resolved to 6h default).
    #[instrument(skip(self, event))]
    pub fn append(&self, event: Event) -> Result<AppendOutcome, EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");

        if let Some(key) = &event.idempotency_key {
            let window_start = (Utc::now() - self.idempotency_ttl).to_rfc3339();
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM events WHERE project_id = ?1 AND idempotency_key = ?2 AND created_at >= ?3
                     ORDER BY created_at DESC LIMIT 1",
                    params![event.project_id, key, window_start],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("idempotency lookup")))?;

            if let Some(existing_id) = existing {
                let id: Uuid = existing_id
                    .parse()
                    .map_err(|_| EventStoreError::Database(anyhow::anyhow!("corrupt event id {existing_id}")))?;
                drop(conn);
                let stored = self.get(id)?;
                return Ok(AppendOutcome::Replayed(stored));
            }
        }

        conn.execute(
            "INSERT INTO events (id, event_type, project_id, correlation_id, idempotency_key, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                event.id.to_string(),
                event.event_type,
                event.project_id,
                event.correlation_id,
                event.idempotency_key,
                event.payload.to_string(),
                event.created_at.to_rfc3339(),
            ],
        )
        .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("insert event")))?;

        Ok(AppendOutcome::Stored(event))
    }

    pub fn get(&self, id: Uuid) -> Result<Event, EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        conn.query_row(
            "SELECT id, event_type, project_id, correlation_id, idempotency_key, payload, created_at
             FROM events WHERE id = ?1",
            params![id.to_string()],
            row_to_event,
        )
        .optional()
        .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("get event")))?
        .ok_or(EventStoreError::NotFound { id })
    }

    /// Creates the `Execution` record for a newly-accepted event, in the
    /// `queued` state (§4.C, §3 Execution).
    pub fn create_execution(&self, project_id: &str, event_id: Uuid) -> Result<Execution, EventStoreError> {
        let execution = Execution::new(project_id, event_id);
        let conn = self.conn.lock().expect("event store connection poisoned");
        conn.execute(
            "INSERT INTO executions (execution_id, project_id, event_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                execution.execution_id.to_string(),
                execution.project_id,
                execution.event_id.to_string(),
                execution.status.as_str(),
                execution.created_at.to_rfc3339(),
                execution.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("insert execution")))?;
        Ok(execution)
    }

    pub fn update_execution_status(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<Execution, EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        let now = Utc::now().to_rfc3339();
        let updated = conn
            .execute(
                "UPDATE executions SET status = ?1, updated_at = ?2 WHERE execution_id = ?3",
                params![status.as_str(), now, execution_id.to_string()],
            )
            .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("update execution status")))?;
        if updated == 0 {
            return Err(EventStoreError::NotFound { id: execution_id });
        }
        drop(conn);
        self.get_execution(execution_id)
    }

    pub fn get_execution(&self, execution_id: Uuid) -> Result<Execution, EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        conn.query_row(
            "SELECT execution_id, project_id, event_id, status, created_at, updated_at
             FROM executions WHERE execution_id = ?1",
            params![execution_id.to_string()],
            row_to_execution,
        )
        .optional()
        .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("get execution")))?
        .ok_or(EventStoreError::NotFound { id: execution_id })
    }

    /// At most one live (non-terminal) execution per project is permitted
    /// (§3 Execution invariant) — callers check this before queuing a new one.
    pub fn live_execution_for_project(&self, project_id: &str) -> Result<Option<Execution>, EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        Self::find_live_execution(&conn, project_id)
    }

    fn find_live_execution(conn: &Connection, project_id: &str) -> Result<Option<Execution>, EventStoreError> {
        let mut stmt = conn
            .prepare(
                "SELECT execution_id, project_id, event_id, status, created_at, updated_at
                 FROM executions WHERE project_id = ?1 ORDER BY created_at DESC",
            )
            .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("prepare live execution query")))?;
        let rows = stmt
            .query_map(params![project_id], row_to_execution)
            .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("query live executions")))?;
        for row in rows {
            let execution = row.map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("read execution row")))?;
            if execution.status.is_live() {
                return Ok(Some(execution));
            }
        }
        Ok(None)
    }

    /// The `Execution` created for `event_id`, if one exists (idempotent
    /// `initialize` replays look this up rather than creating a second
    /// execution for the same event).
    pub fn execution_for_event(&self, event_id: Uuid) -> Result<Option<Execution>, EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        conn.query_row(
            "SELECT execution_id, project_id, event_id, status, created_at, updated_at
             FROM executions WHERE event_id = ?1",
            params![event_id.to_string()],
            row_to_execution,
        )
        .optional()
        .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("get execution for event")))
    }

    /// Atomically checks for a live execution on `project_id` and creates a
    /// new one only if none exists, all under one connection lock, so two
    /// concurrent `initialize` calls for the same project cannot both
    /// observe "no live execution" (§8: "for all concurrent initialize
    /// calls for the same project with no prior live execution: exactly one
    /// returns 202, all others return 409").
    pub fn create_execution_if_not_live(
        &self,
        project_id: &str,
        event_id: Uuid,
    ) -> Result<CreateExecutionOutcome, EventStoreError> {
        let conn = self.conn.lock().expect("event store connection poisoned");
        if let Some(existing) = Self::find_live_execution(&conn, project_id)? {
            return Ok(CreateExecutionOutcome::AlreadyLive(existing));
        }
        let execution = Execution::new(project_id, event_id);
        conn.execute(
            "INSERT INTO executions (execution_id, project_id, event_id, status, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                execution.execution_id.to_string(),
                execution.project_id,
                execution.event_id.to_string(),
                execution.status.as_str(),
                execution.created_at.to_rfc3339(),
                execution.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| EventStoreError::Database(anyhow::Error::new(e).context("insert execution")))?;
        Ok(CreateExecutionOutcome::Created(execution))
    }
}

/// Outcome of `create_execution_if_not_live`.
#[derive(Debug, Clone)]
pub enum CreateExecutionOutcome {
    Created(Execution),
    AlreadyLive(Execution),
}

fn row_to_event(row: &rusqlite::Row) -> rusqlite::Result<Event> {
    let id: String = row.get(0)?;
    let payload: String = row.get(5)?;
    let created_at: String = row.get(6)?;
    Ok(Event {
        id: parse_uuid(&id, 0)?,
        event_type: row.get(1)?,
        project_id: row.get(2)?,
        correlation_id: row.get(3)?,
        idempotency_key: row.get(4)?,
        payload: serde_json::from_str(&payload).unwrap_or(serde_json::Value::Null),
        created_at: parse_datetime(&created_at, 6)?,
    })
}

fn row_to_execution(row: &rusqlite::Row) -> rusqlite::Result<Execution> {
    let execution_id: String = row.get(0)?;
    let event_id: String = row.get(2)?;
    let status: String = row.get(3)?;
    let created_at: String = row.get(4)?;
    let updated_at: String = row.get(5)?;
    Ok(Execution {
        execution_id: parse_uuid(&execution_id, 0)?,
        project_id: row.get(1)?,
        event_id: parse_uuid(&event_id, 2)?,
        status: ExecutionStatus::from_str(&status).map_err(|_| {
            rusqlite::Error::FromSqlConversionFailure(3, rusqlite::types::Type::Text, "bad status".into())
        })?,
        created_at: parse_datetime(&created_at, 4)?,
        updated_at: parse_datetime(&updated_at, 5)?,
    })
}

fn parse_uuid(value: &str, column: usize) -> rusqlite::Result<Uuid> {
    value
        .parse()
        .map_err(|_| rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, "bad uuid".into()))
}

fn parse_datetime(value: &str, column: usize) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, "bad timestamp".into()))
}
