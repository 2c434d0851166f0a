use crate::errors::{DroverError, DroverResult};
use crate::events::{Event, EventType};
use crate::spawner::types::{AgentSpec, Instance, InstanceStatus, Template, TemplateScope};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, Row, TransactionBehavior, params};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;

impl From<rusqlite::Error> for DroverError {
    fn from(e: rusqlite::Error) -> Self {
        DroverError::Internal(anyhow::Error::new(e))
    }
}

/// SQLite-backed persistence for templates, instances, and the event log.
///
/// A single connection behind a mutex; writers serialize, which also gives
/// the spawner its single-writer guarantee per instance. The depth and
/// concurrency caps are checked inside the same transaction that inserts
/// the new instance, so two racing spawns cannot both win the last slot.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).with_context(|| {
                format!("failed to create database directory: {}", parent.display())
            })?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open database at {}", db_path.display()))?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA busy_timeout=3000;
             PRAGMA foreign_keys=ON;",
        )?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    /// In-memory store for tests and ephemeral runs.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_templates (
                id TEXT NOT NULL,
                version INTEGER NOT NULL,
                name TEXT NOT NULL,
                owner_id TEXT NOT NULL,
                scope TEXT NOT NULL,
                spec TEXT NOT NULL,
                required_roles TEXT NOT NULL,
                max_template_tools TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (id, version)
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_instances (
                id TEXT PRIMARY KEY,
                template_id TEXT NOT NULL,
                template_version INTEGER NOT NULL,
                spawned_by_user_id TEXT NOT NULL,
                parent_instance_id TEXT,
                root_instance_id TEXT NOT NULL,
                depth INTEGER NOT NULL,
                status TEXT NOT NULL,
                current_state TEXT NOT NULL,
                step INTEGER NOT NULL DEFAULT 0,
                task TEXT NOT NULL,
                context TEXT NOT NULL,
                result TEXT,
                error TEXT,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                cost REAL NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                completed_at TEXT
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_instances_user_status
             ON agent_instances (spawned_by_user_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_instances_root
             ON agent_instances (root_instance_id)",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS agent_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                trace_id TEXT,
                span_id TEXT,
                tokens_used INTEGER NOT NULL DEFAULT 0,
                latency_ms INTEGER,
                timestamp TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_events_instance
             ON agent_events (instance_id, id)",
            [],
        )?;

        Ok(())
    }

    // ---- templates ----

    /// Insert a new template at version 1, or a new version of an existing
    /// id. The spec per `(id, version)` is immutable; updates always land
    /// as a fresh row with a bumped version.
    pub fn save_template(&self, template: &Template) -> DroverResult<Template> {
        let conn = lock(&self.conn)?;
        let now = Utc::now().to_rfc3339();

        let next_version: u32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM agent_templates WHERE id = ?1",
                params![template.id],
                |r| r.get(0),
            )
            .map_err(DroverError::from)?;

        // Previous versions go inactive so lookups resolve to the newest.
        conn.execute(
            "UPDATE agent_templates SET is_active = 0, updated_at = ?2 WHERE id = ?1",
            params![template.id, now],
        )?;

        conn.execute(
            "INSERT INTO agent_templates
                (id, version, name, owner_id, scope, spec, required_roles,
                 max_template_tools, is_active, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            params![
                template.id,
                next_version,
                template.name,
                template.owner_id,
                template.scope.as_str(),
                serde_json::to_string(&template.spec).map_err(anyhow::Error::from)?,
                serde_json::to_string(&template.required_roles).map_err(anyhow::Error::from)?,
                serde_json::to_string(&template.max_template_tools).map_err(anyhow::Error::from)?,
                template.is_active,
                now,
            ],
        )?;

        let mut saved = template.clone();
        saved.version = next_version;
        Ok(saved)
    }

    /// Fetch the newest active version of a template.
    pub fn get_template(&self, id: &str) -> DroverResult<Option<Template>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, version, name, owner_id, scope, spec, required_roles,
                    max_template_tools, is_active
             FROM agent_templates
             WHERE id = ?1 AND is_active = 1
             ORDER BY version DESC LIMIT 1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_template(row)?)),
            None => Ok(None),
        }
    }

    pub fn list_templates(&self) -> DroverResult<Vec<Template>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, version, name, owner_id, scope, spec, required_roles,
                    max_template_tools, is_active
             FROM agent_templates WHERE is_active = 1 ORDER BY id",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            out.push(row_to_template(row)?);
        }
        Ok(out)
    }

    // ---- instances ----

    /// Insert a new instance, enforcing the principal's concurrent-instance
    /// cap inside the same immediate transaction. Racing spawns serialize
    /// here; the losing one observes the winner's row and is rejected.
    pub fn insert_instance_checked(
        &self,
        instance: &Instance,
        max_total_instances: u32,
    ) -> DroverResult<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let active: u32 = tx.query_row(
            "SELECT COUNT(*) FROM agent_instances
             WHERE spawned_by_user_id = ?1
               AND status IN ('queued', 'running', 'awaiting_approval')",
            params![instance.spawned_by_user_id],
            |r| r.get(0),
        )?;
        if active >= max_total_instances {
            return Err(DroverError::SpawnLimitExceeded(format!(
                "max concurrent instances ({}) reached",
                max_total_instances
            )));
        }

        tx.execute(
            "INSERT INTO agent_instances
                (id, template_id, template_version, spawned_by_user_id,
                 parent_instance_id, root_instance_id, depth, status,
                 current_state, step, task, context, result, error,
                 tokens_used, cost, created_at, updated_at, completed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12,
                     NULL, NULL, ?13, ?14, ?15, ?15, NULL)",
            params![
                instance.id,
                instance.template_id,
                instance.template_version,
                instance.spawned_by_user_id,
                instance.parent_instance_id,
                instance.root_instance_id,
                instance.depth,
                instance.status.as_str(),
                instance.current_state,
                instance.step,
                instance.task,
                serde_json::to_string(&instance.context).map_err(anyhow::Error::from)?,
                instance.tokens_used,
                instance.cost,
                instance.created_at.to_rfc3339(),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    pub fn get_instance(&self, id: &str) -> DroverResult<Option<Instance>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, template_id, template_version, spawned_by_user_id,
                    parent_instance_id, root_instance_id, depth, status,
                    current_state, step, task, context, result, error,
                    tokens_used, cost, created_at, updated_at, completed_at
             FROM agent_instances WHERE id = ?1",
        )?;
        let mut rows = stmt.query(params![id])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_instance(row)?)),
            None => Ok(None),
        }
    }

    /// Apply a status transition, rejecting edges outside the lifecycle.
    pub fn update_instance_status(&self, id: &str, next: InstanceStatus) -> DroverResult<()> {
        let mut conn = lock(&self.conn)?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current_str: String = tx
            .query_row(
                "SELECT status FROM agent_instances WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .map_err(|_| DroverError::Internal(anyhow::anyhow!("instance {} not found", id)))?;
        let current = InstanceStatus::parse(&current_str)
            .ok_or_else(|| anyhow::anyhow!("corrupt status '{}' on instance {}", current_str, id))?;

        if !current.can_transition_to(next) {
            return Err(DroverError::Internal(anyhow::anyhow!(
                "illegal status transition {} -> {} for instance {}",
                current.as_str(),
                next.as_str(),
                id
            )));
        }

        let now = Utc::now().to_rfc3339();
        let completed_at: Option<String> = next.is_terminal().then(|| now.clone());
        tx.execute(
            "UPDATE agent_instances
             SET status = ?2, updated_at = ?3,
                 completed_at = COALESCE(?4, completed_at)
             WHERE id = ?1",
            params![id, next.as_str(), now, completed_at],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Record loop progress: step counter, token usage, phase label.
    pub fn update_instance_progress(
        &self,
        id: &str,
        step: u32,
        tokens_used: u64,
        current_state: &str,
    ) -> DroverResult<()> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "UPDATE agent_instances
             SET step = ?2, tokens_used = ?3, current_state = ?4, updated_at = ?5
             WHERE id = ?1",
            params![id, step, tokens_used, current_state, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn set_instance_result(
        &self,
        id: &str,
        result: Option<&Value>,
        error: Option<&str>,
    ) -> DroverResult<()> {
        let conn = lock(&self.conn)?;
        let result_str = match result {
            Some(v) => Some(serde_json::to_string(v).map_err(anyhow::Error::from)?),
            None => None,
        };
        conn.execute(
            "UPDATE agent_instances SET result = ?2, error = ?3, updated_at = ?4 WHERE id = ?1",
            params![id, result_str, error, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn count_active_instances(&self, principal_id: &str) -> DroverResult<u32> {
        let conn = lock(&self.conn)?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM agent_instances
             WHERE spawned_by_user_id = ?1
               AND status IN ('queued', 'running', 'awaiting_approval')",
            params![principal_id],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    // ---- events ----

    /// Append one event. The log is append-only: there is no update or
    /// delete path anywhere in this store.
    pub fn append_event(&self, event: &Event) -> DroverResult<i64> {
        let conn = lock(&self.conn)?;
        conn.execute(
            "INSERT INTO agent_events
                (instance_id, event_type, payload, trace_id, span_id,
                 tokens_used, latency_ms, timestamp)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                event.instance_id,
                event.event_type.as_str(),
                serde_json::to_string(&event.payload).map_err(anyhow::Error::from)?,
                event.trace_id,
                event.span_id,
                event.tokens_used,
                event.latency_ms,
                event.timestamp.to_rfc3339(),
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn events_for_instance(&self, instance_id: &str) -> DroverResult<Vec<Event>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT id, instance_id, event_type, payload, trace_id, span_id,
                    tokens_used, latency_ms, timestamp
             FROM agent_events WHERE instance_id = ?1 ORDER BY id",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![instance_id])?;
        while let Some(row) = rows.next()? {
            out.push(row_to_event(row)?);
        }
        Ok(out)
    }

    /// Events across a whole spawn tree, joined through ancestry.
    pub fn events_for_root(&self, root_instance_id: &str) -> DroverResult<Vec<Event>> {
        let conn = lock(&self.conn)?;
        let mut stmt = conn.prepare(
            "SELECT e.id, e.instance_id, e.event_type, e.payload, e.trace_id,
                    e.span_id, e.tokens_used, e.latency_ms, e.timestamp
             FROM agent_events e
             JOIN agent_instances i ON i.id = e.instance_id
             WHERE i.root_instance_id = ?1
             ORDER BY e.id",
        )?;
        let mut out = Vec::new();
        let mut rows = stmt.query(params![root_instance_id])?;
        while let Some(row) = rows.next()? {
            out.push(row_to_event(row)?);
        }
        Ok(out)
    }
}

fn lock(conn: &Mutex<Connection>) -> DroverResult<std::sync::MutexGuard<'_, Connection>> {
    conn.lock()
        .map_err(|e| DroverError::Internal(anyhow::anyhow!("DB lock poisoned: {}", e)))
}

fn row_to_template(row: &Row<'_>) -> DroverResult<Template> {
    let scope_str: String = row.get(4)?;
    let spec_str: String = row.get(5)?;
    let roles_str: String = row.get(6)?;
    let cap_str: String = row.get(7)?;
    let spec: AgentSpec = serde_json::from_str(&spec_str).map_err(anyhow::Error::from)?;
    Ok(Template {
        id: row.get(0)?,
        version: row.get(1)?,
        name: row.get(2)?,
        owner_id: row.get(3)?,
        scope: TemplateScope::parse(&scope_str)
            .ok_or_else(|| anyhow::anyhow!("corrupt template scope '{}'", scope_str))?,
        spec,
        required_roles: serde_json::from_str(&roles_str).map_err(anyhow::Error::from)?,
        max_template_tools: serde_json::from_str(&cap_str).map_err(anyhow::Error::from)?,
        is_active: row.get(8)?,
    })
}

fn row_to_instance(row: &Row<'_>) -> DroverResult<Instance> {
    let status_str: String = row.get(7)?;
    let context_str: String = row.get(11)?;
    let result_str: Option<String> = row.get(12)?;
    let created_at: String = row.get(16)?;
    let updated_at: String = row.get(17)?;
    let completed_at: Option<String> = row.get(18)?;

    Ok(Instance {
        id: row.get(0)?,
        template_id: row.get(1)?,
        template_version: row.get(2)?,
        spawned_by_user_id: row.get(3)?,
        parent_instance_id: row.get(4)?,
        root_instance_id: row.get(5)?,
        depth: row.get(6)?,
        status: InstanceStatus::parse(&status_str)
            .ok_or_else(|| anyhow::anyhow!("corrupt instance status '{}'", status_str))?,
        current_state: row.get(8)?,
        step: row.get(9)?,
        task: row.get(10)?,
        context: serde_json::from_str(&context_str).map_err(anyhow::Error::from)?,
        result: match result_str {
            Some(s) => Some(serde_json::from_str(&s).map_err(anyhow::Error::from)?),
            None => None,
        },
        error: row.get(13)?,
        tokens_used: row.get(14)?,
        cost: row.get(15)?,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
        completed_at: completed_at.as_deref().map(parse_ts).transpose()?,
    })
}

fn row_to_event(row: &Row<'_>) -> DroverResult<Event> {
    let type_str: String = row.get(2)?;
    let payload_str: String = row.get(3)?;
    let ts_str: String = row.get(8)?;
    Ok(Event {
        id: row.get(0)?,
        instance_id: row.get(1)?,
        event_type: EventType::parse(&type_str)
            .ok_or_else(|| anyhow::anyhow!("corrupt event type '{}'", type_str))?,
        payload: serde_json::from_str(&payload_str).map_err(anyhow::Error::from)?,
        trace_id: row.get(4)?,
        span_id: row.get(5)?,
        tokens_used: row.get(6)?,
        latency_ms: row.get(7)?,
        timestamp: parse_ts(&ts_str)?,
    })
}

fn parse_ts(s: &str) -> DroverResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DroverError::Internal(anyhow::anyhow!("bad timestamp '{}': {}", s, e)))
}

#[cfg(test)]
mod tests;
