// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;
use uuid::Uuid;

use crate::domain::{Agent, Message, Project, Role, Session, SubSession, SubSessionStatus};
use crate::part::{validate_update, MessagePart, PartKind, PartPayload, ToolStatus, TypedPart};
use crate::{StoreError, TokenUsage};

const SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS projects (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    root_path   TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sessions (
    id                  TEXT PRIMARY KEY,
    project_id          INTEGER NOT NULL REFERENCES projects(id) ON DELETE CASCADE,
    title               TEXT,
    active_agent_id     TEXT,
    active_pipeline_id  TEXT,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_sessions_project ON sessions(project_id);

CREATE TABLE IF NOT EXISTS messages (
    id                 TEXT PRIMARY KEY,
    session_id         TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role               TEXT NOT NULL,
    agent_id           TEXT,
    model_id           TEXT,
    provider_id        TEXT,
    usage              TEXT,
    finish_reason      TEXT,
    is_compacted       INTEGER NOT NULL DEFAULT 0,
    parent_message_id  TEXT,
    created_at         TEXT NOT NULL,
    updated_at         TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);

CREATE TABLE IF NOT EXISTS message_parts (
    id           TEXT PRIMARY KEY,
    message_id   TEXT NOT NULL REFERENCES messages(id) ON DELETE CASCADE,
    session_id   TEXT NOT NULL,
    order_index  INTEGER NOT NULL,
    kind         TEXT NOT NULL,
    payload      TEXT NOT NULL,
    created_at   TEXT NOT NULL,
    updated_at   TEXT NOT NULL,
    UNIQUE(message_id, order_index)
);
CREATE INDEX IF NOT EXISTS idx_parts_message ON message_parts(message_id);
CREATE INDEX IF NOT EXISTS idx_parts_session_kind ON message_parts(session_id, kind);

CREATE TABLE IF NOT EXISTS agents (
    id          TEXT PRIMARY KEY,
    slug        TEXT NOT NULL UNIQUE,
    record      TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS sub_sessions (
    id                     TEXT PRIMARY KEY,
    parent_session_id      TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    parent_message_id      TEXT NOT NULL,
    agent_type             TEXT NOT NULL,
    status                 TEXT NOT NULL,
    prompt                 TEXT NOT NULL,
    result                 TEXT,
    error                  TEXT,
    effective_permissions  TEXT NOT NULL,
    created_at             TEXT NOT NULL,
    completed_at           TEXT,
    duration_ms            INTEGER
);
CREATE INDEX IF NOT EXISTS idx_sub_sessions_parent ON sub_sessions(parent_session_id);

CREATE TABLE IF NOT EXISTS app_state (
    key    TEXT PRIMARY KEY,
    value  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS event_log (
    id          TEXT PRIMARY KEY,
    event_type  TEXT NOT NULL,
    session_id  TEXT,
    payload     TEXT NOT NULL,
    created_at  TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_event_log_type ON event_log(event_type);
CREATE INDEX IF NOT EXISTS idx_event_log_session ON event_log(session_id);
CREATE INDEX IF NOT EXISTS idx_event_log_time ON event_log(created_at);
"#;

/// Audited event row.
#[derive(Debug, Clone)]
pub struct EventRecord {
    pub id: String,
    pub event_type: String,
    pub session_id: Option<String>,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// SQLite-backed persistent store.
///
/// A single connection behind a mutex: every method takes the lock for the
/// duration of one statement or transaction.  Write ordering within a
/// session is the responsibility of the per-session locks above this layer.
pub struct Store {
    conn: Mutex<Connection>,
}

fn fmt_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339()
}

fn parse_ts(s: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::InvalidInput(format!("bad timestamp {s}: {e}")))
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        debug!(path = %path.display(), "store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Default database location under the user data directory.
    pub fn default_path() -> PathBuf {
        dirs_path().join("orchid.db")
    }

    // ─── Projects ─────────────────────────────────────────────────────────────

    pub fn create_project(&self, name: &str, root_path: &Path) -> Result<Project, StoreError> {
        let now = Utc::now();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO projects (name, root_path, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
            params![name, root_path.to_string_lossy(), fmt_ts(now), fmt_ts(now)],
        )?;
        let id = conn.last_insert_rowid();
        Ok(Project {
            id,
            name: name.to_string(),
            root_path: root_path.to_path_buf(),
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_project(&self, id: i64) -> Result<Project, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, name, root_path, created_at, updated_at FROM projects WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, i64>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()?;
        let (id, name, root, created, updated) = row.ok_or(StoreError::NotFound {
            what: "project",
            id: id.to_string(),
        })?;
        Ok(Project {
            id,
            name,
            root_path: PathBuf::from(root),
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        })
    }

    pub fn list_projects(&self) -> Result<Vec<Project>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, name, root_path, created_at, updated_at FROM projects ORDER BY id",
        )?;
        let rows = stmt.query_map([], |r| {
            Ok((
                r.get::<_, i64>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, name, root, created, updated) = row?;
            out.push(Project {
                id,
                name,
                root_path: PathBuf::from(root),
                created_at: parse_ts(&created)?,
                updated_at: parse_ts(&updated)?,
            });
        }
        Ok(out)
    }

    pub fn rename_project(&self, id: i64, name: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE projects SET name = ?1, updated_at = ?2 WHERE id = ?3",
            params![name, fmt_ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "project",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn move_project(&self, id: i64, root_path: &Path) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE projects SET root_path = ?1, updated_at = ?2 WHERE id = ?3",
            params![root_path.to_string_lossy(), fmt_ts(Utc::now()), id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "project",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    pub fn delete_project(&self, id: i64) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM projects WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ─── Sessions ─────────────────────────────────────────────────────────────

    pub fn create_session(
        &self,
        project_id: i64,
        title: Option<&str>,
    ) -> Result<Session, StoreError> {
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sessions (id, project_id, title, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![id, project_id, title, fmt_ts(now), fmt_ts(now)],
        )?;
        Ok(Session {
            id,
            project_id,
            title: title.map(|t| t.to_string()),
            active_agent_id: None,
            active_pipeline_id: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_session(&self, id: &str) -> Result<Session, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, project_id, title, active_agent_id, active_pipeline_id,
                        created_at, updated_at
                 FROM sessions WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, i64>(1)?,
                        r.get::<_, Option<String>>(2)?,
                        r.get::<_, Option<String>>(3)?,
                        r.get::<_, Option<String>>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        let (id, project_id, title, agent, pipeline, created, updated) =
            row.ok_or(StoreError::NotFound {
                what: "session",
                id: id.to_string(),
            })?;
        Ok(Session {
            id,
            project_id,
            title,
            active_agent_id: agent,
            active_pipeline_id: pipeline,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        })
    }

    pub fn list_sessions(&self, project_id: i64) -> Result<Vec<Session>, StoreError> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id FROM sessions WHERE project_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![project_id], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| self.get_session(id)).collect()
    }

    /// Select the active agent; clears any active pipeline (XOR invariant).
    pub fn set_active_agent(&self, session_id: &str, agent_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET active_agent_id = ?1, active_pipeline_id = NULL,
             updated_at = ?2 WHERE id = ?3",
            params![agent_id, fmt_ts(Utc::now()), session_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "session",
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    /// Select the active pipeline; clears any active agent (XOR invariant).
    pub fn set_active_pipeline(
        &self,
        session_id: &str,
        pipeline_id: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        let n = conn.execute(
            "UPDATE sessions SET active_pipeline_id = ?1, active_agent_id = NULL,
             updated_at = ?2 WHERE id = ?3",
            params![pipeline_id, fmt_ts(Utc::now()), session_id],
        )?;
        if n == 0 {
            return Err(StoreError::NotFound {
                what: "session",
                id: session_id.to_string(),
            });
        }
        Ok(())
    }

    pub fn rename_session(&self, session_id: &str, title: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sessions SET title = ?1, updated_at = ?2 WHERE id = ?3",
            params![title, fmt_ts(Utc::now()), session_id],
        )?;
        Ok(())
    }

    /// Delete a session; messages, parts, and sub-sessions cascade.
    pub fn delete_session(&self, session_id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM sessions WHERE id = ?1", params![session_id])?;
        Ok(())
    }

    // ─── Messages ─────────────────────────────────────────────────────────────

    pub fn create_message(&self, msg: &Message) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        Self::insert_message(&conn, msg)
    }

    fn insert_message(conn: &Connection, msg: &Message) -> Result<(), StoreError> {
        let usage = msg
            .usage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        conn.execute(
            "INSERT INTO messages (id, session_id, role, agent_id, model_id, provider_id,
                                   usage, finish_reason, is_compacted, parent_message_id,
                                   created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                msg.id,
                msg.session_id,
                msg.role.as_str(),
                msg.agent_id,
                msg.model_id,
                msg.provider_id,
                usage,
                msg.finish_reason,
                msg.is_compacted as i64,
                msg.parent_message_id,
                fmt_ts(msg.created_at),
                fmt_ts(msg.updated_at),
            ],
        )?;
        Ok(())
    }

    fn row_to_message(
        row: (
            String,
            String,
            String,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            Option<String>,
            i64,
            Option<String>,
            String,
            String,
        ),
    ) -> Result<Message, StoreError> {
        let (
            id,
            session_id,
            role,
            agent_id,
            model_id,
            provider_id,
            usage,
            finish_reason,
            is_compacted,
            parent,
            created,
            updated,
        ) = row;
        Ok(Message {
            id,
            session_id,
            role: Role::parse(&role)?,
            agent_id,
            model_id,
            provider_id,
            usage: usage
                .map(|u| serde_json::from_str::<TokenUsage>(&u))
                .transpose()?,
            finish_reason,
            is_compacted: is_compacted != 0,
            parent_message_id: parent,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
        })
    }

    const MESSAGE_COLUMNS: &'static str =
        "id, session_id, role, agent_id, model_id, provider_id, usage, finish_reason,
         is_compacted, parent_message_id, created_at, updated_at";

    pub fn get_message(&self, id: &str) -> Result<Message, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM messages WHERE id = ?1",
            Self::MESSAGE_COLUMNS
        );
        let row = conn
            .query_row(&sql, params![id], |r| {
                Ok((
                    r.get(0)?,
                    r.get(1)?,
                    r.get(2)?,
                    r.get(3)?,
                    r.get(4)?,
                    r.get(5)?,
                    r.get(6)?,
                    r.get(7)?,
                    r.get(8)?,
                    r.get(9)?,
                    r.get(10)?,
                    r.get(11)?,
                ))
            })
            .optional()?;
        let row = row.ok_or(StoreError::NotFound {
            what: "message",
            id: id.to_string(),
        })?;
        Self::row_to_message(row)
    }

    /// All messages of a session in insertion order.
    pub fn list_messages(&self, session_id: &str) -> Result<Vec<Message>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let sql = format!(
            "SELECT {} FROM messages WHERE session_id = ?1 ORDER BY rowid",
            Self::MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok((
                r.get(0)?,
                r.get(1)?,
                r.get(2)?,
                r.get(3)?,
                r.get(4)?,
                r.get(5)?,
                r.get(6)?,
                r.get(7)?,
                r.get(8)?,
                r.get(9)?,
                r.get(10)?,
                r.get(11)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::row_to_message(row?)?);
        }
        Ok(out)
    }

    /// The id of the most recently inserted message of a session.
    pub fn latest_message_id(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT id FROM messages WHERE session_id = ?1 ORDER BY rowid DESC LIMIT 1",
                params![session_id],
                |r| r.get::<_, String>(0),
            )
            .optional()?)
    }

    pub fn update_message_usage(
        &self,
        id: &str,
        usage: Option<&TokenUsage>,
        finish_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let usage = usage.map(serde_json::to_string).transpose()?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE messages SET usage = COALESCE(?1, usage),
                                 finish_reason = COALESCE(?2, finish_reason),
                                 updated_at = ?3
             WHERE id = ?4",
            params![usage, finish_reason, fmt_ts(Utc::now()), id],
        )?;
        Ok(())
    }

    /// Mark a set of messages as replaced by a compaction summary.  Source
    /// rows are never deleted.
    pub fn mark_messages_compacted(&self, ids: &[String]) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for id in ids {
            tx.execute(
                "UPDATE messages SET is_compacted = 1, updated_at = ?1 WHERE id = ?2",
                params![fmt_ts(Utc::now()), id],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Append an iteration's tool-role messages and their parts atomically:
    /// either every row lands or none does.
    pub fn append_tool_exchange(
        &self,
        messages: &[Message],
        parts: &[MessagePart],
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        for msg in messages {
            let usage = msg.usage.as_ref().map(serde_json::to_string).transpose()?;
            tx.execute(
                "INSERT INTO messages (id, session_id, role, agent_id, model_id, provider_id,
                                       usage, finish_reason, is_compacted, parent_message_id,
                                       created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
                params![
                    msg.id,
                    msg.session_id,
                    msg.role.as_str(),
                    msg.agent_id,
                    msg.model_id,
                    msg.provider_id,
                    usage,
                    msg.finish_reason,
                    msg.is_compacted as i64,
                    msg.parent_message_id,
                    fmt_ts(msg.created_at),
                    fmt_ts(msg.updated_at),
                ],
            )?;
        }
        for part in parts {
            tx.execute(
                "INSERT INTO message_parts (id, message_id, session_id, order_index, kind,
                                            payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    part.id,
                    part.message_id,
                    part.session_id,
                    part.order_index,
                    part.kind().as_str(),
                    serde_json::to_string(&part.payload)?,
                    fmt_ts(part.created_at),
                    fmt_ts(part.updated_at),
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ─── Parts ────────────────────────────────────────────────────────────────

    /// Persist a new part at its `order_index`.  Assigns an id when absent
    /// and stamps `created_at`; fails when `(message_id, order_index)` is
    /// already taken.
    pub fn create_part(&self, part: &mut MessagePart) -> Result<(), StoreError> {
        if part.id.is_empty() {
            part.id = Uuid::new_v4().to_string();
        }
        part.created_at = Utc::now();
        part.updated_at = part.created_at;
        let conn = self.conn.lock().unwrap();
        let taken: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM message_parts WHERE message_id = ?1 AND order_index = ?2",
                params![part.message_id, part.order_index],
                |r| r.get(0),
            )
            .optional()?;
        if taken.is_some() {
            return Err(StoreError::OrderIndexConflict {
                message_id: part.message_id.clone(),
                order_index: part.order_index,
            });
        }
        conn.execute(
            "INSERT INTO message_parts (id, message_id, session_id, order_index, kind,
                                        payload, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                part.id,
                part.message_id,
                part.session_id,
                part.order_index,
                part.kind().as_str(),
                serde_json::to_string(&part.payload)?,
                fmt_ts(part.created_at),
                fmt_ts(part.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Replace a part row.  Rejected when the new payload violates the
    /// part type's state machine (e.g. a completed tool going back to
    /// running) or changes the variant.
    pub fn update_part(&self, part: &MessagePart) -> Result<(), StoreError> {
        let old = self.get_part(&part.id)?;
        validate_update(&old, part)?;
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE message_parts SET payload = ?1, updated_at = ?2 WHERE id = ?3",
            params![
                serde_json::to_string(&part.payload)?,
                fmt_ts(Utc::now()),
                part.id
            ],
        )?;
        Ok(())
    }

    pub fn delete_part(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM message_parts WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn get_part(&self, id: &str) -> Result<MessagePart, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, message_id, session_id, order_index, payload, created_at, updated_at
                 FROM message_parts WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, u32>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, String>(6)?,
                    ))
                },
            )
            .optional()?;
        let (id, message_id, session_id, order_index, payload, created, updated) =
            row.ok_or(StoreError::NotFound {
                what: "part",
                id: id.to_string(),
            })?;
        Ok(MessagePart {
            id,
            message_id,
            session_id,
            order_index,
            created_at: parse_ts(&created)?,
            updated_at: parse_ts(&updated)?,
            payload: serde_json::from_str::<PartPayload>(&payload)?,
        })
    }

    /// Parts of a message ordered by `order_index`.
    pub fn parts_by_message(&self, message_id: &str) -> Result<Vec<MessagePart>, StoreError> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id FROM message_parts WHERE message_id = ?1 ORDER BY order_index",
            )?;
            let rows = stmt.query_map(params![message_id], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| self.get_part(id)).collect()
    }

    /// Next free order index for a message (parts are contiguous from 0).
    pub fn next_order_index(&self, message_id: &str) -> Result<u32, StoreError> {
        let conn = self.conn.lock().unwrap();
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM message_parts WHERE message_id = ?1",
            params![message_id],
            |r| r.get(0),
        )?;
        Ok(n as u32)
    }

    /// Tool parts of a session in the given status.  Used by loop recovery
    /// after a crash.
    pub fn tool_parts_by_status(
        &self,
        session_id: &str,
        status: ToolStatus,
    ) -> Result<Vec<MessagePart>, StoreError> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id FROM message_parts WHERE session_id = ?1 AND kind = 'tool'
                 ORDER BY rowid",
            )?;
            let rows = stmt.query_map(params![session_id], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        let mut out = Vec::new();
        for id in ids {
            let part = self.get_part(&id)?;
            if let PartPayload::Tool(t) = &part.payload {
                if t.status == status {
                    out.push(part);
                }
            }
        }
        Ok(out)
    }

    /// The most recent compaction boundary of a session, if any.
    pub fn most_recent_compaction(
        &self,
        session_id: &str,
    ) -> Result<Option<MessagePart>, StoreError> {
        let id: Option<String> = {
            let conn = self.conn.lock().unwrap();
            conn.query_row(
                "SELECT id FROM message_parts WHERE session_id = ?1 AND kind = 'compaction'
                 ORDER BY rowid DESC LIMIT 1",
                params![session_id],
                |r| r.get(0),
            )
            .optional()?
        };
        id.map(|id| self.get_part(&id)).transpose()
    }

    /// Typed accessor: loads the part and extracts the requested variant,
    /// failing with a wrong-type error on mismatch.
    pub fn get_typed<T: TypedPart>(&self, id: &str) -> Result<T, StoreError> {
        let part = self.get_part(id)?;
        T::from_payload(&part.payload).ok_or_else(|| StoreError::WrongPartType {
            id: id.to_string(),
            expected: T::KIND.as_str(),
            actual: part.kind().as_str().to_string(),
        })
    }

    /// All parts of a given kind in a session, in insertion order.
    pub fn parts_by_kind(
        &self,
        session_id: &str,
        kind: PartKind,
    ) -> Result<Vec<MessagePart>, StoreError> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id FROM message_parts WHERE session_id = ?1 AND kind = ?2 ORDER BY rowid",
            )?;
            let rows =
                stmt.query_map(params![session_id, kind.as_str()], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| self.get_part(id)).collect()
    }

    // ─── Agents ───────────────────────────────────────────────────────────────

    pub fn upsert_agent(&self, agent: &Agent) -> Result<(), StoreError> {
        if !Agent::slug_is_valid(&agent.slug) {
            return Err(StoreError::InvalidInput(format!(
                "invalid agent slug: {}",
                agent.slug
            )));
        }
        let record = serde_json::to_string(agent)?;
        let now = fmt_ts(Utc::now());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agents (id, slug, record, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(slug) DO UPDATE SET record = ?3, updated_at = ?4",
            params![agent.id, agent.slug, record, now],
        )?;
        Ok(())
    }

    pub fn agent_by_slug(&self, slug: &str) -> Result<Agent, StoreError> {
        let conn = self.conn.lock().unwrap();
        let record: Option<String> = conn
            .query_row(
                "SELECT record FROM agents WHERE slug = ?1",
                params![slug],
                |r| r.get(0),
            )
            .optional()?;
        let record = record.ok_or(StoreError::NotFound {
            what: "agent",
            id: slug.to_string(),
        })?;
        Ok(serde_json::from_str(&record)?)
    }

    pub fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let records: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare("SELECT record FROM agents ORDER BY slug")?;
            let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        records
            .iter()
            .map(|r| serde_json::from_str(r).map_err(StoreError::from))
            .collect()
    }

    pub fn delete_agent(&self, slug: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM agents WHERE slug = ?1", params![slug])?;
        Ok(())
    }

    // ─── Sub-sessions ─────────────────────────────────────────────────────────

    pub fn create_sub_session(&self, sub: &SubSession) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sub_sessions (id, parent_session_id, parent_message_id, agent_type,
                                       status, prompt, result, error, effective_permissions,
                                       created_at, completed_at, duration_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                sub.id,
                sub.parent_session_id,
                sub.parent_message_id,
                sub.agent_type,
                sub.status.as_str(),
                sub.prompt,
                sub.result,
                sub.error,
                serde_json::to_string(&sub.effective_permissions)?,
                fmt_ts(sub.created_at),
                sub.completed_at.map(fmt_ts),
                sub.duration_ms,
            ],
        )?;
        Ok(())
    }

    /// Transition a sub-session; rejected when the transition is not
    /// allowed by the status state machine.
    pub fn update_sub_session_status(
        &self,
        id: &str,
        status: SubSessionStatus,
        result: Option<&str>,
        error: Option<&str>,
    ) -> Result<(), StoreError> {
        let current = self.get_sub_session(id)?;
        if current.status != status && !current.status.can_transition(status) {
            return Err(StoreError::InvalidTransition {
                part_id: id.to_string(),
                from: current.status.as_str().to_string(),
                to: status.as_str().to_string(),
            });
        }
        let completed_at = status.is_terminal().then(Utc::now);
        let duration_ms =
            completed_at.map(|t| (t - current.created_at).num_milliseconds());
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE sub_sessions SET status = ?1,
                                     result = COALESCE(?2, result),
                                     error = COALESCE(?3, error),
                                     completed_at = COALESCE(?4, completed_at),
                                     duration_ms = COALESCE(?5, duration_ms)
             WHERE id = ?6",
            params![
                status.as_str(),
                result,
                error,
                completed_at.map(fmt_ts),
                duration_ms,
                id
            ],
        )?;
        Ok(())
    }

    pub fn get_sub_session(&self, id: &str) -> Result<SubSession, StoreError> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT id, parent_session_id, parent_message_id, agent_type, status, prompt,
                        result, error, effective_permissions, created_at, completed_at,
                        duration_ms
                 FROM sub_sessions WHERE id = ?1",
                params![id],
                |r| {
                    Ok((
                        r.get::<_, String>(0)?,
                        r.get::<_, String>(1)?,
                        r.get::<_, String>(2)?,
                        r.get::<_, String>(3)?,
                        r.get::<_, String>(4)?,
                        r.get::<_, String>(5)?,
                        r.get::<_, Option<String>>(6)?,
                        r.get::<_, Option<String>>(7)?,
                        r.get::<_, String>(8)?,
                        r.get::<_, String>(9)?,
                        r.get::<_, Option<String>>(10)?,
                        r.get::<_, Option<i64>>(11)?,
                    ))
                },
            )
            .optional()?;
        let (
            id,
            parent_session_id,
            parent_message_id,
            agent_type,
            status,
            prompt,
            result,
            error,
            permissions,
            created,
            completed,
            duration_ms,
        ) = row.ok_or(StoreError::NotFound {
            what: "sub-session",
            id: id.to_string(),
        })?;
        Ok(SubSession {
            id,
            parent_session_id,
            parent_message_id,
            agent_type,
            status: SubSessionStatus::parse(&status)?,
            prompt,
            result,
            error,
            effective_permissions: serde_json::from_str(&permissions)?,
            created_at: parse_ts(&created)?,
            completed_at: completed.as_deref().map(parse_ts).transpose()?,
            duration_ms,
        })
    }

    pub fn sub_sessions_for_session(
        &self,
        parent_session_id: &str,
    ) -> Result<Vec<SubSession>, StoreError> {
        let ids: Vec<String> = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id FROM sub_sessions WHERE parent_session_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![parent_session_id], |r| r.get::<_, String>(0))?;
            rows.collect::<Result<_, _>>()?
        };
        ids.iter().map(|id| self.get_sub_session(id)).collect()
    }

    // ─── App state ────────────────────────────────────────────────────────────

    pub fn state_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn
            .query_row(
                "SELECT value FROM app_state WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?)
    }

    pub fn state_set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO app_state (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = ?2",
            params![key, value],
        )?;
        Ok(())
    }

    // ─── Event log ────────────────────────────────────────────────────────────

    pub fn log_event(&self, record: &EventRecord) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO event_log (id, event_type, session_id, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.id,
                record.event_type,
                record.session_id,
                serde_json::to_string(&record.payload)?,
                fmt_ts(record.created_at),
            ],
        )?;
        Ok(())
    }

    pub fn events_for_session(
        &self,
        session_id: &str,
    ) -> Result<Vec<EventRecord>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, event_type, session_id, payload, created_at FROM event_log
             WHERE session_id = ?1 ORDER BY created_at",
        )?;
        let rows = stmt.query_map(params![session_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (id, event_type, session_id, payload, created) = row?;
            out.push(EventRecord {
                id,
                event_type,
                session_id,
                payload: serde_json::from_str(&payload)?,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(out)
    }
}

fn dirs_path() -> PathBuf {
    std::env::var_os("ORCHID_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            std::env::var_os("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".local/share/orchid")
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::part::{CompactionPart, ToolPart};

    fn store_with_session() -> (Store, Session) {
        let store = Store::open_in_memory().unwrap();
        let project = store.create_project("demo", Path::new("/tmp/demo")).unwrap();
        let session = store.create_session(project.id, Some("chat")).unwrap();
        (store, session)
    }

    fn text_part(msg: &Message, index: u32, content: &str) -> MessagePart {
        MessagePart::new(
            &msg.id,
            &msg.session_id,
            index,
            PartPayload::Text {
                content: content.into(),
            },
        )
    }

    // ── Projects and sessions ─────────────────────────────────────────────────

    #[test]
    fn project_crud_round_trip() {
        let store = Store::open_in_memory().unwrap();
        let p = store.create_project("demo", Path::new("/srv/demo")).unwrap();
        store.rename_project(p.id, "renamed").unwrap();
        let got = store.get_project(p.id).unwrap();
        assert_eq!(got.name, "renamed");
        assert_eq!(got.root_path, Path::new("/srv/demo"));
    }

    #[test]
    fn active_agent_and_pipeline_are_exclusive() {
        let (store, session) = store_with_session();
        store.set_active_agent(&session.id, "agent-1").unwrap();
        store.set_active_pipeline(&session.id, "pipe-1").unwrap();
        let s = store.get_session(&session.id).unwrap();
        assert!(s.active_agent_id.is_none());
        assert_eq!(s.active_pipeline_id.as_deref(), Some("pipe-1"));

        store.set_active_agent(&session.id, "agent-2").unwrap();
        let s = store.get_session(&session.id).unwrap();
        assert_eq!(s.active_agent_id.as_deref(), Some("agent-2"));
        assert!(s.active_pipeline_id.is_none());
    }

    #[test]
    fn delete_session_cascades_to_messages_and_parts() {
        let (store, session) = store_with_session();
        let msg = Message::new(&session.id, Role::User);
        store.create_message(&msg).unwrap();
        let mut part = text_part(&msg, 0, "hi");
        store.create_part(&mut part).unwrap();

        store.delete_session(&session.id).unwrap();
        assert!(store.get_message(&msg.id).is_err());
        assert!(store.get_part(&part.id).is_err());
    }

    // ── Parts ─────────────────────────────────────────────────────────────────

    #[test]
    fn create_part_rejects_duplicate_order_index() {
        let (store, session) = store_with_session();
        let msg = Message::new(&session.id, Role::Assistant);
        store.create_message(&msg).unwrap();
        let mut a = text_part(&msg, 0, "a");
        store.create_part(&mut a).unwrap();
        let mut b = text_part(&msg, 0, "b");
        assert!(matches!(
            store.create_part(&mut b),
            Err(StoreError::OrderIndexConflict { .. })
        ));
    }

    #[test]
    fn parts_come_back_ordered_and_contiguous() {
        let (store, session) = store_with_session();
        let msg = Message::new(&session.id, Role::Assistant);
        store.create_message(&msg).unwrap();
        for i in [2u32, 0, 1] {
            let mut p = text_part(&msg, i, &format!("p{i}"));
            store.create_part(&mut p).unwrap();
        }
        let parts = store.parts_by_message(&msg.id).unwrap();
        let indices: Vec<u32> = parts.iter().map(|p| p.order_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(store.next_order_index(&msg.id).unwrap(), 3);
    }

    #[test]
    fn update_part_enforces_tool_state_machine() {
        let (store, session) = store_with_session();
        let msg = Message::new(&session.id, Role::Assistant);
        store.create_message(&msg).unwrap();
        let mut part = MessagePart::new(
            &msg.id,
            &session.id,
            0,
            PartPayload::Tool(ToolPart::pending("call-1", "bash", "bash", "{}")),
        );
        store.create_part(&mut part).unwrap();

        // Pending -> Running is fine.
        if let PartPayload::Tool(t) = &mut part.payload {
            t.status = ToolStatus::Running;
        }
        store.update_part(&part).unwrap();

        // Running -> Completed is fine.
        if let PartPayload::Tool(t) = &mut part.payload {
            t.status = ToolStatus::Completed;
            t.output = Some("done".into());
        }
        store.update_part(&part).unwrap();

        // Completed -> Running is rejected.
        if let PartPayload::Tool(t) = &mut part.payload {
            t.status = ToolStatus::Running;
        }
        assert!(matches!(
            store.update_part(&part),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn get_typed_rejects_wrong_variant() {
        let (store, session) = store_with_session();
        let msg = Message::new(&session.id, Role::Assistant);
        store.create_message(&msg).unwrap();
        let mut part = text_part(&msg, 0, "hello");
        store.create_part(&mut part).unwrap();

        let err = store.get_typed::<ToolPart>(&part.id).unwrap_err();
        assert!(matches!(err, StoreError::WrongPartType { expected: "tool", .. }));
    }

    #[test]
    fn tool_parts_by_status_finds_running_parts() {
        let (store, session) = store_with_session();
        let msg = Message::new(&session.id, Role::Assistant);
        store.create_message(&msg).unwrap();
        let mut running = ToolPart::pending("c1", "bash", "bash", "{}");
        running.status = ToolStatus::Running;
        let mut p1 = MessagePart::new(&msg.id, &session.id, 0, PartPayload::Tool(running));
        store.create_part(&mut p1).unwrap();
        let mut p2 = MessagePart::new(
            &msg.id,
            &session.id,
            1,
            PartPayload::Tool(ToolPart::pending("c2", "glob", "glob", "{}")),
        );
        store.create_part(&mut p2).unwrap();

        let running = store
            .tool_parts_by_status(&session.id, ToolStatus::Running)
            .unwrap();
        assert_eq!(running.len(), 1);
        let pending = store
            .tool_parts_by_status(&session.id, ToolStatus::Pending)
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[test]
    fn most_recent_compaction_returns_latest() {
        let (store, session) = store_with_session();
        let msg = Message::new(&session.id, Role::Assistant);
        store.create_message(&msg).unwrap();
        for (i, count) in [(0u32, 5u32), (1, 9)] {
            let mut p = MessagePart::new(
                &msg.id,
                &session.id,
                i,
                PartPayload::Compaction(CompactionPart {
                    summary: format!("summary {count}"),
                    compacted_message_count: count,
                    compacted_token_count: 100,
                    compacted_at: Utc::now(),
                }),
            );
            store.create_part(&mut p).unwrap();
        }
        let latest = store.most_recent_compaction(&session.id).unwrap().unwrap();
        match latest.payload {
            PartPayload::Compaction(c) => assert_eq!(c.compacted_message_count, 9),
            other => panic!("unexpected payload {other:?}"),
        }
        assert!(store.most_recent_compaction("nope").unwrap().is_none());
    }

    #[test]
    fn part_round_trips_up_to_updated_at() {
        let (store, session) = store_with_session();
        let msg = Message::new(&session.id, Role::Assistant);
        store.create_message(&msg).unwrap();
        let mut part = MessagePart::new(
            &msg.id,
            &session.id,
            0,
            PartPayload::Patch {
                file_path: "a.rs".into(),
                old_content: "x".into(),
                new_content: "y".into(),
                unified_diff: "-x\n+y".into(),
                additions: 1,
                deletions: 1,
            },
        );
        store.create_part(&mut part).unwrap();
        let loaded = store.get_part(&part.id).unwrap();
        assert_eq!(loaded.payload, part.payload);
        assert_eq!(loaded.order_index, part.order_index);
        assert_eq!(loaded.message_id, part.message_id);
    }

    // ── Messages ──────────────────────────────────────────────────────────────

    #[test]
    fn messages_list_in_insertion_order() {
        let (store, session) = store_with_session();
        let m1 = Message::new(&session.id, Role::User);
        let m2 = Message::new(&session.id, Role::Assistant);
        store.create_message(&m1).unwrap();
        store.create_message(&m2).unwrap();
        let all = store.list_messages(&session.id).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].id, m1.id);
        assert_eq!(all[1].id, m2.id);
        assert_eq!(store.latest_message_id(&session.id).unwrap(), Some(m2.id));
    }

    #[test]
    fn mark_compacted_flags_but_keeps_rows() {
        let (store, session) = store_with_session();
        let m1 = Message::new(&session.id, Role::User);
        store.create_message(&m1).unwrap();
        store.mark_messages_compacted(&[m1.id.clone()]).unwrap();
        let got = store.get_message(&m1.id).unwrap();
        assert!(got.is_compacted);
    }

    #[test]
    fn usage_persists_as_json() {
        let (store, session) = store_with_session();
        let mut m = Message::new(&session.id, Role::Assistant);
        m.usage = Some(TokenUsage {
            input: 10,
            output: 5,
            reasoning: 2,
            cache_read: 1,
            cache_write: 0,
        });
        store.create_message(&m).unwrap();
        let got = store.get_message(&m.id).unwrap();
        assert_eq!(got.usage, m.usage);
    }

    #[test]
    fn append_tool_exchange_is_atomic() {
        let (store, session) = store_with_session();
        let assistant = Message::new(&session.id, Role::Assistant);
        store.create_message(&assistant).unwrap();

        let mut tool_msg = Message::new(&session.id, Role::Tool);
        tool_msg.parent_message_id = Some(assistant.id.clone());
        let part = MessagePart::new(
            &tool_msg.id,
            &session.id,
            0,
            PartPayload::Text {
                content: "output".into(),
            },
        );
        store
            .append_tool_exchange(&[tool_msg.clone()], &[part])
            .unwrap();
        let got = store.get_message(&tool_msg.id).unwrap();
        assert_eq!(got.parent_message_id.as_deref(), Some(assistant.id.as_str()));
        assert_eq!(store.parts_by_message(&tool_msg.id).unwrap().len(), 1);

        // A duplicate message id fails the whole batch: nothing new lands.
        let mut dup = Message::new(&session.id, Role::Tool);
        dup.id = tool_msg.id.clone();
        let orphan = MessagePart::new(&dup.id, &session.id, 5, PartPayload::Text {
            content: "never".into(),
        });
        assert!(store.append_tool_exchange(&[dup], &[orphan]).is_err());
        assert_eq!(store.parts_by_message(&tool_msg.id).unwrap().len(), 1);
    }

    // ── Agents and sub-sessions ───────────────────────────────────────────────

    fn sample_agent(slug: &str) -> Agent {
        Agent {
            id: uuid::Uuid::new_v4().to_string(),
            slug: slug.into(),
            name: slug.into(),
            category: orchid_config::AgentCategory::Primary,
            provider_id: "mock".into(),
            model_id: "mock-model".into(),
            system_prompt: "You are helpful.".into(),
            prompt_variables: Default::default(),
            execution_mode: Default::default(),
            max_iterations: 10,
            timeout_secs: None,
            can_spawn_subagents: true,
            allowed_subagent_types: vec![],
            tools: Default::default(),
            permissions: vec![],
        }
    }

    #[test]
    fn agent_upsert_by_slug() {
        let store = Store::open_in_memory().unwrap();
        let mut agent = sample_agent("coder");
        store.upsert_agent(&agent).unwrap();
        agent.max_iterations = 25;
        store.upsert_agent(&agent).unwrap();
        let got = store.agent_by_slug("coder").unwrap();
        assert_eq!(got.max_iterations, 25);
        assert_eq!(store.list_agents().unwrap().len(), 1);
    }

    #[test]
    fn agent_slug_is_validated() {
        let store = Store::open_in_memory().unwrap();
        let agent = sample_agent("Not Valid");
        assert!(store.upsert_agent(&agent).is_err());
    }

    #[test]
    fn sub_session_status_transitions_are_checked() {
        let (store, session) = store_with_session();
        let sub = SubSession {
            id: "sub-1".into(),
            parent_session_id: session.id.clone(),
            parent_message_id: "m".into(),
            agent_type: "explore".into(),
            status: SubSessionStatus::Pending,
            prompt: "look around".into(),
            result: None,
            error: None,
            effective_permissions: vec![],
            created_at: Utc::now(),
            completed_at: None,
            duration_ms: None,
        };
        store.create_sub_session(&sub).unwrap();
        store
            .update_sub_session_status("sub-1", SubSessionStatus::Running, None, None)
            .unwrap();
        store
            .update_sub_session_status("sub-1", SubSessionStatus::Completed, Some("found"), None)
            .unwrap();
        let got = store.get_sub_session("sub-1").unwrap();
        assert_eq!(got.status, SubSessionStatus::Completed);
        assert_eq!(got.result.as_deref(), Some("found"));
        assert!(got.completed_at.is_some());
        assert!(got.duration_ms.is_some());

        // Terminal states absorb.
        assert!(store
            .update_sub_session_status("sub-1", SubSessionStatus::Running, None, None)
            .is_err());
    }

    // ── App state and event log ───────────────────────────────────────────────

    #[test]
    fn app_state_get_set() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.state_get("k").unwrap().is_none());
        store.state_set("k", "v1").unwrap();
        store.state_set("k", "v2").unwrap();
        assert_eq!(store.state_get("k").unwrap().as_deref(), Some("v2"));
    }

    #[test]
    fn event_log_round_trip() {
        let (store, session) = store_with_session();
        store
            .log_event(&EventRecord {
                id: "e1".into(),
                event_type: "tool-execution-started".into(),
                session_id: Some(session.id.clone()),
                payload: serde_json::json!({"tool_name": "bash"}),
                created_at: Utc::now(),
            })
            .unwrap();
        let events = store.events_for_session(&session.id).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, "tool-execution-started");
    }
}
