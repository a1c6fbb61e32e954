//! Database module
//!
//! SQLite persistence for sessions, turns, escalations, audit events, lessons
//! and consent changes.

mod schema;

pub use schema::*;

use crate::escalation::{EscalationRecord, EscalationStatus};
use crate::runtime::traits::StoreError;
use crate::runtime::{AuditEvent, Channel, SessionId, SessionRecord, SessionStatus, Turn, TurnRole};
use crate::safety::{EscalationReason, Severity};
use crate::state_machine::ConversationState;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Session not found: {0}")]
    SessionNotFound(String),
    #[error("Corrupt row: {0}")]
    Corrupt(String),
    #[error("Database lock poisoned")]
    Poisoned,
}

pub type DbResult<T> = Result<T, DbError>;

impl From<DbError> for StoreError {
    fn from(e: DbError) -> Self {
        match e {
            DbError::Poisoned => StoreError::Unavailable(e.to_string()),
            _ => StoreError::Backend(e.to_string()),
        }
    }
}

/// Thread-safe database handle
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Open or create database at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> DbResult<Self> {
        let conn = Connection::open(path)?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DbResult<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    fn conn(&self) -> DbResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    fn run_migrations(&self) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    // ==================== Session Operations ====================

    /// Insert or update a session row
    pub fn upsert_session(&self, session: &SessionRecord) -> DbResult<()> {
        let conn = self.conn()?;
        let context = serde_json::to_string(&session.context)?;
        conn.execute(
            "INSERT INTO sessions (id, patient_id, channel, language, lesson_id, status, state, context, started_at, ended_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                lesson_id = excluded.lesson_id,
                status = excluded.status,
                state = excluded.state,
                context = excluded.context,
                ended_at = excluded.ended_at,
                updated_at = excluded.updated_at",
            params![
                session.id.to_string(),
                session.patient_id,
                session.channel.as_str(),
                session.language,
                session.lesson_id,
                session.status.as_str(),
                session.state.as_str(),
                context,
                session.started_at.to_rfc3339(),
                session.ended_at.map(|t| t.to_rfc3339()),
                Utc::now().to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Get session by ID
    pub fn get_session(&self, id: SessionId) -> DbResult<SessionRecord> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, patient_id, channel, language, lesson_id, status, state, context, started_at, ended_at
             FROM sessions WHERE id = ?1",
        )?;
        let row = stmt
            .query_row(params![id.to_string()], |row| {
                Ok((
                    row.get::<_, i64>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<i64>>(4)?,
                    row.get::<_, String>(5)?,
                    row.get::<_, String>(6)?,
                    row.get::<_, String>(7)?,
                    row.get::<_, String>(8)?,
                    row.get::<_, Option<String>>(9)?,
                ))
            })
            .optional()?
            .ok_or_else(|| DbError::SessionNotFound(id.to_string()))?;

        let (patient_id, channel, language, lesson_id, status, state, context, started, ended) = row;
        Ok(SessionRecord {
            id,
            patient_id,
            channel: Channel::parse(&channel)
                .ok_or_else(|| DbError::Corrupt(format!("channel {channel}")))?,
            language,
            lesson_id,
            status: SessionStatus::parse(&status)
                .ok_or_else(|| DbError::Corrupt(format!("status {status}")))?,
            state: ConversationState::parse(&state)
                .ok_or_else(|| DbError::Corrupt(format!("state {state}")))?,
            context: serde_json::from_str(&context)?,
            started_at: parse_datetime(&started),
            ended_at: ended.as_deref().map(parse_datetime),
        })
    }

    // ==================== Turn Operations ====================

    /// Append a turn; a duplicate turn number is rejected by the unique index
    pub fn insert_turn(&self, turn: &Turn) -> DbResult<()> {
        let conn = self.conn()?;
        let metadata = if turn.metadata.is_null() {
            None
        } else {
            Some(serde_json::to_string(&turn.metadata)?)
        };
        conn.execute(
            "INSERT INTO turns (session_id, turn_number, role, user_input, assistant_response, audio_ref, tts_audio_ref, latency_ms, safety_violation, state, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                turn.session_id.to_string(),
                turn.turn_number,
                turn.role.as_str(),
                turn.user_input,
                turn.assistant_response,
                turn.audio_ref,
                turn.tts_audio_ref,
                turn.latency_ms.and_then(|ms| i64::try_from(ms).ok()),
                turn.safety_violation,
                turn.state.as_str(),
                metadata,
                turn.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Turns of a session ordered by turn number
    pub fn get_turns(&self, session_id: SessionId) -> DbResult<Vec<Turn>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT turn_number, role, user_input, assistant_response, audio_ref, tts_audio_ref, latency_ms, safety_violation, state, metadata, created_at
             FROM turns WHERE session_id = ?1 ORDER BY turn_number",
        )?;
        let rows = stmt.query_map(params![session_id.to_string()], |row| {
            Ok(RawTurn {
                turn_number: row.get(0)?,
                role: row.get(1)?,
                user_input: row.get(2)?,
                assistant_response: row.get(3)?,
                audio_ref: row.get(4)?,
                tts_audio_ref: row.get(5)?,
                latency_ms: row.get(6)?,
                safety_violation: row.get(7)?,
                state: row.get(8)?,
                metadata: row.get(9)?,
                created_at: row.get(10)?,
            })
        })?;

        let mut turns = Vec::new();
        for raw in rows {
            turns.push(raw?.into_turn(session_id)?);
        }
        Ok(turns)
    }

    // ==================== Escalation Operations ====================

    pub fn upsert_escalation(&self, record: &EscalationRecord) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO escalations (id, session_id, patient_id, reason, severity, description, status, escalated_at, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                resolved_at = excluded.resolved_at",
            params![
                record.id.to_string(),
                record.session_id.to_string(),
                record.patient_id,
                record.reason.as_str(),
                record.severity.as_str(),
                record.description,
                record.status.as_str(),
                record.escalated_at.to_rfc3339(),
                record.resolved_at.map(|t| t.to_rfc3339()),
            ],
        )?;
        Ok(())
    }

    /// Escalations still waiting on a human, oldest first
    pub fn list_open_escalations(&self) -> DbResult<Vec<EscalationRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, session_id, patient_id, reason, severity, description, status, escalated_at, resolved_at
             FROM escalations WHERE status IN ('pending', 'in_progress') ORDER BY escalated_at",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, Option<String>>(8)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, session_id, patient_id, reason, severity, description, status, at, resolved) =
                row?;
            records.push(EscalationRecord {
                id: uuid::Uuid::parse_str(&id).map_err(|e| DbError::Corrupt(e.to_string()))?,
                session_id: SessionId::parse(&session_id)
                    .ok_or_else(|| DbError::Corrupt(format!("session id {session_id}")))?,
                patient_id,
                reason: EscalationReason::parse(&reason)
                    .ok_or_else(|| DbError::Corrupt(format!("reason {reason}")))?,
                severity: Severity::parse(&severity)
                    .ok_or_else(|| DbError::Corrupt(format!("severity {severity}")))?,
                description,
                status: EscalationStatus::parse(&status)
                    .ok_or_else(|| DbError::Corrupt(format!("status {status}")))?,
                escalated_at: parse_datetime(&at),
                resolved_at: resolved.as_deref().map(parse_datetime),
            });
        }
        Ok(records)
    }

    // ==================== Audit Operations ====================

    pub fn insert_audit_event(&self, event: &AuditEvent) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO audit_events (action, entity_type, entity_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.action,
                event.entity_type,
                event.entity_id,
                serde_json::to_string(&event.details)?,
                event.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Audit actions recorded against one entity, oldest first
    pub fn audit_actions(&self, entity_type: &str, entity_id: &str) -> DbResult<Vec<String>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT action FROM audit_events WHERE entity_type = ?1 AND entity_id = ?2 ORDER BY id",
        )?;
        let actions = stmt
            .query_map(params![entity_type, entity_id], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(actions)
    }

    // ==================== Lesson Operations ====================

    /// Create a lesson with base content
    pub fn create_lesson(&self, title: &str, content: &str, is_active: bool) -> DbResult<i64> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO lessons (title, content, is_active, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![title, content, is_active, Utc::now().to_rfc3339()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_lesson(&self, lesson_id: i64) -> DbResult<Option<Lesson>> {
        let conn = self.conn()?;
        let lesson = conn
            .query_row(
                "SELECT id, title, content, is_active, created_at FROM lessons WHERE id = ?1",
                params![lesson_id],
                |row| {
                    Ok(Lesson {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        content: row.get(2)?,
                        is_active: row.get(3)?,
                        created_at: parse_datetime(&row.get::<_, String>(4)?),
                    })
                },
            )
            .optional()?;
        Ok(lesson)
    }

    /// Add the next version of a lesson; returns its version number
    pub fn add_lesson_version(
        &self,
        lesson_id: i64,
        content: &str,
        status: LessonVersionStatus,
    ) -> DbResult<i64> {
        let conn = self.conn()?;
        let next: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version_number), 0) + 1 FROM lesson_versions WHERE lesson_id = ?1",
            params![lesson_id],
            |row| row.get(0),
        )?;
        conn.execute(
            "INSERT INTO lesson_versions (lesson_id, version_number, content, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![lesson_id, next, content, status.as_str(), Utc::now().to_rfc3339()],
        )?;
        Ok(next)
    }

    pub fn set_lesson_version_status(
        &self,
        lesson_id: i64,
        version_number: i64,
        status: LessonVersionStatus,
    ) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "UPDATE lesson_versions SET status = ?1 WHERE lesson_id = ?2 AND version_number = ?3",
            params![status.as_str(), lesson_id, version_number],
        )?;
        Ok(())
    }

    /// Content of the highest approved version
    pub fn latest_approved_content(&self, lesson_id: i64) -> DbResult<Option<String>> {
        let conn = self.conn()?;
        let content = conn
            .query_row(
                "SELECT content FROM lesson_versions
                 WHERE lesson_id = ?1 AND status = 'approved'
                 ORDER BY version_number DESC LIMIT 1",
                params![lesson_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(content)
    }

    // ==================== Consent Operations ====================

    pub fn insert_consent_event(
        &self,
        patient_id: i64,
        channel: Channel,
        granted: bool,
    ) -> DbResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO consent_events (patient_id, channel, granted, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![patient_id, channel.as_str(), granted, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Most recent consent decision for a patient
    pub fn latest_consent(&self, patient_id: i64) -> DbResult<Option<bool>> {
        let conn = self.conn()?;
        let granted = conn
            .query_row(
                "SELECT granted FROM consent_events WHERE patient_id = ?1 ORDER BY id DESC LIMIT 1",
                params![patient_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(granted)
    }
}

struct RawTurn {
    turn_number: u32,
    role: String,
    user_input: Option<String>,
    assistant_response: Option<String>,
    audio_ref: Option<String>,
    tts_audio_ref: Option<String>,
    latency_ms: Option<i64>,
    safety_violation: bool,
    state: String,
    metadata: Option<String>,
    created_at: String,
}

impl RawTurn {
    fn into_turn(self, session_id: SessionId) -> DbResult<Turn> {
        Ok(Turn {
            session_id,
            turn_number: self.turn_number,
            role: TurnRole::parse(&self.role)
                .ok_or_else(|| DbError::Corrupt(format!("role {}", self.role)))?,
            user_input: self.user_input,
            assistant_response: self.assistant_response,
            audio_ref: self.audio_ref,
            tts_audio_ref: self.tts_audio_ref,
            latency_ms: self.latency_ms.and_then(|ms| u64::try_from(ms).ok()),
            safety_violation: self.safety_violation,
            state: ConversationState::parse(&self.state)
                .ok_or_else(|| DbError::Corrupt(format!("state {}", self.state)))?,
            metadata: match self.metadata {
                Some(json) => serde_json::from_str(&json)?,
                None => serde_json::Value::Null,
            },
            created_at: parse_datetime(&self.created_at),
        })
    }
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).map_or_else(|_| Utc::now(), |dt| dt.with_timezone(&Utc))
}
