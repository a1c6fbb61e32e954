//! Session, turn and audit records owned by the runtime

use crate::state_machine::{ConversationContext, ConversationFsm, ConversationState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::Instant;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Delivery medium of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    #[serde(rename = "ivr")]
    Voice,
    #[serde(rename = "sms")]
    Sms,
    #[serde(rename = "whatsapp")]
    Chat,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Voice => "ivr",
            Channel::Sms => "sms",
            Channel::Chat => "whatsapp",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ivr" | "voice" => Some(Channel::Voice),
            "sms" => Some(Channel::Sms),
            "whatsapp" | "chat" => Some(Channel::Chat),
            _ => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Active,
    Completed,
    Abandoned,
    Escalated,
    OptedOut,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::Completed => "completed",
            SessionStatus::Abandoned => "abandoned",
            SessionStatus::Escalated => "escalated",
            SessionStatus::OptedOut => "opted_out",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(SessionStatus::Active),
            "completed" => Some(SessionStatus::Completed),
            "abandoned" => Some(SessionStatus::Abandoned),
            "escalated" => Some(SessionStatus::Escalated),
            "opted_out" => Some(SessionStatus::OptedOut),
            _ => None,
        }
    }
}

// ============================================================================
// Turns
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    Assistant,
    System,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            TurnRole::User => "user",
            TurnRole::Assistant => "assistant",
            TurnRole::System => "system",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(TurnRole::User),
            "assistant" => Some(TurnRole::Assistant),
            "system" => Some(TurnRole::System),
            _ => None,
        }
    }
}

/// One inbound/outbound exchange, numbered from 1 within its session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub session_id: SessionId,
    pub turn_number: u32,
    pub role: TurnRole,
    pub user_input: Option<String>,
    pub assistant_response: Option<String>,
    /// Inbound recording (voice)
    pub audio_ref: Option<String>,
    /// Synthesized reply (voice)
    pub tts_audio_ref: Option<String>,
    pub latency_ms: Option<u64>,
    pub safety_violation: bool,
    /// State after the turn committed
    pub state: ConversationState,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(
        session_id: SessionId,
        turn_number: u32,
        role: TurnRole,
        state: ConversationState,
    ) -> Self {
        Self {
            session_id,
            turn_number,
            role,
            user_input: None,
            assistant_response: None,
            audio_ref: None,
            tts_audio_ref: None,
            latency_ms: None,
            safety_violation: false,
            state,
            metadata: Value::Null,
            created_at: Utc::now(),
        }
    }
}

/// Audit log entry for safety events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditEvent {
    pub fn safety_violation(session_id: SessionId, event_type: &str, details: Value) -> Self {
        Self {
            action: format!("safety_violation_{event_type}"),
            entity_type: "conversation_session".to_string(),
            entity_id: session_id.to_string(),
            details,
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Sessions
// ============================================================================

/// Durable view of a session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: SessionId,
    pub patient_id: i64,
    pub channel: Channel,
    pub language: String,
    pub lesson_id: Option<i64>,
    pub status: SessionStatus,
    pub state: ConversationState,
    pub context: ConversationContext,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl SessionRecord {
    pub fn new(patient_id: i64, channel: Channel, language: impl Into<String>) -> Self {
        Self {
            id: SessionId::new(),
            patient_id,
            channel,
            language: language.into(),
            lesson_id: None,
            status: SessionStatus::Active,
            state: ConversationState::SessionStart,
            context: ConversationContext::default(),
            started_at: Utc::now(),
            ended_at: None,
        }
    }
}

/// Mutable per-session state guarded by the session lock
#[derive(Debug)]
pub struct SessionState {
    pub record: SessionRecord,
    pub fsm: ConversationFsm,
    pub turns: Vec<Turn>,
    /// Bumped on every commit; an external call started at another version is stale
    pub version: u64,
    pub terminated: bool,
    pub last_activity: Instant,
}

impl SessionState {
    pub fn new(record: SessionRecord) -> Self {
        let fsm = ConversationFsm::with_context(record.state, record.context.clone());
        Self {
            record,
            fsm,
            turns: Vec::new(),
            version: 0,
            terminated: false,
            last_activity: Instant::now(),
        }
    }

    pub fn next_turn_number(&self) -> u32 {
        self.turns.last().map_or(1, |t| t.turn_number + 1)
    }

    /// Start a turn record numbered after the last one
    pub fn begin_turn(&self, role: TurnRole) -> Turn {
        Turn::new(
            self.record.id,
            self.next_turn_number(),
            role,
            self.fsm.current_state(),
        )
    }

    /// Copy FSM state into the record and bump the version
    pub fn commit(&mut self) {
        self.record.state = self.fsm.current_state();
        self.record.context = self.fsm.context().clone();
        self.version += 1;
        self.last_activity = Instant::now();
    }

    pub fn push_turn(&mut self, mut turn: Turn) -> Turn {
        turn.turn_number = self.next_turn_number();
        turn.state = self.fsm.current_state();
        self.turns.push(turn.clone());
        turn
    }
}

/// Registry entry for one live session
#[derive(Debug)]
pub struct SessionSlot {
    pub id: SessionId,
    pub channel: Channel,
    pub state: Mutex<SessionState>,
    pub cancel: CancellationToken,
}

impl SessionSlot {
    pub fn new(record: SessionRecord) -> Self {
        Self {
            id: record.id,
            channel: record.channel,
            state: Mutex::new(SessionState::new(record)),
            cancel: CancellationToken::new(),
        }
    }
}
