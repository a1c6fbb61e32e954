//! Escalation coordinator
//!
//! Turns a safety verdict into a durable escalation record, marks the session
//! escalated and produces the handoff text shown to the patient. Resolution
//! of escalations belongs to a human workflow outside this crate; only the
//! legal status moves are encoded here.

use crate::runtime::traits::{EscalationStore, SessionStore, StoreError, Storage};
use crate::runtime::{Channel, SessionId, SessionRecord, SessionStatus};
use crate::safety::{EscalationReason, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

// ============================================================================
// Records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStatus {
    #[default]
    Pending,
    InProgress,
    Resolved,
    Cancelled,
}

impl EscalationStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationStatus::Pending => "pending",
            EscalationStatus::InProgress => "in_progress",
            EscalationStatus::Resolved => "resolved",
            EscalationStatus::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(EscalationStatus::Pending),
            "in_progress" => Some(EscalationStatus::InProgress),
            "resolved" => Some(EscalationStatus::Resolved),
            "cancelled" => Some(EscalationStatus::Cancelled),
            _ => None,
        }
    }

    /// pending -> in_progress -> resolved | cancelled, or pending -> cancelled
    pub fn can_transition_to(self, to: EscalationStatus) -> bool {
        use EscalationStatus::{Cancelled, InProgress, Pending, Resolved};
        matches!(
            (self, to),
            (Pending, InProgress | Cancelled) | (InProgress, Resolved | Cancelled)
        )
    }

    pub fn is_open(self) -> bool {
        matches!(self, EscalationStatus::Pending | EscalationStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EscalationError {
    #[error("Escalation cannot move from {} to {}", from.as_str(), to.as_str())]
    InvalidStatus {
        from: EscalationStatus,
        to: EscalationStatus,
    },
}

/// Durable handoff artifact
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: Uuid,
    pub session_id: SessionId,
    pub patient_id: i64,
    pub reason: EscalationReason,
    pub severity: Severity,
    pub description: String,
    pub status: EscalationStatus,
    pub escalated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl EscalationRecord {
    pub fn pending(
        session: &SessionRecord,
        reason: EscalationReason,
        severity: Severity,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id: session.id,
            patient_id: session.patient_id,
            reason,
            severity,
            description: description.into(),
            status: EscalationStatus::Pending,
            escalated_at: Utc::now(),
            resolved_at: None,
        }
    }

    /// Move along the resolution lifecycle
    pub fn set_status(&mut self, to: EscalationStatus) -> Result<(), EscalationError> {
        if !self.status.can_transition_to(to) {
            return Err(EscalationError::InvalidStatus {
                from: self.status,
                to,
            });
        }
        self.status = to;
        if !to.is_open() {
            self.resolved_at = Some(Utc::now());
        }
        Ok(())
    }
}

// ============================================================================
// Handoff text
// ============================================================================

/// How patients reach emergency services
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmergencyContact {
    pub number: String,
    pub service: String,
}

impl Default for EmergencyContact {
    fn default() -> Self {
        Self {
            number: "193".to_string(),
            service: "Ghana Emergency Services".to_string(),
        }
    }
}

impl EmergencyContact {
    /// Channel-neutral text returned with every escalation
    pub fn handoff_message(&self) -> String {
        format!(
            "Thank you for telling me. I can't give medical advice, so I'm connecting you with a health worker who will contact you shortly. If this is an emergency, call {} ({}).",
            self.number, self.service
        )
    }

    /// Emergency reply phrased for the channel's turn-taking
    pub fn emergency_reply(&self, channel: Channel) -> String {
        match channel {
            Channel::Voice => "I understand this is an emergency. Please stay on the line while I connect you with emergency services.".to_string(),
            Channel::Sms => format!(
                "EMERGENCY: Please contact emergency services at {} ({}) immediately.",
                self.number, self.service
            ),
            Channel::Chat => format!(
                "I understand this is an emergency. Please contact emergency services immediately. For medical emergencies, call {} ({}).",
                self.number, self.service
            ),
        }
    }

    /// Reply for an escalating turn
    pub fn reply_for(&self, channel: Channel, reason: EscalationReason) -> String {
        if reason == EscalationReason::Emergency {
            self.emergency_reply(channel)
        } else {
            self.handoff_message()
        }
    }
}

// ============================================================================
// Notification
// ============================================================================

/// Alerts the humans who pick up escalations
#[async_trait]
pub trait EscalationNotifier: Send + Sync {
    async fn notify(&self, record: &EscalationRecord, session: &SessionRecord) -> Result<(), String>;
}

/// Notifier that only writes a warning to the log
pub struct LogNotifier;

#[async_trait]
impl EscalationNotifier for LogNotifier {
    async fn notify(&self, record: &EscalationRecord, session: &SessionRecord) -> Result<(), String> {
        tracing::warn!(
            escalation_id = %record.id,
            session_id = %session.id,
            patient_id = session.patient_id,
            channel = %session.channel,
            reason = %record.reason,
            severity = %record.severity,
            "Escalation awaiting human follow-up"
        );
        Ok(())
    }
}

// ============================================================================
// Coordinator
// ============================================================================

pub struct EscalationCoordinator {
    store: Arc<dyn Storage>,
    notifier: Arc<dyn EscalationNotifier>,
    contact: EmergencyContact,
}

impl EscalationCoordinator {
    pub fn new(
        store: Arc<dyn Storage>,
        notifier: Arc<dyn EscalationNotifier>,
        contact: EmergencyContact,
    ) -> Self {
        Self {
            store,
            notifier,
            contact,
        }
    }

    pub fn contact(&self) -> &EmergencyContact {
        &self.contact
    }

    /// Persist a pending record, then mark the session escalated.
    ///
    /// The session only becomes `escalated` once its record is durable, so a
    /// failed write leaves the session eligible for escalation on retry.
    /// Humans are not alerted here; call [`Self::notify`] once the session
    /// lock is released.
    pub async fn escalate(
        &self,
        session: &mut SessionRecord,
        reason: EscalationReason,
        severity: Severity,
        details: &str,
    ) -> Result<EscalationRecord, StoreError> {
        let record = EscalationRecord::pending(session, reason, severity, details);

        tracing::warn!(
            session_id = %session.id,
            escalation_id = %record.id,
            reason = %reason,
            severity = %severity,
            "Escalating session"
        );

        self.store.persist_escalation(&record).await?;
        session.status = SessionStatus::Escalated;
        self.store.persist_session(session).await?;
        Ok(record)
    }

    /// Alert the humans behind the notifier; failures are logged, not returned
    pub async fn notify(&self, record: &EscalationRecord, session: &SessionRecord) {
        if let Err(e) = self.notifier.notify(record, session).await {
            tracing::error!(escalation_id = %record.id, error = %e, "Escalation notification failed");
        }
    }
}
