//! Session runtime
//!
//! Owns the registry of live sessions and exposes the core's surface to
//! collaborators (HTTP layer, scheduler trigger): `start_session`,
//! `handle_turn`, `end_session`. Each session is guarded by its own lock;
//! different sessions never contend.

pub mod session;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use session::{
    AuditEvent, Channel, SessionId, SessionRecord, SessionSlot, SessionState, SessionStatus, Turn,
    TurnRole,
};
pub use traits::{DatabaseStorage, SoftCapabilities, StoreError, Storage};

use crate::channels::{
    ChannelOrchestrator, ChatOrchestrator, InboundPayload, SmsOrchestrator, TurnOutcome,
    VoiceOrchestrator,
};
use crate::config::Config;
use crate::engine::ConversationEngine;
use crate::runtime::traits::SessionStore;
use crate::state_machine::{ConversationContext, TransitionError};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error("Session {0} has ended")]
    Terminated(SessionId),
    #[error("Session {0} changed while the turn was in flight")]
    Conflict(SessionId),
    #[error(transparent)]
    Transition(#[from] TransitionError),
    #[error("Persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error("Lesson {0} is missing or inactive")]
    LessonUnavailable(i64),
    #[error("Payload not supported on channel {0}")]
    UnsupportedPayload(Channel),
}

/// Opaque handle returned by `start_session`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: SessionId,
    pub channel: Channel,
}

/// Options for starting a session
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub patient_id: i64,
    pub channel: Channel,
    pub language: Option<String>,
    pub lesson_id: Option<i64>,
}

impl StartOptions {
    pub fn new(patient_id: i64, channel: Channel) -> Self {
        Self {
            patient_id,
            channel,
            language: None,
            lesson_id: None,
        }
    }
}

/// Manager for all live sessions
pub struct SessionManager {
    engine: Arc<ConversationEngine>,
    voice: VoiceOrchestrator,
    sms: SmsOrchestrator,
    chat: ChatOrchestrator,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    default_language: String,
    idle_timeout: Duration,
}

impl SessionManager {
    pub fn new(engine: Arc<ConversationEngine>, config: &Config) -> Self {
        Self {
            voice: VoiceOrchestrator::new(engine.clone()),
            sms: SmsOrchestrator::new(
                engine.clone(),
                config.sms_char_budget,
                config.opt_out_precedes_safety,
            ),
            chat: ChatOrchestrator::new(engine.clone(), config.opt_out_precedes_safety),
            engine,
            sessions: RwLock::new(HashMap::new()),
            default_language: config.default_language.clone(),
            idle_timeout: config.session_idle_timeout,
        }
    }

    fn orchestrator(&self, channel: Channel) -> &dyn ChannelOrchestrator {
        match channel {
            Channel::Voice => &self.voice,
            Channel::Sms => &self.sms,
            Channel::Chat => &self.chat,
        }
    }

    async fn slot(&self, id: SessionId) -> Result<Arc<SessionSlot>, SessionError> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(SessionError::NotFound(id))
    }

    pub async fn start_session(
        &self,
        patient_id: i64,
        channel: Channel,
    ) -> Result<SessionHandle, SessionError> {
        self.start_session_with(StartOptions::new(patient_id, channel))
            .await
    }

    pub async fn start_session_with(
        &self,
        options: StartOptions,
    ) -> Result<SessionHandle, SessionError> {
        let language = options
            .language
            .unwrap_or_else(|| self.default_language.clone());
        let mut record = SessionRecord::new(options.patient_id, options.channel, language);
        record.lesson_id = options.lesson_id;
        record.context = ConversationContext::with_lesson(options.lesson_id);

        self.engine.store().persist_session(&record).await?;

        let handle = SessionHandle {
            id: record.id,
            channel: record.channel,
        };
        tracing::info!(
            session_id = %handle.id,
            patient_id = record.patient_id,
            channel = %handle.channel,
            "Session started"
        );
        self.sessions
            .write()
            .await
            .insert(handle.id, Arc::new(SessionSlot::new(record)));
        Ok(handle)
    }

    /// Process one inbound payload.
    ///
    /// A transition error closes the session along legal edges before the
    /// error is returned.
    pub async fn handle_turn(
        &self,
        handle: &SessionHandle,
        payload: InboundPayload,
    ) -> Result<TurnOutcome, SessionError> {
        let slot = self.slot(handle.id).await?;
        let result = self
            .orchestrator(slot.channel)
            .process(&slot, payload)
            .await;

        match &result {
            Ok(outcome) if outcome.state.is_terminal() => {
                self.sessions.write().await.remove(&handle.id);
                tracing::info!(session_id = %handle.id, "Session reached end state");
            }
            Err(SessionError::Transition(e)) => {
                tracing::error!(session_id = %handle.id, error = %e, "Unrecoverable turn failure, closing session");
                self.close(&slot, SessionStatus::Abandoned).await;
                self.sessions.write().await.remove(&handle.id);
            }
            Err(SessionError::Terminated(_)) => {
                self.sessions.write().await.remove(&handle.id);
            }
            _ => {}
        }
        result
    }

    /// SMS-only: push a lesson snippet into the session
    pub async fn send_lesson_snippet(
        &self,
        handle: &SessionHandle,
        lesson_id: i64,
    ) -> Result<TurnOutcome, SessionError> {
        if handle.channel != Channel::Sms {
            return Err(SessionError::UnsupportedPayload(handle.channel));
        }
        let slot = self.slot(handle.id).await?;
        self.sms.send_lesson_snippet(&slot, lesson_id).await
    }

    /// End a session; in-flight external results are discarded
    pub async fn end_session(&self, handle: &SessionHandle) -> Result<(), SessionError> {
        let slot = self
            .sessions
            .write()
            .await
            .remove(&handle.id)
            .ok_or(SessionError::NotFound(handle.id))?;
        self.engine
            .close_session(&slot, SessionStatus::Completed)
            .await?;
        Ok(())
    }

    /// End sessions idle longer than the configured timeout; returns how many
    pub async fn reap_idle(&self) -> usize {
        let slots: Vec<Arc<SessionSlot>> = self.sessions.read().await.values().cloned().collect();
        let mut reaped = 0;
        for slot in slots {
            let idle = match slot.state.try_lock() {
                Ok(session) => session.last_activity.elapsed() >= self.idle_timeout,
                // A turn is committing right now
                Err(_) => false,
            };
            if idle {
                self.sessions.write().await.remove(&slot.id);
                tracing::info!(session_id = %slot.id, "Reaping idle session");
                self.close(&slot, SessionStatus::Abandoned).await;
                reaped += 1;
            }
        }
        reaped
    }

    pub async fn active_sessions(&self) -> usize {
        self.sessions.read().await.len()
    }

    async fn close(&self, slot: &SessionSlot, status: SessionStatus) {
        if let Err(e) = self.engine.close_session(slot, status).await {
            tracing::error!(session_id = %slot.id, error = %e, "Failed to close session");
        }
    }
}
