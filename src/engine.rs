//! Channel-agnostic turn processing
//!
//! One turn runs in three phases around the per-session lock:
//!
//! 1. lock, snapshot state/context/history/version, unlock
//! 2. screen input, call generation (and synthesis) with the lock released
//! 3. lock, check the session was not ended or advanced meanwhile, validate
//!    and commit the transition, append the turn
//!
//! Escalating input skips generation. The emergency transition and the
//! escalation record are committed immediately in their own lock phase so
//! they are never dropped, even when the session ends while the reply is
//! being synthesized. Notifying humans happens after that lock is released.

use crate::escalation::EscalationCoordinator;
use crate::llm::GenerationRequest;
use crate::runtime::traits::{AuditStore, SessionStore, SoftCapabilities, Storage, TurnStore};
use crate::runtime::{
    AuditEvent, SessionError, SessionSlot, SessionState, SessionStatus, Turn, TurnRole,
};
use crate::safety::{EscalationReason, OutputValidation, SafetyGate, SafetyVerdict, Severity};
use crate::state_machine::{
    context_update_for, is_valid_transition, next_state, ContextUpdate, ConversationContext,
    ConversationState,
};
use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Reply used instead of generation for diagnosis/advice requests and unsafe output
pub const SAFE_REDIRECT_REPLY: &str = "I'm not able to diagnose conditions or give medical advice. Please speak with your nurse, midwife or doctor about this. I can keep sharing general health education if you'd like.";

/// One inbound message as seen by the engine
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub text: String,
    /// Inbound recording the text was transcribed from
    pub audio_ref: Option<String>,
    /// Drive the FSM from the reply; `false` keeps the current state
    pub guided: bool,
    /// Synthesize the reply before committing
    pub speak: bool,
    pub started: Instant,
}

impl TurnRequest {
    pub fn guided(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            audio_ref: None,
            guided: true,
            speak: false,
            started: Instant::now(),
        }
    }

    pub fn stateless(text: impl Into<String>) -> Self {
        Self {
            guided: false,
            ..Self::guided(text)
        }
    }
}

/// Committed result of one turn
#[derive(Debug, Clone)]
pub struct EngineReply {
    pub response: String,
    pub state: ConversationState,
    pub escalated: bool,
    pub turn: Turn,
}

/// A turn recorded without screening or generation (opt-out, acknowledgment, lesson push)
#[derive(Debug, Clone)]
pub struct Exchange {
    pub role: TurnRole,
    pub user_input: Option<String>,
    pub response: String,
    pub update: Option<ContextUpdate>,
    pub status: Option<SessionStatus>,
    /// Drive the session to `EndSession` and terminate it
    pub close: bool,
    pub metadata: serde_json::Value,
}

impl Exchange {
    pub fn reply(user_input: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            role: TurnRole::User,
            user_input: Some(user_input.into()),
            response: response.into(),
            update: None,
            status: None,
            close: false,
            metadata: serde_json::Value::Null,
        }
    }
}

struct Snapshot {
    state: ConversationState,
    context: ConversationContext,
    history: Vec<Turn>,
    version: u64,
    language: String,
}

/// Reply decided outside the lock, waiting to be committed
struct Draft {
    response: String,
    target: Option<ConversationState>,
    safety_violation: bool,
    tokens_used: Option<u32>,
    audits: Vec<AuditEvent>,
    metadata: serde_json::Value,
}

pub struct ConversationEngine {
    gate: SafetyGate,
    capabilities: SoftCapabilities,
    store: Arc<dyn Storage>,
    escalation: EscalationCoordinator,
}

impl ConversationEngine {
    pub fn new(
        gate: SafetyGate,
        capabilities: SoftCapabilities,
        store: Arc<dyn Storage>,
        escalation: EscalationCoordinator,
    ) -> Self {
        Self {
            gate,
            capabilities,
            store,
            escalation,
        }
    }

    pub fn gate(&self) -> &SafetyGate {
        &self.gate
    }

    pub fn capabilities(&self) -> &SoftCapabilities {
        &self.capabilities
    }

    pub fn store(&self) -> &Arc<dyn Storage> {
        &self.store
    }

    pub fn escalation(&self) -> &EscalationCoordinator {
        &self.escalation
    }

    /// Screen, generate, transition and log one inbound message
    pub async fn run_turn(
        &self,
        slot: &SessionSlot,
        request: TurnRequest,
    ) -> Result<EngineReply, SessionError> {
        let snapshot = Self::snapshot(slot).await?;

        let verdict = self.gate.check_input(&request.text);
        if verdict.should_escalate {
            return self.run_escalating_turn(slot, &request, verdict).await;
        }

        let draft = if verdict.is_flagged() {
            Self::redirect_draft(&snapshot, &request, verdict)
        } else {
            self.generate_draft(slot, &snapshot, &request).await?
        };

        let tts_audio_ref = if request.speak {
            Some(self.speak(slot, &draft.response, &snapshot.language).await?)
        } else {
            None
        };

        self.commit(slot, &snapshot, &request, draft, tts_audio_ref).await
    }

    /// Record a turn that bypasses screening and generation
    pub async fn record_exchange(
        &self,
        slot: &SessionSlot,
        exchange: Exchange,
    ) -> Result<EngineReply, SessionError> {
        let mut session = slot.state.lock().await;
        if session.terminated {
            return Err(SessionError::Terminated(slot.id));
        }

        if let Some(update) = exchange.update {
            if let Some(lesson_id) = update.lesson_id {
                session.record.lesson_id = Some(lesson_id);
            }
            session.fsm.update_context(update);
        }
        if let Some(status) = exchange.status {
            session.record.status = status;
        }
        if exchange.close {
            session.fsm.close()?;
        }

        let mut turn = session.begin_turn(exchange.role);
        turn.user_input = exchange.user_input;
        turn.assistant_response = Some(exchange.response.clone());
        turn.metadata = exchange.metadata;
        session.commit();
        if exchange.close {
            Self::terminate(&mut session, slot);
        }
        let turn = session.push_turn(turn);

        self.store.persist_turn(&turn).await?;
        self.store.persist_session(&session.record).await?;

        Ok(EngineReply {
            response: exchange.response,
            state: session.fsm.current_state(),
            escalated: false,
            turn,
        })
    }

    // ========================================================================
    // Phases
    // ========================================================================

    async fn snapshot(slot: &SessionSlot) -> Result<Snapshot, SessionError> {
        let session = slot.state.lock().await;
        if session.terminated {
            return Err(SessionError::Terminated(slot.id));
        }
        Ok(Snapshot {
            state: session.fsm.current_state(),
            context: session.fsm.context().clone(),
            history: session.turns.clone(),
            version: session.version,
            language: session.record.language.clone(),
        })
    }

    fn redirect_draft(
        snapshot: &Snapshot,
        request: &TurnRequest,
        verdict: SafetyVerdict,
    ) -> Draft {
        tracing::info!(reason = %verdict.reason, state = %snapshot.state, "Redirecting request");
        Draft {
            response: SAFE_REDIRECT_REPLY.to_string(),
            target: redirect_target(snapshot.state, request.guided),
            safety_violation: false,
            tokens_used: None,
            audits: Vec::new(),
            metadata: json!({ "redirect": verdict.reason.as_str() }),
        }
    }

    async fn generate_draft(
        &self,
        slot: &SessionSlot,
        snapshot: &Snapshot,
        request: &TurnRequest,
    ) -> Result<Draft, SessionError> {
        let generation_request = GenerationRequest {
            user_input: request.text.clone(),
            state: request.guided.then_some(snapshot.state),
            context: snapshot.context.clone(),
            history: snapshot.history.clone(),
            language: snapshot.language.clone(),
        };

        let generation = tokio::select! {
            () = slot.cancel.cancelled() => {
                tracing::info!(session_id = %slot.id, "Session ended during generation, discarding reply");
                return Err(SessionError::Terminated(slot.id));
            }
            generation = self.capabilities.generate(&generation_request) => generation,
        };

        let validation = self.gate.validate_output(&generation.text);
        if validation.is_valid {
            let target = if request.guided {
                next_state(snapshot.state, &request.text, &generation.text)
            } else {
                None
            };
            return Ok(Draft {
                response: generation.text,
                target,
                safety_violation: false,
                tokens_used: generation.tokens_used,
                audits: Vec::new(),
                metadata: serde_json::Value::Null,
            });
        }

        tracing::warn!(
            session_id = %slot.id,
            violations = ?validation.violations.iter().map(|v| v.kind.as_str()).collect::<Vec<_>>(),
            "Generated reply failed validation, redirecting"
        );
        Ok(Draft {
            response: SAFE_REDIRECT_REPLY.to_string(),
            target: redirect_target(snapshot.state, request.guided),
            safety_violation: true,
            tokens_used: generation.tokens_used,
            audits: audit_events(slot, &validation, &generation.text),
            metadata: json!({
                "violations": validation.violations.iter().map(|v| v.kind.as_str()).collect::<Vec<_>>(),
            }),
        })
    }

    async fn speak(
        &self,
        slot: &SessionSlot,
        text: &str,
        language: &str,
    ) -> Result<String, SessionError> {
        tokio::select! {
            () = slot.cancel.cancelled() => {
                tracing::info!(session_id = %slot.id, "Session ended during synthesis, discarding reply");
                Err(SessionError::Terminated(slot.id))
            }
            audio_ref = self.capabilities.synthesize(text, language) => Ok(audio_ref),
        }
    }

    async fn commit(
        &self,
        slot: &SessionSlot,
        snapshot: &Snapshot,
        request: &TurnRequest,
        draft: Draft,
        tts_audio_ref: Option<String>,
    ) -> Result<EngineReply, SessionError> {
        let mut session = slot.state.lock().await;
        if session.terminated {
            return Err(SessionError::Terminated(slot.id));
        }
        if session.version != snapshot.version {
            tracing::warn!(
                session_id = %slot.id,
                expected = snapshot.version,
                found = session.version,
                "Session advanced during turn, rejecting commit"
            );
            return Err(SessionError::Conflict(slot.id));
        }

        if let Some(to) = draft.target {
            let update = context_update_for(snapshot.state, to, &request.text);
            session.fsm.transition(to, update)?;
        }

        let mut turn = session.begin_turn(TurnRole::User);
        turn.user_input = Some(request.text.clone());
        turn.assistant_response = Some(draft.response.clone());
        turn.audio_ref.clone_from(&request.audio_ref);
        turn.tts_audio_ref = tts_audio_ref;
        turn.latency_ms = Some(elapsed_ms(request.started));
        turn.safety_violation = draft.safety_violation;
        turn.metadata = with_tokens(draft.metadata, draft.tokens_used);

        session.commit();
        let ended = session.fsm.current_state().is_terminal();
        if ended {
            Self::terminate(&mut session, slot);
        }
        let turn = session.push_turn(turn);

        tracing::info!(
            session_id = %slot.id,
            turn = turn.turn_number,
            from = %snapshot.state,
            to = %turn.state,
            latency_ms = turn.latency_ms,
            "Turn committed"
        );

        self.store.persist_turn(&turn).await?;
        for event in &draft.audits {
            self.store.persist_audit_event(event).await?;
            tracing::info!(session_id = %slot.id, action = %event.action, "Audit event recorded");
        }

        let mut escalation = None;
        if !ended
            && session.record.status != SessionStatus::Escalated
            && self.gate.should_escalate(&session.turns)
        {
            let description = format!(
                "Repeated safety flags within the last {} turns",
                self.gate.policy().lookback
            );
            let record = self
                .escalation
                .escalate(
                    &mut session.record,
                    EscalationReason::PolicyViolation,
                    Severity::High,
                    &description,
                )
                .await?;
            escalation = Some((record, session.record.clone()));
        } else {
            self.store.persist_session(&session.record).await?;
        }
        let state = session.fsm.current_state();
        drop(session);

        let escalated = escalation.is_some();
        if let Some((record, snapshot)) = escalation {
            self.escalation.notify(&record, &snapshot).await;
        }

        Ok(EngineReply {
            response: draft.response,
            state,
            escalated,
            turn,
        })
    }

    async fn run_escalating_turn(
        &self,
        slot: &SessionSlot,
        request: &TurnRequest,
        verdict: SafetyVerdict,
    ) -> Result<EngineReply, SessionError> {
        let (record, escalation, state) = {
            let mut session = slot.state.lock().await;
            let state = session.fsm.current_state();
            if !session.terminated
                && state != ConversationState::EmergencyFallback
                && !state.is_terminal()
            {
                session
                    .fsm
                    .transition(ConversationState::EmergencyFallback, None)?;
                session.commit();
            }

            // Status only flips once the record is stored, so a failed write
            // is escalated again on the next flagged turn
            let escalation = if session.record.status == SessionStatus::Escalated {
                tracing::info!(
                    session_id = %slot.id,
                    reason = %verdict.reason,
                    "Session already escalated, not escalating again"
                );
                self.store.persist_session(&session.record).await?;
                None
            } else {
                let description = format!("Patient input flagged: {}", request.text);
                Some(
                    self.escalation
                        .escalate(&mut session.record, verdict.reason, verdict.severity, &description)
                        .await?,
                )
            };
            (session.record.clone(), escalation, session.fsm.current_state())
        };

        if let Some(escalation) = &escalation {
            self.escalation.notify(escalation, &record).await;
        }

        let response = self.escalation.contact().reply_for(record.channel, verdict.reason);

        // The emergency path is already committed; synthesis failure or
        // cancellation only loses the audio
        let tts_audio_ref = if request.speak && !slot.cancel.is_cancelled() {
            Some(self.capabilities.synthesize(&response, &record.language).await)
        } else {
            None
        };

        // Logged even when the session ended meanwhile: the turn is the
        // audit trail of the escalation
        let mut session = slot.state.lock().await;
        let mut turn = session.begin_turn(TurnRole::User);
        turn.user_input = Some(request.text.clone());
        turn.assistant_response = Some(response.clone());
        turn.audio_ref.clone_from(&request.audio_ref);
        turn.tts_audio_ref = tts_audio_ref;
        turn.latency_ms = Some(elapsed_ms(request.started));
        turn.safety_violation = true;
        turn.metadata = json!({
            "escalation_reason": verdict.reason.as_str(),
            "severity": verdict.severity.as_str(),
        });
        let turn = session.push_turn(turn);
        self.store.persist_turn(&turn).await?;

        Ok(EngineReply {
            response,
            state,
            escalated: true,
            turn,
        })
    }

    /// Mark the session ended and cancel its in-flight calls
    fn terminate(session: &mut SessionState, slot: &SessionSlot) {
        session.terminated = true;
        session.record.ended_at = Some(Utc::now());
        if session.record.status == SessionStatus::Active {
            session.record.status = SessionStatus::Completed;
        }
        slot.cancel.cancel();
    }

    /// Close a session along legal edges (explicit end, timeout, unrecoverable failure)
    pub async fn close_session(
        &self,
        slot: &SessionSlot,
        status: SessionStatus,
    ) -> Result<ConversationState, SessionError> {
        slot.cancel.cancel();
        let mut session = slot.state.lock().await;
        if session.terminated {
            return Ok(session.fsm.current_state());
        }
        session.fsm.close()?;
        if matches!(session.record.status, SessionStatus::Active) {
            session.record.status = status;
        }
        session.commit();
        Self::terminate(&mut session, slot);
        self.store.persist_session(&session.record).await?;
        tracing::info!(
            session_id = %slot.id,
            status = session.record.status.as_str(),
            "Session closed"
        );
        Ok(session.fsm.current_state())
    }
}

/// SafeRedirect when the edge exists, otherwise stay put
fn redirect_target(state: ConversationState, guided: bool) -> Option<ConversationState> {
    (guided && is_valid_transition(state, ConversationState::SafeRedirect))
        .then_some(ConversationState::SafeRedirect)
}

fn audit_events(slot: &SessionSlot, validation: &OutputValidation, text: &str) -> Vec<AuditEvent> {
    validation
        .audited()
        .map(|violation| {
            AuditEvent::safety_violation(
                slot.id,
                violation.kind.audit_event_type(),
                json!({
                    "severity": violation.severity.as_str(),
                    "message": violation.message,
                    "matched": violation.matched,
                    "response": text,
                }),
            )
        })
        .collect()
}

fn with_tokens(metadata: serde_json::Value, tokens: Option<u32>) -> serde_json::Value {
    match (metadata, tokens) {
        (serde_json::Value::Object(mut map), Some(tokens)) => {
            map.insert("tokens_used".to_string(), json!(tokens));
            serde_json::Value::Object(map)
        }
        (serde_json::Value::Null, Some(tokens)) => json!({ "tokens_used": tokens }),
        (metadata, _) => metadata,
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
