//! Mock implementations for testing
//!
//! These mocks enable end-to-end session tests without providers or a
//! database.

use super::traits::*;
use super::{AuditEvent, Channel, SessionId, SessionManager, SessionRecord, Turn};
use crate::config::Config;
use crate::db::Lesson;
use crate::engine::ConversationEngine;
use crate::escalation::{EscalationCoordinator, EscalationNotifier, EscalationRecord, LogNotifier};
use crate::llm::{CapabilityError, Generation, GenerationRequest};
use crate::safety::{RuleSet, SafetyGate};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;

/// Reply returned once the queue is empty; trips no safety rule
pub const DEFAULT_REPLY: &str = "Thank you for sharing. Let's keep learning together.";

// ============================================================================
// Mock Generator
// ============================================================================

/// Generator that returns queued results, then `DEFAULT_REPLY`
#[allow(dead_code)]
pub struct MockGenerator {
    responses: Mutex<VecDeque<Result<Generation, CapabilityError>>>,
    model_id: String,
    /// Record of all requests made
    pub requests: Mutex<Vec<GenerationRequest>>,
}

#[allow(dead_code)]
impl MockGenerator {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            model_id: model_id.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn queue_response(&self, generation: Generation) {
        self.responses.lock().unwrap().push_back(Ok(generation));
    }

    pub fn queue_text(&self, text: &str) {
        self.queue_response(Generation::text(text));
    }

    pub fn queue_error(&self, error: CapabilityError) {
        self.responses.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl ResponseGenerator for MockGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, CapabilityError> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Generation::text(DEFAULT_REPLY)))
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

// ============================================================================
// Delayed Mock Generator (for cancellation testing)
// ============================================================================

/// Generator with a fixed delay before answering
pub struct DelayedGenerator {
    inner: MockGenerator,
    delay: Duration,
    /// Notified when a request starts (for test synchronization)
    pub request_started: Arc<Notify>,
}

impl DelayedGenerator {
    pub fn new(delay: Duration) -> Self {
        Self {
            inner: MockGenerator::new("delayed-model"),
            delay,
            request_started: Arc::new(Notify::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.inner.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ResponseGenerator for DelayedGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, CapabilityError> {
        self.request_started.notify_one();
        tokio::time::sleep(self.delay).await;
        self.inner.generate(request).await
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

// ============================================================================
// Mock Speech
// ============================================================================

/// Transcriber with a fixed audio→text table; unknown audio fails
#[derive(Default)]
pub struct MockTranscriber {
    transcripts: Mutex<HashMap<String, String>>,
    pub calls: Mutex<Vec<String>>,
}

impl MockTranscriber {
    pub fn with_transcript(self, audio_ref: &str, text: &str) -> Self {
        self.transcripts
            .lock()
            .unwrap()
            .insert(audio_ref.to_string(), text.to_string());
        self
    }
}

#[async_trait]
impl Transcriber for MockTranscriber {
    async fn transcribe(&self, audio_ref: &str) -> Result<String, CapabilityError> {
        self.calls.lock().unwrap().push(audio_ref.to_string());
        self.transcripts
            .lock()
            .unwrap()
            .get(audio_ref)
            .cloned()
            .ok_or_else(|| CapabilityError::network(format!("Unreachable audio: {audio_ref}")))
    }
}

/// Synthesizer that numbers its outputs and records what it spoke
#[derive(Default)]
pub struct MockSynthesizer {
    pub spoken: Mutex<Vec<String>>,
    failing: AtomicBool,
}

impl MockSynthesizer {
    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl SpeechSynthesizer for MockSynthesizer {
    async fn synthesize(&self, text: &str, _language: &str) -> Result<String, CapabilityError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(CapabilityError::server_error("TTS unavailable"));
        }
        let mut spoken = self.spoken.lock().unwrap();
        spoken.push(text.to_string());
        Ok(format!("tts/{}.mp3", spoken.len()))
    }
}

// ============================================================================
// Gated Notifier
// ============================================================================

/// Notifier that blocks until released, for checking what stays locked
#[derive(Default)]
pub struct GatedNotifier {
    /// Notified when a notification starts
    pub entered: Notify,
    pub release: Notify,
    pub notified: Mutex<Vec<EscalationRecord>>,
}

#[async_trait]
impl EscalationNotifier for GatedNotifier {
    async fn notify(&self, record: &EscalationRecord, _session: &SessionRecord) -> Result<(), String> {
        self.entered.notify_one();
        self.release.notified().await;
        self.notified.lock().unwrap().push(record.clone());
        Ok(())
    }
}

// ============================================================================
// In-Memory Storage
// ============================================================================

/// In-memory storage for testing
#[allow(dead_code)]
#[derive(Default)]
pub struct InMemoryStorage {
    sessions: Mutex<HashMap<SessionId, SessionRecord>>,
    turns: Mutex<Vec<Turn>>,
    escalations: Mutex<Vec<EscalationRecord>>,
    audit_events: Mutex<Vec<AuditEvent>>,
    lessons: Mutex<HashMap<i64, Lesson>>,
    approved: Mutex<HashMap<i64, String>>,
    consent: Mutex<Vec<(i64, Channel, bool)>>,
    failing: AtomicBool,
}

#[allow(dead_code)]
impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `StoreError::Unavailable`
    pub fn fail_writes(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check_writable(&self) -> Result<(), StoreError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(StoreError::Unavailable("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    pub fn session(&self, id: SessionId) -> Option<SessionRecord> {
        self.sessions.lock().unwrap().get(&id).cloned()
    }

    pub fn turns(&self, session_id: SessionId) -> Vec<Turn> {
        self.turns
            .lock()
            .unwrap()
            .iter()
            .filter(|t| t.session_id == session_id)
            .cloned()
            .collect()
    }

    pub fn escalations(&self) -> Vec<EscalationRecord> {
        self.escalations.lock().unwrap().clone()
    }

    pub fn audit_events(&self) -> Vec<AuditEvent> {
        self.audit_events.lock().unwrap().clone()
    }

    pub fn consent_events(&self) -> Vec<(i64, Channel, bool)> {
        self.consent.lock().unwrap().clone()
    }

    pub fn add_lesson(&self, id: i64, content: &str, is_active: bool) {
        self.lessons.lock().unwrap().insert(
            id,
            Lesson {
                id,
                title: format!("Lesson {id}"),
                content: content.to_string(),
                is_active,
                created_at: Utc::now(),
            },
        );
    }

    pub fn approve_version(&self, lesson_id: i64, content: &str) {
        self.approved
            .lock()
            .unwrap()
            .insert(lesson_id, content.to_string());
    }
}

#[async_trait]
impl SessionStore for InMemoryStorage {
    async fn persist_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        self.sessions
            .lock()
            .unwrap()
            .insert(session.id, session.clone());
        Ok(())
    }
}

#[async_trait]
impl TurnStore for InMemoryStorage {
    /// Same uniqueness rule as the turns table
    async fn persist_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut turns = self.turns.lock().unwrap();
        if turns
            .iter()
            .any(|t| t.session_id == turn.session_id && t.turn_number == turn.turn_number)
        {
            return Err(StoreError::Backend(format!(
                "duplicate turn {} for session {}",
                turn.turn_number, turn.session_id
            )));
        }
        turns.push(turn.clone());
        Ok(())
    }
}

#[async_trait]
impl EscalationStore for InMemoryStorage {
    async fn persist_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError> {
        self.check_writable()?;
        let mut escalations = self.escalations.lock().unwrap();
        escalations.retain(|e| e.id != record.id);
        escalations.push(record.clone());
        Ok(())
    }
}

#[async_trait]
impl AuditStore for InMemoryStorage {
    async fn persist_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.check_writable()?;
        self.audit_events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

#[async_trait]
impl LessonStore for InMemoryStorage {
    async fn lookup_lesson(&self, lesson_id: i64) -> Result<Option<Lesson>, StoreError> {
        Ok(self.lessons.lock().unwrap().get(&lesson_id).cloned())
    }

    async fn lookup_approved_lesson_version(
        &self,
        lesson_id: i64,
    ) -> Result<Option<String>, StoreError> {
        Ok(self.approved.lock().unwrap().get(&lesson_id).cloned())
    }
}

#[async_trait]
impl ConsentStore for InMemoryStorage {
    async fn persist_consent_change(
        &self,
        patient_id: i64,
        channel: Channel,
        granted: bool,
    ) -> Result<(), StoreError> {
        self.check_writable()?;
        self.consent.lock().unwrap().push((patient_id, channel, granted));
        Ok(())
    }
}

// ============================================================================
// Test Runtime
// ============================================================================

/// Session manager wired to mocks
pub struct TestRuntime {
    pub manager: Arc<SessionManager>,
    pub storage: Arc<InMemoryStorage>,
    pub transcriber: Arc<MockTranscriber>,
    pub synthesizer: Arc<MockSynthesizer>,
}

impl TestRuntime {
    pub fn builder() -> TestRuntimeBuilder {
        TestRuntimeBuilder::default()
    }

    /// Runtime with default settings around `generator`
    pub fn new(generator: Arc<dyn ResponseGenerator>) -> Self {
        Self::builder().generator(generator).build()
    }
}

pub struct TestRuntimeBuilder {
    config: Config,
    generator: Option<Arc<dyn ResponseGenerator>>,
    notifier: Option<Arc<dyn EscalationNotifier>>,
    transcriber: MockTranscriber,
}

impl Default for TestRuntimeBuilder {
    fn default() -> Self {
        Self {
            config: Config::default(),
            generator: None,
            notifier: None,
            transcriber: MockTranscriber::default(),
        }
    }
}

impl TestRuntimeBuilder {
    pub fn generator(mut self, generator: Arc<dyn ResponseGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn EscalationNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn transcript(mut self, audio_ref: &str, text: &str) -> Self {
        self.transcriber = self.transcriber.with_transcript(audio_ref, text);
        self
    }

    pub fn opt_out_first(mut self, enabled: bool) -> Self {
        self.config.opt_out_precedes_safety = enabled;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.session_idle_timeout = timeout;
        self
    }

    pub fn build(self) -> TestRuntime {
        let storage = Arc::new(InMemoryStorage::new());
        let transcriber = Arc::new(self.transcriber);
        let synthesizer = Arc::new(MockSynthesizer::default());
        let generator: Arc<dyn ResponseGenerator> = match self.generator {
            Some(generator) => generator,
            None => Arc::new(MockGenerator::new("test-model")),
        };

        let notifier: Arc<dyn EscalationNotifier> = match self.notifier {
            Some(notifier) => notifier,
            None => Arc::new(LogNotifier),
        };

        let capabilities = SoftCapabilities::new(transcriber.clone(), generator, synthesizer.clone());
        let escalation = EscalationCoordinator::new(
            storage.clone(),
            notifier,
            self.config.emergency_contact(),
        );
        let engine = Arc::new(ConversationEngine::new(
            SafetyGate::new(RuleSet::v1(), self.config.escalation_policy()),
            capabilities,
            storage.clone(),
            escalation,
        ));

        TestRuntime {
            manager: Arc::new(SessionManager::new(engine, &self.config)),
            storage,
            transcriber,
            synthesizer,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::sms::ACK_REPLY;
    use crate::channels::voice::REPROMPT;
    use crate::channels::{ChannelExtras, InboundPayload, UNSUBSCRIBE_REPLY};
    use crate::engine::SAFE_REDIRECT_REPLY;
    use crate::escalation::EmergencyContact;
    use crate::runtime::{SessionError, SessionStatus};
    use crate::safety::{EscalationReason, Severity};
    use crate::state_machine::ConversationState;

    fn text(s: &str) -> InboundPayload {
        InboundPayload::text(s)
    }

    fn mock_runtime() -> (TestRuntime, Arc<MockGenerator>) {
        let generator = Arc::new(MockGenerator::new("test-model"));
        (TestRuntime::new(generator.clone()), generator)
    }

    #[tokio::test]
    async fn test_mock_generator_queue() {
        let mock = MockGenerator::new("test-model");
        mock.queue_text("first");
        mock.queue_error(CapabilityError::network("down"));

        let request = GenerationRequest {
            user_input: "hi".to_string(),
            state: None,
            context: crate::state_machine::ConversationContext::default(),
            history: vec![],
            language: "en".to_string(),
        };
        assert_eq!(mock.generate(&request).await.unwrap().text, "first");
        assert!(mock.generate(&request).await.is_err());
        assert_eq!(mock.generate(&request).await.unwrap().text, DEFAULT_REPLY);
        assert_eq!(mock.recorded_requests().len(), 3);
    }

    #[tokio::test]
    async fn test_in_memory_storage_rejects_duplicate_turns() {
        let storage = InMemoryStorage::new();
        let id = SessionId::new();
        let turn = Turn::new(id, 1, crate::runtime::TurnRole::User, ConversationState::Greeting);
        storage.persist_turn(&turn).await.unwrap();
        assert!(storage.persist_turn(&turn).await.is_err());
        assert_eq!(storage.turns(id).len(), 1);
    }

    #[tokio::test]
    async fn test_chat_guided_flow() {
        let (rt, generator) = mock_runtime();
        let handle = rt.manager.start_session(11, Channel::Chat).await.unwrap();
        assert_eq!(
            rt.storage.session(handle.id).map(|s| s.state),
            Some(ConversationState::SessionStart)
        );

        let first = rt.manager.handle_turn(&handle, text("hello")).await.unwrap();
        assert_eq!(first.state, ConversationState::OptInPrompt);
        assert_eq!(first.turn_number, 1);
        assert_eq!(first.response, DEFAULT_REPLY);
        let ChannelExtras::Chat { quick_replies, .. } = &first.extras else {
            panic!("expected chat extras");
        };
        assert_eq!(quick_replies, &vec!["Yes, I agree".to_string(), "No, thanks".to_string()]);

        let second = rt.manager.handle_turn(&handle, text("Yes, I agree")).await.unwrap();
        assert_eq!(second.state, ConversationState::Greeting);
        assert_eq!(second.turn_number, 2);

        let stored = rt.storage.session(handle.id).unwrap();
        assert_eq!(stored.state, ConversationState::Greeting);
        assert!(stored.context.consent_granted);

        // Generation saw the state it was asked to speak for and the history
        let requests = generator.recorded_requests();
        assert_eq!(requests[1].state, Some(ConversationState::OptInPrompt));
        assert_eq!(requests[1].history.len(), 1);
    }

    #[tokio::test]
    async fn test_turn_numbers_strictly_increase() {
        let (rt, _) = mock_runtime();
        let handle = rt.manager.start_session(3, Channel::Chat).await.unwrap();
        for input in ["hello", "yes", "hi", "tell me more", "okay"] {
            rt.manager.handle_turn(&handle, text(input)).await.unwrap();
        }
        let numbers: Vec<u32> = rt
            .storage
            .turns(handle.id)
            .iter()
            .map(|t| t.turn_number)
            .collect();
        assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_emergency_escalates_once_without_generation() {
        let (rt, generator) = mock_runtime();
        let handle = rt.manager.start_session(42, Channel::Voice).await.unwrap();

        let outcome = rt
            .manager
            .handle_turn(&handle, text("I have chest pain"))
            .await
            .unwrap();
        assert!(outcome.escalated);
        assert_eq!(outcome.state, ConversationState::EmergencyFallback);
        assert_eq!(
            outcome.response,
            EmergencyContact::default().emergency_reply(Channel::Voice)
        );
        let ChannelExtras::Voice { audio_ref, .. } = &outcome.extras else {
            panic!("expected voice extras");
        };
        assert!(!audio_ref.is_empty());
        assert!(generator.recorded_requests().is_empty());

        let escalations = rt.storage.escalations();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].reason, EscalationReason::Emergency);
        assert_eq!(escalations[0].severity, Severity::Critical);
        assert_eq!(
            rt.storage.session(handle.id).map(|s| s.status),
            Some(SessionStatus::Escalated)
        );

        // A second emergency in the same session is not escalated again
        let again = rt
            .manager
            .handle_turn(&handle, text("it is an emergency"))
            .await
            .unwrap();
        assert_eq!(again.state, ConversationState::EmergencyFallback);
        assert_eq!(rt.storage.escalations().len(), 1);
        assert!(rt.storage.turns(handle.id).iter().all(|t| t.safety_violation));
    }

    #[tokio::test]
    async fn test_symptom_gets_handoff_message() {
        let (rt, _) = mock_runtime();
        let handle = rt.manager.start_session(5, Channel::Chat).await.unwrap();
        let outcome = rt
            .manager
            .handle_turn(&handle, text("I have a fever since yesterday"))
            .await
            .unwrap();
        assert!(outcome.escalated);
        assert_eq!(outcome.response, EmergencyContact::default().handoff_message());
        assert_eq!(rt.storage.escalations()[0].reason, EscalationReason::SymptomsMentioned);
    }

    #[tokio::test]
    async fn test_sms_stop_with_emergency_opts_out_by_default() {
        let (rt, generator) = mock_runtime();
        let handle = rt.manager.start_session(8, Channel::Sms).await.unwrap();

        let outcome = rt
            .manager
            .handle_turn(&handle, text("STOP I have chest pain"))
            .await
            .unwrap();
        assert_eq!(outcome.response, UNSUBSCRIBE_REPLY);
        assert_eq!(outcome.state, ConversationState::EndSession);
        assert!(!outcome.escalated);
        assert!(matches!(outcome.extras, ChannelExtras::Sms { opt_out: true, .. }));
        assert!(rt.storage.escalations().is_empty());
        assert!(generator.recorded_requests().is_empty());
        assert_eq!(rt.storage.consent_events(), vec![(8, Channel::Sms, false)]);

        let stored = rt.storage.session(handle.id).unwrap();
        assert_eq!(stored.status, SessionStatus::OptedOut);
        assert!(!stored.context.consent_granted);
        assert!(stored.ended_at.is_some());

        // The ended session is gone
        let err = rt.manager.handle_turn(&handle, text("hello")).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_sms_stop_with_emergency_escalates_when_safety_first() {
        let rt = TestRuntime::builder().opt_out_first(false).build();
        let handle = rt.manager.start_session(8, Channel::Sms).await.unwrap();

        let outcome = rt
            .manager
            .handle_turn(&handle, text("STOP I have chest pain"))
            .await
            .unwrap();
        assert!(outcome.escalated);
        assert_eq!(outcome.state, ConversationState::EmergencyFallback);
        assert_eq!(rt.storage.escalations().len(), 1);
        assert!(rt.storage.consent_events().is_empty());

        // Plain STOP still opts out
        let stop = rt.manager.handle_turn(&handle, text("stop")).await.unwrap();
        assert_eq!(stop.state, ConversationState::EndSession);
    }

    #[tokio::test]
    async fn test_sms_acknowledgment_skips_generation() {
        let (rt, generator) = mock_runtime();
        let handle = rt.manager.start_session(2, Channel::Sms).await.unwrap();
        let outcome = rt.manager.handle_turn(&handle, text("ok thanks")).await.unwrap();
        assert_eq!(outcome.response, ACK_REPLY);
        assert!(matches!(outcome.extras, ChannelExtras::Sms { acknowledged: true, .. }));
        assert_eq!(outcome.state, ConversationState::SessionStart);
        assert!(generator.recorded_requests().is_empty());
    }

    #[tokio::test]
    async fn test_sms_free_text_is_stateless_and_truncated() {
        let (rt, generator) = mock_runtime();
        generator.queue_text(&"word ".repeat(40));
        let handle = rt.manager.start_session(2, Channel::Sms).await.unwrap();

        let outcome = rt
            .manager
            .handle_turn(&handle, text("tell me about antenatal visits"))
            .await
            .unwrap();
        assert!(outcome.response.chars().count() <= 150);
        assert!(outcome.response.ends_with("..."));
        assert!(matches!(outcome.extras, ChannelExtras::Sms { truncated: true, .. }));
        assert_eq!(outcome.state, ConversationState::SessionStart);
        assert_eq!(generator.recorded_requests()[0].state, None);
    }

    #[tokio::test]
    async fn test_sms_lesson_snippet() {
        let (rt, _) = mock_runtime();
        rt.storage.add_lesson(1, "Base lesson text", true);
        rt.storage.approve_version(1, "Approved lesson text");
        rt.storage.add_lesson(2, "Retired", false);
        rt.storage.add_lesson(3, &"Drink clean water daily. ".repeat(10), true);

        let handle = rt.manager.start_session(4, Channel::Sms).await.unwrap();
        let outcome = rt.manager.send_lesson_snippet(&handle, 1).await.unwrap();
        assert_eq!(outcome.response, "Approved lesson text");
        assert_eq!(rt.storage.session(handle.id).unwrap().lesson_id, Some(1));

        let long = rt.manager.send_lesson_snippet(&handle, 3).await.unwrap();
        assert!(long.response.chars().count() <= 150);
        assert!(matches!(long.extras, ChannelExtras::Sms { truncated: true, .. }));

        let err = rt.manager.send_lesson_snippet(&handle, 2).await.unwrap_err();
        assert!(matches!(err, SessionError::LessonUnavailable(2)));
        let err = rt.manager.send_lesson_snippet(&handle, 99).await.unwrap_err();
        assert!(matches!(err, SessionError::LessonUnavailable(99)));

        let chat = rt.manager.start_session(4, Channel::Chat).await.unwrap();
        let err = rt.manager.send_lesson_snippet(&chat, 1).await.unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedPayload(Channel::Chat)));
    }

    #[tokio::test]
    async fn test_diagnosis_request_redirects() {
        let (rt, generator) = mock_runtime();
        let handle = rt.manager.start_session(6, Channel::Chat).await.unwrap();
        for input in ["hello", "yes", "hi"] {
            rt.manager.handle_turn(&handle, text(input)).await.unwrap();
        }
        assert_eq!(
            rt.storage.session(handle.id).map(|s| s.state),
            Some(ConversationState::TopicIntro)
        );

        let outcome = rt
            .manager
            .handle_turn(&handle, text("What is wrong with me?"))
            .await
            .unwrap();
        assert_eq!(outcome.response, SAFE_REDIRECT_REPLY);
        assert_eq!(outcome.state, ConversationState::SafeRedirect);
        assert!(!outcome.escalated);
        assert_eq!(generator.recorded_requests().len(), 3);
        assert!(rt.storage.escalations().is_empty());
    }

    #[tokio::test]
    async fn test_unsafe_output_is_replaced_and_audited() {
        let (rt, generator) = mock_runtime();
        generator.queue_text("You have malaria and you should take medication.");
        generator.queue_text("Your diagnosis is anemia.");
        let handle = rt.manager.start_session(9, Channel::Chat).await.unwrap();

        let first = rt.manager.handle_turn(&handle, text("hello")).await.unwrap();
        assert_eq!(first.response, SAFE_REDIRECT_REPLY);
        // No redirect edge from the first state, so the session stays put
        assert_eq!(first.state, ConversationState::SessionStart);
        assert!(!first.escalated);

        let mut actions: Vec<String> = rt
            .storage
            .audit_events()
            .into_iter()
            .map(|e| e.action)
            .collect();
        actions.sort();
        assert_eq!(
            actions,
            vec![
                "safety_violation_diagnosis_attempted".to_string(),
                "safety_violation_medical_advice_attempted".to_string(),
            ]
        );

        // Second flagged turn inside the window escalates
        let second = rt.manager.handle_turn(&handle, text("hello again")).await.unwrap();
        assert!(second.escalated);
        let escalations = rt.storage.escalations();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].reason, EscalationReason::PolicyViolation);
        assert_eq!(escalations[0].severity, Severity::High);
        assert!(rt.storage.turns(handle.id).iter().all(|t| t.safety_violation));
    }

    #[tokio::test]
    async fn test_generation_failure_uses_apology() {
        let (rt, generator) = mock_runtime();
        generator.queue_error(CapabilityError::server_error("boom"));
        let handle = rt.manager.start_session(1, Channel::Chat).await.unwrap();
        let outcome = rt.manager.handle_turn(&handle, text("hello")).await.unwrap();
        assert_eq!(outcome.response, GENERATION_APOLOGY);
        assert_eq!(outcome.state, ConversationState::OptInPrompt);
    }

    #[tokio::test]
    async fn test_voice_pipeline() {
        let generator = Arc::new(MockGenerator::new("test-model"));
        let rt = TestRuntime::builder()
            .generator(generator.clone())
            .transcript("call-1.wav", "hello")
            .build();
        let handle = rt.manager.start_session(7, Channel::Voice).await.unwrap();

        let outcome = rt
            .manager
            .handle_turn(&handle, InboundPayload::audio("call-1.wav"))
            .await
            .unwrap();
        assert_eq!(outcome.state, ConversationState::OptInPrompt);
        let ChannelExtras::Voice { audio_ref, .. } = &outcome.extras else {
            panic!("expected voice extras");
        };
        assert_eq!(audio_ref, "tts/1.mp3");

        let turn = &rt.storage.turns(handle.id)[0];
        assert_eq!(turn.user_input.as_deref(), Some("hello"));
        assert_eq!(turn.audio_ref.as_deref(), Some("call-1.wav"));
        assert_eq!(turn.tts_audio_ref.as_deref(), Some("tts/1.mp3"));
        assert!(turn.latency_ms.is_some());
        assert_eq!(rt.synthesizer.spoken.lock().unwrap()[0], DEFAULT_REPLY);
    }

    #[tokio::test]
    async fn test_voice_empty_transcript_reprompts() {
        let (rt, generator) = mock_runtime();
        let handle = rt.manager.start_session(7, Channel::Voice).await.unwrap();

        // Unknown audio fails transcription, which reads as silence
        let outcome = rt
            .manager
            .handle_turn(&handle, InboundPayload::audio("missing.wav"))
            .await
            .unwrap();
        assert_eq!(outcome.response, REPROMPT);
        assert_eq!(outcome.state, ConversationState::SessionStart);
        assert!(generator.recorded_requests().is_empty());
        assert_eq!(rt.transcriber.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_voice_synthesis_failure_keeps_text() {
        let (rt, _) = mock_runtime();
        rt.synthesizer.fail(true);
        let handle = rt.manager.start_session(7, Channel::Voice).await.unwrap();
        let outcome = rt.manager.handle_turn(&handle, text("hello")).await.unwrap();
        assert_eq!(outcome.response, DEFAULT_REPLY);
        assert!(matches!(&outcome.extras, ChannelExtras::Voice { audio_ref, .. } if audio_ref.is_empty()));
    }

    #[tokio::test]
    async fn test_chat_rejects_audio() {
        let (rt, _) = mock_runtime();
        let handle = rt.manager.start_session(1, Channel::Chat).await.unwrap();
        let err = rt
            .manager
            .handle_turn(&handle, InboundPayload::audio("x.wav"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::UnsupportedPayload(Channel::Chat)));
    }

    #[tokio::test]
    async fn test_chat_opt_out_closes_session() {
        let (rt, _) = mock_runtime();
        let handle = rt.manager.start_session(12, Channel::Chat).await.unwrap();
        rt.manager.handle_turn(&handle, text("hello")).await.unwrap();

        let outcome = rt
            .manager
            .handle_turn(&handle, text("please unsubscribe me"))
            .await
            .unwrap();
        assert_eq!(outcome.state, ConversationState::EndSession);
        let ChannelExtras::Chat { quick_replies, opt_out, .. } = &outcome.extras else {
            panic!("expected chat extras");
        };
        assert!(*opt_out);
        assert!(quick_replies.is_empty());
        assert_eq!(rt.manager.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_concurrent_turns_conflict() {
        let generator = Arc::new(DelayedGenerator::new(Duration::from_millis(100)));
        let rt = TestRuntime::new(generator.clone());
        let handle = rt.manager.start_session(1, Channel::Chat).await.unwrap();

        let (a, b) = tokio::join!(
            rt.manager.handle_turn(&handle, text("hello")),
            rt.manager.handle_turn(&handle, text("hi there")),
        );
        let conflicts = [&a, &b]
            .iter()
            .filter(|r| matches!(r, Err(SessionError::Conflict(_))))
            .count();
        assert_eq!(conflicts, 1);
        assert!(a.is_ok() || b.is_ok());
        assert_eq!(generator.call_count(), 2);
        assert_eq!(rt.storage.turns(handle.id).len(), 1);
    }

    #[tokio::test]
    async fn test_end_session_discards_in_flight_reply() {
        let generator = Arc::new(DelayedGenerator::new(Duration::from_secs(5)));
        let rt = TestRuntime::new(generator.clone());
        let handle = rt.manager.start_session(1, Channel::Chat).await.unwrap();

        let manager = rt.manager.clone();
        let turn = tokio::spawn(async move { manager.handle_turn(&handle, text("hello")).await });

        generator.request_started.notified().await;
        rt.manager.end_session(&handle).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), turn)
            .await
            .expect("turn should stop once the session ends")
            .unwrap();
        assert!(matches!(result, Err(SessionError::Terminated(_))));
        assert!(rt.storage.turns(handle.id).is_empty());

        let stored = rt.storage.session(handle.id).unwrap();
        assert_eq!(stored.state, ConversationState::EndSession);
        assert_eq!(stored.status, SessionStatus::Completed);
    }

    #[tokio::test]
    async fn test_end_unknown_session() {
        let (rt, _) = mock_runtime();
        let handle = rt.manager.start_session(1, Channel::Sms).await.unwrap();
        rt.manager.end_session(&handle).await.unwrap();
        assert!(matches!(
            rt.manager.end_session(&handle).await,
            Err(SessionError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_reap_idle_abandons_sessions() {
        let rt = TestRuntime::builder().idle_timeout(Duration::ZERO).build();
        let handle = rt.manager.start_session(1, Channel::Voice).await.unwrap();
        assert_eq!(rt.manager.reap_idle().await, 1);
        assert_eq!(rt.manager.active_sessions().await, 0);
        let stored = rt.storage.session(handle.id).unwrap();
        assert_eq!(stored.status, SessionStatus::Abandoned);
        assert_eq!(stored.state, ConversationState::EndSession);
    }

    #[tokio::test]
    async fn test_start_session_with_lesson_and_language() {
        let (rt, generator) = mock_runtime();
        let handle = rt
            .manager
            .start_session_with(crate::runtime::StartOptions {
                language: Some("tw".to_string()),
                lesson_id: Some(5),
                ..crate::runtime::StartOptions::new(2, Channel::Chat)
            })
            .await
            .unwrap();
        let stored = rt.storage.session(handle.id).unwrap();
        assert_eq!(stored.lesson_id, Some(5));
        assert_eq!(stored.context.lesson_id, Some(5));

        rt.manager.handle_turn(&handle, text("hello")).await.unwrap();
        let request = &generator.recorded_requests()[0];
        assert_eq!(request.language, "tw");
        assert_eq!(request.context.lesson_id, Some(5));
    }

    #[tokio::test]
    async fn test_persistence_failure_surfaces() {
        let (rt, _) = mock_runtime();
        let handle = rt.manager.start_session(1, Channel::Chat).await.unwrap();
        rt.storage.fail_writes(true);
        let err = rt.manager.handle_turn(&handle, text("hello")).await.unwrap_err();
        assert!(matches!(err, SessionError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_failed_escalation_is_retried_on_next_emergency() {
        let (rt, _) = mock_runtime();
        let handle = rt.manager.start_session(3, Channel::Chat).await.unwrap();

        rt.storage.fail_writes(true);
        let err = rt
            .manager
            .handle_turn(&handle, text("I have chest pain"))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Persistence(_)));
        assert!(rt.storage.escalations().is_empty());

        rt.storage.fail_writes(false);
        let retry = rt
            .manager
            .handle_turn(&handle, text("I have chest pain"))
            .await
            .unwrap();
        assert!(retry.escalated);
        assert_eq!(retry.state, ConversationState::EmergencyFallback);

        let escalations = rt.storage.escalations();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].reason, EscalationReason::Emergency);
        assert_eq!(
            rt.storage.session(handle.id).map(|s| s.status),
            Some(SessionStatus::Escalated)
        );

        rt.manager
            .handle_turn(&handle, text("I have chest pain"))
            .await
            .unwrap();
        assert_eq!(rt.storage.escalations().len(), 1);
    }

    #[tokio::test]
    async fn test_escalation_notifies_without_holding_session() {
        let notifier = Arc::new(GatedNotifier::default());
        let rt = TestRuntime::builder().notifier(notifier.clone()).build();
        let handle = rt.manager.start_session(4, Channel::Chat).await.unwrap();

        let manager = rt.manager.clone();
        let turn = tokio::spawn(async move {
            manager.handle_turn(&handle, text("I have chest pain")).await
        });

        notifier.entered.notified().await;
        tokio::time::timeout(Duration::from_secs(1), rt.manager.end_session(&handle))
            .await
            .expect("session should be free while humans are notified")
            .unwrap();
        notifier.release.notify_one();

        let outcome = tokio::time::timeout(Duration::from_secs(1), turn)
            .await
            .expect("turn should finish once notified")
            .unwrap()
            .unwrap();
        assert!(outcome.escalated);
        assert_eq!(notifier.notified.lock().unwrap().len(), 1);
        assert_eq!(rt.storage.escalations().len(), 1);

        // The emergency turn is still logged after the session ended
        let turns = rt.storage.turns(handle.id);
        assert_eq!(turns.len(), 1);
        assert!(turns[0].safety_violation);
        assert_eq!(
            rt.storage.session(handle.id).map(|s| s.status),
            Some(SessionStatus::Escalated)
        );
    }
}
