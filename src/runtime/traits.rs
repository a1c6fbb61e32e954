//! Trait abstractions for runtime I/O
//!
//! External capabilities (generation, transcription, synthesis) and the
//! persistence ports the core writes through. Mock implementations live in
//! `testing.rs`.

use super::session::{AuditEvent, Channel, SessionRecord, Turn};
use crate::db::Lesson;
use crate::escalation::EscalationRecord;
use crate::llm::{CapabilityError, Generation, GenerationRequest};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// Persistence port failure
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("Storage backend error: {0}")]
    Backend(String),
    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

// ============================================================================
// External capabilities
// ============================================================================

/// Speech-to-text
#[async_trait]
pub trait Transcriber: Send + Sync {
    async fn transcribe(&self, audio_ref: &str) -> Result<String, CapabilityError>;
}

/// Reply generation
#[async_trait]
pub trait ResponseGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, CapabilityError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

/// Text-to-speech; returns a reference to the stored audio
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    async fn synthesize(&self, text: &str, language: &str) -> Result<String, CapabilityError>;
}

// ============================================================================
// Persistence ports
// ============================================================================

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn persist_session(&self, session: &SessionRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait TurnStore: Send + Sync {
    async fn persist_turn(&self, turn: &Turn) -> Result<(), StoreError>;
}

#[async_trait]
pub trait EscalationStore: Send + Sync {
    async fn persist_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn persist_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError>;
}

#[async_trait]
pub trait LessonStore: Send + Sync {
    async fn lookup_lesson(&self, lesson_id: i64) -> Result<Option<Lesson>, StoreError>;

    /// Content of the newest approved version, if any
    async fn lookup_approved_lesson_version(
        &self,
        lesson_id: i64,
    ) -> Result<Option<String>, StoreError>;
}

#[async_trait]
pub trait ConsentStore: Send + Sync {
    async fn persist_consent_change(
        &self,
        patient_id: i64,
        channel: Channel,
        granted: bool,
    ) -> Result<(), StoreError>;
}

/// Combined storage trait for convenience
pub trait Storage:
    SessionStore + TurnStore + EscalationStore + AuditStore + LessonStore + ConsentStore
{
}
impl<T> Storage for T where
    T: SessionStore + TurnStore + EscalationStore + AuditStore + LessonStore + ConsentStore
{
}

// ============================================================================
// Arc implementations for trait objects
// ============================================================================

#[async_trait]
impl<T: Transcriber + ?Sized> Transcriber for Arc<T> {
    async fn transcribe(&self, audio_ref: &str) -> Result<String, CapabilityError> {
        (**self).transcribe(audio_ref).await
    }
}

#[async_trait]
impl<T: ResponseGenerator + ?Sized> ResponseGenerator for Arc<T> {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, CapabilityError> {
        (**self).generate(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

#[async_trait]
impl<T: SpeechSynthesizer + ?Sized> SpeechSynthesizer for Arc<T> {
    async fn synthesize(&self, text: &str, language: &str) -> Result<String, CapabilityError> {
        (**self).synthesize(text, language).await
    }
}

#[async_trait]
impl<T: SessionStore + ?Sized> SessionStore for Arc<T> {
    async fn persist_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        (**self).persist_session(session).await
    }
}

#[async_trait]
impl<T: TurnStore + ?Sized> TurnStore for Arc<T> {
    async fn persist_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        (**self).persist_turn(turn).await
    }
}

#[async_trait]
impl<T: EscalationStore + ?Sized> EscalationStore for Arc<T> {
    async fn persist_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError> {
        (**self).persist_escalation(record).await
    }
}

#[async_trait]
impl<T: AuditStore + ?Sized> AuditStore for Arc<T> {
    async fn persist_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        (**self).persist_audit_event(event).await
    }
}

#[async_trait]
impl<T: LessonStore + ?Sized> LessonStore for Arc<T> {
    async fn lookup_lesson(&self, lesson_id: i64) -> Result<Option<Lesson>, StoreError> {
        (**self).lookup_lesson(lesson_id).await
    }

    async fn lookup_approved_lesson_version(
        &self,
        lesson_id: i64,
    ) -> Result<Option<String>, StoreError> {
        (**self).lookup_approved_lesson_version(lesson_id).await
    }
}

#[async_trait]
impl<T: ConsentStore + ?Sized> ConsentStore for Arc<T> {
    async fn persist_consent_change(
        &self,
        patient_id: i64,
        channel: Channel,
        granted: bool,
    ) -> Result<(), StoreError> {
        (**self).persist_consent_change(patient_id, channel, granted).await
    }
}

// ============================================================================
// Soft-failure wrapper
// ============================================================================

/// Reply used when generation fails
pub const GENERATION_APOLOGY: &str =
    "I apologize, I'm having trouble processing that. Could you please repeat?";

/// Capabilities that never fail: provider errors become fallback values
#[derive(Clone)]
pub struct SoftCapabilities {
    transcriber: Arc<dyn Transcriber>,
    generator: Arc<dyn ResponseGenerator>,
    synthesizer: Arc<dyn SpeechSynthesizer>,
}

impl SoftCapabilities {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        generator: Arc<dyn ResponseGenerator>,
        synthesizer: Arc<dyn SpeechSynthesizer>,
    ) -> Self {
        Self {
            transcriber,
            generator,
            synthesizer,
        }
    }

    /// Empty text on failure
    pub async fn transcribe(&self, audio_ref: &str) -> String {
        match self.transcriber.transcribe(audio_ref).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(kind = ?e.kind, error = %e, "Transcription failed, using empty text");
                String::new()
            }
        }
    }

    /// Fixed apology on failure
    pub async fn generate(&self, request: &GenerationRequest) -> Generation {
        match self.generator.generate(request).await {
            Ok(generation) => generation,
            Err(e) => {
                tracing::warn!(
                    model = self.generator.model_id(),
                    kind = ?e.kind,
                    error = %e,
                    "Generation failed, using apology"
                );
                Generation::text(GENERATION_APOLOGY)
            }
        }
    }

    /// Empty reference on failure
    pub async fn synthesize(&self, text: &str, language: &str) -> String {
        match self.synthesizer.synthesize(text, language).await {
            Ok(audio_ref) => audio_ref,
            Err(e) => {
                tracing::warn!(kind = ?e.kind, error = %e, "Synthesis failed, using empty reference");
                String::new()
            }
        }
    }
}

// ============================================================================
// Production Adapters
// ============================================================================

use crate::db::Database;

/// Adapter to use Database as Storage
#[derive(Clone)]
pub struct DatabaseStorage {
    db: Database,
}

impl DatabaseStorage {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn inner(&self) -> &Database {
        &self.db
    }
}

#[async_trait]
impl SessionStore for DatabaseStorage {
    async fn persist_session(&self, session: &SessionRecord) -> Result<(), StoreError> {
        self.db.upsert_session(session).map_err(StoreError::from)
    }
}

#[async_trait]
impl TurnStore for DatabaseStorage {
    async fn persist_turn(&self, turn: &Turn) -> Result<(), StoreError> {
        self.db.insert_turn(turn).map_err(StoreError::from)
    }
}

#[async_trait]
impl EscalationStore for DatabaseStorage {
    async fn persist_escalation(&self, record: &EscalationRecord) -> Result<(), StoreError> {
        self.db.upsert_escalation(record).map_err(StoreError::from)
    }
}

#[async_trait]
impl AuditStore for DatabaseStorage {
    async fn persist_audit_event(&self, event: &AuditEvent) -> Result<(), StoreError> {
        self.db.insert_audit_event(event).map_err(StoreError::from)
    }
}

#[async_trait]
impl LessonStore for DatabaseStorage {
    async fn lookup_lesson(&self, lesson_id: i64) -> Result<Option<Lesson>, StoreError> {
        self.db.get_lesson(lesson_id).map_err(StoreError::from)
    }

    async fn lookup_approved_lesson_version(
        &self,
        lesson_id: i64,
    ) -> Result<Option<String>, StoreError> {
        self.db
            .latest_approved_content(lesson_id)
            .map_err(StoreError::from)
    }
}

#[async_trait]
impl ConsentStore for DatabaseStorage {
    async fn persist_consent_change(
        &self,
        patient_id: i64,
        channel: Channel,
        granted: bool,
    ) -> Result<(), StoreError> {
        self.db
            .insert_consent_event(patient_id, channel, granted)
            .map_err(StoreError::from)
    }
}
