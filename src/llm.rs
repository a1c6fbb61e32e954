//! Generation, transcription and speech capabilities
//!
//! Request/response types for reply generation, a logging decorator, and the
//! OpenAI-backed adapters used in production.

mod error;
mod openai;

pub use error::{CapabilityError, CapabilityErrorKind};
pub use openai::{OpenAiConfig, OpenAiService};

use crate::runtime::traits::{ResponseGenerator, SpeechSynthesizer, Transcriber};
use crate::runtime::Turn;
use crate::state_machine::{ConversationContext, ConversationState};
use async_trait::async_trait;
use std::sync::Arc;

/// Input to one reply generation
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub user_input: String,
    /// `None` for stateless channels (SMS free text)
    pub state: Option<ConversationState>,
    pub context: ConversationContext,
    pub history: Vec<Turn>,
    pub language: String,
}

/// Generated reply with usage accounting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub tokens_used: Option<u32>,
}

impl Generation {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tokens_used: None,
        }
    }
}

/// Logging wrapper for generators
pub struct LoggingGenerator {
    inner: Arc<dyn ResponseGenerator>,
    model_id: String,
}

impl LoggingGenerator {
    pub fn new(inner: Arc<dyn ResponseGenerator>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl ResponseGenerator for LoggingGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, CapabilityError> {
        let start = std::time::Instant::now();
        let result = self.inner.generate(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(generation) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    tokens = generation.tokens_used,
                    state = ?request.state,
                    "Generation completed"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "Generation failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// Stand-in for all three capabilities when no provider key is configured
///
/// Every call fails with an auth error, so the soft-failure fallbacks apply.
pub struct Unconfigured;

impl Unconfigured {
    fn error() -> CapabilityError {
        CapabilityError::auth("No provider configured. Set OPENAI_API_KEY.")
    }
}

#[async_trait]
impl ResponseGenerator for Unconfigured {
    async fn generate(&self, _request: &GenerationRequest) -> Result<Generation, CapabilityError> {
        Err(Self::error())
    }

    fn model_id(&self) -> &str {
        "unconfigured"
    }
}

#[async_trait]
impl Transcriber for Unconfigured {
    async fn transcribe(&self, _audio_ref: &str) -> Result<String, CapabilityError> {
        Err(Self::error())
    }
}

#[async_trait]
impl SpeechSynthesizer for Unconfigured {
    async fn synthesize(&self, _text: &str, _language: &str) -> Result<String, CapabilityError> {
        Err(Self::error())
    }
}
