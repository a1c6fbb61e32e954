//! Voice (IVR) orchestrator
//!
//! transcribe -> screen -> engine turn -> synthesize. Latency covers the whole
//! pipeline and is logged per turn.

use super::{ChannelExtras, ChannelOrchestrator, InboundPayload, TurnOutcome};
use crate::engine::{ConversationEngine, Exchange, TurnRequest};
use crate::runtime::{Channel, SessionError, SessionSlot};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::time::Instant;

/// Spoken when the recording produced no text
pub const REPROMPT: &str = "I'm sorry, I didn't catch that. Could you please repeat?";

pub struct VoiceOrchestrator {
    engine: Arc<ConversationEngine>,
}

impl VoiceOrchestrator {
    pub fn new(engine: Arc<ConversationEngine>) -> Self {
        Self { engine }
    }

    async fn transcribe(&self, slot: &SessionSlot, audio_ref: &str) -> Result<String, SessionError> {
        tokio::select! {
            () = slot.cancel.cancelled() => Err(SessionError::Terminated(slot.id)),
            text = self.engine.capabilities().transcribe(audio_ref) => Ok(text),
        }
    }

    async fn reprompt(&self, slot: &SessionSlot, started: Instant) -> Result<TurnOutcome, SessionError> {
        let mut exchange = Exchange::reply("", REPROMPT);
        exchange.user_input = None;
        exchange.metadata = json!({ "reprompt": true });
        let reply = self.engine.record_exchange(slot, exchange).await?;

        let language = slot.state.lock().await.record.language.clone();
        let audio_ref = self.engine.capabilities().synthesize(REPROMPT, &language).await;
        Ok(TurnOutcome::from_reply(
            &reply,
            ChannelExtras::Voice {
                audio_ref,
                latency_ms: elapsed_ms(started),
            },
        ))
    }
}

#[async_trait]
impl ChannelOrchestrator for VoiceOrchestrator {
    fn channel(&self) -> Channel {
        Channel::Voice
    }

    async fn process(
        &self,
        slot: &SessionSlot,
        payload: InboundPayload,
    ) -> Result<TurnOutcome, SessionError> {
        let started = Instant::now();

        let (text, audio_ref) = match payload {
            InboundPayload::Audio { audio_ref } => {
                (self.transcribe(slot, &audio_ref).await?, Some(audio_ref))
            }
            // Keypad or pre-transcribed input
            InboundPayload::Text { text } => (text, None),
        };

        if text.trim().is_empty() {
            tracing::info!(session_id = %slot.id, "Empty transcript, reprompting");
            return self.reprompt(slot, started).await;
        }

        let request = TurnRequest {
            text,
            audio_ref,
            guided: true,
            speak: true,
            started,
        };
        let reply = self.engine.run_turn(slot, request).await?;

        let latency_ms = elapsed_ms(started);
        tracing::info!(
            session_id = %slot.id,
            turn = reply.turn.turn_number,
            state = %reply.state,
            escalated = reply.escalated,
            latency_ms,
            "Voice turn completed"
        );

        Ok(TurnOutcome::from_reply(
            &reply,
            ChannelExtras::Voice {
                audio_ref: reply.turn.tts_audio_ref.clone().unwrap_or_default(),
                latency_ms,
            },
        ))
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
