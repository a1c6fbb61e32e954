//! Channel orchestrators
//!
//! Voice, SMS and chat variants over one contract: take an inbound payload
//! for a live session, drive the engine and safety gate under the channel's
//! constraints, and return the reply plus channel-specific extras.

pub mod chat;
pub mod sms;
pub mod voice;

pub use chat::{ChatButton, ChatOrchestrator};
pub use sms::{truncate_for_sms, SmsOrchestrator};
pub use voice::VoiceOrchestrator;

use crate::engine::{ConversationEngine, EngineReply, Exchange};
use crate::runtime::traits::ConsentStore;
use crate::runtime::{Channel, SessionError, SessionSlot, SessionStatus};
use crate::state_machine::{ContextUpdate, ConversationState};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::json;

/// Fixed reply to an opt-out keyword
pub const UNSUBSCRIBE_REPLY: &str =
    "You have been unsubscribed. Reply 'START' to subscribe again.";

/// What arrived from the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundPayload {
    /// Reference (URL or path) to a recording
    Audio { audio_ref: String },
    Text { text: String },
}

impl InboundPayload {
    pub fn text(text: impl Into<String>) -> Self {
        InboundPayload::Text { text: text.into() }
    }

    pub fn audio(audio_ref: impl Into<String>) -> Self {
        InboundPayload::Audio {
            audio_ref: audio_ref.into(),
        }
    }
}

/// Channel-specific parts of a turn result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "channel", rename_all = "snake_case")]
pub enum ChannelExtras {
    Voice {
        /// Synthesized reply; empty when synthesis failed
        audio_ref: String,
        latency_ms: u64,
    },
    Sms {
        opt_out: bool,
        acknowledged: bool,
        truncated: bool,
    },
    Chat {
        quick_replies: Vec<String>,
        buttons: Vec<ChatButton>,
        opt_out: bool,
    },
}

/// Result of `handle_turn`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TurnOutcome {
    pub response: String,
    pub state: ConversationState,
    pub escalated: bool,
    pub turn_number: u32,
    pub extras: ChannelExtras,
}

impl TurnOutcome {
    pub fn from_reply(reply: &EngineReply, extras: ChannelExtras) -> Self {
        Self {
            response: reply.response.clone(),
            state: reply.state,
            escalated: reply.escalated,
            turn_number: reply.turn.turn_number,
            extras,
        }
    }
}

#[async_trait]
pub trait ChannelOrchestrator: Send + Sync {
    fn channel(&self) -> Channel;

    async fn process(
        &self,
        slot: &SessionSlot,
        payload: InboundPayload,
    ) -> Result<TurnOutcome, SessionError>;
}

/// Unsubscribe: revoke consent, mark the session opted out and close it.
///
/// Skips the safety gate and generation entirely.
pub(crate) async fn opt_out(
    engine: &ConversationEngine,
    slot: &SessionSlot,
    text: &str,
    keyword: &str,
) -> Result<EngineReply, SessionError> {
    let patient_id = slot.state.lock().await.record.patient_id;
    tracing::info!(session_id = %slot.id, channel = %slot.channel, keyword, "Opt-out received");

    let exchange = Exchange {
        update: Some(ContextUpdate::new().consent(false)),
        status: Some(SessionStatus::OptedOut),
        close: true,
        metadata: json!({ "opt_out": keyword }),
        ..Exchange::reply(text, UNSUBSCRIBE_REPLY)
    };
    let reply = engine.record_exchange(slot, exchange).await?;

    engine
        .store()
        .persist_consent_change(patient_id, slot.channel, false)
        .await?;
    Ok(reply)
}
