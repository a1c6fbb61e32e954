//! Chat (WhatsApp-style) orchestrator
//!
//! Full FSM flow plus quick replies and buttons looked up from the state the
//! turn landed in.

use super::{opt_out, ChannelExtras, ChannelOrchestrator, InboundPayload, TurnOutcome};
use crate::engine::{ConversationEngine, TurnRequest};
use crate::lexicon::CHAT_OPT_OUT;
use crate::runtime::{Channel, SessionError, SessionSlot};
use crate::state_machine::ConversationState;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

/// Interactive reply button
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatButton {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub title: &'static str,
    pub id: &'static str,
}

impl ChatButton {
    const fn reply(title: &'static str, id: &'static str) -> Self {
        Self {
            kind: "reply",
            title,
            id,
        }
    }
}

/// Suggested replies for a state
pub fn quick_replies(state: ConversationState) -> &'static [&'static str] {
    match state {
        ConversationState::OptInPrompt => &["Yes, I agree", "No, thanks"],
        ConversationState::EngagementCheck => &["Yes, continue", "Not now", "Schedule for later"],
        ConversationState::ScheduleOffer => &["Yes, schedule it", "No, thanks", "Maybe later"],
        ConversationState::EmergencyFallback | ConversationState::EndSession => &[],
        _ => &["Next lesson", "Schedule reminder", "Help"],
    }
}

/// Button set for a state
pub fn buttons(state: ConversationState) -> Vec<ChatButton> {
    match state {
        ConversationState::DeliverLessonDetailed | ConversationState::EngagementCheck => vec![
            ChatButton::reply("Next Lesson", "next_lesson"),
            ChatButton::reply("Schedule", "schedule"),
        ],
        _ => Vec::new(),
    }
}

fn chat_extras(state: ConversationState, opt_out: bool) -> ChannelExtras {
    ChannelExtras::Chat {
        quick_replies: quick_replies(state).iter().map(|s| (*s).to_string()).collect(),
        buttons: buttons(state),
        opt_out,
    }
}

pub struct ChatOrchestrator {
    engine: Arc<ConversationEngine>,
    opt_out_first: bool,
}

impl ChatOrchestrator {
    pub fn new(engine: Arc<ConversationEngine>, opt_out_first: bool) -> Self {
        Self {
            engine,
            opt_out_first,
        }
    }
}

#[async_trait]
impl ChannelOrchestrator for ChatOrchestrator {
    fn channel(&self) -> Channel {
        Channel::Chat
    }

    async fn process(
        &self,
        slot: &SessionSlot,
        payload: InboundPayload,
    ) -> Result<TurnOutcome, SessionError> {
        let InboundPayload::Text { text } = payload else {
            return Err(SessionError::UnsupportedPayload(Channel::Chat));
        };

        if let Some(keyword) = CHAT_OPT_OUT.first_match(&text) {
            if self.opt_out_first || !self.engine.gate().check_input(&text).should_escalate {
                let reply = opt_out(&self.engine, slot, &text, keyword).await?;
                return Ok(TurnOutcome::from_reply(&reply, chat_extras(reply.state, true)));
            }
        }

        let reply = self.engine.run_turn(slot, TurnRequest::guided(text)).await?;
        Ok(TurnOutcome::from_reply(&reply, chat_extras(reply.state, false)))
    }
}
