//! SMS orchestrator
//!
//! Inbound free text runs in stateless short-reply mode: opt-out, then
//! safety, then acknowledgment, then generation. Lesson content goes out
//! through `send_lesson_snippet`, trimmed to the character budget.

use super::{opt_out, ChannelExtras, ChannelOrchestrator, InboundPayload, TurnOutcome};
use crate::engine::{ConversationEngine, EngineReply, Exchange, TurnRequest};
use crate::lexicon::{ACKNOWLEDGMENT, SMS_OPT_OUT};
use crate::runtime::traits::LessonStore;
use crate::runtime::{Channel, SessionError, SessionSlot, TurnRole};
use crate::state_machine::ContextUpdate;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;

/// Reply to an acknowledgment keyword
pub const ACK_REPLY: &str = "Thank you for confirming!";

/// Default message budget in characters
pub const DEFAULT_CHAR_BUDGET: usize = 150;

const ELLIPSIS: &str = "...";

/// Cut `text` to at most `budget` characters on a word boundary, marking the
/// cut with an ellipsis. Text within budget is returned unchanged.
pub fn truncate_for_sms(text: &str, budget: usize) -> String {
    if text.chars().count() <= budget {
        return text.to_string();
    }

    let keep = budget.saturating_sub(ELLIPSIS.len());
    let mut cut: String = text.chars().take(keep).collect();
    let ends_on_boundary = text.chars().nth(keep).is_some_and(char::is_whitespace);
    if !ends_on_boundary {
        if let Some(space) = cut.rfind(char::is_whitespace).filter(|&i| i > 0) {
            cut.truncate(space);
        }
    }
    format!("{}{ELLIPSIS}", cut.trim_end())
}

pub struct SmsOrchestrator {
    engine: Arc<ConversationEngine>,
    char_budget: usize,
    opt_out_first: bool,
}

impl SmsOrchestrator {
    pub fn new(engine: Arc<ConversationEngine>, char_budget: usize, opt_out_first: bool) -> Self {
        Self {
            engine,
            char_budget,
            opt_out_first,
        }
    }

    /// Push the approved version of a lesson (or its base content) as one SMS
    pub async fn send_lesson_snippet(
        &self,
        slot: &SessionSlot,
        lesson_id: i64,
    ) -> Result<TurnOutcome, SessionError> {
        let store = self.engine.store();
        let lesson = store
            .lookup_lesson(lesson_id)
            .await?
            .filter(|lesson| lesson.is_active)
            .ok_or(SessionError::LessonUnavailable(lesson_id))?;

        let approved = store.lookup_approved_lesson_version(lesson_id).await?;
        let from_approved = approved.is_some();
        let content = approved.unwrap_or(lesson.content);
        let message = truncate_for_sms(&content, self.char_budget);
        let truncated = message != content;

        tracing::info!(
            session_id = %slot.id,
            lesson_id,
            from_approved,
            truncated,
            "Sending lesson snippet"
        );

        let exchange = Exchange {
            role: TurnRole::Assistant,
            user_input: None,
            update: Some(ContextUpdate::new().lesson(lesson_id)),
            metadata: json!({ "lesson_id": lesson_id, "approved_version": from_approved }),
            ..Exchange::reply("", message)
        };
        let reply = self.engine.record_exchange(slot, exchange).await?;
        Ok(self.outcome(&reply, false, false, truncated))
    }

    fn outcome(
        &self,
        reply: &EngineReply,
        opt_out: bool,
        acknowledged: bool,
        truncated: bool,
    ) -> TurnOutcome {
        TurnOutcome::from_reply(
            reply,
            ChannelExtras::Sms {
                opt_out,
                acknowledged,
                truncated,
            },
        )
    }
}

#[async_trait]
impl ChannelOrchestrator for SmsOrchestrator {
    fn channel(&self) -> Channel {
        Channel::Sms
    }

    async fn process(
        &self,
        slot: &SessionSlot,
        payload: InboundPayload,
    ) -> Result<TurnOutcome, SessionError> {
        let InboundPayload::Text { text } = payload else {
            return Err(SessionError::UnsupportedPayload(Channel::Sms));
        };

        let opt_out_keyword = SMS_OPT_OUT.first_match(&text);
        let verdict = self.engine.gate().check_input(&text);

        if let Some(keyword) = opt_out_keyword {
            if self.opt_out_first || !verdict.should_escalate {
                let reply = opt_out(&self.engine, slot, &text, keyword).await?;
                return Ok(self.outcome(&reply, true, false, false));
            }
        }

        // Flagged input goes through the engine, which escalates or redirects
        if !verdict.is_flagged() && ACKNOWLEDGMENT.matches(&text) {
            let exchange = Exchange {
                metadata: json!({ "acknowledgment": true }),
                ..Exchange::reply(text.as_str(), ACK_REPLY)
            };
            let reply = self.engine.record_exchange(slot, exchange).await?;
            return Ok(self.outcome(&reply, false, true, false));
        }

        let mut reply = self.engine.run_turn(slot, TurnRequest::stateless(text)).await?;
        let message = truncate_for_sms(&reply.response, self.char_budget);
        let truncated = message != reply.response;
        reply.response = message;
        Ok(self.outcome(&reply, false, false, truncated))
    }
}
