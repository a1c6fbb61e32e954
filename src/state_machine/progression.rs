//! Dialogue progression rules
//!
//! Deterministic successor lookup keyed by the current state. Only the three
//! decision points (opt-in, engagement check, schedule offer) look at what the
//! patient said.

use super::state::{ContextUpdate, ConversationState};
use crate::lexicon::{affirms, AFFIRMATIVE, CONTINUE};

use ConversationState::{
    ConfirmSchedule, DeliverLessonBrief, DeliverLessonDetailed, DeliverLessonIntro,
    EmergencyFallback, EndSession, EngagementCheck, Greeting, OptInPrompt, SafeRedirect,
    ScheduleOffer, SessionStart, TopicIntro,
};

/// Next state after a normal turn, or `None` to stay put
pub fn next_state(
    current: ConversationState,
    user_input: &str,
    _generated_response: &str,
) -> Option<ConversationState> {
    match current {
        SessionStart => Some(OptInPrompt),
        OptInPrompt => Some(if affirms(&AFFIRMATIVE, user_input) {
            Greeting
        } else {
            EndSession
        }),
        Greeting => Some(TopicIntro),
        TopicIntro => Some(DeliverLessonIntro),
        DeliverLessonIntro => Some(DeliverLessonBrief),
        DeliverLessonBrief => Some(EngagementCheck),
        EngagementCheck => Some(if affirms(&CONTINUE, user_input) {
            DeliverLessonDetailed
        } else {
            ScheduleOffer
        }),
        DeliverLessonDetailed => Some(ScheduleOffer),
        ScheduleOffer => Some(if affirms(&AFFIRMATIVE, user_input) {
            ConfirmSchedule
        } else {
            EndSession
        }),
        ConfirmSchedule | SafeRedirect => Some(EndSession),
        EmergencyFallback | EndSession => None,
    }
}

/// Context recorded when a decision point is resolved
pub fn context_update_for(
    from: ConversationState,
    to: ConversationState,
    user_input: &str,
) -> Option<ContextUpdate> {
    match (from, to) {
        (OptInPrompt, Greeting) => Some(ContextUpdate::new().consent(true)),
        (OptInPrompt, EndSession) => Some(ContextUpdate::new().consent(false)),
        (EngagementCheck, DeliverLessonDetailed) => Some(ContextUpdate::new().engagement("continue")),
        (EngagementCheck, ScheduleOffer) => Some(ContextUpdate::new().engagement("declined")),
        (ScheduleOffer, ConfirmSchedule) => {
            Some(ContextUpdate::new().schedule_preference(user_input.trim()))
        }
        _ => None,
    }
}
