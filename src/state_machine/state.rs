//! Conversation state types

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

// ============================================================================
// Conversation State
// ============================================================================

/// Closed set of dialogue states a session moves through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    #[default]
    SessionStart,
    OptInPrompt,
    Greeting,
    TopicIntro,
    DeliverLessonIntro,
    DeliverLessonBrief,
    DeliverLessonDetailed,
    EngagementCheck,
    ScheduleOffer,
    ConfirmSchedule,
    SafeRedirect,
    EmergencyFallback,
    EndSession,
}

impl ConversationState {
    /// Every state, in declaration order
    pub const ALL: [ConversationState; 13] = [
        ConversationState::SessionStart,
        ConversationState::OptInPrompt,
        ConversationState::Greeting,
        ConversationState::TopicIntro,
        ConversationState::DeliverLessonIntro,
        ConversationState::DeliverLessonBrief,
        ConversationState::DeliverLessonDetailed,
        ConversationState::EngagementCheck,
        ConversationState::ScheduleOffer,
        ConversationState::ConfirmSchedule,
        ConversationState::SafeRedirect,
        ConversationState::EmergencyFallback,
        ConversationState::EndSession,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationState::SessionStart => "session_start",
            ConversationState::OptInPrompt => "opt_in_prompt",
            ConversationState::Greeting => "greeting",
            ConversationState::TopicIntro => "topic_intro",
            ConversationState::DeliverLessonIntro => "deliver_lesson_intro",
            ConversationState::DeliverLessonBrief => "deliver_lesson_brief",
            ConversationState::DeliverLessonDetailed => "deliver_lesson_detailed",
            ConversationState::EngagementCheck => "engagement_check",
            ConversationState::ScheduleOffer => "schedule_offer",
            ConversationState::ConfirmSchedule => "confirm_schedule",
            ConversationState::SafeRedirect => "safe_redirect",
            ConversationState::EmergencyFallback => "emergency_fallback",
            ConversationState::EndSession => "end_session",
        }
    }

    /// Parse the persisted snake_case name
    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|state| state.as_str() == s)
    }

    /// No transition leaves a terminal state
    pub fn is_terminal(self) -> bool {
        matches!(self, ConversationState::EndSession)
    }
}

impl fmt::Display for ConversationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Conversation Context
// ============================================================================

/// Mutable per-session context, only changed through FSM transitions
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationContext {
    pub consent_granted: bool,
    pub lesson_id: Option<i64>,
    pub schedule_preference: Option<String>,
    pub engagement_level: Option<String>,
    /// Channel-specific keys
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl ConversationContext {
    pub fn with_lesson(lesson_id: Option<i64>) -> Self {
        Self {
            lesson_id,
            ..Self::default()
        }
    }

    /// Merge an update; fields present in the update win
    pub fn apply(&mut self, update: ContextUpdate) {
        if let Some(consent) = update.consent_granted {
            self.consent_granted = consent;
        }
        if let Some(lesson_id) = update.lesson_id {
            self.lesson_id = Some(lesson_id);
        }
        if let Some(pref) = update.schedule_preference {
            self.schedule_preference = Some(pref);
        }
        if let Some(level) = update.engagement_level {
            self.engagement_level = Some(level);
        }
        self.extra.extend(update.extra);
    }
}

/// Partial context change carried by a transition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ContextUpdate {
    pub consent_granted: Option<bool>,
    pub lesson_id: Option<i64>,
    pub schedule_preference: Option<String>,
    pub engagement_level: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl ContextUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consent(mut self, granted: bool) -> Self {
        self.consent_granted = Some(granted);
        self
    }

    pub fn lesson(mut self, lesson_id: i64) -> Self {
        self.lesson_id = Some(lesson_id);
        self
    }

    pub fn schedule_preference(mut self, pref: impl Into<String>) -> Self {
        self.schedule_preference = Some(pref.into());
        self
    }

    pub fn engagement(mut self, level: impl Into<String>) -> Self {
        self.engagement_level = Some(level.into());
        self
    }

    /// Later inserts of the same key overwrite earlier ones
    pub fn extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}
