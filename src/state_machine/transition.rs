//! Legal transition graph and the FSM that enforces it
//!
//! The adjacency table is an exhaustive match over the closed state enum, so
//! an entry naming a state that does not exist cannot compile.

use super::state::{ContextUpdate, ConversationContext, ConversationState};
use thiserror::Error;

use ConversationState::{
    ConfirmSchedule, DeliverLessonBrief, DeliverLessonDetailed, DeliverLessonIntro,
    EmergencyFallback, EndSession, EngagementCheck, Greeting, OptInPrompt, SafeRedirect,
    ScheduleOffer, SessionStart, TopicIntro,
};

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        from: ConversationState,
        to: ConversationState,
    },
}

/// Adjacency set of a state
pub fn successors(state: ConversationState) -> &'static [ConversationState] {
    match state {
        SessionStart => &[OptInPrompt, EmergencyFallback, EndSession],
        OptInPrompt => &[Greeting, EndSession, EmergencyFallback],
        Greeting => &[TopicIntro, EmergencyFallback, EndSession],
        TopicIntro => &[DeliverLessonIntro, SafeRedirect, EmergencyFallback, EndSession],
        DeliverLessonIntro => &[
            DeliverLessonBrief,
            EngagementCheck,
            SafeRedirect,
            EmergencyFallback,
            EndSession,
        ],
        DeliverLessonBrief => &[
            DeliverLessonDetailed,
            EngagementCheck,
            SafeRedirect,
            EmergencyFallback,
            EndSession,
        ],
        DeliverLessonDetailed => &[
            EngagementCheck,
            ScheduleOffer,
            SafeRedirect,
            EmergencyFallback,
            EndSession,
        ],
        EngagementCheck => &[DeliverLessonDetailed, ScheduleOffer, EndSession, EmergencyFallback],
        ScheduleOffer => &[ConfirmSchedule, EndSession, EmergencyFallback],
        ConfirmSchedule | SafeRedirect => &[EndSession, EmergencyFallback],
        EmergencyFallback => &[EndSession],
        EndSession => &[],
    }
}

/// Pure query: is `to` in the adjacency set of `from`?
pub fn is_valid_transition(from: ConversationState, to: ConversationState) -> bool {
    successors(from).contains(&to)
}

/// Shortest legal route to `EndSession`, excluding the starting state
///
/// Every non-terminal state either links to `EndSession` directly or through
/// `EmergencyFallback`.
pub fn path_to_end(from: ConversationState) -> Vec<ConversationState> {
    if from.is_terminal() {
        vec![]
    } else if is_valid_transition(from, EndSession) {
        vec![EndSession]
    } else {
        vec![EmergencyFallback, EndSession]
    }
}

/// Current state plus context for one live session
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationFsm {
    current: ConversationState,
    context: ConversationContext,
}

impl Default for ConversationFsm {
    fn default() -> Self {
        Self::new(SessionStart)
    }
}

impl ConversationFsm {
    pub fn new(initial: ConversationState) -> Self {
        Self {
            current: initial,
            context: ConversationContext::default(),
        }
    }

    pub fn with_context(initial: ConversationState, context: ConversationContext) -> Self {
        Self {
            current: initial,
            context,
        }
    }

    pub fn current_state(&self) -> ConversationState {
        self.current
    }

    pub fn context(&self) -> &ConversationContext {
        &self.context
    }

    pub fn is_valid_transition(&self, from: ConversationState, to: ConversationState) -> bool {
        is_valid_transition(from, to)
    }

    /// Move to `to`, merging `update` into the context.
    ///
    /// On error neither the state nor the context changes.
    pub fn transition(
        &mut self,
        to: ConversationState,
        update: Option<ContextUpdate>,
    ) -> Result<ConversationState, TransitionError> {
        if !is_valid_transition(self.current, to) {
            return Err(TransitionError::InvalidTransition {
                from: self.current,
                to,
            });
        }
        let from = std::mem::replace(&mut self.current, to);
        if let Some(update) = update {
            self.context.apply(update);
        }
        tracing::debug!(from = %from, to = %to, "FSM transition");
        Ok(from)
    }

    /// Context change without a state change (e.g. opt-out revokes consent)
    pub fn update_context(&mut self, update: ContextUpdate) {
        self.context.apply(update);
    }

    /// Drive to `EndSession` along legal edges
    pub fn close(&mut self) -> Result<(), TransitionError> {
        for step in path_to_end(self.current) {
            self.transition(step, None)?;
        }
        Ok(())
    }
}
