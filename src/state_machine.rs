//! Conversation state machine
//!
//! A closed set of dialogue states, a fixed table of legal transitions, and
//! the per-session FSM that enforces it. Nothing here performs I/O.

pub mod progression;
pub mod state;
pub mod transition;


pub use progression::{context_update_for, next_state};
pub use state::{ContextUpdate, ConversationContext, ConversationState};
pub use transition::{is_valid_transition, successors, ConversationFsm, TransitionError};
