//! CareArena conversation core
//!
//! Drives patient health-education sessions over voice, SMS and chat:
//! a guarded dialogue state machine, a keyword safety gate, channel
//! orchestrators, and escalation to human care workers.

pub mod channels;
pub mod config;
pub mod db;
pub mod engine;
pub mod escalation;
pub mod lexicon;
pub mod llm;
pub mod prompt;
pub mod runtime;
pub mod safety;
pub mod state_machine;

pub use channels::{InboundPayload, TurnOutcome};
pub use config::Config;
pub use runtime::{SessionError, SessionHandle, SessionManager, StartOptions};
