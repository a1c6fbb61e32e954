//! Prompt construction for reply generation
//!
//! Builds the per-turn user prompt from the current state, context and recent
//! history, and carries the fixed safety rules sent as the system prompt.

use crate::llm::GenerationRequest;
use crate::state_machine::ConversationState;
use std::fmt::Write;

/// Number of prior turns included in the prompt
pub const HISTORY_WINDOW: usize = 3;

/// Safety rules sent with every generation request
pub const SYSTEM_PROMPT: &str = r"You are a helpful health education assistant for CareArena, specializing in preeclampsia education.

CRITICAL RULES:
1. You CANNOT diagnose medical conditions
2. You CANNOT provide medical advice
3. You CANNOT prescribe medications
4. If the patient mentions symptoms, redirect them to consult a healthcare provider
5. If there's an emergency, escalate immediately
6. Only deliver pre-approved educational content
7. Be conversational, empathetic, and culturally sensitive
8. Support multiple languages: English, Twi, Ga, Ewe

Your role is to educate, not to diagnose or treat.";

/// Instruction for the state the session is in
pub fn state_instruction(state: Option<ConversationState>) -> &'static str {
    use ConversationState as S;
    match state {
        Some(S::OptInPrompt) => "Ask the patient if they consent to receive health education.",
        Some(S::Greeting) => "Greet the patient warmly and introduce CareArena.",
        Some(S::TopicIntro) => "Introduce the topic of preeclampsia education.",
        Some(S::DeliverLessonIntro) => "Deliver a brief introduction to the lesson.",
        Some(S::DeliverLessonBrief) => "Deliver a brief summary of the lesson content.",
        Some(S::DeliverLessonDetailed) => "Deliver detailed lesson content about preeclampsia.",
        Some(S::EngagementCheck) => "Check if the patient wants to continue learning.",
        Some(S::ScheduleOffer) => "Offer to schedule future lessons.",
        Some(S::ConfirmSchedule) => "Confirm the schedule preference with the patient.",
        Some(
            S::SessionStart | S::SafeRedirect | S::EmergencyFallback | S::EndSession,
        )
        | None => "Continue the conversation naturally.",
    }
}

/// Assemble the user prompt for one generation request
pub fn build_prompt(request: &GenerationRequest) -> String {
    let mut prompt = state_instruction(request.state).to_string();

    if let Some(lesson_id) = request.context.lesson_id {
        let _ = write!(prompt, "\nCurrent lesson ID: {lesson_id}");
    }
    if request.language != "en" {
        let _ = write!(prompt, "\nRespond in language: {}", request.language);
    }

    let recent = &request.history[request.history.len().saturating_sub(HISTORY_WINDOW)..];
    if !recent.is_empty() {
        prompt.push_str("\n\nConversation history:");
        for turn in recent {
            if let Some(input) = &turn.user_input {
                let _ = write!(prompt, "\nuser: {input}");
            }
            if let Some(reply) = &turn.assistant_response {
                let _ = write!(prompt, "\nassistant: {reply}");
            }
        }
    }

    let _ = write!(prompt, "\n\nUser input: {}", request.user_input);
    prompt.push_str(
        "\n\nGenerate a natural, conversational response. Do NOT provide medical diagnosis or advice.",
    );
    prompt
}
