//! Keyword lexicons for short conversational replies
//!
//! Short words ("ok", "end", "yes") are matched as whole words, case
//! insensitive, so "look" does not read as "ok" and "yesterday" does not read
//! as consent. Safety phrases do not go through here (see `safety::rules`).

use regex::Regex;
use std::sync::LazyLock;

/// A named list of words compiled into one whole-word matcher
#[derive(Debug)]
pub struct Lexicon {
    name: &'static str,
    words: &'static [&'static str],
    pattern: Option<Regex>,
}

impl Lexicon {
    pub fn new(name: &'static str, words: &'static [&'static str]) -> Self {
        let alternation = words
            .iter()
            .map(|w| regex::escape(w))
            .collect::<Vec<_>>()
            .join("|");
        let pattern = Regex::new(&format!(r"(?i)\b(?:{alternation})\b")).ok();
        if pattern.is_none() {
            tracing::warn!(lexicon = name, "Lexicon pattern failed to compile, using substring matching");
        }
        Self {
            name,
            words,
            pattern,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn words(&self) -> &'static [&'static str] {
        self.words
    }

    pub fn matches(&self, text: &str) -> bool {
        self.first_match(text).is_some()
    }

    /// The first listed word that occurs in `text`
    pub fn first_match(&self, text: &str) -> Option<&'static str> {
        match &self.pattern {
            Some(pattern) => {
                let found = pattern.find(text)?.as_str().to_lowercase();
                self.words.iter().copied().find(|w| *w == found)
            }
            None => {
                let lower = text.to_lowercase();
                self.words.iter().copied().find(|w| lower.contains(w))
            }
        }
    }
}

/// Consent / agreement at decision points
pub static AFFIRMATIVE: LazyLock<Lexicon> = LazyLock::new(|| {
    Lexicon::new(
        "affirmative",
        &["yes", "yeah", "yep", "ok", "okay", "sure", "start", "i agree"],
    )
});

/// Wants more lesson content at the engagement check
pub static CONTINUE: LazyLock<Lexicon> = LazyLock::new(|| {
    Lexicon::new("continue", &["yes", "continue", "more", "next", "go on"])
});

/// Refusals and negations; any of these overrides an agreeing word
pub static NEGATIVE: LazyLock<Lexicon> = LazyLock::new(|| {
    Lexicon::new(
        "negative",
        &["no", "not", "nope", "never", "don't", "don’t", "dont", "do not", "refuse", "decline"],
    )
});

/// `lexicon` matches and nothing in `text` negates it
pub fn affirms(lexicon: &Lexicon, text: &str) -> bool {
    lexicon.matches(text) && !NEGATIVE.matches(text)
}

/// SMS opt-out, including the carrier-standard END keyword
pub static SMS_OPT_OUT: LazyLock<Lexicon> = LazyLock::new(|| {
    Lexicon::new(
        "sms_opt_out",
        &["stop", "unsubscribe", "cancel", "opt out", "quit", "end"],
    )
});

/// Chat opt-out ("end" is too common in free chat to treat as a keyword)
pub static CHAT_OPT_OUT: LazyLock<Lexicon> = LazyLock::new(|| {
    Lexicon::new(
        "chat_opt_out",
        &["stop", "unsubscribe", "cancel", "opt out", "quit"],
    )
});

/// SMS receipt acknowledgments
pub static ACKNOWLEDGMENT: LazyLock<Lexicon> = LazyLock::new(|| {
    Lexicon::new(
        "acknowledgment",
        &["ok", "okay", "yes", "received", "thanks", "thank you"],
    )
});
