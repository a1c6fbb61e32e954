//! Safety gate
//!
//! Screens patient input and generated replies against a keyword rule set.
//! Every check here is pure and synchronous; persisting audit events and
//! escalations is the caller's job.

pub mod rules;
pub mod verdict;

pub use rules::RuleSet;
pub use verdict::{
    EscalationReason, OutputValidation, SafetyVerdict, Severity, Violation, ViolationKind,
};

use crate::runtime::Turn;
use std::sync::Arc;

/// Turn-window escalation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationPolicy {
    /// Number of most recent turns inspected
    pub lookback: usize,
    /// Flagged turns within the window that trigger escalation
    pub threshold: usize,
}

impl Default for EscalationPolicy {
    fn default() -> Self {
        Self {
            lookback: 3,
            threshold: 2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SafetyGate {
    rules: Arc<RuleSet>,
    policy: EscalationPolicy,
}

impl Default for SafetyGate {
    fn default() -> Self {
        Self::new(RuleSet::v1(), EscalationPolicy::default())
    }
}

impl SafetyGate {
    pub fn new(rules: RuleSet, policy: EscalationPolicy) -> Self {
        Self {
            rules: Arc::new(rules),
            policy,
        }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn policy(&self) -> EscalationPolicy {
        self.policy
    }

    /// Single-label classification of patient input; first rule hit wins
    pub fn check_input(&self, text: &str) -> SafetyVerdict {
        let lowered = text.to_lowercase();
        match self.rules.first_input_match(&lowered) {
            Some(rule) => {
                tracing::debug!(
                    phrase = %rule.phrase,
                    reason = %rule.verdict.reason,
                    severity = %rule.verdict.severity,
                    rules = self.rules.version(),
                    "Input matched safety rule"
                );
                rule.verdict
            }
            None => SafetyVerdict::SAFE,
        }
    }

    /// Multi-label validation of generated text
    pub fn validate_output(&self, text: &str) -> OutputValidation {
        let lowered = text.to_lowercase();
        let violations = self
            .rules
            .output_matches(&lowered)
            .into_iter()
            .map(|rule| Violation::new(rule.kind, rule.phrase.clone()))
            .collect();
        OutputValidation::from_violations(violations)
    }

    /// Pattern check over the most recent turns
    pub fn should_escalate(&self, history: &[Turn]) -> bool {
        let window = &history[history.len().saturating_sub(self.policy.lookback)..];

        let flagged = window.iter().filter(|t| t.safety_violation).count();
        if flagged >= self.policy.threshold {
            return true;
        }

        window
            .iter()
            .filter_map(|t| t.user_input.as_deref())
            .any(|input| self.check_input(input).should_escalate)
    }
}
