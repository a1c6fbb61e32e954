//! Safety classification results

use serde::{Deserialize, Serialize};
use std::fmt;

/// Ordered severity level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Severity::Low),
            "medium" => Some(Severity::Medium),
            "high" => Some(Severity::High),
            "critical" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cause attached to a verdict or an escalation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EscalationReason {
    Emergency,
    SymptomsMentioned,
    MedicalAdviceRequested,
    DiagnosisRequested,
    PolicyViolation,
    #[default]
    None,
}

impl EscalationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EscalationReason::Emergency => "emergency",
            EscalationReason::SymptomsMentioned => "symptoms_mentioned",
            EscalationReason::MedicalAdviceRequested => "medical_advice_requested",
            EscalationReason::DiagnosisRequested => "diagnosis_requested",
            EscalationReason::PolicyViolation => "policy_violation",
            EscalationReason::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            EscalationReason::Emergency,
            EscalationReason::SymptomsMentioned,
            EscalationReason::MedicalAdviceRequested,
            EscalationReason::DiagnosisRequested,
            EscalationReason::PolicyViolation,
            EscalationReason::None,
        ]
        .into_iter()
        .find(|r| r.as_str() == s)
    }
}

impl fmt::Display for EscalationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of screening one piece of patient input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyVerdict {
    pub should_escalate: bool,
    pub reason: EscalationReason,
    pub severity: Severity,
}

impl SafetyVerdict {
    pub const SAFE: SafetyVerdict = SafetyVerdict {
        should_escalate: false,
        reason: EscalationReason::None,
        severity: Severity::Low,
    };

    pub const fn escalate(reason: EscalationReason, severity: Severity) -> Self {
        Self {
            should_escalate: true,
            reason,
            severity,
        }
    }

    pub const fn redirect(reason: EscalationReason, severity: Severity) -> Self {
        Self {
            should_escalate: false,
            reason,
            severity,
        }
    }

    /// Matched some rule, escalating or not
    pub fn is_flagged(&self) -> bool {
        self.reason != EscalationReason::None
    }
}

impl Default for SafetyVerdict {
    fn default() -> Self {
        Self::SAFE
    }
}

// ============================================================================
// Output validation
// ============================================================================

/// Families of unsafe content in generated text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    Diagnosis,
    MedicalAdvice,
    SymptomHandling,
}

impl ViolationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ViolationKind::Diagnosis => "diagnosis",
            ViolationKind::MedicalAdvice => "medical_advice",
            ViolationKind::SymptomHandling => "symptom_handling",
        }
    }

    pub fn severity(self) -> Severity {
        match self {
            ViolationKind::Diagnosis => Severity::Critical,
            ViolationKind::MedicalAdvice => Severity::High,
            ViolationKind::SymptomHandling => Severity::Medium,
        }
    }

    /// Symptom mentions are redirected but not audited
    pub fn requires_audit(self) -> bool {
        !matches!(self, ViolationKind::SymptomHandling)
    }

    /// Event type recorded in the audit log
    pub fn audit_event_type(self) -> &'static str {
        match self {
            ViolationKind::Diagnosis => "diagnosis_attempted",
            ViolationKind::MedicalAdvice => "medical_advice_attempted",
            ViolationKind::SymptomHandling => "symptom_handling",
        }
    }

    fn message(self) -> &'static str {
        match self {
            ViolationKind::Diagnosis => "Response contains potential diagnosis",
            ViolationKind::MedicalAdvice => "Response contains medical advice",
            ViolationKind::SymptomHandling => "Response discusses symptoms",
        }
    }
}

impl fmt::Display for ViolationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub message: String,
    /// Phrase that triggered the violation
    pub matched: String,
}

impl Violation {
    pub fn new(kind: ViolationKind, matched: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            message: kind.message().to_string(),
            matched: matched.into(),
        }
    }
}

/// Multi-label validation of one generated reply
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OutputValidation {
    pub is_valid: bool,
    pub violations: Vec<Violation>,
    pub should_redirect: bool,
}

impl OutputValidation {
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        let is_valid = violations.is_empty();
        Self {
            is_valid,
            should_redirect: !is_valid,
            violations,
        }
    }

    pub fn has(&self, kind: ViolationKind) -> bool {
        self.violations.iter().any(|v| v.kind == kind)
    }

    /// Violations that must be written to the audit log
    pub fn audited(&self) -> impl Iterator<Item = &Violation> {
        self.violations.iter().filter(|v| v.kind.requires_audit())
    }
}
