//! Versioned keyword rule set for the safety gate
//!
//! Rules are plain data: an ordered list of `(phrase, verdict)` pairs for
//! patient input and `(phrase, violation kind)` pairs for generated output.
//! Input rules are evaluated in list order and the first hit wins, so the
//! list order *is* the priority order. Phrases are matched as lowercase
//! substrings.

use super::verdict::{EscalationReason, SafetyVerdict, Severity, ViolationKind};

const EMERGENCY: &[&str] = &[
    "emergency",
    "urgent",
    "severe pain",
    "can't breathe",
    "cannot breathe",
    "unconscious",
    "chest pain",
    "heart attack",
    "stroke",
    "bleeding heavily",
    "seizure",
];

const SYMPTOM: &[&str] = &[
    "pain",
    "ache",
    "bleeding",
    "fever",
    "nausea",
    "vomiting",
    "dizziness",
    "shortness of breath",
    "chest pain",
    "headache",
    "cramps",
    "swelling",
    "blurred vision",
];

const DIAGNOSIS_REQUEST: &[&str] = &[
    "do i have",
    "what do i have",
    "what's wrong with me",
    "what is wrong with me",
    "diagnose me",
    "can you diagnose",
    "is it serious",
];

const ADVICE_REQUEST: &[&str] = &[
    "what should i take",
    "should i take",
    "can i take",
    "what medicine",
    "what medication",
    "how much should i take",
    "what drug",
];

const DIAGNOSIS_OUTPUT: &[&str] = &[
    "diagnose",
    "diagnosis",
    "you have",
    "you've got",
    "you're suffering from",
    "you're sick with",
    "you're infected with",
];

const ADVICE_OUTPUT: &[&str] = &[
    "you should take",
    "you need to",
    "prescribe",
    "medication",
    "treatment",
    "you must",
    "you have to",
];

const SYMPTOM_OUTPUT: &[&str] = SYMPTOM;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputRule {
    pub phrase: String,
    pub verdict: SafetyVerdict,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputRule {
    pub phrase: String,
    pub kind: ViolationKind,
}

/// Ordered, versioned rule data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSet {
    version: String,
    input: Vec<InputRule>,
    output: Vec<OutputRule>,
}

impl Default for RuleSet {
    fn default() -> Self {
        Self::v1()
    }
}

impl RuleSet {
    /// Empty rule set; matches nothing
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            input: Vec::new(),
            output: Vec::new(),
        }
    }

    /// Built-in keyword lists: emergency > symptom > diagnosis request > advice request
    pub fn v1() -> Self {
        Self::new("v1")
            .with_input_group(
                EMERGENCY,
                SafetyVerdict::escalate(EscalationReason::Emergency, Severity::Critical),
            )
            .with_input_group(
                SYMPTOM,
                SafetyVerdict::escalate(EscalationReason::SymptomsMentioned, Severity::High),
            )
            .with_input_group(
                DIAGNOSIS_REQUEST,
                SafetyVerdict::redirect(EscalationReason::DiagnosisRequested, Severity::Medium),
            )
            .with_input_group(
                ADVICE_REQUEST,
                SafetyVerdict::redirect(EscalationReason::MedicalAdviceRequested, Severity::Medium),
            )
            .with_output_group(DIAGNOSIS_OUTPUT, ViolationKind::Diagnosis)
            .with_output_group(ADVICE_OUTPUT, ViolationKind::MedicalAdvice)
            .with_output_group(SYMPTOM_OUTPUT, ViolationKind::SymptomHandling)
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// Append an input rule at the lowest priority
    pub fn with_input(mut self, phrase: &str, verdict: SafetyVerdict) -> Self {
        self.input.push(InputRule {
            phrase: phrase.to_lowercase(),
            verdict,
        });
        self
    }

    pub fn with_output(mut self, phrase: &str, kind: ViolationKind) -> Self {
        self.output.push(OutputRule {
            phrase: phrase.to_lowercase(),
            kind,
        });
        self
    }

    fn with_input_group(self, phrases: &[&str], verdict: SafetyVerdict) -> Self {
        phrases
            .iter()
            .fold(self, |rules, phrase| rules.with_input(phrase, verdict))
    }

    fn with_output_group(self, phrases: &[&str], kind: ViolationKind) -> Self {
        phrases
            .iter()
            .fold(self, |rules, phrase| rules.with_output(phrase, kind))
    }

    pub fn input_rules(&self) -> &[InputRule] {
        &self.input
    }

    pub fn output_rules(&self) -> &[OutputRule] {
        &self.output
    }

    /// First input rule contained in `lowered`
    pub fn first_input_match(&self, lowered: &str) -> Option<&InputRule> {
        self.input.iter().find(|rule| lowered.contains(&rule.phrase))
    }

    /// First matching output rule per violation kind, in rule order
    pub fn output_matches(&self, lowered: &str) -> Vec<&OutputRule> {
        let mut hits: Vec<&OutputRule> = Vec::new();
        for rule in &self.output {
            if hits.iter().any(|h| h.kind == rule.kind) {
                continue;
            }
            if lowered.contains(&rule.phrase) {
                hits.push(rule);
            }
        }
        hits
    }
}
