//! Environment-driven configuration
//!
//! Every setting has a default so a bare environment still boots. Values are
//! handed to constructors explicitly; nothing reads the environment after
//! startup.

use crate::escalation::EmergencyContact;
use crate::llm::OpenAiConfig;
use crate::safety::EscalationPolicy;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub db_path: PathBuf,
    pub audio_dir: PathBuf,
    /// Local recordings may only be read from here
    pub recordings_dir: PathBuf,
    pub openai_api_key: Option<String>,
    pub llm_gateway: Option<String>,
    pub llm_model: String,
    pub asr_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    pub sms_char_budget: usize,
    pub escalation_lookback: usize,
    pub escalation_threshold: usize,
    /// An opt-out keyword wins over an emergency phrase in the same message
    pub opt_out_precedes_safety: bool,
    pub default_language: String,
    pub session_idle_timeout: Duration,
    pub emergency_number: String,
    pub emergency_service: String,
}

impl Default for Config {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; unset or unparsable values fall back to defaults
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let home = lookup("HOME").unwrap_or_else(|| "/tmp".to_string());
        let data_dir = PathBuf::from(home).join(".carearena");
        let contact = EmergencyContact::default();
        let policy = EscalationPolicy::default();

        let string = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        Self {
            db_path: lookup("CAREARENA_DB_PATH")
                .map_or_else(|| data_dir.join("carearena.db"), PathBuf::from),
            audio_dir: lookup("CAREARENA_AUDIO_DIR")
                .map_or_else(|| data_dir.join("audio"), PathBuf::from),
            recordings_dir: lookup("CAREARENA_RECORDINGS_DIR")
                .map_or_else(|| data_dir.join("recordings"), PathBuf::from),
            openai_api_key: non_empty("OPENAI_API_KEY"),
            llm_gateway: non_empty("CAREARENA_LLM_GATEWAY"),
            llm_model: string("CAREARENA_LLM_MODEL", "gpt-4o"),
            asr_model: string("CAREARENA_ASR_MODEL", "whisper-1"),
            tts_model: string("CAREARENA_TTS_MODEL", "tts-1"),
            tts_voice: string("CAREARENA_TTS_VOICE", "alloy"),
            sms_char_budget: parsed(&lookup, "CAREARENA_SMS_CHAR_BUDGET")
                .unwrap_or(crate::channels::sms::DEFAULT_CHAR_BUDGET),
            escalation_lookback: parsed(&lookup, "CAREARENA_ESCALATION_LOOKBACK")
                .unwrap_or(policy.lookback),
            escalation_threshold: parsed(&lookup, "CAREARENA_ESCALATION_THRESHOLD")
                .unwrap_or(policy.threshold),
            opt_out_precedes_safety: lookup("CAREARENA_OPT_OUT_PRECEDES_SAFETY")
                .and_then(|v| parse_bool(&v))
                .unwrap_or(true),
            default_language: string("CAREARENA_DEFAULT_LANGUAGE", "en"),
            session_idle_timeout: Duration::from_secs(
                parsed(&lookup, "CAREARENA_SESSION_IDLE_TIMEOUT_SECS").unwrap_or(900),
            ),
            emergency_number: string("CAREARENA_EMERGENCY_NUMBER", &contact.number),
            emergency_service: string("CAREARENA_EMERGENCY_SERVICE", &contact.service),
        }
    }

    pub fn escalation_policy(&self) -> EscalationPolicy {
        EscalationPolicy {
            lookback: self.escalation_lookback,
            threshold: self.escalation_threshold,
        }
    }

    pub fn emergency_contact(&self) -> EmergencyContact {
        EmergencyContact {
            number: self.emergency_number.clone(),
            service: self.emergency_service.clone(),
        }
    }

    /// Provider settings, or `None` without an API key
    pub fn openai(&self) -> Option<OpenAiConfig> {
        let api_key = self.openai_api_key.clone()?;
        Some(OpenAiConfig {
            api_key,
            gateway: self.llm_gateway.clone(),
            chat_model: self.llm_model.clone(),
            asr_model: self.asr_model.clone(),
            tts_model: self.tts_model.clone(),
            tts_voice: self.tts_voice.clone(),
            audio_dir: self.audio_dir.clone(),
            recordings_dir: self.recordings_dir.clone(),
        })
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparsable setting");
            None
        }
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
