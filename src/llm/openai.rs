//! `OpenAI` provider implementation
//!
//! Chat completions for reply generation, Whisper for transcription and the
//! speech endpoint for synthesis.

use super::{CapabilityError, Generation, GenerationRequest};
use crate::prompt::{build_prompt, SYSTEM_PROMPT};
use crate::runtime::traits::{ResponseGenerator, SpeechSynthesizer, Transcriber};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";
const MAX_TOKENS: u32 = 500;
const TEMPERATURE: f32 = 0.7;

/// Connection and model settings
#[derive(Debug, Clone)]
pub struct OpenAiConfig {
    pub api_key: String,
    /// Gateway override; `None` talks to api.openai.com directly
    pub gateway: Option<String>,
    pub chat_model: String,
    pub asr_model: String,
    pub tts_model: String,
    pub tts_voice: String,
    /// Where synthesized audio files are written
    pub audio_dir: PathBuf,
    /// Only local recordings under this directory are uploaded
    pub recordings_dir: PathBuf,
}

/// `OpenAI` service implementing all three capabilities
pub struct OpenAiService {
    client: Client,
    config: OpenAiConfig,
    base_url: String,
}

impl OpenAiService {
    pub fn new(config: OpenAiConfig) -> Result<Self, CapabilityError> {
        let base_url = match &config.gateway {
            Some(gw) => format!("{}/openai/v1", gw.trim_end_matches('/')),
            None => DEFAULT_BASE_URL.to_string(),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| CapabilityError::unknown(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            config,
            base_url,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url)
    }

    /// Turn a non-success response into a classified error
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, CapabilityError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .map_err(|e| CapabilityError::network(format!("Failed to read response: {e}")))?;
        let message = serde_json::from_str::<OpenAiErrorResponse>(&body)
            .map_or(body, |resp| resp.error.message);
        Err(CapabilityError::from_status(status.as_u16(), &message))
    }

    /// Recording bytes from a URL or a path inside the recordings directory
    async fn load_audio(&self, audio_ref: &str) -> Result<(Vec<u8>, String), CapabilityError> {
        let file_name = audio_ref
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .unwrap_or("audio.wav")
            .to_string();

        if audio_ref.starts_with("http://") || audio_ref.starts_with("https://") {
            let response = Self::check(self.client.get(audio_ref).send().await?).await?;
            let bytes = response.bytes().await?;
            return Ok((bytes.to_vec(), file_name));
        }

        let path = self.recording_path(audio_ref).await?;
        let bytes = tokio::fs::read(&path).await.map_err(|e| {
            CapabilityError::invalid_request(format!("Cannot read audio {audio_ref}: {e}"))
        })?;
        Ok((bytes, file_name))
    }

    /// Resolve a local reference, rejecting anything outside the recordings directory
    async fn recording_path(&self, audio_ref: &str) -> Result<PathBuf, CapabilityError> {
        let unreadable = |e: std::io::Error| {
            CapabilityError::invalid_request(format!("Cannot read audio {audio_ref}: {e}"))
        };
        let root = tokio::fs::canonicalize(&self.config.recordings_dir)
            .await
            .map_err(unreadable)?;
        let path = tokio::fs::canonicalize(root.join(audio_ref))
            .await
            .map_err(unreadable)?;

        if !path.starts_with(&root) {
            tracing::warn!(audio_ref, "Rejected recording outside the recordings directory");
            return Err(CapabilityError::invalid_request(format!(
                "Audio {audio_ref} is outside the recordings directory"
            )));
        }
        Ok(path)
    }
}

#[async_trait]
impl ResponseGenerator for OpenAiService {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, CapabilityError> {
        let body = ChatRequest {
            model: self.config.chat_model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: SYSTEM_PROMPT.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: build_prompt(request),
                },
            ],
            max_tokens: MAX_TOKENS,
            temperature: TEMPERATURE,
        };

        let response = self
            .client
            .post(self.url("chat/completions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let response: ChatResponse = Self::check(response).await?.json().await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| CapabilityError::unknown("Empty completion"))?;

        Ok(Generation {
            text,
            tokens_used: response.usage.map(|u| u.total_tokens),
        })
    }

    fn model_id(&self) -> &str {
        &self.config.chat_model
    }
}

#[async_trait]
impl Transcriber for OpenAiService {
    async fn transcribe(&self, audio_ref: &str) -> Result<String, CapabilityError> {
        let (bytes, file_name) = self.load_audio(audio_ref).await?;
        let form = Form::new()
            .text("model", self.config.asr_model.clone())
            .part("file", Part::bytes(bytes).file_name(file_name));

        let response = self
            .client
            .post(self.url("audio/transcriptions"))
            .bearer_auth(&self.config.api_key)
            .multipart(form)
            .send()
            .await?;
        let transcript: TranscriptionResponse = Self::check(response).await?.json().await?;
        Ok(transcript.text)
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiService {
    async fn synthesize(&self, text: &str, language: &str) -> Result<String, CapabilityError> {
        // The speech endpoint infers language from the text
        tracing::debug!(language, chars = text.chars().count(), "Synthesizing speech");
        let body = SpeechRequest {
            model: self.config.tts_model.clone(),
            voice: self.config.tts_voice.clone(),
            input: text.to_string(),
        };

        let response = self
            .client
            .post(self.url("audio/speech"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let audio = Self::check(response).await?.bytes().await?;

        let path = self
            .config
            .audio_dir
            .join(format!("{}.mp3", uuid::Uuid::new_v4()));
        let io_err = |e: std::io::Error| CapabilityError::unknown(format!("Cannot store audio: {e}"));
        tokio::fs::create_dir_all(&self.config.audio_dir)
            .await
            .map_err(io_err)?;
        tokio::fs::write(&path, &audio).await.map_err(io_err)?;
        Ok(path.to_string_lossy().into_owned())
    }
}

// OpenAI API types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    total_tokens: u32,
}

#[derive(Debug, Serialize)]
struct SpeechRequest {
    model: String,
    voice: String,
    input: String,
}

#[derive(Debug, Deserialize)]
struct TranscriptionResponse {
    text: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiErrorResponse {
    error: OpenAiError,
}

#[derive(Debug, Deserialize)]
struct OpenAiError {
    message: String,
}
