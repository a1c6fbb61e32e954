//! CareArena console driver
//!
//! Runs one patient session on stdin/stdout so the conversation flow can be
//! exercised without a telephony or messaging provider.
//!
//! Usage: `carearena [voice|sms|chat] [patient_id] [lesson_id]`
//!
//! Lines are sent as text. On voice, `audio:<path-or-url>` sends a recording (local paths must sit
//! under the recordings directory);
//! on SMS, `/snippet <lesson_id>` pushes a lesson snippet. `/quit` ends the
//! session.

use carearena::channels::ChannelExtras;
use carearena::db::Database;
use carearena::engine::ConversationEngine;
use carearena::escalation::{EscalationCoordinator, LogNotifier};
use carearena::llm::{LoggingGenerator, OpenAiService, Unconfigured};
use carearena::runtime::traits::{ResponseGenerator, SpeechSynthesizer, Transcriber};
use carearena::runtime::{Channel, DatabaseStorage, SoftCapabilities};
use carearena::safety::{RuleSet, SafetyGate};
use carearena::{Config, InboundPayload, SessionError, SessionManager, StartOptions, TurnOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carearena=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(std::io::stderr)
                .with_current_span(false)
                .with_span_list(false),
        )
        .init();

    let config = Config::from_env();
    let mut args = std::env::args().skip(1);
    let channel = match args.next() {
        Some(name) => Channel::parse(&name).ok_or_else(|| format!("Unknown channel: {name}"))?,
        None => Channel::Chat,
    };
    let patient_id: i64 = args.next().map_or(Ok(1), |s| s.parse())?;
    let lesson_id: Option<i64> = args.next().map(|s| s.parse()).transpose()?;

    // Ensure database directory exists
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    tracing::info!(path = %config.db_path.display(), "Opening database");
    let storage = Arc::new(DatabaseStorage::new(Database::open(&config.db_path)?));

    let capabilities = build_capabilities(&config)?;
    let escalation = EscalationCoordinator::new(
        storage.clone(),
        Arc::new(LogNotifier),
        config.emergency_contact(),
    );
    let engine = Arc::new(ConversationEngine::new(
        SafetyGate::new(RuleSet::v1(), config.escalation_policy()),
        capabilities,
        storage,
        escalation,
    ));
    let manager = Arc::new(SessionManager::new(engine, &config));

    let reaper = {
        let manager = manager.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                let reaped = manager.reap_idle().await;
                if reaped > 0 {
                    tracing::info!(reaped, "Idle sessions ended");
                }
            }
        })
    };

    let handle = manager
        .start_session_with(StartOptions {
            lesson_id,
            ..StartOptions::new(patient_id, channel)
        })
        .await?;

    let mut stdout = tokio::io::stdout();
    stdout
        .write_all(format!("Session {} on {channel}. /quit to end.\n", handle.id).as_bytes())
        .await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line == "/quit" {
            manager.end_session(&handle).await?;
            break;
        }

        let result = if let Some(id) = line.strip_prefix("/snippet ") {
            match id.trim().parse() {
                Ok(id) => manager.send_lesson_snippet(&handle, id).await,
                Err(_) => {
                    stdout.write_all(b"usage: /snippet <lesson_id>\n").await?;
                    continue;
                }
            }
        } else if let Some(audio_ref) = line.strip_prefix("audio:") {
            manager
                .handle_turn(&handle, InboundPayload::audio(audio_ref.trim()))
                .await
        } else {
            manager.handle_turn(&handle, InboundPayload::text(line)).await
        };

        match result {
            Ok(outcome) => {
                stdout.write_all(render(&outcome).as_bytes()).await?;
                if outcome.state.is_terminal() {
                    break;
                }
            }
            Err(e @ (SessionError::Terminated(_) | SessionError::NotFound(_))) => {
                stdout.write_all(format!("[{e}]\n").as_bytes()).await?;
                break;
            }
            Err(e) => {
                tracing::error!(error = %e, "Turn failed");
                stdout.write_all(format!("[error: {e}]\n").as_bytes()).await?;
            }
        }
    }

    reaper.abort();
    Ok(())
}

fn build_capabilities(config: &Config) -> Result<SoftCapabilities, Box<dyn std::error::Error>> {
    let Some(openai) = config.openai() else {
        tracing::warn!("No provider API key configured. Set OPENAI_API_KEY.");
        let unconfigured = Arc::new(Unconfigured);
        return Ok(SoftCapabilities::new(
            unconfigured.clone(),
            unconfigured.clone(),
            unconfigured,
        ));
    };

    std::fs::create_dir_all(&openai.audio_dir)?;
    std::fs::create_dir_all(&openai.recordings_dir)?;
    let service = Arc::new(OpenAiService::new(openai)?);
    tracing::info!(model = service.model_id(), "Provider initialized");
    let transcriber: Arc<dyn Transcriber> = service.clone();
    let synthesizer: Arc<dyn SpeechSynthesizer> = service.clone();
    let generator: Arc<dyn ResponseGenerator> = Arc::new(LoggingGenerator::new(service));
    Ok(SoftCapabilities::new(transcriber, generator, synthesizer))
}

fn render(outcome: &TurnOutcome) -> String {
    let mut out = format!("< {}\n", outcome.response);
    match &outcome.extras {
        ChannelExtras::Voice { audio_ref, .. } if !audio_ref.is_empty() => {
            out.push_str(&format!("  [audio: {audio_ref}]\n"));
        }
        ChannelExtras::Chat { quick_replies, .. } if !quick_replies.is_empty() => {
            out.push_str(&format!("  [{}]\n", quick_replies.join(" | ")));
        }
        _ => {}
    }
    if outcome.escalated {
        out.push_str("  [escalated to a health worker]\n");
    }
    out.push_str(&format!("  ({})\n", outcome.state));
    out
}
