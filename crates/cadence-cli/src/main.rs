//! Cadence console: talk to a language model and hear it answer sentence by sentence.
//!
//! Usage:
//!   cargo run -p cadence-cli -- [--config config/cadence.toml] [--no-greeting] [--text] [--list-devices]
//!
//! `--text` replaces the microphone with stdin: every line you type is one utterance.
//! Events are printed as JSON lines on stdout; logs go to stderr (`RUST_LOG`).

use anyhow::Context;
use async_trait::async_trait;
use cadence_voice::{
    create_best_stt, create_best_tts, AudioOutput, AudioTurn, CaptureSource, Collaborators,
    ConversationSession, FallbackVoice, MicCapture, OpenAiChat, ResponseSource, RodioOutput,
    ScriptedResponder, SilentVoice, SimulatedCapture, SimulatedCaptureHandle, SystemVoice,
    Transcriber, VoiceConfig, VoiceError, VoiceResult,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    no_greeting: bool,
    text: bool,
    list_devices: bool,
}

fn parse_args() -> Option<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(a) = it.next() {
        match a.as_str() {
            "--config" => args.config = it.next().map(PathBuf::from),
            "--no-greeting" => args.no_greeting = true,
            "--text" => args.text = true,
            "--list-devices" => args.list_devices = true,
            "--help" | "-h" => return None,
            other => eprintln!("[cadence] ignoring unknown argument {}", other),
        }
    }
    Some(args)
}

fn usage() {
    eprintln!("Cadence - spoken conversation console");
    eprintln!("  --config PATH    TOML config (default: $CADENCE_CONFIG or config/cadence.toml)");
    eprintln!("  --no-greeting    Skip the spoken greeting and listen right away");
    eprintln!("  --text           Type utterances on stdin instead of using the microphone");
    eprintln!("  --list-devices   Print the available input devices and exit");
    eprintln!();
    eprintln!("API keys: CADENCE_{{TTS,STT,LLM}}_API_KEY or OPENAI_API_KEY (placeholders otherwise).");
}

/// Stdin lines waiting to be "transcribed", one per simulated utterance.
#[derive(Debug, Default)]
struct TypedLines {
    queue: Mutex<VecDeque<String>>,
}

#[async_trait]
impl Transcriber for TypedLines {
    async fn transcribe(&self, _turn: &AudioTurn) -> VoiceResult<String> {
        self.queue
            .lock()
            .pop_front()
            .ok_or_else(|| VoiceError::Stt("no typed line for this utterance".to_string()))
    }
}

/// Feed stdin into the simulated capture until EOF.
async fn read_lines(lines: Arc<TypedLines>, capture: SimulatedCaptureHandle) {
    let mut stdin = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match stdin.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!("stdin: {}", e);
                break;
            }
        };
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        lines.queue.lock().push_back(line);
        let turn = AudioTurn::from_samples(vec![0.0; 4_800], 16_000);
        if !(capture.speech_start() && capture.speech_end(turn)) {
            lines.queue.lock().pop_back();
            eprintln!("[cadence] not listening right now, line dropped");
        }
    }
}

fn responder(config: &VoiceConfig) -> Arc<dyn ResponseSource> {
    match OpenAiChat::from_env(&config.llm) {
        Ok(chat) => {
            info!(model = %config.llm.model, "Using chat completions responder");
            Arc::new(chat)
        }
        Err(e) => {
            warn!("Chat responder unavailable ({}); echoing transcripts", e);
            Arc::new(ScriptedResponder::echo())
        }
    }
}

fn fallback_voice(config: &VoiceConfig) -> Arc<dyn FallbackVoice> {
    match SystemVoice::new(&config.fallback) {
        Ok(voice) => Arc::new(voice),
        Err(e) => {
            warn!("System voice unavailable ({}); failed sentences will be silent", e);
            Arc::new(SilentVoice)
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("[cadence] .env not loaded: {} (using system environment)", e);
    }

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let Some(args) = parse_args() else {
        usage();
        return Ok(());
    };

    if args.list_devices {
        for name in MicCapture::list_input_devices().context("listing input devices")? {
            println!("{}", name);
        }
        return Ok(());
    }

    let mut config = match &args.config {
        Some(path) => VoiceConfig::load_from(path),
        None => VoiceConfig::load(),
    }
    .context("loading configuration")?;
    if args.no_greeting {
        config.turn.greeting.clear();
    }

    let typed = Arc::new(TypedLines::default());
    let (capture, transcriber, typed_capture) = if args.text {
        let (capture, handle) = SimulatedCapture::new();
        (
            Box::new(capture) as Box<dyn CaptureSource>,
            typed.clone() as Arc<dyn Transcriber>,
            Some(handle),
        )
    } else {
        let capture = MicCapture::new(&config.capture).context("opening microphone")?;
        (
            Box::new(capture) as Box<dyn CaptureSource>,
            Arc::from(create_best_stt(&config.stt)),
            None,
        )
    };

    let output: Arc<dyn AudioOutput> = Arc::new(RodioOutput::new().context("opening speaker")?);
    let collaborators = Collaborators {
        capture,
        transcriber,
        responder: responder(&config),
        synthesizer: Arc::from(create_best_tts(&config.tts)),
        output,
        fallback: fallback_voice(&config),
    };

    let (session, handle, mut events) = ConversationSession::new(collaborators, &config);
    let mut session_task = tokio::spawn(session.run());

    if let Some(capture) = typed_capture {
        tokio::spawn(read_lines(typed, capture));
    }

    handle.start().context("starting session")?;
    info!("Cadence running (Ctrl+C to stop)");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => println!("{}", serde_json::to_string(&event)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("CTRL-C received; ending conversation");
                // The session may already have stopped on its own.
                let _ = handle.end();
            }
            finished = &mut session_task => {
                let state = finished.context("session task panicked")??;
                info!("Conversation over ({})", state);
                while let Ok(event) = events.try_recv() {
                    println!("{}", serde_json::to_string(&event)?);
                }
                return Ok(());
            }
        }
    }

    let state = session_task.await.context("session task panicked")??;
    info!("Conversation over ({})", state);
    Ok(())
}
