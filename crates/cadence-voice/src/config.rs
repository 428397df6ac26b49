//! Pipeline configuration loaded from defaults, an optional TOML file and the environment.
//!
//! | Source | Example |
//! |--------|---------|
//! | Defaults | see each section's `Default` impl |
//! | File | `CADENCE_CONFIG=./voice.toml`, else `config/cadence.toml` when present |
//! | Env | `CADENCE__SEGMENTER__MIN_SENTENCE_LENGTH=25`, `CADENCE__TURN__BARGE_IN=false` |
//!
//! API keys are never read from the file; see [`api_key_from_env`].

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for a conversation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    pub segmenter: SegmenterConfig,
    pub sequencer: SequencerConfig,
    pub turn: TurnConfig,
    pub capture: CaptureConfig,
    pub tts: TtsConfig,
    pub stt: SttConfig,
    pub llm: LlmConfig,
    pub fallback: FallbackConfig,
}

/// Sentence boundary heuristics.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Sentences shorter than this (in characters) are merged or deferred.
    pub min_sentence_length: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            min_sentence_length: 20,
        }
    }
}

/// Ordered playback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SequencerConfig {
    /// How long the drain loop waits for a missing index before skipping it (default 8s).
    pub missing_item_timeout_ms: u64,
}

impl SequencerConfig {
    pub fn missing_item_timeout(&self) -> Duration {
        Duration::from_millis(self.missing_item_timeout_ms)
    }
}

impl Default for SequencerConfig {
    fn default() -> Self {
        Self {
            missing_item_timeout_ms: 8_000,
        }
    }
}

/// Turn-taking behaviour.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Keep capture running while speaking so the user can interrupt (default true).
    pub barge_in: bool,
    /// Pause between an interruption and re-entering Listening (default 300ms).
    pub interrupt_grace_ms: u64,
    /// Spoken when the conversation starts. Empty string skips straight to listening.
    pub greeting: String,
}

impl TurnConfig {
    pub fn interrupt_grace(&self) -> Duration {
        Duration::from_millis(self.interrupt_grace_ms)
    }
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            barge_in: true,
            interrupt_grace_ms: 300,
            greeting: "Hi! I'm listening whenever you're ready.".to_string(),
        }
    }
}

/// Microphone capture and gap detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Sample rate (default 16000). Must be 8000/16000/32000/48000 for WebRTC VAD.
    pub sample_rate: u32,
    /// Chunk size in samples (default 480 = 30ms at 16kHz).
    pub chunk_size: usize,
    /// WebRTC VAD aggressiveness, 0-3 (default 2).
    pub vad_mode: u8,
    /// Silence after speech that commits an utterance (default 800ms).
    pub gap_ms: u64,
    /// Utterances shorter than this are reported as misfires (default 200ms).
    pub min_speech_ms: u64,
    /// Utterances are force-committed after this long (default 30s).
    pub max_turn_secs: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            chunk_size: 480,
            vad_mode: 2,
            gap_ms: 800,
            min_speech_ms: 200,
            max_turn_secs: 30,
        }
    }
}

/// Speech synthesis service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TtsConfig {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// tts-1 (fast) or tts-1-hd (higher quality).
    pub model: String,
    pub voice: String,
    pub timeout_secs: u64,
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            timeout_secs: 60,
        }
    }
}

/// Transcription service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SttConfig {
    pub base_url: String,
    /// whisper-1 or gpt-4o-transcribe, etc.
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for SttConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "whisper-1".to_string(),
            timeout_secs: 30,
        }
    }
}

/// Streaming chat completion service.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    pub model: String,
    pub system_prompt: String,
    /// Number of past user/assistant exchanges replayed with each request.
    pub history_turns: usize,
    pub temperature: f32,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            system_prompt: "You are a friendly voice assistant. Answer in short, natural spoken sentences without markdown or lists.".to_string(),
            history_turns: 8,
            temperature: 0.7,
        }
    }
}

/// Local voice used when synthesis or playback fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Program and leading arguments; the sentence text is appended as the last argument.
    pub command: Vec<String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            command: vec!["espeak-ng".to_string()],
        }
    }
}

impl VoiceConfig {
    /// Load config from file and environment. Precedence: env `CADENCE__*` > file > defaults.
    ///
    /// The file is `CADENCE_CONFIG` when set, otherwise `config/cadence.toml` if it exists.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("CADENCE_CONFIG").unwrap_or_else(|_| "config/cadence.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    /// Load with an explicit file path (missing file is not an error).
    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let builder = config::Config::builder();
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("CADENCE")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(" ")
                    .with_list_parse_key("fallback.command"),
            )
            .build()?;

        let cfg: VoiceConfig = built.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would stall or break the pipeline.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.sequencer.missing_item_timeout_ms == 0 {
            return Err(VoiceError::Config(
                "sequencer.missing_item_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if self.capture.gap_ms == 0 {
            return Err(VoiceError::Config("capture.gap_ms must be greater than 0".to_string()));
        }
        if self.capture.vad_mode > 3 {
            return Err(VoiceError::Config(format!(
                "capture.vad_mode must be 0-3, got {}",
                self.capture.vad_mode
            )));
        }
        if self.fallback.command.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(VoiceError::Config("fallback.command must name a program".to_string()));
        }
        if self.llm.history_turns == 0 {
            return Err(VoiceError::Config("llm.history_turns must be at least 1".to_string()));
        }
        Ok(())
    }
}

/// Read an API key for `service` ("TTS", "STT", "LLM"): `CADENCE_{service}_API_KEY`, then `OPENAI_API_KEY`.
pub fn api_key_from_env(service: &str) -> VoiceResult<String> {
    let specific = format!("CADENCE_{}_API_KEY", service.to_ascii_uppercase());
    std::env::var(&specific)
        .or_else(|_| std::env::var("OPENAI_API_KEY"))
        .ok()
        .filter(|k| !k.trim().is_empty())
        .ok_or_else(|| VoiceError::Config(format!("{} requires {} or OPENAI_API_KEY", service, specific)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let cfg = VoiceConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.segmenter.min_sentence_length, 20);
        assert_eq!(cfg.capture.chunk_size, 480);
        assert!(cfg.turn.barge_in);
        assert_eq!(cfg.turn.interrupt_grace(), Duration::from_millis(300));
    }

    #[test]
    fn file_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            "[segmenter]\nmin_sentence_length = 32\n\n[turn]\nbarge_in = false\ngreeting = \"\"\n"
        )
        .unwrap();

        let cfg = VoiceConfig::load_from(file.path()).unwrap();
        assert_eq!(cfg.segmenter.min_sentence_length, 32);
        assert!(!cfg.turn.barge_in);
        assert!(cfg.turn.greeting.is_empty());
        // Untouched sections keep their defaults
        assert_eq!(cfg.tts.model, "tts-1");
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = VoiceConfig::load_from(Path::new("/definitely/not/here.toml")).unwrap();
        assert_eq!(cfg.sequencer.missing_item_timeout_ms, 8_000);
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut cfg = VoiceConfig::default();
        cfg.sequencer.missing_item_timeout_ms = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_fallback_command() {
        let mut cfg = VoiceConfig::default();
        cfg.fallback.command.clear();
        assert!(cfg.validate().is_err());
    }
}
