//! **Speech synthesis**: turn one sentence of text into encoded audio (WAV/MP3).
//!
//! Implement `SpeechSynthesizer` for OpenAI/ElevenLabs/OpenRouter or a local engine.
//! Each call is independent; the dispatcher runs many of them concurrently.

use crate::config::{api_key_from_env, TtsConfig};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Backend that turns text into audio bytes.
#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Synthesize text to audio bytes. An empty vec means "nothing to play" and is treated as a failure.
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>>;
}

/// Placeholder TTS: returns empty audio so every sentence goes to the fallback voice.
#[derive(Debug, Default)]
pub struct PlaceholderTts;

#[async_trait]
impl SpeechSynthesizer for PlaceholderTts {
    async fn synthesize(&self, _text: &str) -> VoiceResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// Production TTS backend: OpenAI-compatible `/audio/speech` (OpenAI, OpenRouter, local servers).
#[derive(Debug, Clone)]
pub struct OpenAiTts {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    pub model: String,
    /// alloy, echo, fable, onyx, nova, shimmer, ...
    pub voice: String,
    client: reqwest::Client,
}

impl OpenAiTts {
    /// Build from config plus `CADENCE_TTS_API_KEY` (or `OPENAI_API_KEY`).
    pub fn from_env(config: &TtsConfig) -> VoiceResult<Self> {
        let api_key = api_key_from_env("TTS")?;
        Self::new(config, api_key)
    }

    /// Create with an explicit key (e.g. for tests or non-env wiring).
    pub fn new(config: &TtsConfig, api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            voice: config.voice.clone(),
            client,
        })
    }

    /// Set a fixed voice instead of the configured one.
    pub fn with_voice(mut self, voice: impl Into<String>) -> Self {
        self.voice = voice.into();
        self
    }
}

#[async_trait]
impl SpeechSynthesizer for OpenAiTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/audio/speech", self.base_url);
        let body = serde_json::json!({
            "model": self.model,
            "input": text,
            "voice": self.voice,
        });
        debug!(chars = text.len(), voice = %self.voice, "TTS request");
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| VoiceError::Tts(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Tts(format!("TTS API error {}: {}", status, body)));
        }
        let bytes = res.bytes().await.map_err(|e| VoiceError::Tts(e.to_string()))?;
        Ok(bytes.to_vec())
    }
}

/// Create the best available synthesizer: `OpenAiTts` when a key is set, else `PlaceholderTts`.
pub fn create_best_tts(config: &TtsConfig) -> Box<dyn SpeechSynthesizer> {
    match OpenAiTts::from_env(config) {
        Ok(tts) => {
            info!("TTS: using {} ({}, voice {})", tts.base_url, tts.model, tts.voice);
            Box::new(tts)
        }
        Err(e) => {
            info!("TTS: {}; using placeholder (fallback voice only)", e);
            Box::new(PlaceholderTts)
        }
    }
}
