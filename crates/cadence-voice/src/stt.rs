//! **Speech-to-text**: turn a committed `AudioTurn` into the user's words.
//!
//! Implement `Transcriber` for a remote OpenAI-compatible endpoint or local Whisper.
//! An empty transcript is not an error here; the turn state machine treats it as one.

use crate::capture::AudioTurn;
use crate::config::{api_key_from_env, SttConfig};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use std::io::Cursor;
use std::time::Duration;
use tracing::{debug, info};

/// Backend for converting PCM (AudioTurn) to text.
#[async_trait]
pub trait Transcriber: Send + Sync {
    /// Transcribe one turn. Return an empty string if nothing was recognised.
    async fn transcribe(&self, turn: &AudioTurn) -> VoiceResult<String>;
}

/// Encode f32 PCM (mono) to 16-bit WAV bytes for API upload.
pub fn encode_wav(samples: &[f32], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(44 + samples.len() * 2));
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec).map_err(|e| VoiceError::Stt(e.to_string()))?;
        for &s in samples {
            let sample = (s.clamp(-1.0, 1.0) * 32767.0).round() as i16;
            writer.write_sample(sample).map_err(|e| VoiceError::Stt(e.to_string()))?;
        }
        writer.finalize().map_err(|e| VoiceError::Stt(e.to_string()))?;
    }
    Ok(cursor.into_inner())
}

/// Placeholder STT: returns a fixed string. Use for testing the voice loop without Whisper/API.
#[derive(Debug, Default)]
pub struct PlaceholderStt {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderStt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait]
impl Transcriber for PlaceholderStt {
    async fn transcribe(&self, turn: &AudioTurn) -> VoiceResult<String> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!(
            "[STT placeholder: {} samples, {:.1}s]",
            turn.samples.len(),
            turn.duration.as_secs_f32()
        ))
    }
}

/// Production STT backend: OpenAI-compatible `/audio/transcriptions` (OpenAI Whisper, OpenRouter, local servers).
#[derive(Debug, Clone)]
pub struct OpenAiStt {
    /// Base URL without trailing slash (e.g. https://api.openai.com/v1).
    pub base_url: String,
    /// Bearer API key.
    pub api_key: String,
    /// Model: whisper-1 or gpt-4o-transcribe, etc.
    pub model: String,
    client: reqwest::Client,
}

impl OpenAiStt {
    /// Build from config plus `CADENCE_STT_API_KEY` (or `OPENAI_API_KEY`).
    pub fn from_env(config: &SttConfig) -> VoiceResult<Self> {
        let api_key = api_key_from_env("STT")?;
        Self::new(config, api_key)
    }

    /// Create with an explicit key.
    pub fn new(config: &SttConfig, api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            model: config.model.clone(),
            client,
        })
    }
}

#[async_trait]
impl Transcriber for OpenAiStt {
    async fn transcribe(&self, turn: &AudioTurn) -> VoiceResult<String> {
        if turn.samples.is_empty() {
            return Ok(String::new());
        }
        let wav = encode_wav(&turn.samples, turn.sample_rate)?;
        debug!(bytes = wav.len(), "STT upload");
        let url = format!("{}/audio/transcriptions", self.base_url);
        let part = reqwest::multipart::Part::bytes(wav)
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone());
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(VoiceError::Stt(format!("STT API error {}: {}", status, body)));
        }
        let json: serde_json::Value = res.json().await.map_err(|e| VoiceError::Stt(e.to_string()))?;
        Ok(json
            .get("text")
            .and_then(|t| t.as_str())
            .unwrap_or("")
            .trim()
            .to_string())
    }
}

#[cfg(feature = "whisper")]
mod whisper_stt {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use whisper_rs::{FullParams, SamplingStrategy, WhisperContext, WhisperContextParameters};

    /// Local Whisper STT: loads a ggml model (e.g. ggml-base.en.bin) and runs inference
    /// on a blocking thread. Audio must be 16 kHz mono.
    pub struct WhisperStt {
        _context: WhisperContext,
        state: Arc<Mutex<whisper_rs::WhisperState>>,
    }

    impl WhisperStt {
        /// Load the Whisper model from `model_path`.
        pub fn new(model_path: &str) -> VoiceResult<Self> {
            let context = WhisperContext::new_with_params(model_path, WhisperContextParameters::default())
                .map_err(|e| VoiceError::Stt(format!("Whisper load failed: {}", e)))?;
            let state = context
                .create_state()
                .map_err(|e| VoiceError::Stt(format!("Whisper state init failed: {}", e)))?;
            Ok(Self {
                _context: context,
                state: Arc::new(Mutex::new(state)),
            })
        }

        /// Build from env: `WHISPER_MODEL_PATH` must point to a .bin model file.
        pub fn from_env() -> VoiceResult<Self> {
            let path = std::env::var("WHISPER_MODEL_PATH")
                .map_err(|_| VoiceError::Config("WHISPER_MODEL_PATH not set".to_string()))?;
            let path = path.trim();
            if path.is_empty() {
                return Err(VoiceError::Config("WHISPER_MODEL_PATH is empty".to_string()));
            }
            Self::new(path)
        }
    }

    #[async_trait]
    impl Transcriber for WhisperStt {
        async fn transcribe(&self, turn: &AudioTurn) -> VoiceResult<String> {
            if turn.samples.is_empty() {
                return Ok(String::new());
            }
            if turn.sample_rate != 16000 {
                return Err(VoiceError::Stt(format!(
                    "Whisper expects 16 kHz; got {} Hz",
                    turn.sample_rate
                )));
            }
            let state = Arc::clone(&self.state);
            let samples = turn.samples.clone();
            tokio::task::spawn_blocking(move || {
                let mut params = FullParams::new(SamplingStrategy::Greedy { best_of: 1 });
                params.set_print_progress(false);
                params.set_print_realtime(false);
                params.set_no_timestamps(true);
                params.set_language(Some("en"));

                let mut state = state.lock();
                state
                    .full(params, &samples)
                    .map_err(|e| VoiceError::Stt(format!("Whisper inference failed: {}", e)))?;
                Ok(state
                    .as_iter()
                    .filter_map(|seg| seg.to_str().ok().map(str::to_string))
                    .collect::<Vec<_>>()
                    .join(" ")
                    .trim()
                    .to_string())
            })
            .await
            .map_err(|e| VoiceError::Stt(e.to_string()))?
        }
    }
}

#[cfg(feature = "whisper")]
pub use whisper_stt::WhisperStt;

/// Create the best available STT backend.
/// Priority: (1) WhisperStt if `WHISPER_MODEL_PATH` is set and the model loads (requires `whisper` feature),
/// (2) OpenAiStt if an API key is set, (3) PlaceholderStt.
pub fn create_best_stt(config: &SttConfig) -> Box<dyn Transcriber> {
    #[cfg(feature = "whisper")]
    {
        match WhisperStt::from_env() {
            Ok(w) => {
                info!("STT: using local Whisper");
                return Box::new(w);
            }
            Err(e) => debug!("STT: local Whisper unavailable: {}", e),
        }
    }
    match OpenAiStt::from_env(config) {
        Ok(stt) => {
            info!("STT: using {} ({})", stt.base_url, stt.model);
            Box::new(stt)
        }
        Err(e) => {
            info!("STT: {}; using placeholder", e);
            Box::new(PlaceholderStt::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn turn(samples: Vec<f32>) -> AudioTurn {
        AudioTurn::from_samples(samples, 16_000)
    }

    #[tokio::test]
    async fn placeholder_returns_message() {
        let stt = PlaceholderStt::new();
        let s = stt.transcribe(&turn(vec![0.0; 480])).await.unwrap();
        assert!(s.contains("STT placeholder"));
        assert!(s.contains("480"));
    }

    #[tokio::test]
    async fn placeholder_with_response() {
        let stt = PlaceholderStt::with_response("hello world");
        assert_eq!(stt.transcribe(&turn(vec![])).await.unwrap(), "hello world");
    }

    #[tokio::test]
    async fn empty_audio_skips_the_request() {
        let stt = OpenAiStt::new(&SttConfig::default(), "test-key").unwrap();
        assert_eq!(stt.transcribe(&turn(vec![])).await.unwrap(), "");
    }

    #[test]
    fn wav_encoding_round_trips_through_hound() {
        let samples = vec![0.0, 0.5, -0.5, 1.5];
        let bytes = encode_wav(&samples, 16_000).unwrap();
        assert_eq!(&bytes[..4], b"RIFF");
        assert_eq!(bytes.len(), 44 + samples.len() * 2);

        let mut reader = hound::WavReader::new(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.spec().sample_rate, 16_000);
        let decoded: Vec<i16> = reader.samples::<i16>().map(|s| s.unwrap()).collect();
        assert_eq!(decoded, vec![0, 16384, -16384, 32767]);
    }
}
