//! Voice activity detection using WebRTC VAD.

use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use tracing::{info, trace};
use webrtc_vad::{SampleRate, Vad, VadMode};

/// Configuration for VAD detection
#[derive(Debug, Clone)]
pub struct VadConfig {
    /// Sample rate (must be 8000, 16000, 32000, or 48000 Hz for WebRTC VAD)
    pub sample_rate: u32,

    /// Detection mode (0-3, where 3 is most aggressive)
    pub mode: u8,

    /// Frame length in samples; WebRTC VAD accepts 10, 20 or 30 ms frames.
    pub chunk_size: usize,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for VadConfig {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            mode: config.vad_mode,
            chunk_size: config.chunk_size,
        }
    }
}

/// Voice Activity Detector using WebRTC VAD.
///
/// `Vad` is not `Send`; build the detector on the thread that uses it.
pub struct VadDetector {
    vad: Vad,
    config: VadConfig,
}

impl VadDetector {
    /// Create a new VAD detector with the given configuration
    pub fn new(config: VadConfig) -> VoiceResult<Self> {
        info!(
            "🎙️ Initializing WebRTC VAD (sample_rate: {}Hz, mode: {})",
            config.sample_rate, config.mode
        );
        validate(&config)?;
        let vad = build(&config)?;
        Ok(Self { vad, config })
    }

    /// Whether a frame of exactly `chunk_size` samples contains speech.
    pub fn is_speech(&mut self, audio: &[f32]) -> VoiceResult<bool> {
        if audio.len() != self.config.chunk_size {
            return Err(VoiceError::VadProcessing(format!(
                "Expected {} samples, got {}",
                self.config.chunk_size,
                audio.len()
            )));
        }

        // WebRTC VAD works on 16-bit PCM.
        let audio_i16: Vec<i16> = audio
            .iter()
            .map(|&sample| (sample.clamp(-1.0, 1.0) * 32767.0) as i16)
            .collect();

        let is_speech = self
            .vad
            .is_voice_segment(&audio_i16)
            .map_err(|e| VoiceError::VadProcessing(format!("VAD processing failed: {:?}", e)))?;
        trace!("VAD result: {}", if is_speech { "SPEECH" } else { "SILENCE" });
        Ok(is_speech)
    }

    /// Get the expected chunk size in samples
    pub fn chunk_size(&self) -> usize {
        self.config.chunk_size
    }

    /// Forget adaptive state, e.g. after capture was paused.
    pub fn reset(&mut self) -> VoiceResult<()> {
        self.vad = build(&self.config)?;
        Ok(())
    }
}

fn validate(config: &VadConfig) -> VoiceResult<()> {
    if !matches!(config.sample_rate, 8000 | 16000 | 32000 | 48000) {
        return Err(VoiceError::VadInit(format!(
            "WebRTC VAD only supports 8000, 16000, 32000, or 48000 Hz, got {}",
            config.sample_rate
        )));
    }
    if config.mode > 3 {
        return Err(VoiceError::VadInit(format!("VAD mode must be 0-3, got {}", config.mode)));
    }
    let per_10ms = config.sample_rate as usize / 100;
    if ![per_10ms, per_10ms * 2, per_10ms * 3].contains(&config.chunk_size) {
        return Err(VoiceError::VadInit(format!(
            "chunk size {} is not a 10, 20 or 30 ms frame at {}Hz",
            config.chunk_size, config.sample_rate
        )));
    }
    Ok(())
}

fn build(config: &VadConfig) -> VoiceResult<Vad> {
    let mode = match config.mode {
        0 => VadMode::Quality,
        1 => VadMode::LowBitrate,
        2 => VadMode::Aggressive,
        _ => VadMode::VeryAggressive,
    };
    let sample_rate = match config.sample_rate {
        8000 => SampleRate::Rate8kHz,
        16000 => SampleRate::Rate16kHz,
        32000 => SampleRate::Rate32kHz,
        48000 => SampleRate::Rate48kHz,
        other => return Err(VoiceError::VadInit(format!("Invalid sample rate: {}", other))),
    };
    let mut vad = Vad::new();
    vad.set_mode(mode);
    vad.set_sample_rate(sample_rate);
    Ok(vad)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vad_initialization() {
        let detector = VadDetector::new(VadConfig::default()).unwrap();
        assert_eq!(detector.chunk_size(), 480); // 30ms at 16kHz
    }

    #[test]
    fn test_invalid_sample_rate() {
        let config = VadConfig {
            sample_rate: 44100,
            ..Default::default()
        };
        assert!(matches!(VadDetector::new(config), Err(VoiceError::VadInit(_))));
    }

    #[test]
    fn test_invalid_frame_length() {
        let config = VadConfig {
            chunk_size: 512,
            ..Default::default()
        };
        assert!(VadDetector::new(config).is_err());
    }

    #[test]
    fn test_chunk_size_validation() {
        let mut detector = VadDetector::new(VadConfig::default()).unwrap();
        assert!(detector.is_speech(&[0.0f32; 100]).is_err());
    }

    #[test]
    fn test_silence_detection() {
        let mut detector = VadDetector::new(VadConfig::default()).unwrap();
        assert!(!detector.is_speech(&[0.0f32; 480]).unwrap());
        detector.reset().unwrap();
    }
}
