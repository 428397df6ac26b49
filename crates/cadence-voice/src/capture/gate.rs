//! Gap logic: decide when an utterance starts and when the speaker has finished.
//!
//! Fed one VAD decision per chunk. An utterance is committed after `gap` of continuous
//! silence following speech, or force-committed at `max_turn`. Utterances whose voiced
//! part is shorter than `min_speech` are reported as misfires instead.
//!
//! Time is measured in samples, not wall-clock, so the gate behaves the same on a
//! live stream and in tests.

use super::{samples_to_duration, AudioTurn};
use crate::config::CaptureConfig;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Thresholds for the gate.
#[derive(Debug, Clone)]
pub struct GateConfig {
    pub sample_rate: u32,
    /// Silence after speech that commits the utterance (default: 800ms).
    pub gap: Duration,
    /// Minimum voiced duration for a real utterance (default: 200ms).
    pub min_speech: Duration,
    /// Utterances are committed once they reach this length (default: 30s).
    pub max_turn: Duration,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for GateConfig {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            gap: Duration::from_millis(config.gap_ms),
            min_speech: Duration::from_millis(config.min_speech_ms),
            max_turn: Duration::from_secs(config.max_turn_secs),
        }
    }
}

/// What one chunk changed.
#[derive(Debug, Clone, PartialEq)]
pub enum GateEvent {
    Started,
    Committed(AudioTurn),
    Misfire,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GateState {
    Idle,
    Speaking,
    TrailingSilence,
}

/// Turns per-chunk speech/silence decisions into utterances.
#[derive(Debug)]
pub struct SpeechGate {
    config: GateConfig,
    state: GateState,
    buffer: Vec<f32>,
    voiced_samples: usize,
    silent_samples: usize,
}

impl SpeechGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            state: GateState::Idle,
            buffer: Vec::new(),
            voiced_samples: 0,
            silent_samples: 0,
        }
    }

    fn samples_for(&self, duration: Duration) -> usize {
        (duration.as_nanos() * self.config.sample_rate as u128 / 1_000_000_000) as usize
    }

    /// Process one chunk with its VAD decision.
    pub fn push(&mut self, is_speech: bool, chunk: &[f32]) -> Option<GateEvent> {
        match (self.state, is_speech) {
            (GateState::Idle, true) => {
                debug!("🎤 gate: speech started");
                self.state = GateState::Speaking;
                self.buffer.clear();
                self.buffer.extend_from_slice(chunk);
                self.voiced_samples = chunk.len();
                self.silent_samples = 0;
                Some(GateEvent::Started)
            }
            (GateState::Idle, false) => None,
            (GateState::Speaking | GateState::TrailingSilence, true) => {
                self.state = GateState::Speaking;
                self.buffer.extend_from_slice(chunk);
                self.voiced_samples += chunk.len();
                self.silent_samples = 0;
                if self.buffer.len() >= self.samples_for(self.config.max_turn) {
                    warn!("⏱️ gate: max utterance length reached, committing");
                    return Some(self.commit());
                }
                None
            }
            (GateState::Speaking | GateState::TrailingSilence, false) => {
                self.state = GateState::TrailingSilence;
                self.silent_samples += chunk.len();
                if self.silent_samples >= self.samples_for(self.config.gap) {
                    return Some(self.commit());
                }
                None
            }
        }
    }

    fn commit(&mut self) -> GateEvent {
        let voiced = samples_to_duration(self.voiced_samples, self.config.sample_rate);
        let event = if voiced < self.config.min_speech {
            debug!("⏭️ gate: speech too short ({:?}), misfire", voiced);
            GateEvent::Misfire
        } else {
            let mut turn = AudioTurn::from_samples(std::mem::take(&mut self.buffer), self.config.sample_rate);
            turn.duration = voiced;
            info!("🎯 gate: utterance committed ({:?}, {} samples)", voiced, turn.samples.len());
            GateEvent::Committed(turn)
        };
        self.reset();
        event
    }

    /// Drop any partial utterance.
    pub fn reset(&mut self) {
        self.state = GateState::Idle;
        self.buffer.clear();
        self.voiced_samples = 0;
        self.silent_samples = 0;
    }

    pub fn is_idle(&self) -> bool {
        self.state == GateState::Idle
    }
}
