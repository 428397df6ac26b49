//! **Capture**: microphone, voice activity detection and utterance commits.
//!
//! The session only sees the `CaptureSource` trait. `MicCapture` is the real thing (cpal,
//! WebRTC VAD and the 800 ms gap logic); `SimulatedCapture` lets tests and the text-mode
//! CLI inject speech events directly.

mod gate;
mod mic;
mod vad;

pub use gate::{GateConfig, GateEvent, SpeechGate};
pub use mic::MicCapture;
pub use vad::{VadConfig, VadDetector};

use crate::error::{VoiceError, VoiceResult};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// A committed utterance: buffered PCM from speech start until the gap was detected.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioTurn {
    /// PCM samples (f32, -1.0..1.0), mono.
    pub samples: Vec<f32>,
    /// When the turn was committed.
    pub timestamp: DateTime<Utc>,
    /// Approximate speech duration.
    pub duration: Duration,
    pub sample_rate: u32,
}

impl AudioTurn {
    /// An utterance of `samples` recorded at `sample_rate`, committed now.
    pub fn from_samples(samples: Vec<f32>, sample_rate: u32) -> Self {
        let duration = samples_to_duration(samples.len(), sample_rate);
        Self {
            samples,
            timestamp: Utc::now(),
            duration,
            sample_rate,
        }
    }
}

pub(crate) fn samples_to_duration(samples: usize, sample_rate: u32) -> Duration {
    if sample_rate == 0 {
        return Duration::ZERO;
    }
    Duration::from_nanos(samples as u64 * 1_000_000_000 / sample_rate as u64)
}

/// What the capture collaborator reports.
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    SpeechStart,
    SpeechEnd(AudioTurn),
    /// Voice activity that was too short to be an utterance.
    Misfire,
}

/// A source of speech events with an on/off switch.
pub trait CaptureSource: Send + Sync {
    /// The event stream. Returns `None` after the first call.
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CaptureEvent>>;

    /// Begin (or resume) listening. Failure here is unrecoverable for the session.
    fn start(&self) -> VoiceResult<()>;

    /// Stop reporting events until the next `start`. Partial speech is discarded.
    fn pause(&self);

    /// Release the device. The source cannot be started again.
    fn destroy(&self);
}

#[derive(Debug)]
struct Shared {
    tx: mpsc::UnboundedSender<CaptureEvent>,
    active: AtomicBool,
    destroyed: AtomicBool,
    starts: AtomicUsize,
    fail_start: Mutex<Option<String>>,
}

/// In-memory capture source driven through a `SimulatedCaptureHandle`.
pub struct SimulatedCapture {
    events: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    shared: Arc<Shared>,
}

/// Injects speech into a `SimulatedCapture`.
#[derive(Debug, Clone)]
pub struct SimulatedCaptureHandle {
    shared: Arc<Shared>,
}

impl SimulatedCapture {
    pub fn new() -> (Self, SimulatedCaptureHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            tx,
            active: AtomicBool::new(false),
            destroyed: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            fail_start: Mutex::new(None),
        });
        (
            Self {
                events: Some(rx),
                shared: Arc::clone(&shared),
            },
            SimulatedCaptureHandle { shared },
        )
    }
}

impl CaptureSource for SimulatedCapture {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CaptureEvent>> {
        self.events.take()
    }

    fn start(&self) -> VoiceResult<()> {
        if let Some(reason) = self.shared.fail_start.lock().take() {
            return Err(VoiceError::CapturePermission(reason));
        }
        if self.shared.destroyed.load(Ordering::SeqCst) {
            return Err(VoiceError::AudioDevice("capture was destroyed".to_string()));
        }
        self.shared.starts.fetch_add(1, Ordering::SeqCst);
        self.shared.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.shared.active.store(false, Ordering::SeqCst);
        self.shared.destroyed.store(true, Ordering::SeqCst);
    }
}

impl SimulatedCaptureHandle {
    /// Deliver an event as the microphone would. Dropped (returns `false`) while paused.
    pub fn emit(&self, event: CaptureEvent) -> bool {
        if !self.is_active() {
            debug!(?event, "simulated capture paused, dropping event");
            return false;
        }
        self.shared.tx.send(event).is_ok()
    }

    pub fn speech_start(&self) -> bool {
        self.emit(CaptureEvent::SpeechStart)
    }

    pub fn speech_end(&self, turn: AudioTurn) -> bool {
        self.emit(CaptureEvent::SpeechEnd(turn))
    }

    pub fn misfire(&self) -> bool {
        self.emit(CaptureEvent::Misfire)
    }

    /// Start and end an utterance of `duration` of low-level noise.
    pub fn utter(&self, duration: Duration) -> bool {
        let samples = vec![0.05; (duration.as_secs_f64() * 16_000.0) as usize];
        self.speech_start() && self.speech_end(AudioTurn::from_samples(samples, 16_000))
    }

    /// Make the next `start` fail as if microphone access were denied.
    pub fn fail_next_start(&self, reason: impl Into<String>) {
        *self.shared.fail_start.lock() = Some(reason.into());
    }

    pub fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    /// Number of successful `start` calls.
    pub fn start_count(&self) -> usize {
        self.shared.starts.load(Ordering::SeqCst)
    }
}
