//! Microphone capture: cpal input stream, WebRTC VAD and the speech gate.
//!
//! cpal streams and the WebRTC VAD are not `Send`, so each lives on its own OS thread:
//!
//! ```text
//!  cadence-mic thread            cadence-vad thread                 session (tokio)
//!  cpal callback ── chunks ──▶ VadDetector ─▶ SpeechGate ── CaptureEvent ──▶ select!
//! ```
//!
//! Pausing keeps the device open and drops frames at the VAD thread, so resuming is
//! instant. `destroy` closes the device and both threads wind down.

use super::{CaptureEvent, CaptureSource, GateConfig, GateEvent, SpeechGate, VadConfig, VadDetector};
use crate::config::CaptureConfig;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// Keeps the capture threads alive; dropping it closes the device.
struct Running {
    _shutdown: std_mpsc::Sender<()>,
}

/// Default input device with local VAD and gap detection.
pub struct MicCapture {
    config: CaptureConfig,
    events_tx: mpsc::UnboundedSender<CaptureEvent>,
    events_rx: Option<mpsc::UnboundedReceiver<CaptureEvent>>,
    paused: Arc<AtomicBool>,
    running: Mutex<Option<Running>>,
    destroyed: AtomicBool,
}

impl MicCapture {
    /// Validate the configuration. The device is opened on the first `start`.
    pub fn new(config: &CaptureConfig) -> VoiceResult<Self> {
        // Fails early on an unsupported rate, mode or frame length.
        VadDetector::new(VadConfig::from(config))?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Ok(Self {
            config: config.clone(),
            events_tx,
            events_rx: Some(events_rx),
            paused: Arc::new(AtomicBool::new(true)),
            running: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        })
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let devices = cpal::default_host().input_devices()?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn open(&self) -> VoiceResult<Running> {
        let (chunk_tx, chunk_rx) = std_mpsc::channel::<Vec<f32>>();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let sample_rate = self.config.sample_rate;
        let chunk_size = self.config.chunk_size;
        thread::Builder::new()
            .name("cadence-mic".to_string())
            .spawn(move || {
                let stream = match build_input_stream(sample_rate, chunk_size, chunk_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                if ready_tx.send(Ok(())).is_err() {
                    return;
                }
                // Returns once the Running guard is dropped.
                let _ = shutdown_rx.recv();
                drop(stream);
                info!("🛑 Microphone closed");
            })?;

        ready_rx
            .recv()
            .map_err(|e| VoiceError::AudioDevice(format!("capture thread died: {}", e)))??;

        let vad_config = VadConfig::from(&self.config);
        let gate_config = GateConfig::from(&self.config);
        let events = self.events_tx.clone();
        let paused = Arc::clone(&self.paused);
        thread::Builder::new()
            .name("cadence-vad".to_string())
            .spawn(move || run_vad(vad_config, gate_config, chunk_rx, events, paused))?;

        Ok(Running {
            _shutdown: shutdown_tx,
        })
    }
}

fn build_input_stream(
    sample_rate: u32,
    chunk_size: usize,
    chunk_tx: std_mpsc::Sender<Vec<f32>>,
) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;
    info!(
        "📱 Using input device: {}",
        device.name().unwrap_or_else(|_| "Unknown".to_string())
    );

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut pending = Vec::with_capacity(chunk_size);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            for &sample in data {
                pending.push(sample);
                if pending.len() == chunk_size {
                    // Receiver gone means the VAD thread exited; the stream is about to close.
                    let _ = chunk_tx.send(std::mem::replace(&mut pending, Vec::with_capacity(chunk_size)));
                }
            }
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;
    stream.play()?;
    info!("✅ Audio capture started ({}Hz, {} sample chunks)", sample_rate, chunk_size);
    Ok(stream)
}

fn run_vad(
    vad_config: VadConfig,
    gate_config: GateConfig,
    chunks: std_mpsc::Receiver<Vec<f32>>,
    events: mpsc::UnboundedSender<CaptureEvent>,
    paused: Arc<AtomicBool>,
) {
    let mut vad = match VadDetector::new(vad_config) {
        Ok(v) => v,
        Err(e) => {
            error!("Failed to initialize VAD: {}", e);
            return;
        }
    };
    let mut gate = SpeechGate::new(gate_config);
    let mut was_paused = paused.load(Ordering::SeqCst);
    info!("🔄 VAD thread started");

    for chunk in chunks {
        if paused.load(Ordering::SeqCst) {
            if !was_paused {
                gate.reset();
                if let Err(e) = vad.reset() {
                    warn!("VAD reset failed: {}", e);
                }
                was_paused = true;
            }
            continue;
        }
        was_paused = false;

        let is_speech = match vad.is_speech(&chunk) {
            Ok(s) => s,
            Err(e) => {
                warn!("VAD processing error: {}", e);
                continue;
            }
        };
        let event = match gate.push(is_speech, &chunk) {
            Some(GateEvent::Started) => CaptureEvent::SpeechStart,
            Some(GateEvent::Committed(turn)) => CaptureEvent::SpeechEnd(turn),
            Some(GateEvent::Misfire) => CaptureEvent::Misfire,
            None => continue,
        };
        if events.send(event).is_err() {
            break;
        }
    }
    warn!("🛑 VAD thread ended");
}

impl CaptureSource for MicCapture {
    fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<CaptureEvent>> {
        self.events_rx.take()
    }

    fn start(&self) -> VoiceResult<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(VoiceError::AudioDevice("microphone was released".to_string()));
        }
        let mut running = self.running.lock();
        if running.is_none() {
            *running = Some(self.open()?);
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn destroy(&self) {
        self.paused.store(true, Ordering::SeqCst);
        self.destroyed.store(true, Ordering::SeqCst);
        self.running.lock().take();
    }
}

impl Drop for MicCapture {
    fn drop(&mut self) {
        self.running.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_configuration() {
        let config = CaptureConfig {
            sample_rate: 44_100,
            ..Default::default()
        };
        assert!(MicCapture::new(&config).is_err());
    }

    #[test]
    fn starts_paused_without_opening_the_device() {
        let mut mic = MicCapture::new(&CaptureConfig::default()).unwrap();
        assert!(mic.take_events().is_some());
        assert!(mic.take_events().is_none());
        assert!(mic.running.lock().is_none());
        mic.destroy();
        assert!(mic.start().is_err());
    }

    #[test]
    #[ignore] // Requires a microphone
    fn opens_the_default_device() {
        let mic = MicCapture::new(&CaptureConfig::default()).unwrap();
        mic.start().unwrap();
        mic.pause();
        mic.destroy();
    }
}
