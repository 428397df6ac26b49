//! **Output**: the speaker and the local fallback voice.
//!
//! `AudioOutput` plays one encoded clip and resolves when it has finished; `stop()` is the
//! interruption kill-switch and must make an in-flight `play` return promptly.
//! `FallbackVoice` speaks text without the network, for sentences whose synthesis or
//! playback failed.

use crate::config::FallbackConfig;
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use rodio::{OutputStream, Sink, Source};
use std::io::Cursor;
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// A single audio output device.
#[async_trait]
pub trait AudioOutput: Send + Sync {
    /// Play encoded audio (WAV/MP3) to completion.
    async fn play(&self, bytes: &[u8]) -> VoiceResult<()>;

    /// Halt playback immediately.
    fn stop(&self);
}

/// Local, non-networked speech.
#[async_trait]
pub trait FallbackVoice: Send + Sync {
    /// Speak `text` to completion.
    async fn speak(&self, text: &str) -> VoiceResult<()>;

    /// Halt speech immediately.
    fn stop(&self);
}

/// Plays audio through rodio on the default output device.
///
/// rodio's `OutputStream` is not `Send`, so it lives on a dedicated thread for as long as
/// this value exists; only the (thread-safe) `Sink` is shared.
pub struct RodioOutput {
    sink: Arc<Sink>,
    _keepalive: Option<std::sync::mpsc::Sender<()>>,
}

impl RodioOutput {
    /// Open the default output device.
    pub fn new() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std::sync::mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let (keepalive_tx, keepalive_rx) = std::sync::mpsc::channel::<()>();

        thread::Builder::new()
            .name("cadence-output".to_string())
            .spawn(move || {
                let opened = OutputStream::try_default()
                    .map_err(|e| VoiceError::Playback(e.to_string()))
                    .and_then(|(stream, handle)| {
                        Sink::try_new(&handle)
                            .map(|sink| (stream, Arc::new(sink)))
                            .map_err(|e| VoiceError::Playback(e.to_string()))
                    });
                match opened {
                    Ok((stream, sink)) => {
                        if ready_tx.send(Ok(sink)).is_err() {
                            return;
                        }
                        // Returns once the owning RodioOutput is dropped.
                        let _ = keepalive_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                    }
                }
            })?;

        let sink = ready_rx
            .recv()
            .map_err(|e| VoiceError::Playback(format!("output thread died: {}", e)))??;
        info!("RodioOutput: sink ready for playback");
        Ok(Self {
            sink,
            _keepalive: Some(keepalive_tx),
        })
    }
}

#[async_trait]
impl AudioOutput for RodioOutput {
    async fn play(&self, bytes: &[u8]) -> VoiceResult<()> {
        if bytes.is_empty() {
            return Err(VoiceError::Playback("empty audio".to_string()));
        }
        let source = rodio::Decoder::new(Cursor::new(bytes.to_vec()))
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
        let sink = Arc::clone(&self.sink);
        // After a stop(), `append` itself waits for the stopped source to drain.
        tokio::task::spawn_blocking(move || {
            sink.append(source.convert_samples::<f32>());
            sink.sleep_until_end();
        })
            .await
            .map_err(|e| VoiceError::Playback(e.to_string()))
    }

    fn stop(&self) {
        self.sink.stop();
        debug!("RodioOutput: stopped");
    }
}

/// Speaks through a local TTS program such as `espeak-ng` or `say`.
pub struct SystemVoice {
    program: String,
    args: Vec<String>,
    halt: Notify,
}

impl SystemVoice {
    pub fn new(config: &FallbackConfig) -> VoiceResult<Self> {
        let (program, args) = config
            .command
            .split_first()
            .ok_or_else(|| VoiceError::Config("fallback.command is empty".to_string()))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
            halt: Notify::new(),
        })
    }
}

#[async_trait]
impl FallbackVoice for SystemVoice {
    async fn speak(&self, text: &str) -> VoiceResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }
        let mut child = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(text)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| VoiceError::Playback(format!("{}: {}", self.program, e)))?;

        tokio::select! {
            status = child.wait() => {
                let status = status?;
                if status.success() {
                    Ok(())
                } else {
                    Err(VoiceError::Playback(format!("{} exited with {}", self.program, status)))
                }
            }
            _ = self.halt.notified() => {
                if let Err(e) = child.kill().await {
                    warn!("SystemVoice: kill failed: {}", e);
                }
                Ok(())
            }
        }
    }

    fn stop(&self) {
        self.halt.notify_waiters();
    }
}

/// Fallback that only logs the text. Use when no local TTS program is installed.
#[derive(Debug, Default)]
pub struct SilentVoice;

#[async_trait]
impl FallbackVoice for SilentVoice {
    async fn speak(&self, text: &str) -> VoiceResult<()> {
        info!("(fallback voice) {}", text);
        Ok(())
    }

    fn stop(&self) {}
}
