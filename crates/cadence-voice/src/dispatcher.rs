//! Per-sentence synthesis dispatch.
//!
//! Every sentence gets the next turn-scoped index and its own synthesis task. The text
//! is announced immediately so a transcript can render before any audio exists; audio
//! (or the failure) follows whenever the service answers, in no particular order.

use crate::tts::SpeechSynthesizer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// A sentence with its playback position in the current turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sentence {
    pub text: String,
    pub index: usize,
}

/// Events produced while a turn's response is being voiced.
///
/// Every variant carries the generation it was produced under; consumers drop events
/// whose generation is no longer current.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// Sentence text is known; audio is on its way.
    TextReady {
        generation: u64,
        index: usize,
        text: String,
    },
    /// Synthesis finished for `index`.
    AudioReady {
        generation: u64,
        index: usize,
        payload: Vec<u8>,
        text: String,
    },
    /// Synthesis failed for `index`; the fallback voice should speak `text`.
    SynthesisFailed {
        generation: u64,
        index: usize,
        text: String,
        reason: String,
    },
    /// The token stream ended; `total` sentences were dispatched this turn.
    StreamEnded { generation: u64, total: usize },
    /// The token stream broke off early.
    StreamFailed { generation: u64, reason: String },
}

impl DispatchEvent {
    pub fn generation(&self) -> u64 {
        match self {
            DispatchEvent::TextReady { generation, .. }
            | DispatchEvent::AudioReady { generation, .. }
            | DispatchEvent::SynthesisFailed { generation, .. }
            | DispatchEvent::StreamEnded { generation, .. }
            | DispatchEvent::StreamFailed { generation, .. } => *generation,
        }
    }
}

/// Assigns indices and fans sentences out to the synthesizer.
///
/// One dispatcher lives for one turn. In-flight requests are never aborted: after a
/// cancellation their results still arrive, tagged with the old generation.
pub struct SynthesisDispatcher {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    generation: u64,
    next_index: usize,
    events: mpsc::UnboundedSender<DispatchEvent>,
}

impl SynthesisDispatcher {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        generation: u64,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        Self {
            synthesizer,
            generation,
            next_index: 0,
            events,
        }
    }

    /// Index the sentence, announce its text and start synthesis in the background.
    ///
    /// Must be called from within a tokio runtime.
    pub fn dispatch(&mut self, text: String) -> Sentence {
        let sentence = Sentence {
            text,
            index: self.next_index,
        };
        self.next_index += 1;

        let generation = self.generation;
        self.send(DispatchEvent::TextReady {
            generation,
            index: sentence.index,
            text: sentence.text.clone(),
        });

        let synthesizer = Arc::clone(&self.synthesizer);
        let events = self.events.clone();
        let job = sentence.clone();
        tokio::spawn(async move {
            let event = match synthesizer.synthesize(&job.text).await {
                Ok(payload) if !payload.is_empty() => {
                    debug!(index = job.index, bytes = payload.len(), "synthesis ready");
                    DispatchEvent::AudioReady {
                        generation,
                        index: job.index,
                        payload,
                        text: job.text,
                    }
                }
                Ok(_) => DispatchEvent::SynthesisFailed {
                    generation,
                    index: job.index,
                    text: job.text,
                    reason: "synthesizer returned no audio".to_string(),
                },
                Err(e) => {
                    warn!(index = job.index, "synthesis failed, fallback voice will speak it: {}", e);
                    DispatchEvent::SynthesisFailed {
                        generation,
                        index: job.index,
                        text: job.text,
                        reason: e.to_string(),
                    }
                }
            };
            // Receiver gone means the session ended; nothing left to tell.
            let _ = events.send(event);
        });

        sentence
    }

    /// Number of sentences dispatched so far.
    pub fn dispatched(&self) -> usize {
        self.next_index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report the end of the token stream.
    pub fn finish(&self) {
        self.send(DispatchEvent::StreamEnded {
            generation: self.generation,
            total: self.next_index,
        });
    }

    /// Report a broken token stream.
    pub fn fail(&self, reason: String) {
        self.send(DispatchEvent::StreamFailed {
            generation: self.generation,
            reason,
        });
    }

    fn send(&self, event: DispatchEvent) {
        if self.events.send(event).is_err() {
            debug!("dispatcher: event receiver closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{VoiceError, VoiceResult};
    use async_trait::async_trait;
    use std::time::Duration;

    /// Answers slower for earlier sentences so completions arrive reversed.
    struct ReversingTts;

    #[async_trait]
    impl SpeechSynthesizer for ReversingTts {
        async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
            if text.contains("fail") {
                return Err(VoiceError::Tts("service unavailable".into()));
            }
            let delay = 60u64.saturating_sub(text.len() as u64 * 2);
            tokio::time::sleep(Duration::from_millis(delay)).await;
            Ok(text.as_bytes().to_vec())
        }
    }

    #[tokio::test]
    async fn text_is_announced_before_audio_and_indices_increase() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = SynthesisDispatcher::new(Arc::new(ReversingTts), 7, tx);

        let a = dispatcher.dispatch("short".to_string());
        let b = dispatcher.dispatch("a much longer sentence".to_string());
        assert_eq!((a.index, b.index), (0, 1));
        assert_eq!(dispatcher.dispatched(), 2);

        // Both TextReady events are queued synchronously.
        for expected in 0..2 {
            match rx.try_recv().unwrap() {
                DispatchEvent::TextReady { generation, index, .. } => {
                    assert_eq!(generation, 7);
                    assert_eq!(index, expected);
                }
                other => panic!("expected TextReady, got {:?}", other),
            }
        }

        let mut audio_order = Vec::new();
        while audio_order.len() < 2 {
            if let Some(DispatchEvent::AudioReady { index, generation, .. }) = rx.recv().await {
                assert_eq!(generation, 7);
                audio_order.push(index);
            }
        }
        // The longer (later) sentence resolved first.
        assert_eq!(audio_order, vec![1, 0]);
    }

    #[tokio::test]
    async fn failure_is_isolated_to_its_sentence() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher = SynthesisDispatcher::new(Arc::new(ReversingTts), 0, tx);
        dispatcher.dispatch("this one will fail".to_string());
        dispatcher.dispatch("this one is fine".to_string());
        dispatcher.finish();

        let mut failed = None;
        let mut ready = None;
        let mut total = None;
        while failed.is_none() || ready.is_none() || total.is_none() {
            match rx.recv().await.unwrap() {
                DispatchEvent::SynthesisFailed { index, text, .. } => failed = Some((index, text)),
                DispatchEvent::AudioReady { index, .. } => ready = Some(index),
                DispatchEvent::StreamEnded { total: t, .. } => total = Some(t),
                _ => {}
            }
        }
        assert_eq!(failed, Some((0, "this one will fail".to_string())));
        assert_eq!(ready, Some(1));
        assert_eq!(total, Some(2));
    }

    #[tokio::test]
    async fn empty_audio_counts_as_failure() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut dispatcher =
            SynthesisDispatcher::new(Arc::new(crate::tts::PlaceholderTts), 1, tx);
        dispatcher.dispatch("Nothing comes back.".to_string());
        let _text = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            DispatchEvent::SynthesisFailed { index, .. } => assert_eq!(index, 0),
            other => panic!("expected SynthesisFailed, got {:?}", other),
        }
    }
}
