//! Per-turn response pipeline: token stream -> segmenter -> dispatcher.
//!
//! One task per reply. It owns a fresh `SentenceSegmenter` and `SynthesisDispatcher`,
//! so nothing leaks between turns. Cancelling the token stops reading the stream;
//! synthesis requests already in flight still report, under their old generation.

use crate::dispatcher::{DispatchEvent, SynthesisDispatcher};
use crate::responder::ResponseSource;
use crate::segmenter::SentenceSegmenter;
use crate::tts::SpeechSynthesizer;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Spawns the per-turn tasks that turn replies into dispatched sentences.
#[derive(Clone)]
pub struct ResponsePipeline {
    synthesizer: Arc<dyn SpeechSynthesizer>,
    min_sentence_length: usize,
    events: mpsc::UnboundedSender<DispatchEvent>,
}

impl ResponsePipeline {
    pub fn new(
        synthesizer: Arc<dyn SpeechSynthesizer>,
        min_sentence_length: usize,
        events: mpsc::UnboundedSender<DispatchEvent>,
    ) -> Self {
        Self {
            synthesizer,
            min_sentence_length,
            events,
        }
    }

    fn parts(&self, generation: u64) -> (SentenceSegmenter, SynthesisDispatcher) {
        (
            SentenceSegmenter::new(self.min_sentence_length),
            SynthesisDispatcher::new(Arc::clone(&self.synthesizer), generation, self.events.clone()),
        )
    }

    /// Stream the model's answer to `transcript`.
    ///
    /// A broken stream reports `StreamFailed`, then voices what already arrived and
    /// reports `StreamEnded` as usual.
    pub fn respond(
        &self,
        responder: Arc<dyn ResponseSource>,
        transcript: String,
        generation: u64,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let (mut segmenter, mut dispatcher) = self.parts(generation);
        tokio::spawn(async move {
            let opened = tokio::select! {
                _ = cancel.cancelled() => return,
                opened = responder.respond(&transcript) => opened,
            };
            let mut deltas = match opened {
                Ok(rx) => rx,
                Err(e) => {
                    warn!(generation, "pipeline: response request failed: {}", e);
                    dispatcher.fail(e.to_string());
                    dispatcher.finish();
                    return;
                }
            };

            loop {
                let item = tokio::select! {
                    _ = cancel.cancelled() => {
                        debug!(generation, sentences = dispatcher.dispatched(), "pipeline: cancelled");
                        return;
                    }
                    item = deltas.recv() => item,
                };
                match item {
                    Some(Ok(delta)) => {
                        for sentence in segmenter.add_text(&delta) {
                            dispatcher.dispatch(sentence);
                        }
                    }
                    Some(Err(e)) => {
                        warn!(generation, "pipeline: response stream broke off: {}", e);
                        dispatcher.fail(e.to_string());
                        break;
                    }
                    None => break,
                }
            }

            if let Some(rest) = segmenter.flush() {
                dispatcher.dispatch(rest);
            }
            debug!(generation, sentences = dispatcher.dispatched(), "pipeline: stream ended");
            dispatcher.finish();
        })
    }

    /// Voice fixed text, such as the greeting, through the same path as a reply.
    pub fn speak(&self, text: String, generation: u64) -> JoinHandle<()> {
        let (mut segmenter, mut dispatcher) = self.parts(generation);
        tokio::spawn(async move {
            for sentence in segmenter.add_text(&text) {
                dispatcher.dispatch(sentence);
            }
            if let Some(rest) = segmenter.flush() {
                dispatcher.dispatch(rest);
            }
            dispatcher.finish();
        })
    }
}
