//! The conversation loop: the single owner of a conversation's turns.
//!
//! `ConversationSession::run` selects over control commands, capture events, dispatcher
//! events, playback events and its own spawned completions (transcriptions, grace
//! timers). Each of these becomes a `TurnInput`; the resulting `TurnAction`s are executed
//! here against the collaborators. Nothing else mutates turn state.
//!
//! Every reply runs under the sequencer's current generation. Dispatcher and playback
//! events carrying any other generation are stale and dropped on arrival.

use crate::capture::{AudioTurn, CaptureEvent, CaptureSource};
use crate::config::VoiceConfig;
use crate::dispatcher::DispatchEvent;
use crate::error::{FailureKind, VoiceError, VoiceResult};
use crate::events::ConversationEvent;
use crate::output::{AudioOutput, FallbackVoice};
use crate::pipeline::ResponsePipeline;
use crate::responder::ResponseSource;
use crate::sequencer::{AudioItem, PlaybackEvent, PlaybackSequencer};
use crate::stt::Transcriber;
use crate::tts::SpeechSynthesizer;
use crate::turn::{TurnAction, TurnInput, TurnState, TurnStateMachine};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// The external services a session drives.
pub struct Collaborators {
    pub capture: Box<dyn CaptureSource>,
    pub transcriber: Arc<dyn Transcriber>,
    pub responder: Arc<dyn ResponseSource>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub output: Arc<dyn AudioOutput>,
    pub fallback: Arc<dyn FallbackVoice>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Control {
    Start,
    End,
}

/// Cloneable remote control for a running session. Dropping every handle ends the session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::UnboundedSender<Control>,
}

impl SessionHandle {
    /// The user's start gesture.
    pub fn start(&self) -> VoiceResult<()> {
        self.send(Control::Start)
    }

    /// End the conversation.
    pub fn end(&self) -> VoiceResult<()> {
        self.send(Control::End)
    }

    fn send(&self, control: Control) -> VoiceResult<()> {
        self.tx
            .send(control)
            .map_err(|_| VoiceError::ChannelSend("session has stopped".to_string()))
    }
}

/// Completions of work the session spawned itself.
enum Internal {
    Transcribed { epoch: u64, result: VoiceResult<String> },
    GraceElapsed { epoch: u64 },
}

/// One spoken conversation.
pub struct ConversationSession {
    machine: TurnStateMachine,
    capture: Box<dyn CaptureSource>,
    transcriber: Arc<dyn Transcriber>,
    responder: Arc<dyn ResponseSource>,
    pipeline: ResponsePipeline,
    sequencer: PlaybackSequencer,
    greeting: String,

    control_rx: mpsc::UnboundedReceiver<Control>,
    dispatch_rx: mpsc::UnboundedReceiver<DispatchEvent>,
    playback_rx: mpsc::UnboundedReceiver<PlaybackEvent>,
    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    events: mpsc::UnboundedSender<ConversationEvent>,

    /// Stops the current reply's token stream.
    response_cancel: CancellationToken,
    /// Generation the current reply runs under.
    generation: u64,
    transcription_epoch: u64,
    grace_epoch: u64,
    inputs: VecDeque<TurnInput>,
}

impl ConversationSession {
    /// Wire a session. Returns the session (call `run`), its control handle and the
    /// event stream for the application.
    pub fn new(
        collaborators: Collaborators,
        config: &VoiceConfig,
    ) -> (Self, SessionHandle, mpsc::UnboundedReceiver<ConversationEvent>) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        let (sequencer, playback_rx) =
            PlaybackSequencer::new(collaborators.output, collaborators.fallback, &config.sequencer);
        let pipeline = ResponsePipeline::new(
            collaborators.synthesizer,
            config.segmenter.min_sentence_length,
            dispatch_tx,
        );

        let session = Self {
            machine: TurnStateMachine::new(&config.turn),
            capture: collaborators.capture,
            transcriber: collaborators.transcriber,
            responder: collaborators.responder,
            pipeline,
            sequencer,
            greeting: config.turn.greeting.clone(),
            control_rx,
            dispatch_rx,
            playback_rx,
            internal_tx,
            internal_rx,
            events,
            response_cancel: CancellationToken::new(),
            generation: 0,
            transcription_epoch: 0,
            grace_epoch: 0,
            inputs: VecDeque::new(),
        };
        (session, SessionHandle { tx: control_tx }, events_rx)
    }

    pub fn state(&self) -> TurnState {
        self.machine.state()
    }

    /// Drive the conversation until it ends. Returns the terminal state.
    pub async fn run(mut self) -> VoiceResult<TurnState> {
        let mut capture_rx = self
            .capture
            .take_events()
            .ok_or_else(|| VoiceError::Unknown("capture events already taken".to_string()))?;
        let mut capture_open = true;
        info!("🎭 Conversation session running");

        while !self.machine.is_terminal() {
            tokio::select! {
                control = self.control_rx.recv() => match control {
                    Some(Control::Start) => self.apply(TurnInput::StartRequested),
                    Some(Control::End) | None => self.apply(TurnInput::EndRequested),
                },
                event = capture_rx.recv(), if capture_open => match event {
                    Some(event) => self.on_capture(event),
                    None => {
                        capture_open = false;
                        let closed = VoiceError::ChannelSend("capture event stream closed".to_string());
                        self.apply(TurnInput::fatal(&closed));
                    }
                },
                Some(event) = self.dispatch_rx.recv() => self.on_dispatch(event),
                Some(event) = self.playback_rx.recv() => self.on_playback(event),
                Some(internal) = self.internal_rx.recv() => self.on_internal(internal),
            }
        }

        self.response_cancel.cancel();
        let state = self.machine.state();
        info!("🛑 Conversation session finished ({})", state);
        Ok(state)
    }

    fn emit(&self, event: ConversationEvent) {
        if self.events.send(event).is_err() {
            debug!("session: event receiver dropped");
        }
    }

    fn apply(&mut self, input: TurnInput) {
        self.inputs.push_back(input);
        while let Some(input) = self.inputs.pop_front() {
            for action in self.machine.handle(input) {
                self.execute(action);
            }
        }
    }

    fn execute(&mut self, action: TurnAction) {
        match action {
            TurnAction::Transition { from, to } => {
                self.emit(ConversationEvent::StateChanged { from, to });
            }
            TurnAction::SpeakGreeting => {
                let generation = self.begin_reply();
                self.pipeline.speak(self.greeting.clone(), generation);
            }
            TurnAction::StartCapture => {
                if let Err(e) = self.capture.start() {
                    error!("Capture failed to start: {}", e);
                    self.inputs.push_back(TurnInput::fatal(&e));
                }
            }
            TurnAction::PauseCapture => self.capture.pause(),
            TurnAction::StopCapture => self.capture.destroy(),
            TurnAction::Transcribe(audio) => self.transcribe(audio),
            TurnAction::EmitTranscript(text) => {
                self.emit(ConversationEvent::Transcript { text });
            }
            TurnAction::BeginResponse(transcript) => {
                let generation = self.begin_reply();
                self.pipeline.respond(
                    Arc::clone(&self.responder),
                    transcript,
                    generation,
                    self.response_cancel.clone(),
                );
            }
            TurnAction::CancelPlayback => {
                self.generation = self.sequencer.cancel();
            }
            TurnAction::CancelResponse => self.response_cancel.cancel(),
            TurnAction::ScheduleGrace(delay) => self.schedule_grace(delay),
            TurnAction::ReportError { kind, message, fatal } => {
                self.emit(ConversationEvent::error(kind, message, fatal));
            }
        }
    }

    /// Fresh generation and cancellation scope for the next reply.
    fn begin_reply(&mut self) -> u64 {
        self.response_cancel.cancel();
        self.response_cancel = CancellationToken::new();
        self.generation = self.sequencer.begin_turn();
        self.generation
    }

    fn transcribe(&mut self, audio: AudioTurn) {
        self.transcription_epoch += 1;
        let epoch = self.transcription_epoch;
        let transcriber = Arc::clone(&self.transcriber);
        let tx = self.internal_tx.clone();
        debug!(epoch, samples = audio.samples.len(), "session: transcribing");
        tokio::spawn(async move {
            let result = transcriber.transcribe(&audio).await;
            let _ = tx.send(Internal::Transcribed { epoch, result });
        });
    }

    fn schedule_grace(&mut self, delay: Duration) {
        self.grace_epoch += 1;
        let epoch = self.grace_epoch;
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(Internal::GraceElapsed { epoch });
        });
    }

    fn on_capture(&mut self, event: CaptureEvent) {
        let input = match event {
            CaptureEvent::SpeechStart => TurnInput::SpeechStarted,
            CaptureEvent::SpeechEnd(audio) => TurnInput::SpeechEnded(audio),
            CaptureEvent::Misfire => TurnInput::Misfire,
        };
        self.apply(input);
    }

    fn on_internal(&mut self, internal: Internal) {
        match internal {
            Internal::Transcribed { epoch, result } if epoch == self.transcription_epoch => match result {
                Ok(text) => self.apply(TurnInput::TranscriptReady(text)),
                Err(e) if e.is_fatal() => self.apply(TurnInput::fatal(&e)),
                Err(e) => self.apply(TurnInput::TranscriptionFailed(e.to_string())),
            },
            Internal::GraceElapsed { epoch } if epoch == self.grace_epoch => {
                self.apply(TurnInput::GraceElapsed);
            }
            _ => debug!("session: dropping superseded completion"),
        }
    }

    fn on_dispatch(&mut self, event: DispatchEvent) {
        let generation = event.generation();
        if generation != self.generation {
            debug!(generation, current = self.generation, "session: dropping stale dispatch event");
            return;
        }
        match event {
            DispatchEvent::TextReady { index, text, .. } => {
                self.sequencer.announce(generation, index, &text);
                self.emit(ConversationEvent::Text { index, text });
            }
            DispatchEvent::AudioReady {
                index, payload, text, ..
            } => {
                self.emit(ConversationEvent::AudioReady {
                    index,
                    bytes: payload.clone(),
                });
                self.sequencer.enqueue(generation, AudioItem::audio(index, payload, text));
            }
            DispatchEvent::SynthesisFailed {
                index, text, reason, ..
            } => {
                debug!(index, "session: synthesis failed ({})", reason);
                self.emit(ConversationEvent::SynthesisFailed {
                    index,
                    text: text.clone(),
                });
                self.sequencer.enqueue(generation, AudioItem::fallback(index, text));
            }
            DispatchEvent::StreamEnded { total, .. } => {
                self.emit(ConversationEvent::TurnComplete { sentences: total });
                self.sequencer.finish(generation, total);
                self.apply(TurnInput::ResponseComplete);
            }
            DispatchEvent::StreamFailed { reason, .. } => {
                self.apply(TurnInput::ResponseFailed(reason));
            }
        }
    }

    fn on_playback(&mut self, event: PlaybackEvent) {
        match event {
            PlaybackEvent::Started { generation, .. } | PlaybackEvent::FellBack { generation, .. }
                if generation == self.generation =>
            {
                self.apply(TurnInput::PlayableReady);
            }
            PlaybackEvent::Skipped { generation, index } if generation == self.generation => {
                warn!(index, "session: sentence audio never arrived");
                self.emit(ConversationEvent::error(
                    FailureKind::Synthesis,
                    format!("sentence {} was skipped", index),
                    false,
                ));
            }
            PlaybackEvent::Complete { generation } if generation == self.generation => {
                self.apply(TurnInput::PlaybackComplete);
            }
            stale => debug!(?stale, "session: dropping stale playback event"),
        }
    }
}
