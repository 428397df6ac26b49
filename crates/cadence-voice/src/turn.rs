//! Turn taking for a spoken conversation.
//!
//! `TurnStateMachine` is pure: it takes one `TurnInput` at a time and answers with the
//! `TurnAction`s the session must perform, in order. It never touches audio, tasks or
//! channels itself, which keeps every transition testable without hardware.
//!
//! ```text
//!  ReadyToStart ──start──▶ AiSpeaking ──playback done──▶ Listening ──speech end──▶ Processing
//!                              │  ▲                          ▲                        │
//!                  speech start│  └────── first playable ────┼────────────────────────┘
//!                              ▼                             │
//!                         Interrupted ──── grace elapsed ────┘
//! ```

use crate::capture::AudioTurn;
use crate::config::TurnConfig;
use crate::error::{FailureKind, VoiceError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Where the conversation currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    ReadyToStart,
    AiSpeaking,
    Listening,
    Processing,
    Interrupted,
    Ended,
    Error,
}

impl TurnState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TurnState::Ended | TurnState::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnState::ReadyToStart => "ready_to_start",
            TurnState::AiSpeaking => "ai_speaking",
            TurnState::Listening => "listening",
            TurnState::Processing => "processing",
            TurnState::Interrupted => "interrupted",
            TurnState::Ended => "ended",
            TurnState::Error => "error",
        }
    }
}

impl fmt::Display for TurnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything that can move the conversation forward.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnInput {
    /// User start gesture.
    StartRequested,
    /// Capture heard the user begin speaking.
    SpeechStarted,
    /// Capture committed an utterance.
    SpeechEnded(AudioTurn),
    /// Capture heard something too short to be speech.
    Misfire,
    TranscriptReady(String),
    TranscriptionFailed(String),
    /// The first sentence of the response is ready to play.
    PlayableReady,
    /// The response text stream has ended.
    ResponseComplete,
    /// The response text stream broke off.
    ResponseFailed(String),
    /// Every sentence of the response has been played.
    PlaybackComplete,
    /// The post-interruption grace delay is over.
    GraceElapsed,
    EndRequested,
    /// Something that makes forward progress impossible.
    Fatal { kind: FailureKind, message: String },
}

impl TurnInput {
    /// A fatal input classified by the error that caused it.
    pub fn fatal(err: &VoiceError) -> Self {
        TurnInput::Fatal {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Side effects requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnAction {
    Transition { from: TurnState, to: TurnState },
    /// Speak the configured greeting as the first response.
    SpeakGreeting,
    StartCapture,
    PauseCapture,
    /// Tear capture down for good.
    StopCapture,
    Transcribe(AudioTurn),
    EmitTranscript(String),
    /// Start streaming a response to this transcript.
    BeginResponse(String),
    /// Cancel the sequencer (halts output and the fallback voice).
    CancelPlayback,
    /// Stop reading the response stream.
    CancelResponse,
    ScheduleGrace(Duration),
    ReportError {
        kind: FailureKind,
        message: String,
        fatal: bool,
    },
}

/// The conversation's turn-taking logic.
#[derive(Debug, Clone)]
pub struct TurnStateMachine {
    state: TurnState,
    barge_in: bool,
    interrupt_grace: Duration,
    response_complete: bool,
    playback_complete: bool,
    /// Utterance that ended while the grace delay was still running.
    held_speech: Option<AudioTurn>,
}

impl TurnStateMachine {
    pub fn new(config: &TurnConfig) -> Self {
        Self {
            state: TurnState::ReadyToStart,
            barge_in: config.barge_in,
            interrupt_grace: config.interrupt_grace(),
            response_complete: false,
            playback_complete: false,
            held_speech: None,
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Apply one input and return the actions to perform, in order.
    pub fn handle(&mut self, input: TurnInput) -> Vec<TurnAction> {
        let mut actions = Vec::new();
        if self.state.is_terminal() {
            debug!(state = %self.state, ?input, "turn: ignoring input in terminal state");
            return actions;
        }

        match (self.state, input) {
            (_, TurnInput::Fatal { kind, message }) => {
                self.go(TurnState::Error, &mut actions);
                actions.push(TurnAction::CancelPlayback);
                actions.push(TurnAction::CancelResponse);
                actions.push(TurnAction::StopCapture);
                actions.push(TurnAction::ReportError {
                    kind,
                    message,
                    fatal: true,
                });
            }
            (_, TurnInput::EndRequested) => {
                self.go(TurnState::Ended, &mut actions);
                actions.push(TurnAction::CancelPlayback);
                actions.push(TurnAction::CancelResponse);
                actions.push(TurnAction::StopCapture);
            }

            (TurnState::ReadyToStart, TurnInput::StartRequested) => {
                self.reset_response();
                self.go(TurnState::AiSpeaking, &mut actions);
                actions.push(TurnAction::SpeakGreeting);
                if self.barge_in {
                    actions.push(TurnAction::StartCapture);
                }
            }

            (TurnState::AiSpeaking, TurnInput::SpeechStarted) if self.barge_in => {
                info!("⚡ turn: barge-in, silencing playback");
                self.held_speech = None;
                self.go(TurnState::Interrupted, &mut actions);
                actions.push(TurnAction::CancelPlayback);
                actions.push(TurnAction::CancelResponse);
                actions.push(TurnAction::ScheduleGrace(self.interrupt_grace));
            }
            (TurnState::AiSpeaking, TurnInput::ResponseComplete) => {
                self.response_complete = true;
                self.maybe_finish_response(&mut actions);
            }
            (TurnState::AiSpeaking, TurnInput::PlaybackComplete) => {
                self.playback_complete = true;
                self.maybe_finish_response(&mut actions);
            }
            (TurnState::AiSpeaking, TurnInput::ResponseFailed(message)) => {
                // Whatever already reached the speaker keeps playing.
                actions.push(TurnAction::ReportError {
                    kind: FailureKind::Network,
                    message,
                    fatal: false,
                });
            }

            (TurnState::Interrupted, TurnInput::SpeechEnded(audio)) => {
                debug!("turn: utterance ended during grace delay, holding it");
                self.held_speech = Some(audio);
            }
            (TurnState::Interrupted, TurnInput::GraceElapsed) => {
                self.go(TurnState::Listening, &mut actions);
                actions.push(TurnAction::StartCapture);
                if let Some(audio) = self.held_speech.take() {
                    self.submit(audio, &mut actions);
                }
            }

            (TurnState::Listening, TurnInput::SpeechEnded(audio)) => {
                self.submit(audio, &mut actions);
            }

            (TurnState::Processing, TurnInput::TranscriptReady(text)) => {
                let text = text.trim().to_string();
                if text.is_empty() {
                    self.abort_to_listening(FailureKind::Transcription, "nothing was heard".to_string(), &mut actions);
                } else {
                    self.reset_response();
                    actions.push(TurnAction::EmitTranscript(text.clone()));
                    actions.push(TurnAction::BeginResponse(text));
                }
            }
            (TurnState::Processing, TurnInput::TranscriptionFailed(message)) => {
                self.abort_to_listening(FailureKind::Transcription, message, &mut actions);
            }
            (TurnState::Processing, TurnInput::PlayableReady) => {
                self.go(TurnState::AiSpeaking, &mut actions);
                if self.barge_in {
                    actions.push(TurnAction::StartCapture);
                }
            }
            (TurnState::Processing, TurnInput::ResponseFailed(message)) => {
                actions.push(TurnAction::CancelPlayback);
                self.abort_to_listening(FailureKind::Network, message, &mut actions);
            }
            (TurnState::Processing, TurnInput::ResponseComplete) => {
                self.response_complete = true;
                self.maybe_finish_response(&mut actions);
            }
            (TurnState::Processing, TurnInput::PlaybackComplete) => {
                self.playback_complete = true;
                self.maybe_finish_response(&mut actions);
            }

            (state, TurnInput::Misfire) => {
                debug!(%state, "turn: capture misfire");
            }
            (state, input) => {
                debug!(%state, ?input, "turn: input has no effect");
            }
        }
        actions
    }

    fn go(&mut self, to: TurnState, actions: &mut Vec<TurnAction>) {
        let from = self.state;
        if from == to {
            return;
        }
        info!("turn: {} -> {}", from, to);
        self.state = to;
        actions.push(TurnAction::Transition { from, to });
    }

    fn reset_response(&mut self) {
        self.response_complete = false;
        self.playback_complete = false;
    }

    fn submit(&mut self, audio: AudioTurn, actions: &mut Vec<TurnAction>) {
        self.go(TurnState::Processing, actions);
        actions.push(TurnAction::PauseCapture);
        actions.push(TurnAction::Transcribe(audio));
    }

    /// Back to listening only once the stream has ended and the last sentence was heard.
    fn maybe_finish_response(&mut self, actions: &mut Vec<TurnAction>) {
        if self.response_complete && self.playback_complete {
            self.go(TurnState::Listening, actions);
            actions.push(TurnAction::StartCapture);
        }
    }

    fn abort_to_listening(&mut self, kind: FailureKind, message: String, actions: &mut Vec<TurnAction>) {
        warn!("turn: {:?} failure, back to listening: {}", kind, message);
        self.go(TurnState::Listening, actions);
        actions.push(TurnAction::ReportError {
            kind,
            message,
            fatal: false,
        });
        actions.push(TurnAction::StartCapture);
    }
}
