//! # Cadence Voice - spoken replies for conversational AI
//!
//! Turns a token-by-token reply into naturally paced, interruptible speech while the
//! microphone drives turn taking with barge-in.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────┐
//! │                        ConversationSession                            │
//! │                                                                       │
//! │  tokens ─▶ ┌────────────┐ sentences ┌────────────┐  audio / failure   │
//! │            │ Segmenter  │ ────────▶ │ Dispatcher │ ───────┐ (any order)│
//! │            └────────────┘           └────────────┘        ▼           │
//! │                                                    ┌────────────┐     │
//! │  ┌──────────────┐  speech start/end   ┌─────────┐  │ Sequencer  │     │
//! │  │ Mic + VAD    │ ──────────────────▶ │  Turn   │◀─│ (in order) │     │
//! │  │ (cpal, gap)  │ ◀── pause/start ─── │ machine │  └─────┬──────┘     │
//! │  └──────────────┘                     └────┬────┘        ▼            │
//! │                                 barge-in ──┴──▶ cancel  Speaker       │
//! └───────────────────────────────────────────────────────────────────────┘
//! ```

pub mod capture;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod output;
pub mod pipeline;
pub mod responder;
pub mod segmenter;
pub mod sequencer;
pub mod session;
pub mod stt;
pub mod tts;
pub mod turn;

pub use capture::{
    AudioTurn, CaptureEvent, CaptureSource, MicCapture, SimulatedCapture, SimulatedCaptureHandle,
};
pub use config::VoiceConfig;
pub use dispatcher::{DispatchEvent, Sentence, SynthesisDispatcher};
pub use error::{FailureKind, VoiceError, VoiceResult};
pub use events::ConversationEvent;
pub use output::{AudioOutput, FallbackVoice, RodioOutput, SilentVoice, SystemVoice};
pub use pipeline::ResponsePipeline;
pub use responder::{OpenAiChat, ResponseSource, ScriptedResponder};
pub use segmenter::SentenceSegmenter;
pub use sequencer::{AudioItem, PlaybackEvent, PlaybackSequencer};
pub use session::{Collaborators, ConversationSession, SessionHandle};
#[cfg(feature = "whisper")]
pub use stt::WhisperStt;
pub use stt::{create_best_stt, OpenAiStt, PlaceholderStt, Transcriber};
pub use tts::{create_best_tts, OpenAiTts, PlaceholderTts, SpeechSynthesizer};
pub use turn::{TurnAction, TurnInput, TurnState, TurnStateMachine};
