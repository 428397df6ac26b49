//! Events delivered to the surrounding application (transcript UI, state indicators).

use crate::error::FailureKind;
use crate::turn::TurnState;
use serde::Serialize;

/// What the application sees of a conversation.
///
/// Within one turn `Transcript` always precedes that turn's `Text` and `AudioReady`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationEvent {
    /// What the user said.
    Transcript { text: String },
    /// A sentence of the reply, as soon as it is known.
    Text { index: usize, text: String },
    /// Synthesized audio for sentence `index` is ready.
    AudioReady {
        index: usize,
        #[serde(skip)]
        bytes: Vec<u8>,
    },
    /// Sentence `index` will be spoken by the fallback voice.
    SynthesisFailed { index: usize, text: String },
    /// The reply text is final; playback may still be running.
    TurnComplete { sentences: usize },
    StateChanged { from: TurnState, to: TurnState },
    Error {
        kind: FailureKind,
        message: String,
        fatal: bool,
    },
}

impl ConversationEvent {
    pub fn error(kind: FailureKind, message: impl Into<String>, fatal: bool) -> Self {
        ConversationEvent::Error {
            kind,
            message: message.into(),
            fatal,
        }
    }
}
