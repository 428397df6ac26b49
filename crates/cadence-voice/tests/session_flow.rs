//! End-to-end conversation tests over simulated capture, canned replies and a recording
//! speaker. No audio hardware or network needed.

use async_trait::async_trait;
use cadence_voice::{
    AudioOutput, Collaborators, ConversationEvent, ConversationSession, FailureKind, FallbackVoice,
    PlaceholderStt, ScriptedResponder, SessionHandle, SimulatedCapture, SimulatedCaptureHandle,
    SpeechSynthesizer, TurnState, VoiceConfig, VoiceError, VoiceResult,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// "Synthesizes" a sentence as its own UTF-8 bytes, refusing sentences containing `refuse`.
struct TextTts {
    refuse: Option<&'static str>,
}

#[async_trait]
impl SpeechSynthesizer for TextTts {
    async fn synthesize(&self, text: &str) -> VoiceResult<Vec<u8>> {
        if let Some(word) = self.refuse {
            if text.contains(word) {
                return Err(VoiceError::Tts("voice unavailable".into()));
            }
        }
        Ok(text.as_bytes().to_vec())
    }
}

#[derive(Default)]
struct RecordingOutput {
    delay: Duration,
    played: Mutex<Vec<String>>,
    stops: AtomicUsize,
}

#[async_trait]
impl AudioOutput for RecordingOutput {
    async fn play(&self, bytes: &[u8]) -> VoiceResult<()> {
        self.played.lock().push(String::from_utf8_lossy(bytes).into_owned());
        tokio::time::sleep(self.delay).await;
        Ok(())
    }

    fn stop(&self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RecordingFallback {
    spoken: Mutex<Vec<String>>,
}

#[async_trait]
impl FallbackVoice for RecordingFallback {
    async fn speak(&self, text: &str) -> VoiceResult<()> {
        self.spoken.lock().push(text.to_string());
        Ok(())
    }

    fn stop(&self) {}
}

struct Harness {
    handle: SessionHandle,
    capture: SimulatedCaptureHandle,
    events: mpsc::UnboundedReceiver<ConversationEvent>,
    output: Arc<RecordingOutput>,
    fallback: Arc<RecordingFallback>,
    task: JoinHandle<VoiceResult<TurnState>>,
}

struct Setup {
    config: VoiceConfig,
    transcriber: PlaceholderStt,
    responder: ScriptedResponder,
    refuse: Option<&'static str>,
    play_delay: Duration,
}

impl Setup {
    fn new(transcript: &str, replies: &[&str]) -> Self {
        let mut config = VoiceConfig::default();
        config.turn.greeting = "Hello there, welcome back.".to_string();
        config.turn.interrupt_grace_ms = 100;
        Self {
            config,
            transcriber: PlaceholderStt::with_response(transcript),
            responder: ScriptedResponder::new(replies.iter().copied()),
            refuse: None,
            play_delay: Duration::from_millis(10),
        }
    }

    fn spawn(self) -> Harness {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let (capture, capture_handle) = SimulatedCapture::new();
        let output = Arc::new(RecordingOutput {
            delay: self.play_delay,
            ..Default::default()
        });
        let fallback = Arc::new(RecordingFallback::default());
        let output_dyn: Arc<dyn AudioOutput> = output.clone();
        let fallback_dyn: Arc<dyn FallbackVoice> = fallback.clone();

        let (session, handle, events) = ConversationSession::new(
            Collaborators {
                capture: Box::new(capture),
                transcriber: Arc::new(self.transcriber),
                responder: Arc::new(self.responder),
                synthesizer: Arc::new(TextTts { refuse: self.refuse }),
                output: output_dyn,
                fallback: fallback_dyn,
            },
            &self.config,
        );
        assert_eq!(session.state(), TurnState::ReadyToStart);

        Harness {
            handle,
            capture: capture_handle,
            events,
            output,
            fallback,
            task: tokio::spawn(session.run()),
        }
    }
}

impl Harness {
    /// Collect events up to and including the first one matching `done`.
    async fn until(&mut self, done: impl Fn(&ConversationEvent) -> bool) -> Vec<ConversationEvent> {
        let mut seen = Vec::new();
        loop {
            let event = timeout(Duration::from_secs(5), self.events.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out; saw {:?}", seen))
                .expect("event stream closed");
            let matched = done(&event);
            seen.push(event);
            if matched {
                return seen;
            }
        }
    }

    async fn until_entered(&mut self, state: TurnState) -> Vec<ConversationEvent> {
        self.until(|e| matches!(e, ConversationEvent::StateChanged { to, .. } if *to == state))
            .await
    }

    /// Start the session and wait for the greeting to finish.
    async fn start_and_greet(&mut self) {
        self.handle.start().unwrap();
        self.until_entered(TurnState::Listening).await;
    }

    fn played(&self) -> Vec<String> {
        self.output.played.lock().clone()
    }
}

fn texts(events: &[ConversationEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::Text { text, .. } => Some(text.clone()),
            _ => None,
        })
        .collect()
}

fn position(events: &[ConversationEvent], pred: impl Fn(&ConversationEvent) -> bool) -> Option<usize> {
    events.iter().position(pred)
}

#[tokio::test]
async fn full_turn_speaks_the_reply_in_order_and_listens_again() {
    let mut h = Setup::new(
        "what is the weather like",
        &["It is sunny and warm today. Enjoy your walk in the park!"],
    )
    .spawn();

    h.start_and_greet().await;
    assert_eq!(h.played(), vec!["Hello there, welcome back."]);
    assert!(h.capture.is_active());

    assert!(h.capture.utter(Duration::from_millis(400)));
    let events = h.until_entered(TurnState::Listening).await;

    let transcript = position(&events, |e| {
        matches!(e, ConversationEvent::Transcript { text } if text == "what is the weather like")
    })
    .expect("transcript event");
    let first_text = position(&events, |e| matches!(e, ConversationEvent::Text { .. })).expect("text event");
    let first_audio =
        position(&events, |e| matches!(e, ConversationEvent::AudioReady { .. })).expect("audio event");
    assert!(transcript < first_text);
    assert!(transcript < first_audio);

    assert_eq!(
        texts(&events),
        vec!["It is sunny and warm today.", "Enjoy your walk in the park!"]
    );
    assert!(events.contains(&ConversationEvent::TurnComplete { sentences: 2 }));

    let states: Vec<(TurnState, TurnState)> = events
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::StateChanged { from, to } => Some((*from, *to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![
            (TurnState::Listening, TurnState::Processing),
            (TurnState::Processing, TurnState::AiSpeaking),
            (TurnState::AiSpeaking, TurnState::Listening),
        ]
    );

    assert_eq!(
        h.played(),
        vec![
            "Hello there, welcome back.",
            "It is sunny and warm today.",
            "Enjoy your walk in the park!",
        ]
    );
    assert!(h.capture.is_active());

    h.handle.end().unwrap();
    assert_eq!(h.task.await.unwrap().unwrap(), TurnState::Ended);
}

#[tokio::test]
async fn barge_in_silences_the_reply_and_takes_the_new_utterance() {
    let mut setup = Setup::new(
        "tell me a story",
        &[
            "Once upon a time there was a first story. It went on and on for a first while. The first story never seemed to end.",
            "Fine, here is a second and shorter answer.",
        ],
    );
    setup.play_delay = Duration::from_millis(300);
    let mut h = setup.spawn();

    h.start_and_greet().await;
    assert!(h.capture.utter(Duration::from_millis(400)));
    h.until(|e| {
        matches!(
            e,
            ConversationEvent::StateChanged {
                from: TurnState::Processing,
                to: TurnState::AiSpeaking
            }
        )
    })
    .await;

    // Barge in while the first reply is still playing.
    assert!(h.capture.is_active());
    assert!(h.capture.speech_start());
    h.until_entered(TurnState::Interrupted).await;
    assert!(h.output.stops.load(Ordering::SeqCst) >= 1);
    assert!(h.capture.speech_end(cadence_voice::AudioTurn::from_samples(
        vec![0.05; 8_000],
        16_000
    )));

    let after = h.until_entered(TurnState::AiSpeaking).await;
    let states: Vec<TurnState> = after
        .iter()
        .filter_map(|e| match e {
            ConversationEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect();
    assert_eq!(
        states,
        vec![TurnState::Listening, TurnState::Processing, TurnState::AiSpeaking]
    );

    let after = {
        let mut all = after;
        all.extend(h.until_entered(TurnState::Listening).await);
        all
    };
    let spoken = texts(&after);
    assert!(!spoken.is_empty());
    assert!(spoken.iter().all(|t| !t.contains("first")), "stale text leaked: {:?}", spoken);

    let played = h.played();
    assert_eq!(played.last().map(String::as_str), Some("Fine, here is a second and shorter answer."));
    assert!(
        !played.iter().any(|t| t.contains("never seemed to end")),
        "interrupted reply kept playing: {:?}",
        played
    );

    h.handle.end().unwrap();
    assert_eq!(h.task.await.unwrap().unwrap(), TurnState::Ended);
}

#[tokio::test]
async fn empty_transcript_returns_to_listening() {
    let mut h = Setup::new("   ", &["This reply should never be requested."]).spawn();

    h.start_and_greet().await;
    assert!(h.capture.utter(Duration::from_millis(400)));
    let events = h.until_entered(TurnState::Listening).await;

    assert!(events.iter().any(|e| matches!(
        e,
        ConversationEvent::Error {
            kind: FailureKind::Transcription,
            fatal: false,
            ..
        }
    )));
    assert!(!events.iter().any(|e| matches!(e, ConversationEvent::Transcript { .. })));
    assert!(h.capture.is_active());
    assert_eq!(h.played(), vec!["Hello there, welcome back."]);

    h.handle.end().unwrap();
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn failed_synthesis_is_spoken_by_the_fallback_voice() {
    let mut setup = Setup::new(
        "read me the list",
        &["The first item is bread and milk. The second item cannot be voiced here."],
    );
    setup.refuse = Some("cannot");
    let mut h = setup.spawn();

    h.start_and_greet().await;
    assert!(h.capture.utter(Duration::from_millis(400)));
    let events = h.until_entered(TurnState::Listening).await;

    assert!(events.iter().any(|e| matches!(
        e,
        ConversationEvent::SynthesisFailed { index: 1, text } if text == "The second item cannot be voiced here."
    )));
    assert_eq!(
        h.fallback.spoken.lock().clone(),
        vec!["The second item cannot be voiced here."]
    );
    assert_eq!(
        h.played(),
        vec!["Hello there, welcome back.", "The first item is bread and milk."]
    );

    h.handle.end().unwrap();
    h.task.await.unwrap().unwrap();
}

#[tokio::test]
async fn denied_microphone_ends_in_error() {
    let mut h = Setup::new("unused", &["unused"]).spawn();
    h.capture.fail_next_start("microphone permission denied");

    h.handle.start().unwrap();
    let events = h.until_entered(TurnState::Error).await;
    assert!(events.contains(&ConversationEvent::StateChanged {
        from: TurnState::AiSpeaking,
        to: TurnState::Error,
    }));

    let rest = h.until(|e| matches!(e, ConversationEvent::Error { .. })).await;
    match rest.last() {
        Some(ConversationEvent::Error { kind, fatal, message }) => {
            assert_eq!(*kind, FailureKind::UnrecoverableInit);
            assert!(*fatal);
            assert!(message.contains("microphone permission denied"));
        }
        other => panic!("expected a fatal error, got {:?}", other),
    }

    assert_eq!(h.task.await.unwrap().unwrap(), TurnState::Error);
    assert!(h.capture.is_destroyed());
}

#[tokio::test]
async fn ending_the_session_releases_capture() {
    let mut h = Setup::new("unused", &["unused"]).spawn();
    h.start_and_greet().await;

    h.handle.end().unwrap();
    let events = h.until_entered(TurnState::Ended).await;
    assert!(events.contains(&ConversationEvent::StateChanged {
        from: TurnState::Listening,
        to: TurnState::Ended,
    }));
    assert_eq!(h.task.await.unwrap().unwrap(), TurnState::Ended);
    assert!(h.capture.is_destroyed());
    assert!(!h.capture.is_active());
    assert!(h.handle.start().is_err());
}
