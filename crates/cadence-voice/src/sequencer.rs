//! Ordered playback of out-of-order synthesis results.
//!
//! Synthesis completions arrive in whatever order the service answers. The sequencer
//! buffers them in a map keyed by index and a single drain task plays them strictly as
//! 0, 1, 2, ... on one output. Arrivals wake the drain task through a `Notify`, so nothing
//! polls. A missing index is waited for at most `missing_item_timeout`, after which the
//! sentence is spoken by the fallback voice (if its text was announced) and skipped.
//!
//! Every turn runs under a generation number. `cancel()` bumps it, halts the output and
//! the fallback voice, and drops everything buffered; results that show up later with the
//! old generation are discarded on arrival.

use crate::config::SequencerConfig;
use crate::output::{AudioOutput, FallbackVoice};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// One unit of playback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioItem {
    pub index: usize,
    /// Encoded audio, or `None` when the fallback voice must speak `source_text`.
    pub payload: Option<Vec<u8>>,
    pub source_text: String,
}

impl AudioItem {
    pub fn audio(index: usize, payload: Vec<u8>, source_text: impl Into<String>) -> Self {
        Self {
            index,
            payload: Some(payload),
            source_text: source_text.into(),
        }
    }

    pub fn fallback(index: usize, source_text: impl Into<String>) -> Self {
        Self {
            index,
            payload: None,
            source_text: source_text.into(),
        }
    }
}

/// Progress reports from the drain loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybackEvent {
    /// `index` started playing.
    Started { generation: u64, index: usize },
    /// `index` is being spoken by the fallback voice.
    FellBack { generation: u64, index: usize },
    /// `index` never arrived and was skipped.
    Skipped { generation: u64, index: usize },
    /// Everything the producer announced has been played.
    Complete { generation: u64 },
}

struct State {
    generation: u64,
    cancel: CancellationToken,
    pending: BTreeMap<usize, AudioItem>,
    /// Sentence texts by index, so a lost item can still be voiced.
    announced: HashMap<usize, String>,
    next_expected: usize,
    draining: bool,
    /// Set by `finish`: number of items the producer will ever send this generation.
    total: Option<usize>,
    completed: bool,
}

impl State {
    fn reset(&mut self) -> u64 {
        self.generation += 1;
        self.cancel.cancel();
        self.cancel = CancellationToken::new();
        self.pending.clear();
        self.announced.clear();
        self.next_expected = 0;
        self.draining = false;
        self.total = None;
        self.completed = false;
        self.generation
    }

    /// More items are owed before the turn can complete.
    fn awaiting_more(&self) -> bool {
        !self.pending.is_empty() || self.total.is_some_and(|t| self.next_expected < t)
    }

    fn is_complete(&self) -> bool {
        self.pending.is_empty() && self.total.is_some_and(|t| self.next_expected >= t)
    }
}

struct Inner {
    state: Mutex<State>,
    arrivals: Notify,
    /// Held for the duration of one item so a winding-down drain never overlaps a new one.
    play_lock: tokio::sync::Mutex<()>,
    output: Arc<dyn AudioOutput>,
    fallback: Arc<dyn FallbackVoice>,
    missing_item_timeout: Duration,
    events: mpsc::UnboundedSender<PlaybackEvent>,
}

/// Plays audio items strictly in index order, one at a time.
#[derive(Clone)]
pub struct PlaybackSequencer {
    inner: Arc<Inner>,
}

enum Step {
    Play(AudioItem),
    Wait(usize),
}

impl PlaybackSequencer {
    /// Create a sequencer and the receiver for its playback events.
    pub fn new(
        output: Arc<dyn AudioOutput>,
        fallback: Arc<dyn FallbackVoice>,
        config: &SequencerConfig,
    ) -> (Self, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Inner {
            state: Mutex::new(State {
                generation: 0,
                cancel: CancellationToken::new(),
                pending: BTreeMap::new(),
                announced: HashMap::new(),
                next_expected: 0,
                draining: false,
                total: None,
                completed: false,
            }),
            arrivals: Notify::new(),
            play_lock: tokio::sync::Mutex::new(()),
            output,
            fallback,
            missing_item_timeout: config.missing_item_timeout(),
            events,
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            events_rx,
        )
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.inner.state.lock().generation
    }

    /// Next index the drain loop will play.
    pub fn next_expected(&self) -> usize {
        self.inner.state.lock().next_expected
    }

    pub fn is_draining(&self) -> bool {
        self.inner.state.lock().draining
    }

    /// Items buffered and waiting for their turn.
    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Start a fresh turn: new generation, empty queue, indices from 0.
    pub fn begin_turn(&self) -> u64 {
        let generation = self.inner.state.lock().reset();
        debug!(generation, "sequencer: turn started");
        generation
    }

    /// Stop everything now and invalidate all outstanding results.
    pub fn cancel(&self) -> u64 {
        let generation = self.inner.state.lock().reset();
        self.inner.output.stop();
        self.inner.fallback.stop();
        self.inner.arrivals.notify_waiters();
        info!(generation, "sequencer: playback cancelled");
        generation
    }

    /// Remember the text for `index` in case its audio never shows up.
    pub fn announce(&self, generation: u64, index: usize, text: &str) {
        let mut state = self.inner.state.lock();
        if state.generation == generation && index >= state.next_expected {
            state.announced.insert(index, text.to_string());
        }
    }

    /// Buffer an item for playback. Returns `false` if it was discarded as stale or duplicate.
    pub fn enqueue(&self, generation: u64, item: AudioItem) -> bool {
        let mut state = self.inner.state.lock();
        if state.generation != generation {
            debug!(
                index = item.index,
                generation,
                current = state.generation,
                "sequencer: dropping stale item"
            );
            return false;
        }
        if item.index < state.next_expected || state.pending.contains_key(&item.index) {
            debug!(index = item.index, "sequencer: dropping duplicate item");
            return false;
        }
        state.pending.insert(item.index, item);
        self.wake_or_start(&mut state);
        true
    }

    /// The producer will send no more than `total` items this generation.
    pub fn finish(&self, generation: u64, total: usize) {
        let mut state = self.inner.state.lock();
        if state.generation != generation {
            return;
        }
        state.total = Some(total);
        if state.draining {
            self.inner.arrivals.notify_one();
        } else if state.awaiting_more() {
            self.wake_or_start(&mut state);
        } else {
            self.inner.complete_if_done(&mut state);
        }
    }

    fn wake_or_start(&self, state: &mut State) {
        if state.draining {
            self.inner.arrivals.notify_one();
            return;
        }
        state.draining = true;
        let inner = Arc::clone(&self.inner);
        let generation = state.generation;
        let cancel = state.cancel.clone();
        tokio::spawn(async move {
            inner.drain(generation, cancel).await;
        });
    }
}

impl Inner {
    fn emit(&self, event: PlaybackEvent) {
        if self.events.send(event).is_err() {
            debug!("sequencer: event receiver closed");
        }
    }

    fn complete_if_done(&self, state: &mut State) {
        if !state.completed && state.is_complete() {
            state.completed = true;
            debug!(generation = state.generation, "sequencer: playback complete");
            self.emit(PlaybackEvent::Complete {
                generation: state.generation,
            });
        }
    }

    async fn drain(&self, generation: u64, cancel: CancellationToken) {
        // (index, deadline) for the item currently being waited on.
        let mut waiting: Option<(usize, Instant)> = None;

        loop {
            let step = {
                let mut state = self.state.lock();
                if state.generation != generation {
                    return;
                }
                let expected = state.next_expected;
                if let Some(item) = state.pending.remove(&expected) {
                    state.next_expected += 1;
                    Step::Play(item)
                } else if state.awaiting_more() {
                    Step::Wait(expected)
                } else {
                    state.draining = false;
                    self.complete_if_done(&mut state);
                    return;
                }
            };

            match step {
                Step::Play(item) => {
                    waiting = None;
                    if !self.play_item(generation, &cancel, item).await {
                        return;
                    }
                }
                Step::Wait(index) => {
                    let deadline = match waiting {
                        Some((i, deadline)) if i == index => deadline,
                        _ => {
                            let deadline = Instant::now() + self.missing_item_timeout;
                            waiting = Some((index, deadline));
                            deadline
                        }
                    };
                    let timed_out = tokio::select! {
                        _ = cancel.cancelled() => return,
                        _ = self.arrivals.notified() => false,
                        _ = tokio::time::sleep_until(deadline) => true,
                    };
                    if timed_out && !self.skip_missing(generation, &cancel, index).await {
                        return;
                    }
                }
            }
        }
    }

    /// Give up on `index`. Returns `false` if the generation was cancelled meanwhile.
    async fn skip_missing(&self, generation: u64, cancel: &CancellationToken, index: usize) -> bool {
        let text = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            if state.next_expected != index || state.pending.contains_key(&index) {
                // It arrived just in time.
                return true;
            }
            state.next_expected += 1;
            state.announced.remove(&index)
        };

        warn!(
            index,
            timeout_ms = self.missing_item_timeout.as_millis() as u64,
            "sequencer: audio never arrived, skipping"
        );
        self.emit(PlaybackEvent::Skipped { generation, index });

        match text {
            Some(text) => self.speak_fallback(generation, cancel, index, &text).await,
            None => true,
        }
    }

    /// Play one item to completion. Returns `false` if cancelled.
    async fn play_item(&self, generation: u64, cancel: &CancellationToken, item: AudioItem) -> bool {
        let _guard = tokio::select! {
            guard = self.play_lock.lock() => guard,
            _ = cancel.cancelled() => return false,
        };
        if cancel.is_cancelled() {
            return false;
        }
        self.state.lock().announced.remove(&item.index);
        self.emit(PlaybackEvent::Started {
            generation,
            index: item.index,
        });

        let failure = match item.payload.as_deref() {
            Some(bytes) => {
                let played = tokio::select! {
                    played = self.output.play(bytes) => played,
                    _ = cancel.cancelled() => return false,
                };
                played.err().map(|e| e.to_string())
            }
            None => Some("no synthesized audio".to_string()),
        };

        match failure {
            None => true,
            Some(reason) => {
                debug!(index = item.index, "sequencer: using fallback voice ({})", reason);
                self.speak_fallback_locked(generation, cancel, item.index, &item.source_text)
                    .await
            }
        }
    }

    async fn speak_fallback(&self, generation: u64, cancel: &CancellationToken, index: usize, text: &str) -> bool {
        let _guard = tokio::select! {
            guard = self.play_lock.lock() => guard,
            _ = cancel.cancelled() => return false,
        };
        self.speak_fallback_locked(generation, cancel, index, text).await
    }

    /// Caller holds `play_lock`.
    async fn speak_fallback_locked(
        &self,
        generation: u64,
        cancel: &CancellationToken,
        index: usize,
        text: &str,
    ) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        self.emit(PlaybackEvent::FellBack { generation, index });
        let spoken = tokio::select! {
            spoken = self.fallback.speak(text) => spoken,
            _ = cancel.cancelled() => return false,
        };
        if let Err(e) = spoken {
            warn!(index, "sequencer: fallback voice failed: {}", e);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{VoiceError, VoiceResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records what it plays; payload is the index as a decimal string.
    #[derive(Default)]
    struct FakeOutput {
        played: Mutex<Vec<usize>>,
        delay_ms: u64,
        active: AtomicUsize,
        max_active: AtomicUsize,
        stops: AtomicUsize,
        fail_on: Option<usize>,
    }

    impl FakeOutput {
        fn with_delay(delay_ms: u64) -> Self {
            Self {
                delay_ms,
                ..Default::default()
            }
        }

        fn played(&self) -> Vec<usize> {
            self.played.lock().clone()
        }
    }

    #[async_trait]
    impl AudioOutput for FakeOutput {
        async fn play(&self, bytes: &[u8]) -> VoiceResult<()> {
            let index: usize = String::from_utf8_lossy(bytes).parse().unwrap();
            if self.fail_on == Some(index) {
                return Err(VoiceError::Playback("decoder exploded".into()));
            }
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_active.fetch_max(now, Ordering::SeqCst);
            self.played.lock().push(index);
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct FakeFallback {
        spoken: Mutex<Vec<String>>,
        stops: AtomicUsize,
    }

    #[async_trait]
    impl FallbackVoice for FakeFallback {
        async fn speak(&self, text: &str) -> VoiceResult<()> {
            self.spoken.lock().push(text.to_string());
            Ok(())
        }

        fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn item(index: usize) -> AudioItem {
        AudioItem::audio(index, index.to_string().into_bytes(), format!("sentence {}", index))
    }

    fn sequencer(
        output: &Arc<FakeOutput>,
        fallback: &Arc<FakeFallback>,
        timeout_ms: u64,
    ) -> (PlaybackSequencer, mpsc::UnboundedReceiver<PlaybackEvent>) {
        let config = SequencerConfig {
            missing_item_timeout_ms: timeout_ms,
        };
        PlaybackSequencer::new(output.clone(), fallback.clone(), &config)
    }

    async fn wait_complete(rx: &mut mpsc::UnboundedReceiver<PlaybackEvent>, generation: u64) {
        let wait = async {
            while let Some(event) = rx.recv().await {
                if event == (PlaybackEvent::Complete { generation }) {
                    return;
                }
            }
            panic!("event channel closed");
        };
        tokio::time::timeout(Duration::from_secs(5), wait)
            .await
            .expect("playback did not complete");
    }

    #[tokio::test]
    async fn any_arrival_order_plays_in_index_order() {
        let orders: [&[usize]; 4] = [
            &[0, 1, 2, 3, 4],
            &[4, 3, 2, 1, 0],
            &[2, 0, 4, 1, 3],
            &[1, 3, 0, 4, 2],
        ];
        for order in orders {
            let output = Arc::new(FakeOutput::with_delay(5));
            let fallback = Arc::new(FakeFallback::default());
            let (seq, mut rx) = sequencer(&output, &fallback, 2_000);
            let generation = seq.begin_turn();

            for &i in order {
                assert!(seq.enqueue(generation, item(i)));
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
            seq.finish(generation, order.len());
            wait_complete(&mut rx, generation).await;

            assert_eq!(output.played(), vec![0, 1, 2, 3, 4], "arrival order {:?}", order);
            assert_eq!(output.max_active.load(Ordering::SeqCst), 1);
            assert!(fallback.spoken.lock().is_empty());
        }
    }

    #[tokio::test]
    async fn completion_waits_for_the_producer() {
        let output = Arc::new(FakeOutput::with_delay(1));
        let fallback = Arc::new(FakeFallback::default());
        let (seq, mut rx) = sequencer(&output, &fallback, 2_000);
        let generation = seq.begin_turn();

        seq.enqueue(generation, item(0));
        seq.enqueue(generation, item(1));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(output.played(), vec![0, 1]);
        assert!(!seq.is_draining());

        // Queue is empty but the stream has not ended: no completion yet.
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, PlaybackEvent::Complete { .. }));
        }

        seq.finish(generation, 2);
        wait_complete(&mut rx, generation).await;
    }

    #[tokio::test]
    async fn empty_turn_completes_on_finish() {
        let output = Arc::new(FakeOutput::default());
        let fallback = Arc::new(FakeFallback::default());
        let (seq, mut rx) = sequencer(&output, &fallback, 2_000);
        let generation = seq.begin_turn();
        seq.finish(generation, 0);
        assert_eq!(rx.recv().await, Some(PlaybackEvent::Complete { generation }));
    }

    #[tokio::test]
    async fn cancel_mid_drain_stops_and_discards() {
        let output = Arc::new(FakeOutput::with_delay(300));
        let fallback = Arc::new(FakeFallback::default());
        let (seq, mut rx) = sequencer(&output, &fallback, 2_000);
        let old = seq.begin_turn();

        seq.enqueue(old, item(0));
        seq.enqueue(old, item(1));
        seq.enqueue(old, item(2));
        assert_eq!(rx.recv().await, Some(PlaybackEvent::Started { generation: old, index: 0 }));

        let new = seq.cancel();
        assert!(new > old);
        assert_eq!(output.stops.load(Ordering::SeqCst), 1);
        assert_eq!(fallback.stops.load(Ordering::SeqCst), 1);
        assert_eq!(seq.pending_len(), 0);
        assert_eq!(seq.next_expected(), 0);

        // Late results from the cancelled turn are refused.
        assert!(!seq.enqueue(old, item(3)));
        seq.finish(old, 4);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(output.played(), vec![0]);
        while let Ok(event) = rx.try_recv() {
            assert!(!matches!(event, PlaybackEvent::Complete { .. }), "stale completion: {:?}", event);
        }

        // The next turn starts again at index 0.
        assert!(seq.enqueue(new, item(0)));
        seq.finish(new, 1);
        wait_complete(&mut rx, new).await;
        assert_eq!(output.played(), vec![0, 0]);
    }

    #[tokio::test]
    async fn absent_payload_uses_the_fallback_voice() {
        let output = Arc::new(FakeOutput::with_delay(1));
        let fallback = Arc::new(FakeFallback::default());
        let (seq, mut rx) = sequencer(&output, &fallback, 2_000);
        let generation = seq.begin_turn();

        seq.enqueue(generation, AudioItem::fallback(1, "spoken locally"));
        seq.enqueue(generation, item(0));
        seq.enqueue(generation, item(2));
        seq.finish(generation, 3);
        wait_complete(&mut rx, generation).await;

        assert_eq!(output.played(), vec![0, 2]);
        assert_eq!(*fallback.spoken.lock(), vec!["spoken locally".to_string()]);
    }

    #[tokio::test]
    async fn playback_failure_uses_the_fallback_voice() {
        let output = Arc::new(FakeOutput {
            fail_on: Some(1),
            delay_ms: 1,
            ..Default::default()
        });
        let fallback = Arc::new(FakeFallback::default());
        let (seq, mut rx) = sequencer(&output, &fallback, 2_000);
        let generation = seq.begin_turn();

        for i in 0..3 {
            seq.enqueue(generation, item(i));
        }
        seq.finish(generation, 3);
        wait_complete(&mut rx, generation).await;

        assert_eq!(output.played(), vec![0, 2]);
        assert_eq!(*fallback.spoken.lock(), vec!["sentence 1".to_string()]);
    }

    #[tokio::test]
    async fn missing_index_is_skipped_after_timeout() {
        let output = Arc::new(FakeOutput::with_delay(1));
        let fallback = Arc::new(FakeFallback::default());
        let (seq, mut rx) = sequencer(&output, &fallback, 100);
        let generation = seq.begin_turn();

        seq.announce(generation, 0, "lost sentence");
        seq.enqueue(generation, item(1));
        seq.finish(generation, 2);

        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(output.played().is_empty(), "must not play ahead of index 0");

        wait_complete(&mut rx, generation).await;
        assert_eq!(*fallback.spoken.lock(), vec!["lost sentence".to_string()]);
        assert_eq!(output.played(), vec![1]);
    }

    #[tokio::test]
    async fn trailing_missing_index_does_not_stall_completion() {
        let output = Arc::new(FakeOutput::with_delay(1));
        let fallback = Arc::new(FakeFallback::default());
        let (seq, mut rx) = sequencer(&output, &fallback, 80);
        let generation = seq.begin_turn();

        seq.enqueue(generation, item(0));
        seq.finish(generation, 2);
        wait_complete(&mut rx, generation).await;
        assert_eq!(output.played(), vec![0]);
    }

    #[tokio::test]
    async fn duplicates_are_dropped() {
        let output = Arc::new(FakeOutput::with_delay(50));
        let fallback = Arc::new(FakeFallback::default());
        let (seq, _rx) = sequencer(&output, &fallback, 2_000);
        let generation = seq.begin_turn();

        assert!(seq.enqueue(generation, item(1)));
        assert!(!seq.enqueue(generation, item(1)));
    }
}
