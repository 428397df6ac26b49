//! **Response source**: the token stream the assistant speaks.
//!
//! `respond` returns a channel of text deltas. The channel closing is the "stream ended"
//! signal; an `Err` item means the stream broke off. Dropping the receiver stops generation.

use crate::config::{api_key_from_env, LlmConfig};
use crate::error::{VoiceError, VoiceResult};
use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Capacity of the delta channel handed to the caller.
const DELTA_CHANNEL_CAPACITY: usize = 100;

/// A conversational model that answers a transcript with streamed text.
#[async_trait]
pub trait ResponseSource: Send + Sync {
    /// Start answering `transcript`.
    async fn respond(&self, transcript: &str) -> VoiceResult<mpsc::Receiver<VoiceResult<String>>>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Debug)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One parsed server-sent event from a chat completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
enum SseItem {
    Delta(String),
    Done,
}

/// Incremental `data: ...` line parser; network chunks may split lines (and UTF-8
/// sequences) anywhere, so raw bytes are buffered and only complete lines are decoded.
#[derive(Debug, Default)]
struct SseParser {
    buffer: Vec<u8>,
}

impl SseParser {
    fn push(&mut self, bytes: &[u8]) -> Vec<SseItem> {
        self.buffer.extend_from_slice(bytes);
        let mut items = Vec::new();
        while let Some(newline) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw: Vec<u8> = self.buffer.drain(..=newline).collect();
            let line = match std::str::from_utf8(&raw) {
                Ok(line) => line.trim(),
                Err(e) => {
                    warn!("chat: dropping SSE line with invalid UTF-8: {}", e);
                    continue;
                }
            };

            let Some(data) = line.strip_prefix("data:") else {
                continue;
            };
            let data = data.trim_start();
            if data == "[DONE]" {
                items.push(SseItem::Done);
                continue;
            }
            match serde_json::from_str::<StreamChunk>(data) {
                Ok(chunk) => {
                    if let Some(content) = chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
                        if !content.is_empty() {
                            items.push(SseItem::Delta(content));
                        }
                    }
                }
                Err(e) => debug!("chat: failed to parse SSE chunk: {} - data: {}", e, data),
            }
        }
        items
    }
}

/// Streaming chat over an OpenAI-compatible `/chat/completions` endpoint.
///
/// Keeps a rolling in-memory history of the last `history_turns` exchanges.
#[derive(Debug, Clone)]
pub struct OpenAiChat {
    pub base_url: String,
    pub model: String,
    api_key: String,
    system_prompt: String,
    temperature: f32,
    history_turns: usize,
    history: Arc<Mutex<VecDeque<(ChatMessage, ChatMessage)>>>,
    client: reqwest::Client,
}

impl OpenAiChat {
    /// Build from config plus `CADENCE_LLM_API_KEY` (or `OPENAI_API_KEY`).
    pub fn from_env(config: &LlmConfig) -> VoiceResult<Self> {
        let api_key = api_key_from_env("LLM")?;
        Self::new(config, api_key)
    }

    pub fn new(config: &LlmConfig, api_key: impl Into<String>) -> VoiceResult<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| VoiceError::Response(e.to_string()))?;
        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key: api_key.into(),
            system_prompt: config.system_prompt.clone(),
            temperature: config.temperature,
            history_turns: config.history_turns,
            history: Arc::new(Mutex::new(VecDeque::new())),
            client,
        })
    }

    fn build_messages(&self, transcript: &str) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system",
            content: self.system_prompt.clone(),
        }];
        for (user, assistant) in self.history.lock().iter() {
            messages.push(user.clone());
            messages.push(assistant.clone());
        }
        messages.push(ChatMessage {
            role: "user",
            content: transcript.to_string(),
        });
        messages
    }

    fn remember(
        history: &Mutex<VecDeque<(ChatMessage, ChatMessage)>>,
        limit: usize,
        transcript: String,
        reply: String,
    ) {
        if limit == 0 || reply.trim().is_empty() {
            return;
        }
        let mut history = history.lock();
        history.push_back((
            ChatMessage {
                role: "user",
                content: transcript,
            },
            ChatMessage {
                role: "assistant",
                content: reply,
            },
        ));
        while history.len() > limit {
            history.pop_front();
        }
    }

    /// Exchanges currently remembered.
    pub fn history_len(&self) -> usize {
        self.history.lock().len()
    }
}

#[async_trait]
impl ResponseSource for OpenAiChat {
    async fn respond(&self, transcript: &str) -> VoiceResult<mpsc::Receiver<VoiceResult<String>>> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": self.build_messages(transcript),
            "stream": true,
            "temperature": self.temperature,
        });
        let url = format!("{}/chat/completions", self.base_url);
        info!(model = %self.model, "chat: streaming session started");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(VoiceError::Response(format!("chat API error ({}): {}", status, error_text)));
        }

        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);
        let history = Arc::clone(&self.history);
        let limit = self.history_turns;
        let transcript = transcript.to_string();
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut parser = SseParser::default();
            let mut reply = String::new();

            'read: while let Some(chunk) = stream.next().await {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        warn!("chat: stream error: {}", e);
                        let _ = tx.send(Err(VoiceError::Network(e))).await;
                        break;
                    }
                };
                for item in parser.push(&bytes) {
                    match item {
                        SseItem::Done => break 'read,
                        SseItem::Delta(delta) => {
                            reply.push_str(&delta);
                            if tx.send(Ok(delta)).await.is_err() {
                                debug!("chat: receiver dropped, stopping stream");
                                break 'read;
                            }
                        }
                    }
                }
            }
            // Partial replies are remembered too: that is what the user heard.
            Self::remember(&history, limit, transcript, reply);
        });

        Ok(rx)
    }
}

/// Canned replies streamed word by word. For tests and offline runs.
#[derive(Debug)]
pub struct ScriptedResponder {
    replies: Vec<String>,
    next: AtomicUsize,
    word_delay: Duration,
    fail_after_words: Option<usize>,
}

impl ScriptedResponder {
    /// Cycle through `replies`, one per turn.
    pub fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: replies.into_iter().map(Into::into).collect(),
            next: AtomicUsize::new(0),
            word_delay: Duration::ZERO,
            fail_after_words: None,
        }
    }

    /// Answer every transcript by repeating it back.
    pub fn echo() -> Self {
        Self::new(Vec::<String>::new())
    }

    /// Pause between words to mimic token streaming.
    pub fn with_word_delay(mut self, delay: Duration) -> Self {
        self.word_delay = delay;
        self
    }

    /// Break every stream off with an error after this many words.
    pub fn failing_after(mut self, words: usize) -> Self {
        self.fail_after_words = Some(words);
        self
    }

    fn reply_for(&self, transcript: &str) -> String {
        if self.replies.is_empty() {
            return format!("You said: {}", transcript.trim());
        }
        let i = self.next.fetch_add(1, Ordering::SeqCst) % self.replies.len();
        self.replies[i].clone()
    }
}

#[async_trait]
impl ResponseSource for ScriptedResponder {
    async fn respond(&self, transcript: &str) -> VoiceResult<mpsc::Receiver<VoiceResult<String>>> {
        let reply = self.reply_for(transcript);
        let delay = self.word_delay;
        let fail_after = self.fail_after_words;
        let (tx, rx) = mpsc::channel(DELTA_CHANNEL_CAPACITY);

        tokio::spawn(async move {
            for (sent, word) in reply.split_inclusive(' ').enumerate() {
                if fail_after == Some(sent) {
                    let _ = tx
                        .send(Err(VoiceError::Response("scripted stream failure".to_string())))
                        .await;
                    return;
                }
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                if tx.send(Ok(word.to_string())).await.is_err() {
                    return;
                }
            }
        });
        Ok(rx)
    }
}
