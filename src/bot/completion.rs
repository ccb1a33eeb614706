//! Client for an OpenAI-compatible completion API.
//!
//! Both modes share the same trimming policy: on a context-overflow
//! rejection the oldest turn is dropped and the request is rebuilt, until
//! the remote accepts or the history is empty. Overflow is recognized from
//! the structured error body, not matched at call sites.
//!
//! Streaming retries only while connecting. Once deltas flow, any remote
//! failure is fatal for the request.

use std::pin::Pin;
use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use futures::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::bot::context::{PromptContent, PromptMessage, PromptPart, UserInput, build_prompt};
use crate::bot::dialog::Turn;
use crate::bot::registry::ChatMode;
use crate::bot::tokenizer::{HeuristicTokenizer, Tokenizer};
use crate::bot::usage::TokenUsage;

/// Prompt overhead constants used for local estimation.
const TOKENS_PER_MESSAGE: usize = 3;
const TOKENS_PER_IMAGE: usize = 85;
const TOKENS_PROMPT_PRIMING: usize = 2;

#[derive(Debug, Error)]
pub enum CompletionError {
    /// The prompt exceeded the model's context window for one attempt.
    #[error("prompt exceeds the model's context window")]
    ContextOverflow,
    /// The remote still rejects with an empty history. Fatal; the user
    /// must start a new dialog.
    #[error("prompt too large even with all history trimmed")]
    ContextExhausted,
    #[error("completion API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("completion http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed completion response: {0}")]
    Parse(String),
    #[error("completion response contained no content")]
    Empty,
}

impl CompletionError {
    /// Image generation rejected by the remote content filter.
    pub fn is_safety_refusal(&self) -> bool {
        matches!(self, CompletionError::Api { message, .. } if message.contains("safety system"))
    }
}

/// Sampling options sent with every completion request.
#[derive(Debug, Clone, Copy)]
pub struct CompletionOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub top_p: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
}

impl Default for CompletionOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1000,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
        }
    }
}

/// A finished whole-response completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub answer: String,
    pub usage: TokenUsage,
    /// Turns dropped from the history across all overflow retries.
    pub n_trimmed: usize,
}

/// One streaming update.
#[derive(Debug, Clone)]
pub enum StreamUpdate {
    Partial { answer: String, usage: TokenUsage },
    Finished {
        answer: String,
        usage: TokenUsage,
        n_trimmed: usize,
    },
}

pub struct CompletionClient {
    http: reqwest::Client,
    api_key: String,
    api_base: String,
    options: CompletionOptions,
    tokenizer: Arc<dyn Tokenizer>,
}

impl CompletionClient {
    pub fn new(api_key: String, api_base: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            api_base: api_base.trim_end_matches('/').to_string(),
            options: CompletionOptions::default(),
            tokenizer: Arc::new(HeuristicTokenizer),
        }
    }

    pub fn with_options(mut self, options: CompletionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    /// Whole-response completion with trim-on-overflow.
    pub async fn send_chat(
        &self,
        model_key: &str,
        mode: &ChatMode,
        input: &UserInput,
        history: &[Turn],
    ) -> Result<Completion, CompletionError> {
        let n_before = history.len();
        let mut history = history.to_vec();

        loop {
            let prompt = build_prompt(mode, &history, input);
            match self.request_whole(model_key, &prompt).await {
                Ok((answer, usage)) => {
                    return Ok(Completion {
                        answer: answer.trim().to_string(),
                        usage,
                        n_trimmed: n_before - history.len(),
                    });
                }
                Err(CompletionError::ContextOverflow) => {
                    if history.is_empty() {
                        return Err(CompletionError::ContextExhausted);
                    }
                    history.remove(0);
                    debug!("Context overflow, dropped oldest turn ({} left)", history.len());
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Open a streaming completion. Trimming happens while connecting;
    /// the returned stream yields partial updates and exactly one terminal.
    pub async fn stream_chat(
        &self,
        model_key: &str,
        mode: &ChatMode,
        input: &UserInput,
        history: &[Turn],
    ) -> Result<ChatStream, CompletionError> {
        let n_before = history.len();
        let mut history = history.to_vec();

        loop {
            let prompt = build_prompt(mode, &history, input);
            let response = self
                .http
                .post(format!("{}/chat/completions", self.api_base))
                .bearer_auth(&self.api_key)
                .json(&ChatRequest {
                    model: model_key,
                    messages: &prompt,
                    stream: true,
                    temperature: self.options.temperature,
                    max_tokens: self.options.max_tokens,
                    top_p: self.options.top_p,
                    frequency_penalty: self.options.frequency_penalty,
                    presence_penalty: self.options.presence_penalty,
                })
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                match classify_api_error(status, &body) {
                    CompletionError::ContextOverflow => {
                        if history.is_empty() {
                            return Err(CompletionError::ContextExhausted);
                        }
                        history.remove(0);
                        debug!(
                            "Context overflow, dropped oldest turn ({} left)",
                            history.len()
                        );
                        continue;
                    }
                    other => return Err(other),
                }
            }

            let prompt_tokens =
                estimate_prompt_tokens(&prompt, self.tokenizer.as_ref(), model_key);
            return Ok(ChatStream {
                bytes: Box::pin(response.bytes_stream()),
                buf: String::new(),
                answer: String::new(),
                model_key: model_key.to_string(),
                tokenizer: self.tokenizer.clone(),
                prompt_tokens,
                n_trimmed: n_before - history.len(),
                terminal_sent: false,
            });
        }
    }

    async fn request_whole(
        &self,
        model_key: &str,
        prompt: &[PromptMessage],
    ) -> Result<(String, TokenUsage), CompletionError> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&ChatRequest {
                model: model_key,
                messages: prompt,
                stream: false,
                temperature: self.options.temperature,
                max_tokens: self.options.max_tokens,
                top_p: self.options.top_p,
                frequency_penalty: self.options.frequency_penalty,
                presence_penalty: self.options.presence_penalty,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Parse(e.to_string()))?;

        let answer = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(CompletionError::Empty)?;

        let usage = match parsed.usage {
            Some(u) => TokenUsage::new(u.prompt_tokens, u.completion_tokens),
            None => TokenUsage::new(
                estimate_prompt_tokens(prompt, self.tokenizer.as_ref(), model_key) as u64,
                (1 + self.tokenizer.count_tokens(&answer, model_key)) as u64,
            ),
        };

        Ok((answer, usage))
    }

    /// Transcribe an audio file. Opaque remote call; returns the text.
    pub async fn transcribe_audio(
        &self,
        audio: Vec<u8>,
        file_name: &str,
    ) -> Result<String, CompletionError> {
        let part = reqwest::multipart::Part::bytes(audio).file_name(file_name.to_string());
        let form = reqwest::multipart::Form::new()
            .text("model", "whisper-1")
            .part("file", part);

        let response = self
            .http
            .post(format!("{}/audio/transcriptions", self.api_base))
            .bearer_auth(&self.api_key)
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &body));
        }

        let parsed: TranscriptionResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Parse(e.to_string()))?;
        Ok(parsed.text)
    }

    /// Generate images. Opaque remote call; returns decoded image bytes.
    pub async fn generate_images(
        &self,
        prompt: &str,
        n_images: u32,
        size: &str,
    ) -> Result<Vec<Vec<u8>>, CompletionError> {
        let response = self
            .http
            .post(format!("{}/images/generations", self.api_base))
            .bearer_auth(&self.api_key)
            .json(&ImageRequest {
                model: "dall-e-2",
                prompt,
                n: n_images,
                size,
                response_format: "b64_json",
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_api_error(status, &body));
        }

        let parsed: ImageResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::Parse(e.to_string()))?;

        parsed
            .data
            .into_iter()
            .map(|item| {
                BASE64
                    .decode(item.b64_json)
                    .map_err(|e| CompletionError::Parse(e.to_string()))
            })
            .collect()
    }
}

/// An open streaming completion. Single-use; yields `Partial` updates and
/// exactly one `Finished`, then `None`.
pub struct ChatStream {
    bytes: Pin<Box<dyn Stream<Item = reqwest::Result<Bytes>> + Send>>,
    buf: String,
    answer: String,
    model_key: String,
    tokenizer: Arc<dyn Tokenizer>,
    prompt_tokens: usize,
    n_trimmed: usize,
    terminal_sent: bool,
}

impl std::fmt::Debug for ChatStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatStream")
            .field("model_key", &self.model_key)
            .field("prompt_tokens", &self.prompt_tokens)
            .field("n_trimmed", &self.n_trimmed)
            .field("terminal_sent", &self.terminal_sent)
            .finish_non_exhaustive()
    }
}

impl ChatStream {
    /// Turns already dropped while connecting.
    pub fn n_trimmed(&self) -> usize {
        self.n_trimmed
    }

    /// One update per non-terminal delta, then exactly one terminal.
    pub async fn next(&mut self) -> Result<Option<StreamUpdate>, CompletionError> {
        if self.terminal_sent {
            return Ok(None);
        }

        loop {
            // Drain buffered events before reading more from the socket
            while let Some(data) = next_sse_data(&mut self.buf) {
                if data == "[DONE]" {
                    return Ok(Some(self.finish()));
                }
                let parsed: StreamChunk = serde_json::from_str(&data)
                    .map_err(|e| CompletionError::Parse(e.to_string()))?;
                let mut grew = false;
                for choice in parsed.choices {
                    if let Some(content) = choice.delta.content {
                        self.answer.push_str(&content);
                        grew = true;
                    }
                }
                if grew {
                    return Ok(Some(StreamUpdate::Partial {
                        answer: self.answer.clone(),
                        usage: self.estimate_usage(),
                    }));
                }
            }

            match self.bytes.next().await {
                Some(Ok(chunk)) => {
                    self.buf.push_str(&String::from_utf8_lossy(&chunk));
                }
                Some(Err(e)) => return Err(CompletionError::Http(e)),
                None => return Ok(Some(self.finish())),
            }
        }
    }

    fn finish(&mut self) -> StreamUpdate {
        self.terminal_sent = true;
        StreamUpdate::Finished {
            answer: self.answer.trim().to_string(),
            usage: self.estimate_usage(),
            n_trimmed: self.n_trimmed,
        }
    }

    fn estimate_usage(&self) -> TokenUsage {
        TokenUsage::new(
            self.prompt_tokens as u64,
            (1 + self.tokenizer.count_tokens(&self.answer, &self.model_key)) as u64,
        )
    }
}

/// Drain the next `data:` payload from an SSE buffer, if a complete line
/// is available. Comment and event lines are skipped.
fn next_sse_data(buf: &mut String) -> Option<String> {
    while let Some(pos) = buf.find('\n') {
        let line: String = buf.drain(..=pos).collect();
        let line = line.trim();
        if let Some(data) = line.strip_prefix("data:") {
            return Some(data.trim().to_string());
        }
    }
    None
}

/// Local prompt-size estimate, mirroring the remote's accounting overhead.
fn estimate_prompt_tokens(
    messages: &[PromptMessage],
    tokenizer: &dyn Tokenizer,
    model_key: &str,
) -> usize {
    let mut n = 0;
    for msg in messages {
        n += TOKENS_PER_MESSAGE;
        match &msg.content {
            PromptContent::Text(text) => n += tokenizer.count_tokens(text, model_key),
            PromptContent::Parts(parts) => {
                for part in parts {
                    match part {
                        PromptPart::Text { text } => {
                            n += tokenizer.count_tokens(text, model_key);
                        }
                        PromptPart::ImageUrl { .. } => n += TOKENS_PER_IMAGE,
                    }
                }
            }
        }
    }
    n + TOKENS_PROMPT_PRIMING
}

/// Map a non-success response to a typed error. Context overflow is
/// recognized from the structured `code` field, with a message-substring
/// fallback for older-style bodies.
fn classify_api_error(status: StatusCode, body: &str) -> CompletionError {
    if let Ok(parsed) = serde_json::from_str::<ApiErrorBody>(body) {
        let detail = parsed.error;
        if detail.code.as_deref() == Some("context_length_exceeded")
            || detail.message.contains("maximum context length")
        {
            return CompletionError::ContextOverflow;
        }
        return CompletionError::Api {
            status: status.as_u16(),
            message: detail.message,
        };
    }
    CompletionError::Api {
        status: status.as_u16(),
        message: body.chars().take(200).collect(),
    }
}

// Wire types.

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [PromptMessage],
    stream: bool,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
    #[serde(default)]
    code: Option<String>,
}

#[derive(Serialize)]
struct ImageRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    n: u32,
    size: &'a str,
    response_format: &'a str,
}

#[derive(Deserialize)]
struct ImageResponse {
    data: Vec<ImageData>,
}

#[derive(Deserialize)]
struct ImageData {
    b64_json: String,
}

#[derive(Deserialize)]
struct TranscriptionResponse {
    #[serde(default)]
    text: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bot::registry::Registry;

    #[test]
    fn test_classify_overflow_by_code() {
        let body = r#"{"error":{"message":"too many tokens","type":"invalid_request_error","code":"context_length_exceeded"}}"#;
        assert!(matches!(
            classify_api_error(StatusCode::BAD_REQUEST, body),
            CompletionError::ContextOverflow
        ));
    }

    #[test]
    fn test_classify_overflow_by_message() {
        let body = r#"{"error":{"message":"This model's maximum context length is 8192 tokens"}}"#;
        assert!(matches!(
            classify_api_error(StatusCode::BAD_REQUEST, body),
            CompletionError::ContextOverflow
        ));
    }

    #[test]
    fn test_classify_other_api_error() {
        let body = r#"{"error":{"message":"Rate limit reached","code":"rate_limit_exceeded"}}"#;
        let err = classify_api_error(StatusCode::TOO_MANY_REQUESTS, body);
        assert!(matches!(
            err,
            CompletionError::Api { status: 429, ref message } if message == "Rate limit reached"
        ));
    }

    #[test]
    fn test_classify_unparseable_body() {
        let err = classify_api_error(StatusCode::BAD_GATEWAY, "<html>bad gateway</html>");
        assert!(matches!(err, CompletionError::Api { status: 502, .. }));
    }

    #[test]
    fn test_next_sse_data_drains_complete_lines() {
        let mut buf = String::from("data: {\"a\":1}\n\ndata: {\"b\":2}\ndata: {\"par");
        assert_eq!(next_sse_data(&mut buf).as_deref(), Some(r#"{"a":1}"#));
        assert_eq!(next_sse_data(&mut buf).as_deref(), Some(r#"{"b":2}"#));
        // Incomplete trailing line stays buffered
        assert_eq!(next_sse_data(&mut buf), None);
        assert_eq!(buf, "data: {\"par");

        buf.push_str("t\":3}\n");
        assert_eq!(next_sse_data(&mut buf).as_deref(), Some(r#"{"part":3}"#));
    }

    #[test]
    fn test_next_sse_data_skips_non_data_lines() {
        let mut buf = String::from(": keepalive\nevent: ping\ndata: [DONE]\n");
        assert_eq!(next_sse_data(&mut buf).as_deref(), Some("[DONE]"));
    }

    #[test]
    fn test_stream_chunk_parsing() {
        let data = r#"{"id":"x","choices":[{"index":0,"delta":{"content":"Hel"},"finish_reason":null}]}"#;
        let chunk: StreamChunk = serde_json::from_str(data).unwrap();
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hel"));

        let terminal = r#"{"id":"x","choices":[{"index":0,"delta":{},"finish_reason":"stop"}]}"#;
        let chunk: StreamChunk = serde_json::from_str(terminal).unwrap();
        assert!(chunk.choices[0].delta.content.is_none());
    }

    #[test]
    fn test_estimate_prompt_tokens_counts_overhead() {
        let registry = Registry::default();
        let mode = registry.chat_mode("assistant").unwrap();
        let tokenizer = HeuristicTokenizer;

        let text_prompt = build_prompt(mode, &[], &UserInput::text("12345678"));
        let n_text = estimate_prompt_tokens(&text_prompt, &tokenizer, "gpt-4o");
        // 2 messages * 3 overhead + 2 priming + system tokens + 2 input tokens
        let system_tokens = tokenizer.count_tokens(&mode.prompt_start, "gpt-4o");
        assert_eq!(n_text, 3 * 2 + 2 + system_tokens + 2);

        let vision_prompt = build_prompt(
            mode,
            &[],
            &UserInput::with_image("12345678", vec![1, 2, 3]),
        );
        let n_vision = estimate_prompt_tokens(&vision_prompt, &tokenizer, "gpt-4o");
        assert_eq!(n_vision, n_text + TOKENS_PER_IMAGE);
    }
}
