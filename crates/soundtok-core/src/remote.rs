//! HTTP-backed capabilities: an OpenAI-compatible completions server (vLLM and
//! friends) as the [`Decoder`], and a remote audio tokenizer service.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::SoundTokenizer;
use crate::config::TARGET_SAMPLE_RATE;
use crate::decoder::{DecodeParams, DecodeSession, DecodedToken, Decoder};
use crate::error::{Error, Result};
use crate::prompt::Prompt;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

fn client(timeout: Option<Duration>) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .user_agent(format!("soundtok/{}", env!("CARGO_PKG_VERSION")));

    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to initialize HTTP client: {}", e)))
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

#[derive(Debug, Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    max_tokens: usize,
    temperature: f32,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    stop_token_ids: Vec<u32>,
}

impl<'a> CompletionRequest<'a> {
    fn new(model: &'a str, prompt: &'a str, params: &DecodeParams) -> Self {
        Self {
            model,
            prompt,
            stream: true,
            max_tokens: params.max_tokens,
            temperature: if params.greedy { 0.0 } else { 1.0 },
            stop_token_ids: params.stop_token_id.into_iter().collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct CompletionChunk {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    #[serde(default)]
    text: String,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum SseEvent {
    Text(String),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseEvent> {
    let Some(payload) = line.trim_end_matches('\r').strip_prefix("data:") else {
        return Ok(SseEvent::Skip);
    };
    let payload = payload.trim();
    if payload.is_empty() {
        return Ok(SseEvent::Skip);
    }
    if payload == "[DONE]" {
        return Ok(SseEvent::Done);
    }

    let chunk: CompletionChunk = serde_json::from_str(payload)
        .map_err(|e| Error::Decode(format!("Malformed completion chunk: {e}")))?;
    match chunk.choices.into_iter().next() {
        Some(choice) if choice.text.is_empty() && choice.finish_reason.is_some() => {
            Ok(SseEvent::Skip)
        }
        Some(choice) => Ok(SseEvent::Text(choice.text)),
        None => Ok(SseEvent::Skip),
    }
}

/// Splits a byte stream into lines, tolerating chunk boundaries anywhere.
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(String::from_utf8_lossy(&line[..pos]).into_owned());
        }
        lines
    }

    fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(String::from_utf8_lossy(&rest).into_owned())
    }
}

/// Streams completions from an OpenAI-compatible `/v1/completions` endpoint.
///
/// Servers of this kind only expose decoded text, so every token is
/// text-only and termination relies on the server honouring
/// `stop_token_ids` plus the text terminator.
pub struct OpenAiCompletionsDecoder {
    client: reqwest::Client,
    base_url: String,
    model: String,
    eos_token_id: Option<u32>,
}

impl OpenAiCompletionsDecoder {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Result<Self> {
        Ok(Self {
            client: client(None)?,
            base_url: base_url.into(),
            model: model.into(),
            eos_token_id: None,
        })
    }

    /// Forwarded to the server as `stop_token_ids`.
    pub fn with_eos_token_id(mut self, eos_token_id: Option<u32>) -> Self {
        self.eos_token_id = eos_token_id;
        self
    }
}

#[async_trait]
impl Decoder for OpenAiCompletionsDecoder {
    fn eos_token_id(&self) -> Option<u32> {
        self.eos_token_id
    }

    async fn start(
        &self,
        prompt: &Prompt,
        params: &DecodeParams,
    ) -> Result<Box<dyn DecodeSession>> {
        let url = endpoint(&self.base_url, "/v1/completions");
        let body = CompletionRequest::new(&self.model, prompt.as_str(), params);
        debug!(%url, max_tokens = body.max_tokens, "Opening completion stream");

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::Decode(format!("Completion request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Decode(format!(
                "Completion server returned {status}: {text}"
            )));
        }

        Ok(Box::new(CompletionSession {
            response,
            lines: LineBuffer::default(),
            pending: VecDeque::new(),
            done: false,
        }))
    }
}

struct CompletionSession {
    response: reqwest::Response,
    lines: LineBuffer,
    pending: VecDeque<DecodedToken>,
    done: bool,
}

impl CompletionSession {
    fn absorb(&mut self, line: &str) -> Result<()> {
        match parse_sse_line(line)? {
            SseEvent::Text(text) => self.pending.push_back(DecodedToken::text_only(text)),
            SseEvent::Done => self.done = true,
            SseEvent::Skip => {}
        }
        Ok(())
    }
}

#[async_trait]
impl DecodeSession for CompletionSession {
    async fn next_token(&mut self) -> Result<Option<DecodedToken>> {
        loop {
            if let Some(token) = self.pending.pop_front() {
                return Ok(Some(token));
            }
            if self.done {
                return Ok(None);
            }

            let chunk = self
                .response
                .chunk()
                .await
                .map_err(|e| Error::Decode(format!("Completion stream failed: {e}")))?;

            match chunk {
                Some(bytes) => {
                    for line in self.lines.push(&bytes) {
                        if self.done {
                            break;
                        }
                        self.absorb(&line)?;
                    }
                }
                None => {
                    if let Some(line) = self.lines.finish() {
                        self.absorb(&line)?;
                    }
                    self.done = true;
                }
            }
        }
    }
}

#[derive(Debug, Serialize)]
struct TokenizeRequest {
    audio_base64: String,
    sample_rate: u32,
}

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    codes: Vec<u32>,
}

/// Remote sound tokenizer: `POST {base}/v1/audio/tokens`.
///
/// Samples travel as base64 little-endian `f32` at 16 kHz.
pub struct HttpSoundTokenizer {
    client: reqwest::Client,
    base_url: String,
    vocab_size: u32,
}

impl HttpSoundTokenizer {
    pub fn new(base_url: impl Into<String>, vocab_size: u32, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: client(Some(timeout))?,
            base_url: base_url.into(),
            vocab_size,
        })
    }
}

fn encode_samples(samples: &[f32]) -> String {
    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

#[async_trait]
impl SoundTokenizer for HttpSoundTokenizer {
    fn vocab_size(&self) -> u32 {
        self.vocab_size
    }

    async fn encode(&self, samples: &[f32]) -> Result<Vec<u32>> {
        let url = endpoint(&self.base_url, "/v1/audio/tokens");
        let body = TokenizeRequest {
            audio_base64: encode_samples(samples),
            sample_rate: TARGET_SAMPLE_RATE,
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let text = response.text().await.unwrap_or_default();
            return Err(Error::Codec(format!("Tokenizer returned {status}: {text}")));
        }

        let parsed: TokenizeResponse = response
            .json()
            .await
            .map_err(|e| Error::Codec(format!("Malformed tokenizer response: {e}")))?;
        Ok(parsed.codes)
    }
}
