//! Language-model decoding capability.
//!
//! Backends come in two shapes. Stepwise backends implement [`Decoder`]
//! directly and hand out a [`DecodeSession`] that is pulled one token at a
//! time. Backends that can only run a whole generation and push tokens into a
//! callback implement [`PushDecoder`] and are wrapped in a [`PushAdapter`].
//! The streaming generator only ever sees [`Decoder`].

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};
use crate::prompt::Prompt;

/// One generated token and the text it decodes to (possibly empty).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedToken {
    /// `None` when the backend only exposes decoded text.
    pub id: Option<u32>,
    pub text: String,
}

impl DecodedToken {
    pub fn new(id: u32, text: impl Into<String>) -> Self {
        Self {
            id: Some(id),
            text: text.into(),
        }
    }

    pub fn text_only(text: impl Into<String>) -> Self {
        Self {
            id: None,
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeParams {
    pub max_tokens: usize,
    pub stop_token_id: Option<u32>,
    /// Deterministic argmax decoding.
    pub greedy: bool,
}

impl DecodeParams {
    pub fn greedy(max_tokens: usize, stop_token_id: Option<u32>) -> Self {
        Self {
            max_tokens,
            stop_token_id,
            greedy: true,
        }
    }
}

/// Shared, read-only decoding service. Must tolerate concurrent sessions.
#[async_trait]
pub trait Decoder: Send + Sync {
    /// Designated end-of-sequence token id, when the backend exposes ids.
    fn eos_token_id(&self) -> Option<u32>;

    async fn start(&self, prompt: &Prompt, params: &DecodeParams)
        -> Result<Box<dyn DecodeSession>>;
}

/// Per-request decoding state.
#[async_trait]
pub trait DecodeSession: Send {
    /// Produce the next token, or `None` once the backend has nothing more.
    async fn next_token(&mut self) -> Result<Option<DecodedToken>>;
}

/// Returned from a push callback to tell the backend whether to keep going.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenControl {
    Continue,
    Stop,
}

/// Blocking backend that runs a full generation and pushes each token out.
pub trait PushDecoder: Send + Sync + 'static {
    fn eos_token_id(&self) -> Option<u32>;

    /// Implementations must return promptly once `on_token` yields [`TokenControl::Stop`].
    fn generate_with_callback(
        &self,
        prompt: &str,
        params: &DecodeParams,
        on_token: &mut dyn FnMut(DecodedToken) -> TokenControl,
    ) -> Result<()>;
}

/// Runs a [`PushDecoder`] on the blocking pool and exposes it as a pull session.
pub struct PushAdapter<D> {
    inner: Arc<D>,
}

impl<D: PushDecoder> PushAdapter<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner: Arc::new(inner),
        }
    }
}

#[async_trait]
impl<D: PushDecoder> Decoder for PushAdapter<D> {
    fn eos_token_id(&self) -> Option<u32> {
        self.inner.eos_token_id()
    }

    async fn start(
        &self,
        prompt: &Prompt,
        params: &DecodeParams,
    ) -> Result<Box<dyn DecodeSession>> {
        let (tx, rx) = mpsc::unbounded_channel::<Result<DecodedToken>>();
        let inner = self.inner.clone();
        let prompt = prompt.as_str().to_string();
        let params = *params;

        let task = tokio::task::spawn_blocking(move || {
            let mut on_token = |token: DecodedToken| {
                if tx.send(Ok(token)).is_err() {
                    TokenControl::Stop
                } else {
                    TokenControl::Continue
                }
            };
            let result = inner.generate_with_callback(&prompt, &params, &mut on_token);
            if let Err(err) = result {
                let _ = tx.send(Err(err));
            }
        });

        Ok(Box::new(PushSession {
            rx,
            task: Some(task),
        }))
    }
}

struct PushSession {
    rx: mpsc::UnboundedReceiver<Result<DecodedToken>>,
    task: Option<JoinHandle<()>>,
}

#[async_trait]
impl DecodeSession for PushSession {
    async fn next_token(&mut self) -> Result<Option<DecodedToken>> {
        match self.rx.recv().await {
            Some(Ok(token)) => Ok(Some(token)),
            Some(Err(err)) => Err(err),
            None => {
                if let Some(task) = self.task.take() {
                    task.await.map_err(|err| {
                        Error::Decode(format!("Push decoder terminated abnormally: {err}"))
                    })?;
                }
                Ok(None)
            }
        }
    }
}
