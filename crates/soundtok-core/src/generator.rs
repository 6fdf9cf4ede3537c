//! Streaming generation: a producer task drives the decoder while the caller
//! drains fragments with a per-token deadline.
//!
//! ```text
//! Idle -> Running -> Completed(reason) | TimedOut | Cancelled | Failed
//! ```
//!
//! The producer evaluates the stop condition and the token cap after every
//! token and races each decoder call against the cancel signal. The consumer
//! side owns the state machine; the producer only reports what happened.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::GenerationConfig;
use crate::decoder::{DecodeParams, DecodedToken, Decoder};
use crate::error::{Error, Result};
use crate::prompt::Prompt;
use crate::stop::StopCondition;

/// Everything needed to run one generation.
#[derive(Clone)]
pub struct GenerationRequest {
    pub prompt: Prompt,
    pub max_tokens: usize,
    pub per_token_timeout: Duration,
    pub stop_condition: Arc<dyn StopCondition>,
    /// Handoff bound; `None` means `max_tokens + 1`.
    pub handoff_capacity: Option<usize>,
}

impl GenerationRequest {
    pub fn new(
        prompt: Prompt,
        stop_condition: Arc<dyn StopCondition>,
        config: &GenerationConfig,
    ) -> Self {
        Self {
            prompt,
            max_tokens: config.max_tokens,
            per_token_timeout: config.per_token_timeout(),
            stop_condition,
            handoff_capacity: config.handoff_capacity,
        }
    }

    fn handoff_capacity(&self) -> usize {
        self.handoff_capacity
            .unwrap_or_else(|| self.max_tokens.saturating_add(1))
            .clamp(1, Semaphore::MAX_PERMITS)
    }
}

impl fmt::Debug for GenerationRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationRequest")
            .field("mode", &self.prompt.mode())
            .field("sound_tokens", &self.prompt.sound_tokens())
            .field("max_tokens", &self.max_tokens)
            .field("per_token_timeout", &self.per_token_timeout)
            .field("handoff_capacity", &self.handoff_capacity)
            .finish()
    }
}

/// Decoded text for one generated token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFragment {
    /// Position of the token in the generated sequence.
    pub index: usize,
    pub token_id: Option<u32>,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionReason {
    /// The stop condition matched; the matching token was withheld.
    StopCondition,
    /// `max_tokens` tokens were generated.
    MaxTokens,
    /// The decoder ran out of tokens on its own.
    EndOfStream,
    /// The consumer found the end-of-sequence text in the output.
    TextTerminator,
}

impl CompletionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionReason::StopCondition => "stop_condition",
            CompletionReason::MaxTokens => "max_tokens",
            CompletionReason::EndOfStream => "end_of_stream",
            CompletionReason::TextTerminator => "text_terminator",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Idle,
    Running,
    Completed(CompletionReason),
    TimedOut,
    Cancelled,
    Failed,
}

impl GenerationState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, GenerationState::Idle | GenerationState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationState::Idle => "idle",
            GenerationState::Running => "running",
            GenerationState::Completed(_) => "completed",
            GenerationState::TimedOut => "timeout",
            GenerationState::Cancelled => "cancelled",
            GenerationState::Failed => "error",
        }
    }
}

impl fmt::Display for GenerationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GenerationState::Completed(reason) => write!(f, "completed ({})", reason.as_str()),
            other => f.write_str(other.as_str()),
        }
    }
}

/// Clonable handle that asks a running generation to stop.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// True once the generation has been told to stop, for any reason.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

/// Summary of a finished (or still running) generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationOutcome {
    pub state: GenerationState,
    pub tokens_generated: usize,
    pub fragments_delivered: usize,
    pub elapsed: Duration,
}

#[derive(Debug)]
enum Handoff {
    Fragment(TokenFragment),
    Finished(CompletionReason),
    Failed(Error),
    Cancelled,
}

pub struct StreamingGenerator {
    decoder: Arc<dyn Decoder>,
    request: Option<GenerationRequest>,
    per_token_timeout: Duration,
    state: GenerationState,
    cancel: CancelHandle,
    cancel_rx: watch::Receiver<bool>,
    rx: Option<mpsc::Receiver<Handoff>>,
    producer: Option<JoinHandle<()>>,
    tokens_generated: Arc<AtomicUsize>,
    fragments_delivered: usize,
    started_at: Option<Instant>,
    elapsed: Option<Duration>,
}

impl StreamingGenerator {
    pub fn new(decoder: Arc<dyn Decoder>, request: GenerationRequest) -> Self {
        let (cancel, cancel_rx) = CancelHandle::new();
        Self {
            decoder,
            per_token_timeout: request.per_token_timeout,
            request: Some(request),
            state: GenerationState::Idle,
            cancel,
            cancel_rx,
            rx: None,
            producer: None,
            tokens_generated: Arc::new(AtomicUsize::new(0)),
            fragments_delivered: 0,
            started_at: None,
            elapsed: None,
        }
    }

    /// Spawn the producer. Must be called inside a Tokio runtime; later calls are no-ops.
    pub fn start(&mut self) {
        let Some(request) = self.request.take() else {
            return;
        };

        let (tx, rx) = mpsc::channel(request.handoff_capacity());
        debug!(?request, "Starting generation");

        let producer = tokio::spawn(produce(
            self.decoder.clone(),
            request,
            tx,
            self.cancel.subscribe(),
            self.tokens_generated.clone(),
        ));

        self.rx = Some(rx);
        self.producer = Some(producer);
        self.started_at = Some(Instant::now());
        self.state = GenerationState::Running;
    }

    /// Next fragment in production order.
    ///
    /// `None` means the generation ended normally (completed or cancelled);
    /// an `Err` is the terminal event for timeouts and decoder failures.
    /// After either, every further call returns `None`.
    pub async fn next_fragment(&mut self) -> Option<Result<TokenFragment>> {
        if self.state == GenerationState::Idle {
            self.start();
        }
        if self.state.is_terminal() {
            return None;
        }

        let timeout = self.per_token_timeout;
        let rx = self.rx.as_mut()?;
        let received = tokio::select! {
            biased;
            _ = stop_signalled(&mut self.cancel_rx) => None,
            received = tokio::time::timeout(timeout, rx.recv()) => Some(received),
        };

        match received {
            None => {
                self.finish(GenerationState::Cancelled);
                None
            }
            Some(Err(_elapsed)) => {
                warn!("No token within {}ms, abandoning generation", timeout.as_millis());
                self.finish(GenerationState::TimedOut);
                Some(Err(Error::GenerationTimeout { timeout }))
            }
            Some(Ok(Some(Handoff::Fragment(fragment)))) => {
                self.fragments_delivered += 1;
                Some(Ok(fragment))
            }
            Some(Ok(Some(Handoff::Finished(reason)))) => {
                self.finish(GenerationState::Completed(reason));
                None
            }
            Some(Ok(Some(Handoff::Cancelled))) => {
                self.finish(GenerationState::Cancelled);
                None
            }
            Some(Ok(Some(Handoff::Failed(err)))) => {
                warn!("Generation failed: {err}");
                self.finish(GenerationState::Failed);
                Some(Err(err))
            }
            Some(Ok(None)) => {
                self.finish(GenerationState::Failed);
                Some(Err(Error::Decode(
                    "Generation producer exited without a terminal event".to_string(),
                )))
            }
        }
    }

    /// End a running generation from the consumer side with the given reason.
    pub fn complete(&mut self, reason: CompletionReason) {
        if !self.state.is_terminal() {
            self.finish(GenerationState::Completed(reason));
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> GenerationState {
        self.state
    }

    pub fn outcome(&self) -> GenerationOutcome {
        GenerationOutcome {
            state: self.state,
            tokens_generated: self.tokens_generated.load(Ordering::Acquire),
            fragments_delivered: self.fragments_delivered,
            elapsed: self.elapsed.unwrap_or_else(|| {
                self.started_at
                    .map(|started| started.elapsed())
                    .unwrap_or_default()
            }),
        }
    }

    fn finish(&mut self, state: GenerationState) {
        self.state = state;
        self.elapsed = self.started_at.map(|started| started.elapsed());
        // Stop the producer if it is still going; harmless once it has exited.
        self.cancel.cancel();
        self.rx = None;

        let outcome = self.outcome();
        info!(
            state = %outcome.state,
            tokens = outcome.tokens_generated,
            fragments = outcome.fragments_delivered,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Generation finished"
        );
    }
}

impl Drop for StreamingGenerator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn stop_signalled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

async fn produce(
    decoder: Arc<dyn Decoder>,
    request: GenerationRequest,
    tx: mpsc::Sender<Handoff>,
    mut stop_rx: watch::Receiver<bool>,
    tokens_generated: Arc<AtomicUsize>,
) {
    let params = DecodeParams::greedy(request.max_tokens, decoder.eos_token_id());

    let started = tokio::select! {
        biased;
        _ = stop_signalled(&mut stop_rx) => {
            let _ = tx.try_send(Handoff::Cancelled);
            return;
        }
        started = decoder.start(&request.prompt, &params) => started,
    };
    let mut session = match started {
        Ok(session) => session,
        Err(err) => {
            deliver_terminal(&tx, &mut stop_rx, Handoff::Failed(err)).await;
            return;
        }
    };

    let mut history: Vec<DecodedToken> = Vec::new();
    let terminal = loop {
        if history.len() >= request.max_tokens {
            break Handoff::Finished(CompletionReason::MaxTokens);
        }

        let next = tokio::select! {
            biased;
            _ = stop_signalled(&mut stop_rx) => break Handoff::Cancelled,
            next = session.next_token() => next,
        };

        let token = match next {
            Ok(Some(token)) => token,
            Ok(None) => break Handoff::Finished(CompletionReason::EndOfStream),
            Err(err) => break Handoff::Failed(err),
        };

        trace!(index = history.len(), id = ?token.id, text = %token.text, "token");
        let fragment = TokenFragment {
            index: history.len(),
            token_id: token.id,
            text: token.text.clone(),
        };
        history.push(token);
        tokens_generated.store(history.len(), Ordering::Release);

        if request.stop_condition.should_stop(&history) {
            break Handoff::Finished(CompletionReason::StopCondition);
        }

        let sent = tokio::select! {
            biased;
            _ = stop_signalled(&mut stop_rx) => break Handoff::Cancelled,
            sent = tx.send(Handoff::Fragment(fragment)) => sent,
        };
        if sent.is_err() {
            // Consumer is gone.
            return;
        }
    };

    deliver_terminal(&tx, &mut stop_rx, terminal).await;
}

async fn deliver_terminal(
    tx: &mpsc::Sender<Handoff>,
    stop_rx: &mut watch::Receiver<bool>,
    event: Handoff,
) {
    if matches!(event, Handoff::Cancelled) {
        // The consumer observes cancellation through the same signal.
        let _ = tx.try_send(event);
        return;
    }
    tokio::select! {
        biased;
        _ = stop_signalled(stop_rx) => {}
        _ = tx.send(event) => {}
    }
}
