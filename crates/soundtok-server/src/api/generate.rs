//! Spoken-prompt endpoints streaming cumulative text over SSE.

use std::convert::Infallible;
use std::time::Duration;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
    Extension, Json,
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use soundtok_core::{GenerationState, PromptMode, Waveform};
use tracing::{debug, info, warn};

use crate::api::request_context::RequestContext;
use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    /// Encoded audio file, raw base64 or a `data:` URI
    #[serde(default)]
    pub audio_base64: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
enum StreamEvent {
    Start {
        request_id: String,
        mode: PromptMode,
    },
    Partial {
        text: String,
    },
    Done {
        status: &'static str,
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<&'static str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl StreamEvent {
    fn into_event(self) -> Event {
        Event::default().data(serde_json::to_string(&self).unwrap_or_default())
    }
}

pub async fn respond(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    stream_generation(state, ctx, req, PromptMode::Respond).await
}

pub async fn transcribe(
    State(state): State<AppState>,
    Extension(ctx): Extension<RequestContext>,
    Json(req): Json<GenerateRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    stream_generation(state, ctx, req, PromptMode::Transcribe).await
}

/// Decodes off the async workers; uploads can be tens of megabytes.
async fn parse_audio(req: GenerateRequest) -> Result<Option<Waveform>, ApiError> {
    let Some(payload) = req.audio_base64.filter(|p| !p.trim().is_empty()) else {
        return Ok(None);
    };
    let waveform = tokio::task::spawn_blocking(move || Waveform::from_base64(payload.trim()))
        .await
        .map_err(|err| ApiError::internal(format!("Audio decoding failed: {err}")))??;
    Ok(Some(waveform))
}

async fn stream_generation(
    state: AppState,
    ctx: RequestContext,
    req: GenerateRequest,
    mode: PromptMode,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let waveform = parse_audio(req).await?;

    let permit = state
        .request_semaphore
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::unavailable("Server is shutting down"))?;

    // Audio problems surface here as a plain HTTP error, before any event is sent.
    let mut responses = state.pipeline.run(waveform, mode).await?;
    debug!(request_id = %ctx.correlation_id, %mode, "Streaming response");

    let deadline =
        tokio::time::Instant::now() + Duration::from_secs(state.request_timeout_secs);
    let request_id = ctx.correlation_id;

    let stream = async_stream::stream! {
        let _permit = permit;

        yield Ok::<_, Infallible>(StreamEvent::Start {
            request_id: request_id.clone(),
            mode,
        }
        .into_event());

        let mut error = None;
        let mut expired = false;
        loop {
            match tokio::time::timeout_at(deadline, responses.next()).await {
                Ok(Some(Ok(message))) => {
                    yield Ok(StreamEvent::Partial {
                        text: message.into_string(),
                    }
                    .into_event());
                }
                Ok(Some(Err(err))) => {
                    error = Some(err.to_string());
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    warn!(request_id = %request_id, "Request deadline exceeded, cancelling generation");
                    responses.cancel();
                    expired = true;
                    break;
                }
            }
        }

        let outcome = responses.outcome();
        let (status, reason) = match outcome.state {
            _ if expired => ("timeout", None),
            GenerationState::Completed(reason) => ("completed", Some(reason.as_str())),
            other => (other.as_str(), None),
        };
        info!(
            request_id = %request_id,
            status,
            tokens = outcome.tokens_generated,
            elapsed_ms = outcome.elapsed.as_millis() as u64,
            "Response stream finished"
        );

        yield Ok(StreamEvent::Done { status, reason, error }.into_event());
    };

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}
