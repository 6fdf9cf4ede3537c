//! Error taxonomy for the generation pipeline.

use std::time::Duration;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Missing, empty or unreadable audio. Raised before any generation starts.
    #[error("Invalid audio: {0}")]
    InvalidAudio(String),

    /// The model runtime failed while producing tokens.
    #[error("Decode error: {0}")]
    Decode(String),

    /// No fragment arrived within the per-token bound.
    #[error("Generation timed out: no token within {}ms", .timeout.as_millis())]
    GenerationTimeout { timeout: Duration },

    /// The sound tokenizer failed or returned codes outside its vocabulary.
    #[error("Sound codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl Error {
    /// Whether re-issuing the whole request may succeed. The pipeline itself never retries.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::GenerationTimeout { .. })
    }
}
