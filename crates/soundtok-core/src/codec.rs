//! Waveform to sound-token conversion.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::audio::{resample_linear, Waveform};
use crate::config::CodecConfig;
use crate::error::{Error, Result};

/// Audio tokenizer backend. Receives mono samples already at the target rate.
#[async_trait]
pub trait SoundTokenizer: Send + Sync {
    /// Number of distinct codes; every emitted code is below this.
    fn vocab_size(&self) -> u32;

    async fn encode(&self, samples: &[f32]) -> Result<Vec<u32>>;
}

/// Ordered codes produced from exactly one waveform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoundTokenSequence {
    codes: Vec<u32>,
    vocab_size: u32,
}

impl SoundTokenSequence {
    /// Builds a sequence, rejecting any code outside `[0, vocab_size)`.
    pub fn new(codes: Vec<u32>, vocab_size: u32) -> Result<Self> {
        if let Some((index, code)) = codes
            .iter()
            .enumerate()
            .find(|(_, code)| **code >= vocab_size)
        {
            return Err(Error::Codec(format!(
                "Code {code} at position {index} is outside vocabulary of size {vocab_size}"
            )));
        }
        Ok(Self { codes, vocab_size })
    }

    pub fn codes(&self) -> &[u32] {
        &self.codes
    }

    pub fn vocab_size(&self) -> u32 {
        self.vocab_size
    }

    pub fn len(&self) -> usize {
        self.codes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.codes.is_empty()
    }
}

/// Validates and resamples input audio before handing it to a [`SoundTokenizer`].
pub struct TokenCodec {
    tokenizer: Arc<dyn SoundTokenizer>,
    target_sample_rate: u32,
}

impl TokenCodec {
    pub fn new(tokenizer: Arc<dyn SoundTokenizer>, config: &CodecConfig) -> Self {
        Self {
            tokenizer,
            target_sample_rate: config.target_sample_rate,
        }
    }

    pub fn target_sample_rate(&self) -> u32 {
        self.target_sample_rate
    }

    pub async fn tokenize(&self, waveform: &Waveform) -> Result<SoundTokenSequence> {
        if waveform.is_empty() {
            return Err(Error::InvalidAudio("Waveform contains no samples".to_string()));
        }
        if waveform.sample_rate == 0 {
            return Err(Error::InvalidAudio(
                "Waveform has invalid sample rate 0".to_string(),
            ));
        }
        if let Some(index) = waveform.samples.iter().position(|s| !s.is_finite()) {
            return Err(Error::InvalidAudio(format!(
                "Waveform contains a non-finite sample at index {index}"
            )));
        }

        let codes = if waveform.sample_rate == self.target_sample_rate {
            self.tokenizer.encode(&waveform.samples).await?
        } else {
            let resampled = resample_linear(
                &waveform.samples,
                waveform.sample_rate,
                self.target_sample_rate,
            );
            self.tokenizer.encode(&resampled).await?
        };

        debug!(
            "Tokenized {:.2}s of audio into {} sound tokens",
            waveform.duration_secs(),
            codes.len()
        );

        SoundTokenSequence::new(codes, self.tokenizer.vocab_size())
    }
}
