//! Speech in, streamed text out.
//!
//! Audio is turned into discrete sound tokens, wrapped in a chat prompt, and
//! handed to a language model whose output is streamed back as cumulative
//! partial messages. The [`StreamingGenerator`] turns a decoder into an
//! ordered, cancellable fragment stream with a per-token deadline; the
//! [`Pipeline`] composes it with the codec, prompt and text rules.

pub mod assembler;
pub mod audio;
pub mod codec;
pub mod config;
pub mod decoder;
pub mod error;
pub mod generator;
pub mod pipeline;
pub mod prompt;
pub mod remote;
pub mod stop;

#[cfg(test)]
mod testing;

pub use assembler::{AssembledMessage, PartialMessage, PartialMessageAssembler, PostProcessor};
pub use audio::Waveform;
pub use codec::{SoundTokenSequence, SoundTokenizer, TokenCodec};
pub use config::{
    CodecConfig, GenerationConfig, PipelineConfig, PostProcessConfig, PromptConfig,
    TARGET_SAMPLE_RATE,
};
pub use decoder::{
    DecodeParams, DecodeSession, DecodedToken, Decoder, PushAdapter, PushDecoder, TokenControl,
};
pub use error::{Error, Result};
pub use generator::{
    CancelHandle, CompletionReason, GenerationOutcome, GenerationRequest, GenerationState,
    StreamingGenerator, TokenFragment,
};
pub use pipeline::{Pipeline, ResponseStream};
pub use prompt::{ChatMessage, ChatRole, ChatTemplate, Llama3ChatTemplate, Prompt, PromptAssembler, PromptMode};
pub use remote::{HttpSoundTokenizer, OpenAiCompletionsDecoder};
pub use stop::{EosTokenStop, NeverStop, StopCondition};
