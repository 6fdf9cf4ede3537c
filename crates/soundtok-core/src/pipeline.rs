//! Audio in, streamed text out.

use std::sync::Arc;

use futures::Stream;
use tracing::info;

use crate::assembler::{PartialMessage, PartialMessageAssembler, PostProcessor};
use crate::audio::Waveform;
use crate::codec::TokenCodec;
use crate::config::PipelineConfig;
use crate::decoder::Decoder;
use crate::error::{Error, Result};
use crate::generator::{
    CancelHandle, CompletionReason, GenerationOutcome, GenerationRequest, GenerationState,
    StreamingGenerator,
};
use crate::prompt::{ChatTemplate, PromptAssembler, PromptMode};
use crate::stop::{EosTokenStop, NeverStop, StopCondition};

/// Long-lived composition of codec, prompt rules and decoder.
///
/// Construct once and share behind an `Arc`; every call to [`respond`](Self::respond)
/// or [`transcribe`](Self::transcribe) gets its own generator and assembler.
pub struct Pipeline {
    codec: Arc<TokenCodec>,
    decoder: Arc<dyn Decoder>,
    prompts: PromptAssembler,
    rules: PostProcessor,
    stop_condition: Arc<dyn StopCondition>,
    config: PipelineConfig,
}

impl Pipeline {
    pub fn new(
        codec: Arc<TokenCodec>,
        decoder: Arc<dyn Decoder>,
        config: PipelineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let stop_condition: Arc<dyn StopCondition> = match decoder.eos_token_id() {
            Some(eos) => Arc::new(EosTokenStop::new(eos)),
            None => Arc::new(NeverStop),
        };

        Ok(Self {
            codec,
            decoder,
            prompts: PromptAssembler::llama3(config.prompt.clone()),
            rules: PostProcessor::new(&config.post_process),
            stop_condition,
            config,
        })
    }

    /// Swap the default Llama 3 chat layout for another model's template.
    pub fn with_template(mut self, template: Arc<dyn ChatTemplate>) -> Self {
        self.prompts = PromptAssembler::new(self.config.prompt.clone(), template);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn respond(&self, waveform: Option<Waveform>) -> Result<ResponseStream> {
        self.run(waveform, PromptMode::Respond).await
    }

    pub async fn transcribe(&self, waveform: Option<Waveform>) -> Result<ResponseStream> {
        self.run(waveform, PromptMode::Transcribe).await
    }

    /// Tokenize, build the prompt and start generating. Audio problems fail
    /// here, before the decoder is touched.
    pub async fn run(&self, waveform: Option<Waveform>, mode: PromptMode) -> Result<ResponseStream> {
        let waveform =
            waveform.ok_or_else(|| Error::InvalidAudio("No audio supplied".to_string()))?;
        let tokens = self.codec.tokenize(&waveform).await?;
        let prompt = self.prompts.assemble(&tokens, mode);

        info!(
            %mode,
            sound_tokens = tokens.len(),
            audio_secs = waveform.duration_secs(),
            "Starting generation"
        );

        let request = GenerationRequest::new(
            prompt,
            self.stop_condition.clone(),
            &self.config.generation,
        );
        let mut generator = StreamingGenerator::new(self.decoder.clone(), request);
        generator.start();

        Ok(ResponseStream {
            generator,
            assembler: PartialMessageAssembler::new(self.rules.clone()),
            last: None,
            done: false,
        })
    }
}

/// Lazy, finite sequence of [`PartialMessage`] snapshots for one request.
///
/// Dropping the stream cancels generation.
pub struct ResponseStream {
    generator: StreamingGenerator,
    assembler: PartialMessageAssembler,
    last: Option<PartialMessage>,
    done: bool,
}

impl ResponseStream {
    /// Next snapshot, only when the visible text changed. An `Err` is terminal.
    pub async fn next(&mut self) -> Option<Result<PartialMessage>> {
        if self.done {
            return None;
        }

        loop {
            match self.generator.next_fragment().await {
                Some(Ok(fragment)) => {
                    let assembled = self.assembler.append(&fragment.text);
                    if assembled.finished {
                        self.generator.complete(CompletionReason::TextTerminator);
                        self.done = true;
                        return self.changed(assembled.message).map(Ok);
                    }
                    if let Some(message) = self.changed(assembled.message) {
                        return Some(Ok(message));
                    }
                }
                Some(Err(err)) => {
                    self.done = true;
                    return Some(Err(err));
                }
                None => {
                    self.done = true;
                    if matches!(self.generator.state(), GenerationState::Completed(_)) {
                        let message = self.assembler.flush();
                        return self.changed(message).map(Ok);
                    }
                    return None;
                }
            }
        }
    }

    fn changed(&mut self, message: PartialMessage) -> Option<PartialMessage> {
        if self.last.as_ref() == Some(&message) {
            return None;
        }
        self.last = Some(message.clone());
        Some(message)
    }

    /// Most recent snapshot handed out.
    pub fn latest(&self) -> Option<&PartialMessage> {
        self.last.as_ref()
    }

    pub fn state(&self) -> GenerationState {
        self.generator.state()
    }

    pub fn outcome(&self) -> GenerationOutcome {
        self.generator.outcome()
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.generator.cancel_handle()
    }

    pub fn cancel(&self) {
        self.generator.cancel();
    }

    pub fn into_stream(self) -> impl Stream<Item = Result<PartialMessage>> + Send {
        let mut responses = self;
        async_stream::stream! {
            while let Some(item) = responses.next().await {
                yield item;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{eos, text, tok, FixedTokenizer, ScriptedDecoder, Step};
    use crate::config::CodecConfig;
    use futures::StreamExt;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn pipeline(decoder: Arc<ScriptedDecoder>, config: PipelineConfig) -> Pipeline {
        let codec = TokenCodec::new(
            Arc::new(FixedTokenizer::new(vec![12, 45, 45, 7])),
            &CodecConfig::default(),
        );
        Pipeline::new(Arc::new(codec), decoder, config).expect("pipeline")
    }

    fn silence() -> Option<Waveform> {
        Some(Waveform::new(vec![0.0; 1_600], 16_000))
    }

    async fn collect(stream: &mut ResponseStream) -> Vec<Result<PartialMessage>> {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item);
        }
        items
    }

    #[tokio::test]
    async fn text_terminator_ends_text_only_backend() {
        let decoder = Arc::new(
            ScriptedDecoder::new(vec![text("Hi"), text(" you"), text("<|eot_id|>"), text("!")])
                .endless(),
        );
        let pipeline = pipeline(decoder.clone(), PipelineConfig::default());

        let mut stream = pipeline.respond(silence()).await.expect("stream");
        let texts: Vec<String> = collect(&mut stream)
            .await
            .into_iter()
            .map(|item| item.expect("message").into_string())
            .collect();

        assert_eq!(texts, vec!["Hi", "Hi you"]);
        assert_eq!(
            stream.state(),
            GenerationState::Completed(CompletionReason::TextTerminator)
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
        let pulls = decoder.pulls();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(decoder.pulls(), pulls);
    }

    #[tokio::test]
    async fn transcribe_uses_directive_marker() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![tok(1, "hi"), eos()]));
        let pipeline = pipeline(decoder.clone(), PipelineConfig::default());

        let mut stream = pipeline.transcribe(silence()).await.expect("stream");
        collect(&mut stream).await;

        let prompt = decoder.last_prompt().expect("prompt recorded");
        assert!(prompt.contains("<|reserved_special_token_69|><|sound_start|>"));

        let mut stream = pipeline.respond(silence()).await.expect("stream");
        collect(&mut stream).await;
        let prompt = decoder.last_prompt().expect("prompt recorded");
        assert!(!prompt.contains("<|reserved_special_token_69|>"));
    }

    #[tokio::test]
    async fn missing_audio_fails_before_decoding() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![tok(1, "x")]));
        let pipeline = pipeline(decoder.clone(), PipelineConfig::default());

        let err = pipeline.respond(None).await.err().expect("should fail");
        assert!(matches!(err, Error::InvalidAudio(_)));
        assert_eq!(decoder.starts(), 0);
    }

    #[tokio::test]
    async fn empty_fragments_do_not_repeat_snapshots() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![
            tok(1, "o"),
            tok(2, ""),
            tok(3, ""),
            tok(4, "k"),
            eos(),
        ]));
        let pipeline = pipeline(decoder, PipelineConfig::default());

        let mut stream = pipeline.respond(silence()).await.expect("stream");
        let texts: Vec<String> = collect(&mut stream)
            .await
            .into_iter()
            .map(|item| item.expect("message").into_string())
            .collect();
        assert_eq!(texts, vec!["o", "ok"]);
        assert_eq!(stream.outcome().fragments_delivered, 4);
    }

    #[tokio::test]
    async fn marker_like_tail_is_shown_immediately() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![tok(1, "5 <"), eos()]));
        let pipeline = pipeline(decoder, PipelineConfig::default());

        let mut stream = pipeline.respond(silence()).await.expect("stream");
        let texts: Vec<String> = collect(&mut stream)
            .await
            .into_iter()
            .map(|item| item.expect("message").into_string())
            .collect();
        assert_eq!(texts, vec!["5 <"]);
    }

    #[tokio::test]
    async fn held_back_tail_is_flushed_at_end() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![tok(1, "5 <"), eos()]));
        let mut config = PipelineConfig::default();
        config.post_process.hold_back_partial_markers = true;
        let pipeline = pipeline(decoder, config);

        let mut stream = pipeline.respond(silence()).await.expect("stream");
        let texts: Vec<String> = collect(&mut stream)
            .await
            .into_iter()
            .map(|item| item.expect("message").into_string())
            .collect();
        assert_eq!(texts, vec!["5 ", "5 <"]);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_still_shows_marker_like_tail() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![tok(1, "I saw a"), Step::Stall]));
        let pipeline = pipeline(decoder, PipelineConfig::default());

        let mut stream = pipeline.respond(silence()).await.expect("stream");
        let items = collect(&mut stream).await;

        assert_eq!(items[0].as_ref().expect("first"), &"I saw a");
        assert!(matches!(items[1], Err(Error::GenerationTimeout { .. })));
        assert_eq!(stream.latest().map(PartialMessage::as_str), Some("I saw a"));
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_keeps_earlier_snapshots() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![tok(1, "partial"), Step::Stall]));
        let pipeline = pipeline(decoder, PipelineConfig::default());

        let mut stream = pipeline.respond(silence()).await.expect("stream");
        let items = collect(&mut stream).await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().expect("first"), &"partial");
        assert!(matches!(items[1], Err(Error::GenerationTimeout { .. })));
        assert_eq!(stream.state(), GenerationState::TimedOut);
        assert_eq!(stream.latest().map(PartialMessage::as_str), Some("partial"));
    }

    #[tokio::test]
    async fn cancel_handle_ends_stream_quietly() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![tok(1, "b")]).endless());
        let mut config = PipelineConfig::default();
        config.generation.max_tokens = 1_000_000;
        let pipeline = pipeline(decoder, config);

        let mut stream = pipeline.respond(silence()).await.expect("stream");
        assert!(stream.next().await.is_some());
        stream.cancel_handle().cancel();

        assert!(stream.next().await.is_none());
        assert_eq!(stream.state(), GenerationState::Cancelled);
    }

    #[tokio::test]
    async fn into_stream_yields_snapshots() {
        let decoder = Arc::new(ScriptedDecoder::new(vec![tok(1, "x"), tok(2, "y"), eos()]));
        let pipeline = pipeline(decoder.clone(), PipelineConfig::default());

        let stream = pipeline.respond(silence()).await.expect("stream").into_stream();
        let texts: Vec<String> = stream
            .map(|item| item.expect("message").into_string())
            .collect()
            .await;
        assert_eq!(texts, vec!["x", "xy"]);
        assert_eq!(decoder.starts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let mut config = PipelineConfig::default();
        config.generation.max_tokens = 0;
        let codec = TokenCodec::new(Arc::new(FixedTokenizer::new(vec![1])), &CodecConfig::default());
        let result = Pipeline::new(
            Arc::new(codec),
            Arc::new(ScriptedDecoder::new(Vec::new())),
            config,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
