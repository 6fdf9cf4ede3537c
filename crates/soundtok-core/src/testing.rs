//! Scripted backends shared by unit tests.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::codec::{SoundTokenSequence, SoundTokenizer};
use crate::config::PromptConfig;
use crate::decoder::{DecodeParams, DecodeSession, DecodedToken, Decoder};
use crate::error::{Error, Result};
use crate::prompt::{Prompt, PromptAssembler, PromptMode};

pub(crate) const EOS: u32 = 128_009;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Token(DecodedToken),
    Delay(Duration, DecodedToken),
    Stall,
    Fail(&'static str),
}

pub(crate) fn tok(id: u32, text: &str) -> Step {
    Step::Token(DecodedToken::new(id, text))
}

pub(crate) fn text(text: &str) -> Step {
    Step::Token(DecodedToken::text_only(text))
}

pub(crate) fn eos() -> Step {
    Step::Token(DecodedToken::new(EOS, ""))
}

pub(crate) struct ScriptedDecoder {
    script: Vec<Step>,
    endless: bool,
    pub starts: Arc<AtomicUsize>,
    pub pulls: Arc<AtomicUsize>,
    pub prompts: Mutex<Vec<String>>,
}

impl ScriptedDecoder {
    pub fn new(script: Vec<Step>) -> Self {
        Self {
            script,
            endless: false,
            starts: Arc::new(AtomicUsize::new(0)),
            pulls: Arc::new(AtomicUsize::new(0)),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// After the script runs out, keep producing non-terminal tokens forever.
    pub fn endless(mut self) -> Self {
        self.endless = true;
        self
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn pulls(&self) -> usize {
        self.pulls.load(Ordering::SeqCst)
    }

    pub fn last_prompt(&self) -> Option<String> {
        self.prompts.lock().expect("prompts lock").last().cloned()
    }
}

#[async_trait]
impl Decoder for ScriptedDecoder {
    fn eos_token_id(&self) -> Option<u32> {
        Some(EOS)
    }

    async fn start(
        &self,
        prompt: &Prompt,
        _params: &DecodeParams,
    ) -> Result<Box<dyn DecodeSession>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.as_str().to_string());
        Ok(Box::new(ScriptedSession {
            script: self.script.clone().into(),
            endless: self.endless,
            pulls: self.pulls.clone(),
        }))
    }
}

struct ScriptedSession {
    script: VecDeque<Step>,
    endless: bool,
    pulls: Arc<AtomicUsize>,
}

#[async_trait]
impl DecodeSession for ScriptedSession {
    async fn next_token(&mut self) -> Result<Option<DecodedToken>> {
        self.pulls.fetch_add(1, Ordering::SeqCst);
        match self.script.pop_front() {
            Some(Step::Token(token)) => Ok(Some(token)),
            Some(Step::Delay(delay, token)) => {
                tokio::time::sleep(delay).await;
                Ok(Some(token))
            }
            Some(Step::Stall) => std::future::pending().await,
            Some(Step::Fail(message)) => Err(Error::Decode(message.to_string())),
            None if self.endless => Ok(Some(DecodedToken::new(42, "x"))),
            None => Ok(None),
        }
    }
}

pub(crate) struct FixedTokenizer {
    codes: Vec<u32>,
    pub calls: AtomicUsize,
}

impl FixedTokenizer {
    pub fn new(codes: Vec<u32>) -> Self {
        Self {
            codes,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl SoundTokenizer for FixedTokenizer {
    fn vocab_size(&self) -> u32 {
        512
    }

    async fn encode(&self, _samples: &[f32]) -> Result<Vec<u32>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.codes.clone())
    }
}

pub(crate) fn prompt() -> Prompt {
    let tokens = SoundTokenSequence::new(vec![12, 45, 45, 7], 512).expect("tokens");
    PromptAssembler::llama3(PromptConfig::default()).assemble(&tokens, PromptMode::Respond)
}
