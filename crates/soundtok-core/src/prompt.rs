//! Prompt assembly: sound tokens wrapped in markers inside a chat template.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::codec::SoundTokenSequence;
use crate::config::PromptConfig;

/// What the model is asked to do with the audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptMode {
    /// Answer the spoken request.
    Respond,
    /// Repeat back what was said.
    Transcribe,
}

impl fmt::Display for PromptMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PromptMode::Respond => write!(f, "respond"),
            PromptMode::Transcribe => write!(f, "transcribe"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

impl ChatRole {
    pub fn as_prompt_role(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }
}

/// Model-specific serialization of chat turns. Implementations own the role
/// markers; callers only supply message content.
pub trait ChatTemplate: Send + Sync {
    fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String;
}

/// Llama 3 header/eot chat layout.
#[derive(Debug, Clone, Default)]
pub struct Llama3ChatTemplate;

impl ChatTemplate for Llama3ChatTemplate {
    fn render(&self, messages: &[ChatMessage], add_generation_prompt: bool) -> String {
        let mut out = String::from("<|begin_of_text|>");
        for message in messages {
            out.push_str("<|start_header_id|>");
            out.push_str(message.role.as_prompt_role());
            out.push_str("<|end_header_id|>\n\n");
            out.push_str(&message.content);
            out.push_str("<|eot_id|>");
        }
        if add_generation_prompt {
            out.push_str("<|start_header_id|>assistant<|end_header_id|>\n\n");
        }
        out
    }
}

/// Fully rendered model input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    text: String,
    sound_tokens: usize,
    mode: PromptMode,
}

impl Prompt {
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn sound_tokens(&self) -> usize {
        self.sound_tokens
    }

    pub fn mode(&self) -> PromptMode {
        self.mode
    }
}

impl fmt::Display for Prompt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

pub struct PromptAssembler {
    markers: PromptConfig,
    template: Arc<dyn ChatTemplate>,
}

impl PromptAssembler {
    pub fn new(markers: PromptConfig, template: Arc<dyn ChatTemplate>) -> Self {
        Self { markers, template }
    }

    pub fn llama3(markers: PromptConfig) -> Self {
        Self::new(markers, Arc::new(Llama3ChatTemplate))
    }

    /// Render one code as its tagged symbol, e.g. `<|sound_0042|>`.
    pub fn render_token(&self, code: u32) -> String {
        format!(
            "{}{:04}{}",
            self.markers.token_prefix, code, self.markers.token_suffix
        )
    }

    /// The user-turn content: optional directive, start marker, symbols, end marker.
    pub fn sound_content(&self, tokens: &SoundTokenSequence, mode: PromptMode) -> String {
        let symbol_len = self.markers.token_prefix.len() + 4 + self.markers.token_suffix.len();
        let mut content = String::with_capacity(
            tokens.len() * symbol_len
                + self.markers.transcribe_marker.len()
                + self.markers.start_marker.len()
                + self.markers.end_marker.len(),
        );

        if mode == PromptMode::Transcribe {
            content.push_str(&self.markers.transcribe_marker);
        }
        content.push_str(&self.markers.start_marker);
        for &code in tokens.codes() {
            content.push_str(&self.render_token(code));
        }
        content.push_str(&self.markers.end_marker);
        content
    }

    pub fn assemble(&self, tokens: &SoundTokenSequence, mode: PromptMode) -> Prompt {
        let messages = [ChatMessage::user(self.sound_content(tokens, mode))];
        Prompt {
            text: self
                .template
                .render(&messages, self.markers.add_generation_prompt),
            sound_tokens: tokens.len(),
            mode,
        }
    }
}
