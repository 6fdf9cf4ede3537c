//! Pipeline configuration types.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Sample rate the sound tokenizer was trained at.
pub const TARGET_SAMPLE_RATE: u32 = 16_000;

/// Configuration for one [`crate::Pipeline`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub generation: GenerationConfig,

    #[serde(default)]
    pub prompt: PromptConfig,

    #[serde(default)]
    pub post_process: PostProcessConfig,

    #[serde(default)]
    pub codec: CodecConfig,
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.generation.max_tokens == 0 {
            return Err(Error::Config(
                "generation.max_tokens must be at least 1".to_string(),
            ));
        }
        if self.generation.per_token_timeout_ms == 0 {
            return Err(Error::Config(
                "generation.per_token_timeout_ms must be positive".to_string(),
            ));
        }
        if self.generation.handoff_capacity == Some(0) {
            return Err(Error::Config(
                "generation.handoff_capacity must be at least 1".to_string(),
            ));
        }
        if self.codec.target_sample_rate == 0 {
            return Err(Error::Config(
                "codec.target_sample_rate must be positive".to_string(),
            ));
        }
        self.prompt.validate()?;
        self.post_process.validate()
    }
}

/// Per-request generation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationConfig {
    /// Hard cap on generated tokens
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Longest the consumer waits for the next fragment (milliseconds)
    #[serde(default = "default_per_token_timeout_ms")]
    pub per_token_timeout_ms: u64,

    /// Producer-to-consumer handoff bound. `None` sizes it to `max_tokens + 1`
    /// so the producer never waits on the consumer.
    #[serde(default)]
    pub handoff_capacity: Option<usize>,
}

impl GenerationConfig {
    pub fn per_token_timeout(&self) -> Duration {
        Duration::from_millis(self.per_token_timeout_ms)
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            per_token_timeout_ms: default_per_token_timeout_ms(),
            handoff_capacity: None,
        }
    }
}

/// Marker text used to embed sound tokens in a prompt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptConfig {
    /// Prefix of a rendered sound token, e.g. `<|sound_` in `<|sound_0042|>`
    #[serde(default = "default_token_prefix")]
    pub token_prefix: String,

    /// Suffix of a rendered sound token
    #[serde(default = "default_token_suffix")]
    pub token_suffix: String,

    #[serde(default = "default_start_marker")]
    pub start_marker: String,

    #[serde(default = "default_end_marker")]
    pub end_marker: String,

    /// Directive placed before the start marker in transcribe mode
    #[serde(default = "default_transcribe_marker")]
    pub transcribe_marker: String,

    /// Append an open assistant header after the user turn.
    #[serde(default)]
    pub add_generation_prompt: bool,
}

impl PromptConfig {
    fn validate(&self) -> Result<()> {
        let markers = [
            ("prompt.token_prefix", &self.token_prefix),
            ("prompt.start_marker", &self.start_marker),
            ("prompt.end_marker", &self.end_marker),
            ("prompt.transcribe_marker", &self.transcribe_marker),
        ];
        for (field, value) in markers {
            if value.is_empty() {
                return Err(Error::Config(format!("{field} cannot be empty")));
            }
        }

        // A rendered token is prefix + digits + suffix; a control marker shaped
        // like that would be indistinguishable from sound content.
        for (field, value) in &markers[1..] {
            if self.is_sound_token_shaped(value) {
                return Err(Error::Config(format!(
                    "{field} '{value}' collides with the sound token namespace"
                )));
            }
        }
        Ok(())
    }

    fn is_sound_token_shaped(&self, marker: &str) -> bool {
        marker
            .strip_prefix(self.token_prefix.as_str())
            .and_then(|rest| rest.strip_suffix(self.token_suffix.as_str()))
            .map(|digits| !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()))
            .unwrap_or(false)
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            token_prefix: default_token_prefix(),
            token_suffix: default_token_suffix(),
            start_marker: default_start_marker(),
            end_marker: default_end_marker(),
            transcribe_marker: default_transcribe_marker(),
            add_generation_prompt: false,
        }
    }
}

/// Text rules applied to the accumulated response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostProcessConfig {
    /// Substrings removed wherever they appear. Applied in order, so list
    /// longer markers before markers they contain.
    #[serde(default = "default_strip_markers")]
    pub strip: Vec<String>,

    /// End-of-sequence text; the response is truncated at its first occurrence.
    #[serde(default = "default_terminator")]
    pub terminator: Option<String>,

    /// Withhold a trailing fragment that could still grow into a marker until
    /// the next fragment (or the end of generation) settles it.
    #[serde(default)]
    pub hold_back_partial_markers: bool,
}

impl PostProcessConfig {
    fn validate(&self) -> Result<()> {
        if self.strip.iter().any(String::is_empty) {
            return Err(Error::Config(
                "post_process.strip cannot contain empty markers".to_string(),
            ));
        }
        if matches!(self.terminator.as_deref(), Some("")) {
            return Err(Error::Config(
                "post_process.terminator cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PostProcessConfig {
    fn default() -> Self {
        Self {
            strip: default_strip_markers(),
            terminator: default_terminator(),
            hold_back_partial_markers: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    #[serde(default = "default_target_sample_rate")]
    pub target_sample_rate: u32,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            target_sample_rate: default_target_sample_rate(),
        }
    }
}

fn default_max_tokens() -> usize {
    1024
}

fn default_per_token_timeout_ms() -> u64 {
    10_000
}

fn default_token_prefix() -> String {
    "<|sound_".to_string()
}

fn default_token_suffix() -> String {
    "|>".to_string()
}

fn default_start_marker() -> String {
    "<|sound_start|>".to_string()
}

fn default_end_marker() -> String {
    "<|sound_end|>".to_string()
}

fn default_transcribe_marker() -> String {
    "<|reserved_special_token_69|>".to_string()
}

fn default_strip_markers() -> Vec<String> {
    vec![
        "<|start_header_id|>assistant<|end_header_id|>\n\n".to_string(),
        "assistant\n\n".to_string(),
    ]
}

fn default_terminator() -> Option<String> {
    Some("<|eot_id|>".to_string())
}

fn default_target_sample_rate() -> u32 {
    TARGET_SAMPLE_RATE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        config.validate().expect("defaults should validate");
        assert_eq!(config.generation.max_tokens, 1024);
        assert_eq!(
            config.generation.per_token_timeout(),
            Duration::from_secs(10)
        );
        assert_eq!(config.codec.target_sample_rate, 16_000);
    }

    #[test]
    fn partial_json_fills_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"generation": {"max_tokens": 32}}"#).expect("parse");
        assert_eq!(config.generation.max_tokens, 32);
        assert_eq!(config.generation.per_token_timeout_ms, 10_000);
        assert_eq!(config.prompt.start_marker, "<|sound_start|>");
        assert_eq!(config.post_process.terminator.as_deref(), Some("<|eot_id|>"));
    }

    #[test]
    fn rejects_zero_limits() {
        let mut config = PipelineConfig::default();
        config.generation.max_tokens = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = PipelineConfig::default();
        config.generation.per_token_timeout_ms = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = PipelineConfig::default();
        config.generation.handoff_capacity = Some(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_markers_inside_sound_namespace() {
        let mut config = PipelineConfig::default();
        config.prompt.start_marker = "<|sound_0001|>".to_string();
        let err = config.validate().expect_err("collision should be rejected");
        assert!(err.to_string().contains("prompt.start_marker"));
    }

    #[test]
    fn rejects_empty_strip_marker() {
        let mut config = PipelineConfig::default();
        config.post_process.strip.push(String::new());
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
