//! Server configuration file (`<config_dir>/soundtok/config.toml`).

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use soundtok_core::PipelineConfig;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Overridden by `--host` and `SOUNDTOK_HOST`
    #[serde(default)]
    pub host: Option<String>,
    /// Overridden by `--port` and `SOUNDTOK_PORT`
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default = "default_cors")]
    pub cors: bool,
    /// Largest accepted request body; audio arrives base64-encoded inside it
    #[serde(default = "default_max_upload_bytes")]
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            max_concurrent: default_max_concurrent(),
            request_timeout_secs: default_request_timeout_secs(),
            cors: default_cors(),
            max_upload_bytes: default_max_upload_bytes(),
        }
    }
}

/// Where the model services live.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    /// OpenAI-compatible completions server
    #[serde(default = "default_decoder_url")]
    pub decoder_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_eos_token_id")]
    pub eos_token_id: Option<u32>,
    #[serde(default = "default_tokenizer_url")]
    pub tokenizer_url: String,
    #[serde(default = "default_vocab_size")]
    pub vocab_size: u32,
    #[serde(default = "default_tokenizer_timeout_secs")]
    pub tokenizer_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            decoder_url: default_decoder_url(),
            model: default_model(),
            eos_token_id: default_eos_token_id(),
            tokenizer_url: default_tokenizer_url(),
            vocab_size: default_vocab_size(),
            tokenizer_timeout_secs: default_tokenizer_timeout_secs(),
        }
    }
}

fn default_max_concurrent() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    300
}

fn default_cors() -> bool {
    true
}

fn default_max_upload_bytes() -> usize {
    64 * 1024 * 1024
}

fn default_decoder_url() -> String {
    "http://127.0.0.1:8000".to_string()
}

fn default_model() -> String {
    "llama3-s".to_string()
}

fn default_eos_token_id() -> Option<u32> {
    Some(128_009)
}

fn default_tokenizer_url() -> String {
    "http://127.0.0.1:8001".to_string()
}

fn default_vocab_size() -> u32 {
    512
}

fn default_tokenizer_timeout_secs() -> u64 {
    60
}

pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("soundtok").join("config.toml"))
        .unwrap_or_else(|| PathBuf::from("config.toml"))
}

impl Config {
    /// Load from `path`, or the default location. A missing file yields defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(default_config_path);

        if !config_path.exists() {
            if path.is_some() {
                anyhow::bail!("Config file {} does not exist", config_path.display());
            }
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read {}", config_path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse {}", config_path.display()))?;
        config.pipeline.validate()?;
        Ok(config)
    }
}
