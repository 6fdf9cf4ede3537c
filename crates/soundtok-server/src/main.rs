//! Soundtok server - streams spoken-prompt responses over HTTP/SSE

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod error;
mod state;

use config::{Config, ServerConfig};
use soundtok_core::{HttpSoundTokenizer, OpenAiCompletionsDecoder, Pipeline, TokenCodec};
use state::AppState;

#[derive(Debug, Parser)]
#[command(
    name = "soundtok-server",
    about = "HTTP API streaming language-model replies to spoken prompts",
    version = env!("CARGO_PKG_VERSION")
)]
struct ServerArgs {
    /// Host to bind to
    #[arg(short = 'H', long)]
    host: Option<String>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Configuration file (defaults to <config dir>/soundtok/config.toml)
    #[arg(short, long, env = "SOUNDTOK_CONFIG")]
    config: Option<PathBuf>,

    /// OpenAI-compatible completions server, overrides `backend.decoder_url`
    #[arg(long)]
    decoder_url: Option<String>,

    /// Sound tokenizer service, overrides `backend.tokenizer_url`
    #[arg(long)]
    tokenizer_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct BindConfig {
    host: String,
    port: u16,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "soundtok_server=info,soundtok_core=info,tower_http=warn".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting soundtok server");

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(url) = args.decoder_url.clone() {
        config.backend.decoder_url = url;
    }
    if let Some(url) = args.tokenizer_url.clone() {
        config.backend.tokenizer_url = url;
    }
    info!(
        "Decoder at {} (model {}), tokenizer at {}",
        config.backend.decoder_url, config.backend.model, config.backend.tokenizer_url
    );

    let tokenizer = HttpSoundTokenizer::new(
        config.backend.tokenizer_url.clone(),
        config.backend.vocab_size,
        Duration::from_secs(config.backend.tokenizer_timeout_secs),
    )?;
    let decoder = OpenAiCompletionsDecoder::new(
        config.backend.decoder_url.clone(),
        config.backend.model.clone(),
    )?
    .with_eos_token_id(config.backend.eos_token_id);

    let codec = TokenCodec::new(Arc::new(tokenizer), &config.pipeline.codec);
    let pipeline = Pipeline::new(Arc::new(codec), Arc::new(decoder), config.pipeline.clone())?;
    let state = AppState::new(pipeline, &config.server);

    let app = api::create_router(state);

    let bind = resolve_bind_config(&args, &config.server);
    let addr = format!("{}:{}", bind.host, bind.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server stopped");
    Ok(())
}

/// CLI flag, then environment, then config file, then default.
fn resolve_bind_config(args: &ServerArgs, file: &ServerConfig) -> BindConfig {
    BindConfig {
        host: args
            .host
            .clone()
            .or_else(host_from_env)
            .or_else(|| file.host.clone())
            .unwrap_or_else(|| "0.0.0.0".to_string()),
        port: args
            .port
            .or_else(port_from_env)
            .or(file.port)
            .unwrap_or(8080),
    }
}

fn host_from_env() -> Option<String> {
    let raw = std::env::var("SOUNDTOK_HOST").ok()?;
    let host = raw.trim();
    if host.is_empty() {
        warn!("Empty SOUNDTOK_HOST, ignoring");
        return None;
    }
    Some(host.to_string())
}

fn port_from_env() -> Option<u16> {
    let raw = std::env::var("SOUNDTOK_PORT").ok()?;
    match raw.trim().parse::<u16>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("Invalid SOUNDTOK_PORT='{}', ignoring", raw);
            None
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("Failed to install SIGTERM handler: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        },
    }
}
