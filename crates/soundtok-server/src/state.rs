//! Shared application state

use std::sync::Arc;

use soundtok_core::Pipeline;
use tokio::sync::Semaphore;

use crate::config::ServerConfig;

#[derive(Clone)]
pub struct AppState {
    /// Built once at startup; every request streams from it
    pub pipeline: Arc<Pipeline>,
    /// Bounds concurrently running generations
    pub request_semaphore: Arc<Semaphore>,
    /// Whole-request deadline (seconds), on top of the per-token timeout
    pub request_timeout_secs: u64,
    pub cors: bool,
    pub max_upload_bytes: usize,
}

impl AppState {
    pub fn new(pipeline: Pipeline, server: &ServerConfig) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            request_semaphore: Arc::new(Semaphore::new(server.max_concurrent.max(1))),
            request_timeout_secs: server.request_timeout_secs,
            cors: server.cors,
            max_upload_bytes: server.max_upload_bytes,
        }
    }
}
