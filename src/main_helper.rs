use crate::constants::{DEFAULT_CHAT_COMPLETIONS_URL, DEFAULT_MAX_TOKENS};
use crate::engine::GenerationEngine;
use crate::metrics::MetricsAggregator;
use crate::store::ContentStore;
use clap::Parser;
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, default_value_t = 8080)]
    pub port: u16,
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,
    /// OpenAI-compatible chat-completions endpoint.
    #[arg(long, default_value = DEFAULT_CHAT_COMPLETIONS_URL)]
    pub chat_completions_url: String,
    /// Root directory for the file-backed card store.
    #[arg(long, default_value = "cards_data")]
    pub data_dir: String,
    /// Keep artifacts in memory only (no files written).
    #[arg(long, default_value_t = false)]
    pub memory_store: bool,
    #[arg(long, default_value_t = 300)]
    pub request_timeout_secs: u64,
    #[arg(long, default_value_t = 10)]
    pub connect_timeout_secs: u64,
    /// Per-read deadline on the upstream stream, 0 disables it.
    #[arg(long, default_value_t = 0)]
    pub stream_read_timeout_secs: u64,
    #[arg(long, default_value_t = DEFAULT_MAX_TOKENS)]
    pub max_tokens: u32,
}

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<GenerationEngine>,
    pub store: Arc<dyn ContentStore>,
    pub metrics: Arc<MetricsAggregator>,
    pub upstream_configured: bool,
}
