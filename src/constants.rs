/// Root markers that qualify a buffer as renderable card markup.
pub const ROOT_MARKERS: &[&str] = &["<svg", "<html", "<body", "<div"];

/// Markdown fence marker used by models to wrap generated markup.
pub const FENCE_MARKER: &str = "```";

/// Buffers shorter than this that ended without a finish signal are
/// treated as possibly truncated.
pub const MIN_PLAUSIBLE_CONTENT_LEN: usize = 100;

/// Hard cap on SSE frames consumed from a single upstream stream.
pub const MAX_STREAM_FRAMES: usize = 100_000;

/// Single `data:` payloads larger than this are rejected as malformed.
pub const MAX_FRAME_BYTES: usize = 10 * 1024 * 1024;

/// Chat-completions endpoint used when no override is configured.
pub const DEFAULT_CHAT_COMPLETIONS_URL: &str = "https://api.deepseek.com/v1/chat/completions";

/// Model sent upstream when the request does not name one.
pub const DEFAULT_MODEL_ID: &str = "deepseek-chat";

/// Completion-length cap sent with every upstream request.
pub const DEFAULT_MAX_TOKENS: u32 = 2000;

/// How many artifact ids the recent ring retains.
pub const MAX_RECENT_ITEMS: usize = 20;

/// Capacity of a per-request progress channel. Progress is advisory;
/// when the channel is full, updates are dropped rather than awaited.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 64;
