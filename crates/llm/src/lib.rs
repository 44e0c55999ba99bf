//! Wire layer for the chat backend: request bodies, the `data:` frame
//! decoder and the HTTP client.

use std::sync::Arc;

pub mod frame;
mod http;
mod model;
mod provider;

pub use frame::{
    AbortReason, DONE_SENTINEL, FrameDecoder, NO_CREDIT_ERROR_TYPE, ServerError, StreamEvent,
    decode_byte_stream,
};
pub use http::{HttpBackend, NEW_CHAT_PATH, STREAM_PATH};
pub use model::{DEFAULT_MODEL_TYPE, Model, ModelParameters, default_models};
pub use provider::{
    BackendConfig, BackendError, BackendResult, BoxFuture, ChatBackend, ChatEventStream,
    ChatRequest, HistoryBackend, HistoryRow, NewChatRequest, NewChatResponse,
};

/// Builds the HTTP backend shared by streaming and history reads.
pub fn create_backend(config: BackendConfig) -> BackendResult<Arc<HttpBackend>> {
    Ok(Arc::new(HttpBackend::new(config)?))
}
