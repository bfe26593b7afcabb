//! HTTP proxy server module.
//!
//! Accepts a conversation on `POST /api/chat`, admits it against the request
//! window, calls the provider with retry, and streams the generated text back.

pub mod admission;
mod handlers;
pub mod retry;
mod server;
pub mod stream;
pub mod types;
pub mod upstream;

pub use admission::{AdmissionController, SlidingWindowLimiter};
pub use handlers::STREAM_CONTENT_TYPE;
pub use retry::{with_retry, RetryPolicy};
pub use server::{create_router, run_server, AppState, RequestId, REQUEST_ID_HEADER};
pub use stream::{translate, StreamOutcome, StreamSummary};
pub use types::{ConversationRequest, Message, Role, UpstreamChunk};
pub use upstream::{ChunkStream, UpstreamClient};
