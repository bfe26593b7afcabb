//! HTTP request handlers.

use axum::{
    body::{Body, Bytes},
    extract::{Extension, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use tracing::Instrument;

use super::retry::with_retry;
use super::server::{AppState, RequestId};
use super::stream::translate;
use super::types::ConversationRequest;
use crate::error::{Error, ErrorKind};

/// Content type of a successful streamed answer.
pub const STREAM_CONTENT_TYPE: &str = "text/plain; charset=utf-8";

/// Handle POST /api/chat
///
/// Failures before streaming starts become a JSON [`crate::error::ProxyError`]
/// with `Retry-After`. Once streaming has begun the status is committed; a
/// later upstream failure can only abort the body.
pub async fn chat(
    State(state): State<AppState>,
    Extension(request_id): Extension<RequestId>,
    body: Bytes,
) -> Response {
    let span = tracing::info_span!("chat", request_id = %request_id.0);

    async move {
        let start = std::time::Instant::now();
        match execute_request(&state, &body).await {
            Ok(response) => {
                tracing::info!(
                    latency_ms = start.elapsed().as_millis() as u64,
                    "streaming response started"
                );
                response
            }
            Err(err) => {
                let status = err.status();
                match err.kind() {
                    ErrorKind::InvalidInput | ErrorKind::RateLimited => {
                        tracing::warn!(status = status.as_u16(), error = %err, "request rejected")
                    }
                    _ => tracing::error!(
                        status = status.as_u16(),
                        kind = ?err.kind(),
                        error = %err,
                        "request failed"
                    ),
                }
                err.into_response()
            }
        }
    }
    .instrument(span)
    .await
}

/// Run a request through validation, admission, the upstream call and
/// stream setup.
async fn execute_request(state: &AppState, body: &[u8]) -> Result<Response, Error> {
    let conversation = ConversationRequest::from_body(body)?;
    tracing::info!(
        messages = conversation.messages.len(),
        "Received chat request"
    );

    // Admission runs before any upstream work so rejected requests cost nothing.
    if !state.admission.try_admit() {
        return Err(Error::RateLimited);
    }

    let upstream = &state.upstream;
    let messages = conversation.messages.as_slice();
    let chunks = with_retry(&state.retry, move || upstream.complete(messages)).await?;

    let (byte_stream, _summary) = translate(chunks);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, STREAM_CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-accel-buffering", "no")
        .body(Body::from_stream(byte_stream))
        .map_err(|e| Error::Internal(format!("failed to build response: {}", e)))
}

/// Handle GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "chatrelay",
        "model": state.config.upstream.model,
        "rate_limit": {
            "window_ms": state.config.rate_limit.window_ms,
            "max_requests": state.config.rate_limit.max_requests,
            "in_window": state.admission.in_window(),
        }
    }))
}
