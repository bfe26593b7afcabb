//! HTTP server setup and configuration.

use axum::{
    extract::Request,
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use reqwest::Client;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use super::admission::{AdmissionController, SlidingWindowLimiter};
use super::handlers;
use super::retry::RetryPolicy;
use super::upstream::UpstreamClient;
use crate::config::Config;

/// Response header: correlation ID (UUID v4).
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Correlation ID assigned to each inbound request.
#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub admission: Arc<dyn AdmissionController>,
    pub upstream: Arc<UpstreamClient>,
    pub retry: RetryPolicy,
    pub config: Arc<Config>,
}

impl AppState {
    /// Construct the process-wide components from configuration.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let http_client = Client::builder()
            .connect_timeout(config.upstream.connect_timeout())
            .build()?;

        let admission = SlidingWindowLimiter::new(
            config.rate_limit.window(),
            config.rate_limit.max_requests,
        );

        Ok(Self {
            admission: Arc::new(admission),
            upstream: Arc::new(UpstreamClient::new(http_client, config.upstream.clone())),
            retry: RetryPolicy::from(&config.retry),
            config: Arc::new(config),
        })
    }
}

/// Tag the request with a fresh [`RequestId`] and echo it on the response.
async fn assign_request_id(mut request: Request, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    request.extensions_mut().insert(request_id);

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// Create the axum router with all endpoints.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/api/chat", post(handlers::chat))
        .route("/health", get(handlers::health))
        .with_state(state)
        .layer(middleware::from_fn(assign_request_id))
        .layer(TraceLayer::new_for_http())
}

/// Run the HTTP server.
pub async fn run_server(config: Config) -> anyhow::Result<()> {
    let listen_addr = config.server.listen.clone();
    let state = AppState::from_config(config)?;

    tracing::info!(
        model = %state.config.upstream.model,
        upstream = %state.config.upstream.base_url,
        window_ms = state.config.rate_limit.window_ms,
        max_requests = state.config.rate_limit.max_requests,
        "Upstream configured"
    );

    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(address = %listen_addr, "Starting chatrelay proxy server");

    axum::serve(listener, app).await?;

    Ok(())
}
