//! HTTP surface: shared state, router assembly, middleware, server lifecycle.

use anyhow::{Context, Result};
use axum::error_handling::HandleErrorLayer;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{BoxError, Json, Router};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower::buffer::BufferLayer;
use tower::limit::RateLimitLayer;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::services::ServeDir;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::HttpConfig;
use crate::media::FileStore;
use crate::otp::OtpDispatcher;
use crate::users::UserStore;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserStore>,
    pub files: Arc<FileStore>,
    pub otp: OtpDispatcher,
    /// Mirror of `otp.expose_in_response`
    pub expose_otp: bool,
    /// Mirror of `auth.bcrypt_cost`
    pub bcrypt_cost: u32,
}

/// `{success: false, message}` failure envelope. The signup flow's 500
/// additionally carries the underlying error text in `error`.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ErrorBody {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: None,
        }
    }

    pub fn with_detail(message: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(detail.into()),
        }
    }
}

/// `{success: true, message}` acknowledgement envelope.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Create the API router
pub fn create_router(state: AppState, config: &HttpConfig, public_dir: &str) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    // Business routes share one throughput-bounded lane; rate-limit
    // overload surfaces as a 429 instead of backpressure.
    let limited = Router::new()
        .route("/", get(root))
        .merge(crate::users::router())
        .merge(crate::verify::router())
        .merge(crate::products::router())
        .merge(crate::media::router())
        .layer(
            ServiceBuilder::new()
                .layer(HandleErrorLayer::new(rate_limit_exceeded))
                .layer(BufferLayer::new(1024))
                .layer(RateLimitLayer::new(
                    config.rate_limit_requests,
                    Duration::from_secs(config.rate_limit_window_secs),
                )),
        );

    // health probes bypass the limiter; stored uploads are served
    // statically at the URL root
    Router::new()
        .merge(limited)
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .fallback_service(ServeDir::new(public_dir))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(SetResponseHeaderLayer::overriding(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static("max-age=63072000; includeSubDomains; preload"),
        ))
        .layer(DefaultBodyLimit::max(config.max_body_bytes))
        .with_state(state)
}

async fn root() -> &'static str {
    "Hello from the server"
}

async fn rate_limit_exceeded(_err: BoxError) -> impl IntoResponse {
    (
        StatusCode::TOO_MANY_REQUESTS,
        Json(serde_json::json!({
            "status": "error",
            "message": "Too many requests, please wait and  try again later."
        })),
    )
}

/// Health check endpoint
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "atelier-api"
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    // Check database connectivity
    match sqlx::query("SELECT 1").fetch_one(state.users.pool()).await {
        Ok(_) => (
            StatusCode::OK,
            Json(serde_json::json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// Start the API server
pub async fn start_api_server(
    state: AppState,
    config: &HttpConfig,
    public_dir: &str,
) -> Result<()> {
    let router = create_router(state, config, public_dir);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .await
        .context("API server error")?;

    Ok(())
}
