//! # Tidemark HTTP API Module
//!
//! Read access to the derived tables and an event-batch entry point, using
//! axum.
//!
//! ## Endpoints
//!
//! - `GET /health` - Health check
//! - `GET /status` - Table sizes and engine settings
//! - `GET /current/{key}` - Current-state row of a key
//! - `GET /history/{key}?as_of=` - History versions of a key
//! - `GET /audit` - Audit summary over every key
//! - `GET /audit/{key}` - Audit summary of a key
//! - `GET /feed` - Change-feed metrics of the last pass
//! - `POST /revisions` - Reconcile an event batch
//! - `POST /export` - Export both tables as a base64 dump
//!
//! ## Security Configuration (Environment Variables)
//!
//! - `TIDEMARK_CORS_ORIGINS`: Comma-separated list of allowed origins, or "*" for all (default: localhost only)
//! - `TIDEMARK_RATE_LIMIT`: Requests per second (default: 100, 0 to disable)
//! - `TIDEMARK_API_KEY`: If set, requires Bearer token authentication

mod auth;
mod handlers;
mod middleware;
mod types;

pub use auth::{API_KEY_ENV, get_api_key_from_env};
pub use middleware::{RATE_LIMIT_ENV, create_rate_limiter, get_rate_limit_from_env};
pub use types::{
    AuditResponse, CurrentResponse, DEFAULT_API_SOURCE, ExportResponse, FailureJson,
    FeedResponse, HealthResponse, HistoryQuery, HistoryResponse, KeyAuditJson, KeyAuditResponse,
    RejectionJson, RevisionsRequest, RevisionsResponse, RowJson, SourceFeedJson, StatusResponse,
    VersionJson,
};

use axum::{
    Router,
    http::{HeaderValue, Method, header},
    middleware as axum_middleware,
    routing::{get, post},
};
use std::sync::Arc;
use tidemark_core::{FeedMetrics, Pipeline, StorageBackend, TidemarkError};
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

/// Environment variable holding the allowed CORS origins.
pub const CORS_ORIGINS_ENV: &str = "TIDEMARK_CORS_ORIGINS";

// =============================================================================
// SERVER STATE
// =============================================================================

/// Shared server state.
#[derive(Clone)]
pub struct AppState {
    /// The pipeline over the served tables.
    pub pipeline: Arc<Pipeline<StorageBackend>>,
    /// Feed metrics of the last `POST /revisions` pass.
    pub last_feed: Arc<RwLock<Option<FeedMetrics>>>,
}

impl AppState {
    #[must_use]
    pub fn new(pipeline: Pipeline<StorageBackend>) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            last_feed: Arc::new(RwLock::new(None)),
        }
    }
}

// =============================================================================
// CORS CONFIGURATION
// =============================================================================

/// Build the CORS layer from `TIDEMARK_CORS_ORIGINS`.
///
/// - `*`: every origin
/// - unset, or no valid entry: localhost only
/// - otherwise: the comma-separated origins
fn build_cors_layer() -> CorsLayer {
    let origins_env = std::env::var(CORS_ORIGINS_ENV).ok();

    match origins_env.as_deref() {
        Some("*") => {
            tracing::warn!(
                "CORS: Allowing ALL origins (TIDEMARK_CORS_ORIGINS=*). This is insecure for production!"
            );
            CorsLayer::permissive()
        }
        Some(origins) => {
            let allowed_origins: Vec<HeaderValue> = origins
                .split(',')
                .filter_map(|s| {
                    let trimmed = s.trim();
                    match trimmed.parse::<HeaderValue>() {
                        Ok(hv) => {
                            tracing::info!("CORS: Allowing origin: {}", trimmed);
                            Some(hv)
                        }
                        Err(e) => {
                            tracing::warn!("CORS: Invalid origin '{}': {}", trimmed, e);
                            None
                        }
                    }
                })
                .collect();

            if allowed_origins.is_empty() {
                tracing::warn!(
                    "CORS: No valid origins in TIDEMARK_CORS_ORIGINS, defaulting to localhost only"
                );
                build_localhost_cors()
            } else {
                CorsLayer::new()
                    .allow_origin(allowed_origins)
                    .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                    .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
            }
        }
        None => {
            tracing::info!("CORS: No TIDEMARK_CORS_ORIGINS set, defaulting to localhost only");
            build_localhost_cors()
        }
    }
}

fn build_localhost_cors() -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        "http://localhost:3000",
        "http://localhost:8080",
        "http://127.0.0.1:3000",
        "http://127.0.0.1:8080",
    ]
    .iter()
    .filter_map(|o| o.parse::<HeaderValue>().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
}

// =============================================================================
// ROUTER CREATION
// =============================================================================

/// Create the axum router with all endpoints and middleware.
///
/// Middleware stack (outer to inner):
/// 1. Tracing
/// 2. CORS
/// 3. Body limit
/// 4. Rate limiting (if enabled)
/// 5. Authentication (if configured)
pub fn create_router(state: AppState) -> Router {
    let cors = build_cors_layer();

    let rate_limit = get_rate_limit_from_env();
    let rate_limiter = if rate_limit > 0 {
        tracing::info!("Rate limiting enabled: {} requests/second", rate_limit);
        Some(create_rate_limiter(rate_limit))
    } else {
        tracing::info!("Rate limiting disabled");
        None
    };

    let has_auth = get_api_key_from_env().is_some();
    if has_auth {
        tracing::info!("API key authentication enabled");
    } else {
        tracing::warn!(
            "API key authentication DISABLED - all endpoints are publicly accessible! \
             Set TIDEMARK_API_KEY to enable authentication."
        );
    }

    let mut router = Router::new()
        .route("/health", get(handlers::health_handler))
        .route("/status", get(handlers::status_handler))
        .route("/current/{key}", get(handlers::current_handler))
        .route("/history/{key}", get(handlers::history_handler))
        .route("/audit", get(handlers::audit_handler))
        .route("/audit/{key}", get(handlers::audit_key_handler))
        .route("/feed", get(handlers::feed_handler))
        .route("/revisions", post(handlers::revisions_handler))
        .route("/export", post(handlers::export_handler));

    if has_auth {
        router = router.layer(axum_middleware::from_fn(auth::api_key_auth_middleware));
    }

    if let Some(limiter) = rate_limiter {
        router = router.layer(axum_middleware::from_fn_with_state(
            limiter,
            middleware::rate_limit_middleware,
        ));
    }

    router
        .layer(axum::extract::DefaultBodyLimit::max(16 * 1024 * 1024))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// =============================================================================
// SERVER STARTUP
// =============================================================================

/// Serve the pipeline's tables over HTTP.
pub async fn run_server(addr: &str, pipeline: Pipeline<StorageBackend>) -> Result<(), TidemarkError> {
    let state = AppState::new(pipeline);
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| TidemarkError::IoError(format!("Bind failed: {}", e)))?;

    tracing::info!("Tidemark HTTP server listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| TidemarkError::IoError(format!("Server error: {}", e)))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
