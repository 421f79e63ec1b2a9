//! Folio - ActivityPub federation for a git-backed publishing platform
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      API Layer (Axum)                        │
//! │  - ActivityPub endpoints                                    │
//! │  - WebFinger / NodeInfo discovery                           │
//! │  - Metrics                                                  │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    Federation Layer                          │
//! │  - Actor documents, inbox state machine, outbox fan-out     │
//! │  - HTTP Signatures and key management                       │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Storage Layer                           │
//! │  - JSON files beside the content tree                       │
//! │  - Encrypted key ring                                       │
//! │  - Optional git data branch with batched commits            │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - `api`: HTTP handlers for ActivityPub and discovery
//! - `federation`: ActivityPub federation handling
//! - `data`: Persisted records
//! - `storage`: Federation data persistence
//! - `config`: Configuration management
//! - `error`: Error types

pub mod api;
pub mod config;
pub mod data;
pub mod error;
pub mod federation;
pub mod metrics;
pub mod storage;

use std::sync::Arc;

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    /// Application configuration
    pub config: Arc<config::AppConfig>,

    /// Federation services (inert when federation is disabled)
    pub federation: Arc<federation::FederationManager>,

    /// HTTP client for federation
    pub http_client: Arc<reqwest::Client>,
}

impl AppState {
    /// Initialize application state
    ///
    /// # Steps
    /// 1. Build the outbound HTTP client
    /// 2. Open federation storage and load or generate signing keys
    ///
    /// # Errors
    /// Returns error if any initialization step fails
    pub async fn new(config: config::AppConfig) -> Result<Self, error::AppError> {
        tracing::info!("Initializing application state...");
        let config = Arc::new(config);
        let http_client = Arc::new(build_http_client()?);

        let federation =
            federation::FederationManager::new(Arc::clone(&config), Arc::clone(&http_client))
                .await?;

        tracing::info!(
            federation_enabled = federation.is_enabled(),
            "Application state initialized successfully"
        );
        Ok(Self {
            config,
            federation: Arc::new(federation),
            http_client,
        })
    }
}

/// Outbound client shared by fetches and deliveries
pub fn build_http_client() -> Result<reqwest::Client, error::AppError> {
    reqwest::Client::builder()
        .user_agent(concat!("Folio/", env!("CARGO_PKG_VERSION")))
        .timeout(std::time::Duration::from_secs(30))
        .build()
        .map_err(|e| error::AppError::Internal(e.into()))
}

/// Build the Axum router with all routes.
///
/// This is shared by the binary and integration tests to keep route
/// composition consistent across environments.
pub fn build_router(state: AppState) -> axum::Router {
    use axum::Router;
    use tower_http::trace::TraceLayer;

    let federation = Router::new()
        .merge(api::wellknown_router())
        .merge(api::activitypub_router())
        .layer(axum::middleware::from_fn(api::security_headers));

    Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(federation)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
        .merge(api::metrics_router())
}

async fn health_check() -> &'static str {
    "OK"
}
