//! JSON REST API for listing search, accounts, saved listings, and admin ingestion.

use std::sync::Arc;
use std::time::Duration;

use axum::http::{header, HeaderName, HeaderValue, Method};
use axum::routing::{get, patch, post, put};
use axum::{Json, Router};
use itrack_adapters::Normalizer;
use itrack_storage::Store;
use itrack_sync::{IdentityPolicy, SyncConfig, SyncPipeline, Upserter};
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

pub mod account;
pub mod admin;
pub mod auth;
pub mod error;
pub mod internships;
pub mod saved;

pub use auth::{AuthConfig, AuthUser, ADMIN_TOKEN_HEADER};
pub use error::{ApiError, ApiResult};

pub const CRATE_NAME: &str = "itrack-web";

pub struct AppState {
    pub store: Arc<dyn Store>,
    pub auth: AuthConfig,
    pub admin_token: Option<String>,
    pub normalizer: Normalizer,
    pub identity: IdentityPolicy,
    pub upserter: Upserter<dyn Store>,
    pub pipeline: Option<Arc<SyncPipeline>>,
}

impl AppState {
    pub fn new(store: Arc<dyn Store>, auth: AuthConfig) -> Self {
        Self {
            upserter: Upserter::new(Arc::clone(&store)),
            store,
            auth,
            admin_token: None,
            normalizer: Normalizer::default(),
            identity: IdentityPolicy::default(),
            pipeline: None,
        }
    }

    pub fn with_admin_token(mut self, token: Option<String>) -> Self {
        self.admin_token = token.filter(|t| !t.is_empty());
        self
    }

    pub fn with_identity_policy(mut self, identity: IdentityPolicy) -> Self {
        self.identity = identity;
        self
    }

    pub fn with_pipeline(mut self, pipeline: Arc<SyncPipeline>) -> Self {
        self.pipeline = Some(pipeline);
        self
    }
}

#[derive(Debug, Clone)]
pub struct WebConfig {
    pub port: u16,
    pub admin_token: Option<String>,
    pub allowed_origins: Vec<String>,
}

impl WebConfig {
    pub fn from_env() -> Self {
        let admin_token = std::env::var("ADMIN_TOKEN").ok().filter(|t| !t.is_empty());
        if admin_token.is_none() {
            warn!("ADMIN_TOKEN not set; admin routes are open");
        }
        Self {
            port: std::env::var("ITRACK_WEB_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5000),
            admin_token,
            allowed_origins: std::env::var("ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }
}

/// Credentialed CORS. An empty origin list mirrors any request origin.
pub fn cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let origin = if allowed_origins.is_empty() {
        AllowOrigin::mirror_request()
    } else {
        let origins: Vec<HeaderValue> = allowed_origins
            .iter()
            .filter_map(|origin| match origin.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(%origin, "ignoring invalid CORS origin");
                    None
                }
            })
            .collect();
        AllowOrigin::list(origins)
    };
    CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static(ADMIN_TOKEN_HEADER),
        ])
        .max_age(Duration::from_secs(60 * 60))
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(account::register))
        .route("/auth/login", post(account::login))
        .route("/auth/me", get(account::me))
        .route(
            "/internships",
            get(internships::search).post(internships::submit),
        )
        .route("/internships/{id}", get(internships::detail))
        .route("/me/saved", get(saved::list))
        .route("/me/save", post(saved::save))
        .route(
            "/me/save/{id}",
            patch(saved::update_status).delete(saved::remove),
        )
        .route("/me/preferences", put(account::update_preferences))
        .route("/admin/scrape/run", post(admin::trigger_run))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("not found".to_string())
}

/// Serves the API until ctrl-c or SIGTERM.
pub async fn serve(state: AppState, config: &WebConfig) -> anyhow::Result<()> {
    let router = app(state).layer(cors_layer(&config.allowed_origins));
    let listener = TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(port = config.port, "web server listening");
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    info!("web server stopped");
    Ok(())
}

pub async fn serve_from_env(
    store: Arc<dyn Store>,
    pipeline: Option<Arc<SyncPipeline>>,
) -> anyhow::Result<()> {
    let config = WebConfig::from_env();
    let sync = match &pipeline {
        Some(pipeline) => pipeline.config().clone(),
        None => SyncConfig::from_env(),
    };
    let state = build_state(store, AuthConfig::from_env(), &config, &sync, pipeline);
    serve(state, &config).await
}

/// Manual submissions follow the same url-less identity policy as sync runs.
pub fn build_state(
    store: Arc<dyn Store>,
    auth: AuthConfig,
    config: &WebConfig,
    sync: &SyncConfig,
    pipeline: Option<Arc<SyncPipeline>>,
) -> AppState {
    let state = AppState::new(store, auth)
        .with_admin_token(config.admin_token.clone())
        .with_identity_policy(IdentityPolicy::new(sync.url_less_identity));
    match pipeline {
        Some(pipeline) => state.with_pipeline(pipeline),
        None => state,
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
        info!("received ctrl-c, shutting down");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received terminate signal, shutting down");
            }
            Err(err) => {
                warn!(error = %err, "failed to install terminate handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
