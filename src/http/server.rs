//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (tracing, timeout, defense)
//! - Bind server to listener and drain on shutdown
//!
//! # Routes
//! - `POST /v1/inspect`: bearer-protected sidecar decision endpoint, returns a [`Decision`]
//! - `ANY /v1/guard`: auth-request style check behind `defense_middleware`
//! - `GET /health`: liveness
//! - `/admin/*`: bearer-protected admin API (when enabled)

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{any, get, post},
    Json, Router,
};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};

use crate::admin::auth::admin_auth_middleware;
use crate::admin::setup_admin_router;
use crate::config::ShieldConfig;
use crate::http::middleware::defense_middleware;
use crate::security::{Decision, DefenseStack, InboundRequest};

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub stack: DefenseStack,
    pub config: Arc<ShieldConfig>,
}

impl AppState {
    pub fn new(stack: DefenseStack, config: ShieldConfig) -> Self {
        Self {
            stack,
            config: Arc::new(config),
        }
    }
}

/// HTTP server for the shield.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            router: build_router(state),
        }
    }

    /// Run the server until `shutdown` fires.
    pub async fn run(
        self,
        listener: TcpListener,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.recv().await;
                tracing::info!("HTTP server draining");
            })
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(state: AppState) -> Router {
    let timeout = Duration::from_secs(state.config.listener.request_timeout_secs);

    let guarded = Router::new()
        .route("/v1/guard", any(guard_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), defense_middleware));

    // Callers name arbitrary identities here, so they must hold the admin key.
    let sidecar = Router::new()
        .route("/v1/inspect", post(inspect_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware));

    let mut router = Router::new()
        .route("/health", get(health_handler))
        .merge(sidecar)
        .merge(guarded);

    if state.config.admin.enabled {
        router = router.merge(setup_admin_router(state.clone()));
    }

    router
        .with_state(state)
        .layer(TimeoutLayer::new(timeout))
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Deserialize)]
pub struct InspectBody {
    pub identity: String,
    #[serde(default)]
    pub source_ip: Option<String>,
    #[serde(default)]
    pub message: String,
}

async fn inspect_handler(
    State(state): State<AppState>,
    Json(body): Json<InspectBody>,
) -> Json<Decision> {
    let source_ip = body.source_ip.unwrap_or_else(|| body.identity.clone());
    let request = InboundRequest::new(body.identity, source_ip, body.message);
    Json(state.stack.inspect(&request))
}

/// Reached only when the defense middleware allowed the request.
async fn guard_handler() -> StatusCode {
    StatusCode::NO_CONTENT
}

async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}
