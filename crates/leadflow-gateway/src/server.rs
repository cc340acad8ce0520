//! HTTP server implementation using Axum.

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    routing::{get, post},
};
use leadflow_core::config::GatewayConfig;
use leadflow_core::tracking::TrackingStore;
use leadflow_scheduler::SequenceScheduler;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::reconcile::WebhookReconciler;

/// Shared state for the gateway server.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<TrackingStore>,
    pub reconciler: Arc<WebhookReconciler>,
    /// Operator endpoints drive the same scheduler as the background loop.
    pub scheduler: Arc<SequenceScheduler>,
    pub start_time: Instant,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    build_router_from_arc(Arc::new(state))
}

pub fn build_router_from_arc(shared: Arc<AppState>) -> Router {
    // Public: hit by mail clients and provider callbacks.
    let public = Router::new()
        .route("/health", get(super::routes::health_check))
        .route("/open/{tracking_id}", get(super::routes::open_pixel))
        .route("/click/{tracking_id}", get(super::routes::click_redirect))
        .route("/webhooks/voice", post(super::routes::voice_webhook))
        .route("/webhooks/call-status", post(super::routes::call_status_webhook))
        .route("/webhooks/recording", post(super::routes::recording_webhook));

    let operator = Router::new()
        .route("/api/v1/scheduler/tick", post(super::routes::scheduler_tick))
        .route(
            "/api/v1/enrollments/failed",
            get(super::routes::list_failed_enrollments),
        )
        .route(
            "/api/v1/enrollments/{id}/reset",
            post(super::routes::reset_enrollment),
        )
        .route(
            "/api/v1/tracking/{tracking_id}",
            get(super::routes::get_tracking),
        );

    public
        .merge(operator)
        .layer({
            let cors = CorsLayer::new()
                .allow_methods([
                    axum::http::Method::GET,
                    axum::http::Method::POST,
                    axum::http::Method::OPTIONS,
                ])
                .allow_headers(Any)
                .max_age(std::time::Duration::from_secs(3600));

            // e.g. LEADFLOW_CORS_ORIGINS=https://crm.example.com,https://app.example.com
            if let Ok(origins_str) = std::env::var("LEADFLOW_CORS_ORIGINS") {
                let origins: Vec<_> = origins_str
                    .split(',')
                    .filter_map(|s| s.trim().parse::<axum::http::HeaderValue>().ok())
                    .collect();
                cors.allow_origin(origins)
            } else {
                cors.allow_origin(Any)
            }
        })
        .layer(TraceLayer::new_for_http())
        .with_state(shared)
}

/// Start the HTTP server.
pub async fn start(config: &GatewayConfig, state: AppState) -> anyhow::Result<()> {
    let app = build_router(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("🌐 Gateway listening on http://{} (public url {})", addr, config.public_url);

    axum::serve(listener, app).await?;
    Ok(())
}
