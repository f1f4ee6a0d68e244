pub mod config;
pub mod db;
pub mod error;
pub mod handlers;
pub mod models;
pub mod services;

use service_core::axum::{routing::get, Router};
use service_core::error::AppError;
use sqlx::PgPool;
use tower_http::trace::TraceLayer;

use crate::services::{AuthService, DomainService, PatService};

#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub service_version: String,
    pub auth: AuthService,
    pub domains: DomainService,
    pub pats: PatService,
    /// Absent when the stores run in memory.
    pub pool: Option<PgPool>,
}

pub async fn build_router(state: AppState) -> Result<Router, AppError> {
    let app = Router::new()
        .route("/health", get(handlers::health::health_check))
        .route("/.well-known/jwks.json", get(handlers::well_known::jwks))
        .with_state(state)
        .layer(TraceLayer::new_for_http().make_span_with(
            |request: &service_core::axum::http::Request<_>| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|value| value.to_str().ok())
                    .unwrap_or("-");

                tracing::info_span!(
                    "http_request",
                    request_id = %request_id,
                    method = %request.method(),
                    uri = %request.uri(),
                )
            },
        ));

    Ok(app)
}
