use crate::{db, AppState};
use service_core::{
    axum::{extract::State, Json},
    error::AppError,
};

/// Service health check
pub async fn health_check(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, AppError> {
    let postgres = match &state.pool {
        Some(pool) => {
            db::health_check(pool).await.map_err(|e| {
                tracing::error!(error = %e, "PostgreSQL health check failed");
                AppError::DatabaseError(anyhow::Error::new(e))
            })?;
            "up"
        }
        None => "in-memory",
    };

    Ok(Json(serde_json::json!({
        "status": "healthy",
        "service": state.service_name,
        "version": state.service_version,
        "checks": {
            "postgres": postgres
        }
    })))
}
