use crate::models::PublicKeySet;
use crate::AppState;
use service_core::{
    axum::{extract::State, http::header, response::IntoResponse, Json},
    error::AppError,
};

/// JSON Web Key Set of the signing key. Symmetric deployments have none and
/// answer 404.
pub async fn jwks(State(state): State<AppState>) -> Result<impl IntoResponse, AppError> {
    let keys = state.auth.public_keys()?;
    Ok((
        [
            (header::CONTENT_TYPE, "application/json"),
            (header::CACHE_CONTROL, "public, max-age=3600"),
        ],
        Json(PublicKeySet { keys }),
    ))
}
