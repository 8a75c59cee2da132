//! Container operation endpoints.

use super::error::ApiError;
use super::AppState;
use crate::container::PurgeReport;
use crate::fs::category::Classification;
use crate::restore::RestoreReport;
use crate::snapshot::SnapshotReport;
use axum::{extract::State, Json};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub archive_path: PathBuf,
}

#[derive(Debug, Deserialize)]
pub struct PurgeRequest {
    #[serde(default)]
    pub confirm: bool,
}

/// GET /classify - Current category partition of the root
pub async fn classify(State(state): State<AppState>) -> Result<Json<Classification>, ApiError> {
    Ok(Json(state.manager.classify().await?))
}

/// POST /snapshot - Build a snapshot and return once it is published
pub async fn snapshot(State(state): State<AppState>) -> Result<Json<SnapshotReport>, ApiError> {
    tracing::info!("Snapshot requested of {}", state.manager.root().display());
    Ok(Json(state.manager.snapshot().await?))
}

/// POST /restore - Restore an outer archive onto the root
pub async fn restore(
    State(state): State<AppState>,
    Json(req): Json<RestoreRequest>,
) -> Result<Json<RestoreReport>, ApiError> {
    if !req.archive_path.is_absolute() {
        return Err(ApiError::BadRequest(format!(
            "archive_path must be absolute, got '{}'",
            req.archive_path.display()
        )));
    }
    if !req.archive_path.is_file() {
        return Err(ApiError::NotFound(format!(
            "no archive at '{}'",
            req.archive_path.display()
        )));
    }

    tracing::info!("Restore requested from {}", req.archive_path.display());
    Ok(Json(state.manager.restore(&req.archive_path).await?))
}

/// POST /purge - Empty the category directories; requires `{"confirm": true}`
pub async fn purge(
    State(state): State<AppState>,
    Json(req): Json<PurgeRequest>,
) -> Result<Json<PurgeReport>, ApiError> {
    if !req.confirm {
        return Err(ApiError::Unprocessable(
            "purge requires \"confirm\": true".to_string(),
        ));
    }

    tracing::warn!("Purge requested of {}", state.manager.root().display());
    Ok(Json(state.manager.purge().await?))
}
