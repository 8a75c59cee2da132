use crate::utils::errors::SnapshotError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(thiserror::Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Unprocessable(String),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, msg) = match &self {
            ApiError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ApiError::NotFound(m) => (StatusCode::NOT_FOUND, m.clone()),
            ApiError::Unprocessable(m) => (StatusCode::UNPROCESSABLE_ENTITY, m.clone()),
            ApiError::Snapshot(e) => (status_for(e), e.to_string()),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", msg);
        }
        (status, Json(json!({ "error": msg }))).into_response()
    }
}

fn status_for(error: &SnapshotError) -> StatusCode {
    match error {
        SnapshotError::CorruptArchive(_)
        | SnapshotError::UnsupportedManifestVersion { .. }
        | SnapshotError::Unsupported(_) => StatusCode::UNPROCESSABLE_ENTITY,
        SnapshotError::Config(_) => StatusCode::BAD_REQUEST,
        SnapshotError::RestoreFailed { source, .. } | SnapshotError::BackupFailed { source, .. } => {
            match source.as_ref() {
                SnapshotError::Io(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    StatusCode::NOT_FOUND
                }
                inner => status_for(inner),
            }
        }
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::errors::RestoreStage;

    #[test]
    fn test_status_mapping() {
        let corrupt = SnapshotError::restore(
            RestoreStage::Unpack,
            SnapshotError::CorruptArchive("bad checksum".to_string()),
        );
        assert_eq!(status_for(&corrupt), StatusCode::UNPROCESSABLE_ENTITY);

        let missing = SnapshotError::restore(
            RestoreStage::Import,
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert_eq!(status_for(&missing), StatusCode::NOT_FOUND);

        let disk = SnapshotError::Io(std::io::Error::new(std::io::ErrorKind::Other, "full"));
        assert_eq!(status_for(&disk), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn test_bad_request_response() {
        let response = ApiError::BadRequest("confirm must be true".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
