use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

/// Error taxonomy shared by every adapter, the virtual-fs facade, and the
/// routes. Routes map each variant 1:1 to an HTTP status.
#[derive(Error, Debug)]
pub enum FsError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} is a directory")]
    IsADirectory(String),

    #[error("{0} is not a directory")]
    NotADirectory(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("requested range not satisfiable")]
    RangeNotSatisfiable,

    #[error("unauthorized")]
    Unauthorized,

    #[error("link has expired")]
    Expired,

    #[error("upstream error (status {status}): {detail}")]
    Upstream { status: u16, detail: String },

    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FsError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            FsError::NotFound(_) => StatusCode::NOT_FOUND,
            FsError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            FsError::IsADirectory(_) => StatusCode::BAD_REQUEST,
            FsError::NotADirectory(_) => StatusCode::BAD_REQUEST,
            FsError::AlreadyExists(_) => StatusCode::CONFLICT,
            FsError::RangeNotSatisfiable => StatusCode::RANGE_NOT_SATISFIABLE,
            FsError::Unauthorized => StatusCode::UNAUTHORIZED,
            FsError::Expired => StatusCode::GONE,
            FsError::Upstream { .. } => StatusCode::BAD_GATEWAY,
            FsError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            FsError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Upstream error from a backend HTTP response.
    pub fn upstream(status: u16, detail: impl Into<String>) -> Self {
        FsError::Upstream {
            status,
            detail: detail.into(),
        }
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        FsError::Internal(detail.into())
    }
}

impl IntoResponse for FsError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            tracing::error!("internal error surfaced to client: {}", self);
        }
        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

impl From<std::io::Error> for FsError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => FsError::NotFound(err.to_string()),
            std::io::ErrorKind::AlreadyExists => FsError::AlreadyExists(err.to_string()),
            _ => FsError::Internal(err.to_string()),
        }
    }
}

impl From<sqlx::Error> for FsError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => FsError::NotFound("row not found".into()),
            other => FsError::Internal(other.to_string()),
        }
    }
}

impl From<anyhow::Error> for FsError {
    fn from(err: anyhow::Error) -> Self {
        FsError::Internal(err.to_string())
    }
}

impl From<reqwest::Error> for FsError {
    fn from(err: reqwest::Error) -> Self {
        let status = err.status().map(|s| s.as_u16()).unwrap_or(502);
        FsError::Upstream {
            status,
            detail: err.to_string(),
        }
    }
}

impl From<image::ImageError> for FsError {
    fn from(err: image::ImageError) -> Self {
        FsError::Internal(format!("image processing failed: {}", err))
    }
}

pub type FsResult<T> = Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_variant_maps_to_its_documented_status() {
        let cases = [
            (FsError::NotFound("x".into()), 404),
            (FsError::InvalidArgument("x".into()), 400),
            (FsError::IsADirectory("x".into()), 400),
            (FsError::NotADirectory("x".into()), 400),
            (FsError::AlreadyExists("x".into()), 409),
            (FsError::RangeNotSatisfiable, 416),
            (FsError::Unauthorized, 401),
            (FsError::Expired, 410),
            (FsError::upstream(503, "x"), 502),
            (FsError::NotImplemented("op"), 501),
            (FsError::internal("x"), 500),
        ];
        for (error, status) in cases {
            assert_eq!(error.status_code().as_u16(), status, "{}", error);
        }
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err: FsError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, FsError::NotFound(_)));
    }
}
