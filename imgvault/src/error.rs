use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use config::ConfigError;
use thiserror::Error;

/// Registry errors, mapped onto the distribution-spec error codes and the
/// JSON error body every handler returns.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("manifest unknown: {0}")]
    ManifestUnknown(String),

    #[error("blob unknown: {0}")]
    BlobUnknown(String),

    #[error("repository name unknown: {0}")]
    NameUnknown(String),

    #[error("blob upload unknown: {0}")]
    BlobUploadUnknown(String),

    #[error("blob upload invalid: {0}")]
    BlobUploadInvalid(String),

    #[error("invalid digest: {0}")]
    DigestInvalid(String),

    #[error("manifest references unknown blob: {0}")]
    ManifestBlobUnknown(String),

    #[error("manifest invalid: {0}")]
    ManifestInvalid(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("requested range not satisfiable: {0}")]
    RangeNotSatisfiable(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("method not allowed")]
    MethodNotAllowed,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(#[from] opendal::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("internal server error: {0}")]
    Internal(String),

    #[error("configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// The distribution-spec error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::ManifestUnknown(_) => "MANIFEST_UNKNOWN",
            AppError::BlobUnknown(_) => "BLOB_UNKNOWN",
            AppError::NameUnknown(_) => "NAME_UNKNOWN",
            AppError::BlobUploadUnknown(_) => "BLOB_UPLOAD_UNKNOWN",
            AppError::BlobUploadInvalid(_) => "BLOB_UPLOAD_INVALID",
            AppError::DigestInvalid(_) => "DIGEST_INVALID",
            AppError::ManifestBlobUnknown(_) => "MANIFEST_BLOB_UNKNOWN",
            AppError::ManifestInvalid(_) => "MANIFEST_INVALID",
            AppError::Unsupported(_) => "UNSUPPORTED",
            AppError::RangeNotSatisfiable(_) => "BLOB_UPLOAD_INVALID",
            AppError::Denied(_) => "DENIED",
            AppError::Unauthorized(_) => "UNAUTHORIZED",
            AppError::MethodNotAllowed => "UNSUPPORTED",
            AppError::Conflict(_) => "BLOB_UPLOAD_INVALID",
            AppError::Storage(_) | AppError::Json(_) | AppError::Internal(_) | AppError::Config(_) => {
                "UNKNOWN"
            }
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            AppError::ManifestUnknown(_)
            | AppError::BlobUnknown(_)
            | AppError::NameUnknown(_)
            | AppError::BlobUploadUnknown(_) => StatusCode::NOT_FOUND,
            AppError::BlobUploadInvalid(_)
            | AppError::DigestInvalid(_)
            | AppError::ManifestBlobUnknown(_)
            | AppError::ManifestInvalid(_) => StatusCode::BAD_REQUEST,
            AppError::Unsupported(_) => StatusCode::BAD_REQUEST,
            AppError::RangeNotSatisfiable(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            AppError::Denied(_) => StatusCode::FORBIDDEN,
            AppError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            AppError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::Storage(_) | AppError::Json(_) | AppError::Internal(_) | AppError::Config(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "errors": [{
                "code": self.code(),
                "message": self.to_string(),
                "detail": null,
            }]
        });
        (self.status(), axum::Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

impl From<ConfigError> for AppError {
    fn from(err: ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}
