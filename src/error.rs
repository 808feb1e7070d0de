use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

use crate::types::now_rfc3339;

/// Failures surfaced to callers of the checker and its HTTP surface.
///
/// Probe failures are not part of this enum: they are reported as a
/// `ProbeResult` with `success == false`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// A required parameter was missing or empty.
    #[error("{0}")]
    Validation(String),

    /// Supplied token matched neither the rotating nor the permanent token.
    #[error("{0}")]
    Auth(String),

    /// DNS fan-out produced no answers or a transport failure.
    #[error("DNS resolution failed: {0}")]
    Resolution(String),

    /// A third-party lookup (geo) failed.
    #[error("{0}")]
    Upstream(String),
}

pub type CheckResult<T> = std::result::Result<T, CheckError>;

impl CheckError {
    pub fn kind(&self) -> &'static str {
        match self {
            CheckError::Validation(_) => "validation",
            CheckError::Auth(_) => "auth",
            CheckError::Resolution(_) => "resolution",
            CheckError::Upstream(_) => "upstream",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CheckError::Validation(_) => StatusCode::BAD_REQUEST,
            CheckError::Auth(_) => StatusCode::FORBIDDEN,
            CheckError::Resolution(_) | CheckError::Upstream(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

/// JSON body used for every error response.
#[derive(Serialize, Debug)]
pub struct ErrorBody {
    pub status: &'static str,
    pub kind: &'static str,
    pub message: String,
    pub timestamp: String,
}

impl From<&CheckError> for ErrorBody {
    fn from(err: &CheckError) -> Self {
        Self {
            status: "error",
            kind: err.kind(),
            message: err.to_string(),
            timestamp: now_rfc3339(),
        }
    }
}

impl IntoResponse for CheckError {
    fn into_response(self) -> Response {
        (self.status_code(), Json(ErrorBody::from(&self))).into_response()
    }
}
