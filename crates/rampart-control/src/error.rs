//! RFC 9457 Problem Details error responses.

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::db::StoreError;
use crate::release::ReleaseError;

/// RFC 9457 Problem Details response.
#[derive(Debug, Clone, Serialize)]
pub struct ProblemDetails {
    #[serde(rename = "type")]
    pub error_type: String,
    pub title: String,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instance: Option<String>,
}

impl ProblemDetails {
    fn new(kind: &str, title: &str, status: StatusCode, detail: Option<String>) -> Self {
        Self {
            error_type: format!("urn:rampart:error:{kind}"),
            title: title.into(),
            status: status.as_u16(),
            detail,
            instance: None,
        }
    }

    /// Create a 404 Not Found error.
    pub fn not_found(detail: impl Into<String>) -> Self {
        Self::new("not-found", "Not Found", StatusCode::NOT_FOUND, Some(detail.into()))
    }

    /// Create a 400 Bad Request error.
    pub fn bad_request(detail: impl Into<String>) -> Self {
        Self::new("bad-request", "Bad Request", StatusCode::BAD_REQUEST, Some(detail.into()))
    }

    /// Create a 400 error for a release that failed domain validation.
    pub fn validation_failed(detail: impl Into<String>) -> Self {
        Self::new(
            "validation-failed",
            "Release Validation Failed",
            StatusCode::BAD_REQUEST,
            Some(detail.into()),
        )
    }

    /// Create a 409 Conflict error.
    pub fn conflict(kind: &str, detail: impl Into<String>) -> Self {
        Self::new(kind, "Conflict", StatusCode::CONFLICT, Some(detail.into()))
    }

    /// Create a 500 Internal Server Error.
    pub fn internal_error() -> Self {
        Self::new(
            "internal-error",
            "Internal Server Error",
            StatusCode::INTERNAL_SERVER_ERROR,
            None,
        )
    }

    /// Create a 500 Internal Server Error with details.
    pub fn internal_error_with_detail(detail: impl Into<String>) -> Self {
        Self::new(
            "internal-error",
            "Internal Server Error",
            StatusCode::INTERNAL_SERVER_ERROR,
            Some(detail.into()),
        )
    }

    /// Create a 503 Service Unavailable error.
    pub fn service_unavailable(detail: impl Into<String>) -> Self {
        Self::new(
            "service-unavailable",
            "Service Unavailable",
            StatusCode::SERVICE_UNAVAILABLE,
            Some(detail.into()),
        )
    }

    pub fn with_instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }
}

impl IntoResponse for ProblemDetails {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        let mut response = Json(&self).into_response();
        *response.status_mut() = status;
        response.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/problem+json"),
        );
        response
    }
}

impl From<StoreError> for ProblemDetails {
    fn from(err: StoreError) -> Self {
        tracing::error!(error = %err, "store error");
        match err {
            StoreError::Constraint(detail) => Self::conflict("constraint", detail),
            StoreError::Database(_) | StoreError::Corrupt(_) => Self::internal_error(),
        }
    }
}

impl From<ReleaseError> for ProblemDetails {
    fn from(err: ReleaseError) -> Self {
        let detail = err.to_string();
        match err {
            ReleaseError::Validation(_) | ReleaseError::Compile(_) => {
                Self::validation_failed(detail)
            }
            ReleaseError::NotFound { .. } => Self::not_found(detail),
            ReleaseError::NoActiveDataPlane(_) => Self::conflict("no-active-data-plane", detail),
            ReleaseError::LegacySchema(_) => Self::conflict("legacy-schema", detail),
            ReleaseError::BindingConflict { .. } => Self::conflict("binding-conflict", detail),
            ReleaseError::Registry(_) => Self::service_unavailable(detail),
            ReleaseError::Store(e) => e.into(),
        }
    }
}
