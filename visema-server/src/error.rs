// HTTP mapping for service errors.

use axum::extract::rejection::JsonRejection;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use tracing::error;
use visema_core::Error;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Wrapper so handlers can return `visema_core::Error` with `?`.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::UnknownSession(_) => StatusCode::NOT_FOUND,
            Error::DoubleAttach(_) => StatusCode::CONFLICT,
            Error::TransportFailure(_) => StatusCode::BAD_GATEWAY,
            Error::NotConfigured(_) => StatusCode::NOT_IMPLEMENTED,
            // recovered inside the manager, reaching a handler is a bug
            Error::AssetUnavailable(_) | Error::Internal(_) | Error::Io(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn code(&self) -> &'static str {
        match &self.0 {
            Error::Validation(_) => "validation_error",
            Error::UnknownSession(_) => "unknown_session",
            Error::DoubleAttach(_) => "already_attached",
            Error::TransportFailure(_) => "transport_failure",
            Error::NotConfigured(_) => "not_configured",
            Error::AssetUnavailable(_) | Error::Internal(_) | Error::Io(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self(Error::Validation(rejection.body_text()))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = if status == StatusCode::INTERNAL_SERVER_ERROR {
            // details go to the log, not to the client
            error!(error = %self.0, "request failed");
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };
        let body = ErrorResponse {
            error: message,
            code: self.code().to_string(),
        };
        (status, Json(body)).into_response()
    }
}
