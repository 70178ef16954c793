//! HTTP mapping for session errors
//!
//! Session failures are returned to the caller as JSON bodies; they never
//! propagate as Rust errors past the handler.

use auth_session::Error;
use axum::http::StatusCode;

/// HTTP status for a session error kind.
pub fn status_for(err: &Error) -> StatusCode {
    match err {
        Error::CallbackInvalid(_) => StatusCode::BAD_REQUEST,
        Error::NotAuthenticated | Error::RefreshUnavailable(_) => StatusCode::UNAUTHORIZED,
        Error::DuplicateCallback | Error::OperationInProgress(_) => StatusCode::CONFLICT,
        Error::InitiationFailed(_)
        | Error::ExchangeFailed(_)
        | Error::RefreshFailed(_)
        | Error::LogoutRemoteFailed(_)
        | Error::IdentityFetchFailed(_) => StatusCode::BAD_GATEWAY,
        Error::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
        Error::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// JSON body describing a session error.
pub fn error_body(err: &Error) -> serde_json::Value {
    serde_json::json!({
        "error": {
            "kind": err.label(),
            "message": err.to_string(),
        }
    })
}
