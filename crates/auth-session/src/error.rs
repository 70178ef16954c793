//! Error kinds surfaced by session operations

use provider::ProviderError;

use crate::session::Operation;

/// Errors from session operations.
///
/// Adapter failures are wrapped into the kind that matches the operation that
/// failed; a raw `ProviderError` never reaches callers. The type is `Clone`
/// because one in-flight outcome is handed to every caller that joined it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("login initiation failed: {0}")]
    InitiationFailed(String),

    #[error("invalid callback: {0}")]
    CallbackInvalid(String),

    #[error("callback state was already consumed")]
    DuplicateCallback,

    #[error("code exchange failed: {0}")]
    ExchangeFailed(String),

    #[error("silent refresh unavailable: {0}")]
    RefreshUnavailable(String),

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),

    /// Non-fatal: local logout still completed.
    #[error("remote logout failed: {0}")]
    LogoutRemoteFailed(String),

    #[error("identity fetch failed: {0}")]
    IdentityFetchFailed(String),

    #[error("{0} already in progress")]
    OperationInProgress(Operation),

    #[error("operation cancelled: session disposed")]
    Cancelled,

    #[error("session is not authenticated")]
    NotAuthenticated,

    #[error("token store error: {0}")]
    Storage(String),
}

impl Error {
    /// Whether the failed operation left the caller without what it asked for.
    ///
    /// `LogoutRemoteFailed` is the only warning-level kind: the local session
    /// was cleared even though the provider was not told.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::LogoutRemoteFailed(_))
    }

    /// Stable snake_case label for metrics and JSON error bodies.
    pub fn label(&self) -> &'static str {
        match self {
            Error::InitiationFailed(_) => "initiation_failed",
            Error::CallbackInvalid(_) => "callback_invalid",
            Error::DuplicateCallback => "duplicate_callback",
            Error::ExchangeFailed(_) => "exchange_failed",
            Error::RefreshUnavailable(_) => "refresh_unavailable",
            Error::RefreshFailed(_) => "refresh_failed",
            Error::LogoutRemoteFailed(_) => "logout_remote_failed",
            Error::IdentityFetchFailed(_) => "identity_fetch_failed",
            Error::OperationInProgress(_) => "operation_in_progress",
            Error::Cancelled => "cancelled",
            Error::NotAuthenticated => "not_authenticated",
            Error::Storage(_) => "storage",
        }
    }

    pub(crate) fn from_initiate(err: ProviderError) -> Self {
        Error::InitiationFailed(err.to_string())
    }

    pub(crate) fn from_exchange(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidCallback(msg) => Error::CallbackInvalid(msg),
            other => Error::ExchangeFailed(other.to_string()),
        }
    }

    pub(crate) fn from_refresh(err: ProviderError) -> Self {
        match err {
            ProviderError::RefreshUnavailable(msg) => Error::RefreshUnavailable(msg),
            other => Error::RefreshFailed(other.to_string()),
        }
    }

    pub(crate) fn from_logout(err: ProviderError) -> Self {
        Error::LogoutRemoteFailed(err.to_string())
    }

    pub(crate) fn from_identity(err: ProviderError) -> Self {
        Error::IdentityFetchFailed(err.to_string())
    }
}

/// Result alias for session operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_mapping_keeps_invalid_callback_distinct() {
        assert_eq!(
            Error::from_exchange(ProviderError::InvalidCallback("unknown state".into())),
            Error::CallbackInvalid("unknown state".into())
        );
        assert!(matches!(
            Error::from_exchange(ProviderError::Rejected("invalid_grant".into())),
            Error::ExchangeFailed(msg) if msg.contains("invalid_grant")
        ));
    }

    #[test]
    fn refresh_mapping_distinguishes_unavailable() {
        assert_eq!(
            Error::from_refresh(ProviderError::RefreshUnavailable("no refresh token".into())),
            Error::RefreshUnavailable("no refresh token".into())
        );
        assert!(matches!(
            Error::from_refresh(ProviderError::Transport("timeout".into())),
            Error::RefreshFailed(_)
        ));
    }

    #[test]
    fn only_remote_logout_failure_is_non_fatal() {
        assert!(!Error::LogoutRemoteFailed("503".into()).is_fatal());
        assert!(Error::DuplicateCallback.is_fatal());
        assert!(Error::Cancelled.is_fatal());
    }

    #[test]
    fn in_progress_names_the_operation() {
        assert_eq!(
            Error::OperationInProgress(Operation::Login).to_string(),
            "login already in progress"
        );
        assert_eq!(
            Error::OperationInProgress(Operation::Login).label(),
            "operation_in_progress"
        );
    }
}
