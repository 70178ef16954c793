//! Error types for OIDC operations

use provider::ProviderError;

/// Errors from OIDC endpoint calls.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("HTTP request failed: {0}")]
    Http(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    /// The refresh grant was refused (revoked, expired or unknown token).
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("userinfo request failed: {0}")]
    UserInfo(String),

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

/// Result alias for OIDC operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for ProviderError {
    fn from(err: Error) -> Self {
        match err {
            Error::Http(msg) => ProviderError::Transport(msg),
            Error::InvalidCredentials(msg) => ProviderError::RefreshUnavailable(msg),
            Error::TokenExchange(msg) | Error::UserInfo(msg) | Error::InvalidResponse(msg) => {
                ProviderError::Rejected(msg)
            }
            Error::Config(msg) => ProviderError::Internal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refused_refresh_maps_to_refresh_unavailable() {
        let err: ProviderError = Error::InvalidCredentials("invalid_grant".into()).into();
        assert_eq!(err, ProviderError::RefreshUnavailable("invalid_grant".into()));
    }

    #[test]
    fn transport_and_endpoint_failures_stay_distinct() {
        assert!(matches!(
            ProviderError::from(Error::Http("connection refused".into())),
            ProviderError::Transport(_)
        ));
        assert!(matches!(
            ProviderError::from(Error::TokenExchange("400".into())),
            ProviderError::Rejected(_)
        ));
        assert!(matches!(
            ProviderError::from(Error::Config("bad url".into())),
            ProviderError::Internal(_)
        ));
    }
}
