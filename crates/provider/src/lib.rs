//! Provider abstraction for identity backends
//!
//! Defines the `ProviderAdapter` trait that decouples the session state
//! machine from any one identity service. Every backend (the OIDC adapter in
//! `oidc-auth`, the scripted `MockProvider` used by tests, future SAML
//! bridges) implements the same five capabilities: initiate login, complete
//! a callback, refresh silently, log out remotely, and fetch the identity.
//!
//! Adapters report their own `ProviderError`; the session core wraps those
//! into its error kinds so backend details never leak to applications.

pub mod mock;
pub mod types;

pub use mock::{MockCalls, MockProvider};
pub use types::{CallbackContext, Identity, LoginParams, LoginStart, TokenRecord};

use std::future::Future;
use std::pin::Pin;

/// Errors reported by an identity backend.
///
/// The variants are coarse on purpose: they carry just enough for the session
/// core to pick the right error kind (e.g. `RefreshUnavailable` versus a
/// generic refresh failure).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProviderError {
    /// The callback context is malformed, expired, or was never issued by
    /// this adapter.
    #[error("invalid callback: {0}")]
    InvalidCallback(String),

    /// The identity service answered and refused the request.
    #[error("rejected by identity provider: {0}")]
    Rejected(String),

    /// Silent refresh is impossible (refresh token absent, expired or revoked).
    #[error("silent refresh unavailable: {0}")]
    RefreshUnavailable(String),

    /// The identity service could not be reached.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("internal provider error: {0}")]
    Internal(String),
}

/// Result alias for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

/// Boxed future returned by every adapter operation.
pub type ProviderFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Capability contract every identity backend implements.
///
/// The session state machine is the only caller. It guarantees that at most
/// one mutating call is in flight per session and that a callback context
/// whose `state` was already consumed never reaches `complete_callback`, so
/// adapters do not need their own locking for correctness. Adapters that can
/// detect replays cheaply (e.g. by removing a PKCE verifier on first use)
/// should still reject them.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn ProviderAdapter>`).
pub trait ProviderAdapter: Send + Sync {
    /// Identifier for logging and metrics (e.g. "oidc", "mock")
    fn id(&self) -> &str;

    /// Start a login.
    ///
    /// Redirect flows return `LoginStart::Redirect` with the URL the
    /// environment must navigate to; control comes back later through a
    /// callback context. Popup or in-memory flows may finish immediately and
    /// return `LoginStart::Completed` with the issued tokens.
    fn initiate_login<'a>(&'a self, params: &'a LoginParams) -> ProviderFuture<'a, LoginStart>;

    /// Exchange a callback context for tokens.
    ///
    /// Called at most once per distinct context `state`.
    fn complete_callback<'a>(&'a self, context: &'a CallbackContext)
    -> ProviderFuture<'a, TokenRecord>;

    /// Obtain fresh tokens without user interaction.
    ///
    /// Must fail with `ProviderError::RefreshUnavailable` when the backend
    /// cannot refresh silently.
    fn refresh<'a>(&'a self, record: &'a TokenRecord) -> ProviderFuture<'a, TokenRecord>;

    /// Best-effort remote invalidation of the session's tokens.
    ///
    /// The caller clears local state regardless of the outcome.
    fn logout<'a>(&'a self, record: &'a TokenRecord) -> ProviderFuture<'a, ()>;

    /// Resolve the identity the tokens belong to.
    fn fetch_identity<'a>(&'a self, record: &'a TokenRecord) -> ProviderFuture<'a, Identity>;

    /// URL the environment should visit after local logout to end the
    /// provider's own browser session, if the backend has one.
    fn logout_redirect(&self) -> Option<String> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_error_display_names_the_failure() {
        assert_eq!(
            ProviderError::RefreshUnavailable("no refresh token".into()).to_string(),
            "silent refresh unavailable: no refresh token"
        );
        assert!(
            ProviderError::Transport("connection refused".into())
                .to_string()
                .contains("connection refused")
        );
    }

    #[test]
    fn adapter_is_dyn_compatible() {
        let adapter: std::sync::Arc<dyn ProviderAdapter> = std::sync::Arc::new(MockProvider::new());
        assert_eq!(adapter.id(), "mock");
        assert!(adapter.logout_redirect().is_none());
    }
}
