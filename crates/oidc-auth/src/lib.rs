//! OIDC authorization-code adapter for the session core
//!
//! Provides PKCE and state generation, the token/userinfo/revocation endpoint
//! calls, and `OidcProvider`, the `ProviderAdapter` that ties them together.
//! The crate has no dependency on the session core or the gateway binary.
//!
//! Login flow:
//! 1. `OidcProvider::initiate_login` generates a verifier, challenge and state
//!    and returns the authorization URL built by `pkce::build_authorization_url()`
//! 2. The issuer redirects back with `code` and `state`
//! 3. `OidcProvider::complete_callback` redeems the state and calls
//!    `token::exchange_code()`
//! 4. `token::refresh_token()` renews access tokens silently
//! 5. `token::revoke_token()` and the end-session URL handle logout

pub mod adapter;
pub mod config;
pub mod error;
pub mod pkce;
pub mod token;

#[cfg(test)]
mod test_idp;

pub use adapter::OidcProvider;
pub use config::{DEFAULT_SCOPES, OidcConfig};
pub use error::{Error, Result};
pub use pkce::{build_authorization_url, compute_challenge, generate_state, generate_verifier};
pub use token::{TokenResponse, exchange_code, fetch_userinfo, refresh_token, revoke_token};
