//! PKCE (Proof Key for Code Exchange) implementation per RFC 7636
//!
//! Generates the code verifier and S256 challenge used during the
//! authorization code flow, plus the opaque `state` value that ties a
//! callback to the login that started it. The verifier stays in memory and
//! is sent during token exchange; the challenge goes into the authorization
//! URL so the issuer can verify the exchange came from the same party.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use provider::LoginParams;
use rand::RngExt;
use sha2::{Digest, Sha256};
use url::Url;

use crate::config::OidcConfig;
use crate::error::{Error, Result};

/// Generate a cryptographically random PKCE code verifier.
///
/// 64 random bytes encoded as URL-safe base64 without padding: 86
/// characters, inside RFC 7636's 43-128 range.
pub fn generate_verifier() -> String {
    let mut bytes = [0u8; 64];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Compute the S256 code challenge from a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`
pub fn compute_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generate the opaque `state` value for CSRF protection (32 random bytes).
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Build the authorization URL for one login.
///
/// Login params override the configured redirect URI and scopes; their
/// `extra` entries are added after (and win over) the configured
/// `extra_params`.
pub fn build_authorization_url(
    config: &OidcConfig,
    params: &LoginParams,
    state: &str,
    challenge: &str,
) -> Result<String> {
    let mut url = Url::parse(&config.authorization_endpoint).map_err(|e| {
        Error::Config(format!(
            "invalid authorization endpoint {}: {e}",
            config.authorization_endpoint
        ))
    })?;

    let redirect_uri = params
        .redirect_uri
        .as_deref()
        .unwrap_or(&config.redirect_uri);
    let scopes = if params.scopes.is_empty() {
        config.scopes.clone()
    } else {
        params.scopes.join(" ")
    };

    let mut extra = config.extra_params.clone();
    extra.extend(params.extra.clone());

    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("client_id", &config.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &scopes)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("state", state);
        if let Some(audience) = &config.audience
            && !extra.contains_key("audience")
        {
            query.append_pair("audience", audience);
        }
        for (name, value) in &extra {
            query.append_pair(name, value);
        }
    }

    Ok(url.into())
}
