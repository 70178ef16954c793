//! OIDC token, userinfo and revocation endpoint calls
//!
//! Handles the issuer interactions behind the provider:
//! 1. Authorization code exchange (login completion)
//! 2. Token refresh (silent refresh)
//! 3. Token revocation (remote logout)
//! 4. Userinfo (identity)
//!
//! Exchange and refresh both POST form-encoded grants to the token endpoint.

use std::collections::BTreeMap;

use provider::TokenRecord;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::OidcConfig;
use crate::error::{Error, Result};

/// Lifetime assumed when the token endpoint omits `expires_in`.
const DEFAULT_EXPIRES_IN_SECS: u64 = 3600;

fn default_expires_in() -> u64 {
    DEFAULT_EXPIRES_IN_SECS
}

/// Response from the token endpoint for both exchange and refresh.
///
/// `expires_in` is a delta in seconds from the response time. `into_record`
/// converts it to an absolute unix millisecond timestamp.
#[derive(Debug, Deserialize, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    /// Absent on refresh responses from issuers that don't rotate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    /// Seconds until the access token expires (delta, not absolute)
    #[serde(default = "default_expires_in")]
    pub expires_in: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_type: Option<String>,
}

impl TokenResponse {
    /// Convert into a `TokenRecord` issued at `now_millis`.
    pub fn into_record(self, now_millis: u64) -> TokenRecord {
        let expires_at = now_millis.saturating_add(self.expires_in.saturating_mul(1000));
        let mut record = TokenRecord::new(self.access_token, now_millis, expires_at);
        if let Some(refresh) = self.refresh_token {
            record = record.with_refresh_token(refresh);
        }
        if let Some(id_token) = self.id_token {
            record = record.with_id_token(id_token);
        }
        record
    }
}

/// Client authentication fields for token and revocation requests.
fn client_fields(config: &OidcConfig) -> BTreeMap<&'static str, String> {
    let mut form = BTreeMap::new();
    form.insert("client_id", config.client_id.clone());
    if let Some(secret) = &config.client_secret {
        form.insert("client_secret", secret.expose().clone());
    }
    form
}

/// Exchange an authorization code for tokens.
///
/// `redirect_uri` must be the one sent in the authorization request.
pub async fn exchange_code(
    client: &reqwest::Client,
    config: &OidcConfig,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse> {
    let mut form = client_fields(config);
    form.insert("grant_type", "authorization_code".into());
    form.insert("code", code.into());
    form.insert("code_verifier", verifier.into());
    form.insert("redirect_uri", redirect_uri.into());

    let response = client
        .post(&config.token_endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token exchange request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "token endpoint returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::InvalidResponse(format!("invalid token response: {e}")))
}

/// Refresh an access token using a refresh token.
///
/// 400/401/403 mean the grant is revoked, expired or unknown and come back as
/// `InvalidCredentials`; the session cannot be refreshed silently.
pub async fn refresh_token(
    client: &reqwest::Client,
    config: &OidcConfig,
    refresh: &str,
) -> Result<TokenResponse> {
    let mut form = client_fields(config);
    form.insert("grant_type", "refresh_token".into());
    form.insert("refresh_token", refresh.into());

    let response = client
        .post(&config.token_endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("token refresh request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));

        if matches!(status.as_u16(), 400 | 401 | 403) {
            return Err(Error::InvalidCredentials(format!(
                "refresh token rejected ({status}): {body}"
            )));
        }

        return Err(Error::TokenExchange(format!(
            "token refresh returned {status}: {body}"
        )));
    }

    response
        .json::<TokenResponse>()
        .await
        .map_err(|e| Error::InvalidResponse(format!("invalid refresh response: {e}")))
}

/// Revoke a refresh token (RFC 7009).
pub async fn revoke_token(
    client: &reqwest::Client,
    config: &OidcConfig,
    endpoint: &str,
    token: &str,
) -> Result<()> {
    let mut form = client_fields(config);
    form.insert("token", token.into());
    form.insert("token_type_hint", "refresh_token".into());

    let response = client
        .post(endpoint)
        .form(&form)
        .send()
        .await
        .map_err(|e| Error::Http(format!("revocation request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| String::from("<no body>"));
        return Err(Error::TokenExchange(format!(
            "revocation endpoint returned {status}: {body}"
        )));
    }
    debug!("refresh token revoked");
    Ok(())
}

/// Fetch the userinfo claims for an access token.
pub async fn fetch_userinfo(
    client: &reqwest::Client,
    config: &OidcConfig,
    access_token: &str,
) -> Result<serde_json::Map<String, serde_json::Value>> {
    let response = client
        .get(&config.userinfo_endpoint)
        .bearer_auth(access_token)
        .send()
        .await
        .map_err(|e| Error::Http(format!("userinfo request failed: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::UserInfo(format!("userinfo endpoint returned {status}")));
    }

    response
        .json::<serde_json::Map<String, serde_json::Value>>()
        .await
        .map_err(|e| Error::InvalidResponse(format!("invalid userinfo response: {e}")))
}
