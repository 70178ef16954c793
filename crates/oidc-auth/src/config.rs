//! OIDC client configuration
//!
//! Endpoint URLs and client registration for one issuer. Values are not
//! secrets except `client_secret`, which is never read from the config file:
//! hosts resolve it from the environment or a secret file and attach it with
//! `with_client_secret`.

use std::collections::BTreeMap;
use std::path::PathBuf;

use common::Secret;
use serde::Deserialize;
use url::Url;

/// Scopes requested when neither the config nor the login names any.
/// `offline_access` asks for a refresh token.
pub const DEFAULT_SCOPES: &str = "openid profile email offline_access";

fn default_scopes() -> String {
    DEFAULT_SCOPES.to_string()
}

/// Issuer endpoints and client registration, usually the `[oidc]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    pub userinfo_endpoint: String,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,

    pub client_id: String,
    /// Confidential clients only. Never deserialized.
    #[serde(skip)]
    pub client_secret: Option<Secret<String>>,
    /// File holding the client secret (trailing whitespace trimmed).
    #[serde(default)]
    pub client_secret_file: Option<PathBuf>,

    pub redirect_uri: String,
    /// Where the provider sends the browser after end-session.
    #[serde(default)]
    pub logout_redirect_uri: Option<String>,

    #[serde(default = "default_scopes")]
    pub scopes: String,
    #[serde(default)]
    pub audience: Option<String>,
    /// Extra authorization parameters added to every login URL.
    #[serde(default)]
    pub extra_params: BTreeMap<String, String>,
}

impl OidcConfig {
    /// Conventional endpoint layout for a hosted issuer domain:
    /// `/authorize`, `/oauth/token`, `/userinfo`, `/oauth/revoke`, `/v2/logout`.
    pub fn from_domain(
        domain: &str,
        client_id: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        let base = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{}", domain.trim_end_matches('/'))
        };
        Self {
            authorization_endpoint: format!("{base}/authorize"),
            token_endpoint: format!("{base}/oauth/token"),
            userinfo_endpoint: format!("{base}/userinfo"),
            revocation_endpoint: Some(format!("{base}/oauth/revoke")),
            end_session_endpoint: Some(format!("{base}/v2/logout")),
            client_id: client_id.into(),
            client_secret: None,
            client_secret_file: None,
            redirect_uri: redirect_uri.into(),
            logout_redirect_uri: None,
            scopes: default_scopes(),
            audience: None,
            extra_params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_client_secret(mut self, secret: impl Into<String>) -> Self {
        self.client_secret = Some(Secret::new(secret.into()));
        self
    }

    #[must_use]
    pub fn with_logout_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.logout_redirect_uri = Some(uri.into());
        self
    }

    #[must_use]
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = Some(audience.into());
        self
    }

    /// Check that every endpoint and URI is an absolute URL and the client
    /// id is present.
    pub fn validate(&self) -> common::Result<()> {
        if self.client_id.trim().is_empty() {
            return Err(common::Error::Config("oidc.client_id must not be empty".into()));
        }
        let required = [
            ("authorization_endpoint", Some(&self.authorization_endpoint)),
            ("token_endpoint", Some(&self.token_endpoint)),
            ("userinfo_endpoint", Some(&self.userinfo_endpoint)),
            ("redirect_uri", Some(&self.redirect_uri)),
            ("revocation_endpoint", self.revocation_endpoint.as_ref()),
            ("end_session_endpoint", self.end_session_endpoint.as_ref()),
            ("logout_redirect_uri", self.logout_redirect_uri.as_ref()),
        ];
        for (name, value) in required {
            if let Some(value) = value {
                Url::parse(value).map_err(|e| {
                    common::Error::Config(format!("oidc.{name} is not a valid URL ({value}): {e}"))
                })?;
            }
        }
        Ok(())
    }
}
