//! Data exchanged between the session core and identity backends

use std::collections::BTreeMap;
use std::fmt;

use common::Secret;
use serde::{Deserialize, Serialize};

/// Token material issued for a session.
///
/// `expires_at` and `issued_at` are unix timestamps in milliseconds
/// (absolute, not deltas). Adapters compute them from the token endpoint's
/// `expires_in` plus the current time. Records are handed around by value;
/// the token cache is the only owner that outlives an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub access_token: Secret<String>,
    pub refresh_token: Option<Secret<String>>,
    pub id_token: Option<Secret<String>>,
    pub expires_at: u64,
    pub issued_at: u64,
}

impl TokenRecord {
    pub fn new(access_token: impl Into<String>, issued_at: u64, expires_at: u64) -> Self {
        Self {
            access_token: Secret::new(access_token.into()),
            refresh_token: None,
            id_token: None,
            expires_at,
            issued_at,
        }
    }

    #[must_use]
    pub fn with_refresh_token(mut self, refresh_token: impl Into<String>) -> Self {
        self.refresh_token = Some(Secret::new(refresh_token.into()));
        self
    }

    #[must_use]
    pub fn with_id_token(mut self, id_token: impl Into<String>) -> Self {
        self.id_token = Some(Secret::new(id_token.into()));
        self
    }
}

/// Who the session belongs to.
///
/// Immutable snapshot: a refresh replaces the whole value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub subject: String,
    #[serde(default)]
    pub claims: serde_json::Map<String, serde_json::Value>,
    /// Unix timestamp in milliseconds
    pub expires_at: u64,
}

impl Identity {
    pub fn new(subject: impl Into<String>, expires_at: u64) -> Self {
        Self {
            subject: subject.into(),
            claims: serde_json::Map::new(),
            expires_at,
        }
    }

    /// Build an identity from a claim set, taking the subject from `sub`.
    ///
    /// Returns `None` when `sub` is missing or not a string.
    pub fn from_claims(
        claims: serde_json::Map<String, serde_json::Value>,
        expires_at: u64,
    ) -> Option<Self> {
        let subject = claims.get("sub")?.as_str()?.to_string();
        Some(Self {
            subject,
            claims,
            expires_at,
        })
    }

    #[must_use]
    pub fn with_claim(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.claims.insert(name.into(), value);
        self
    }

    pub fn claim(&self, name: &str) -> Option<&serde_json::Value> {
        self.claims.get(name)
    }
}

/// Parameters for starting a login.
///
/// `extra` carries provider-specific authorization parameters (audience,
/// prompt, connection hints) that the core passes through untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct LoginParams {
    #[serde(default)]
    pub redirect_uri: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub extra: BTreeMap<String, String>,
}

impl LoginParams {
    #[must_use]
    pub fn with_redirect_uri(mut self, redirect_uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(redirect_uri.into());
        self
    }

    #[must_use]
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    #[must_use]
    pub fn with_param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra.insert(name.into(), value.into());
        self
    }
}

/// How an adapter started a login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoginStart {
    /// The environment must navigate to `url`; the flow resumes with a callback.
    Redirect { url: String },
    /// Popup or in-memory flow that already produced tokens.
    Completed(TokenRecord),
}

/// One-time data carried back by a post-redirect return trip.
///
/// Built from the location's query string. A context is a callback when it
/// carries `state` plus either `code` (success) or `error` (the provider
/// refused the login).
#[derive(Clone, PartialEq, Eq)]
pub struct CallbackContext {
    params: BTreeMap<String, String>,
}

impl CallbackContext {
    pub fn new(code: impl Into<String>, state: impl Into<String>) -> Self {
        let mut params = BTreeMap::new();
        params.insert("code".to_string(), code.into());
        params.insert("state".to_string(), state.into());
        Self { params }
    }

    /// Parse a raw query string (a leading `?` is ignored).
    pub fn from_query(query: &str) -> Self {
        let query = query.strip_prefix('?').unwrap_or(query);
        let params = url::form_urlencoded::parse(query.as_bytes())
            .into_owned()
            .collect();
        Self { params }
    }

    /// Extract a callback from a full or relative location
    /// (`https://app/callback?code=..&state=..` or `/callback?...`).
    ///
    /// Returns `None` when the location does not carry a callback.
    pub fn from_location(location: &str) -> Option<Self> {
        let without_fragment = location.split('#').next().unwrap_or(location);
        let (_, query) = without_fragment.split_once('?')?;
        let context = Self::from_query(query);
        context.is_callback().then_some(context)
    }

    pub fn code(&self) -> Option<&str> {
        self.non_empty("code")
    }

    pub fn state(&self) -> Option<&str> {
        self.non_empty("state")
    }

    /// OAuth error code returned instead of an authorization code.
    pub fn error(&self) -> Option<&str> {
        self.non_empty("error")
    }

    pub fn error_description(&self) -> Option<&str> {
        self.non_empty("error_description")
    }

    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name).map(String::as_str)
    }

    pub fn is_callback(&self) -> bool {
        self.state().is_some() && (self.code().is_some() || self.error().is_some())
    }

    fn non_empty(&self, name: &str) -> Option<&str> {
        self.param(name).filter(|v| !v.is_empty())
    }
}

impl fmt::Debug for CallbackContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (name, value) in &self.params {
            if name == "code" {
                map.entry(name, &"[REDACTED]");
            } else {
                map.entry(name, value);
            }
        }
        map.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_location_extracts_code_and_state() {
        let ctx =
            CallbackContext::from_location("https://app.example/callback?code=abc&state=xyz")
                .unwrap();
        assert_eq!(ctx.code(), Some("abc"));
        assert_eq!(ctx.state(), Some("xyz"));
        assert!(ctx.error().is_none());
    }

    #[test]
    fn from_location_accepts_relative_paths_and_drops_fragment() {
        let ctx = CallbackContext::from_location("/callback?state=s%201&code=c#section").unwrap();
        assert_eq!(ctx.state(), Some("s 1"));
        assert_eq!(ctx.code(), Some("c"));
    }

    #[test]
    fn from_location_ignores_plain_locations() {
        assert!(CallbackContext::from_location("https://app.example/").is_none());
        assert!(CallbackContext::from_location("/dashboard?tab=2").is_none());
        // code without state is not a callback
        assert!(CallbackContext::from_location("/callback?code=abc").is_none());
        assert!(CallbackContext::from_location("/callback?code=&state=xyz").is_none());
    }

    #[test]
    fn error_redirect_is_a_callback() {
        let ctx = CallbackContext::from_location(
            "/callback?error=access_denied&error_description=user+cancelled&state=xyz",
        )
        .unwrap();
        assert!(ctx.code().is_none());
        assert_eq!(ctx.error(), Some("access_denied"));
        assert_eq!(ctx.error_description(), Some("user cancelled"));
    }

    #[test]
    fn debug_redacts_code() {
        let ctx = CallbackContext::new("secret-code", "xyz");
        let debug = format!("{ctx:?}");
        assert!(!debug.contains("secret-code"), "got: {debug}");
        assert!(debug.contains("xyz"));
    }

    #[test]
    fn identity_from_claims_requires_sub() {
        let mut claims = serde_json::Map::new();
        claims.insert("email".into(), serde_json::json!("a@example.com"));
        assert!(Identity::from_claims(claims.clone(), 0).is_none());

        claims.insert("sub".into(), serde_json::json!("auth0|123"));
        let identity = Identity::from_claims(claims, 42).unwrap();
        assert_eq!(identity.subject, "auth0|123");
        assert_eq!(identity.claim("email"), Some(&serde_json::json!("a@example.com")));
        assert_eq!(identity.expires_at, 42);
    }

    #[test]
    fn token_record_debug_never_prints_tokens() {
        let record = TokenRecord::new("at_live", 0, 1)
            .with_refresh_token("rt_live")
            .with_id_token("id_live");
        let debug = format!("{record:?}");
        assert!(!debug.contains("at_live"));
        assert!(!debug.contains("rt_live"));
        assert!(!debug.contains("id_live"));
    }

    #[test]
    fn login_params_builder_collects_extras() {
        let params = LoginParams::default()
            .with_redirect_uri("https://app.example/callback")
            .with_scope("openid")
            .with_param("audience", "https://api.example");
        assert_eq!(params.redirect_uri.as_deref(), Some("https://app.example/callback"));
        assert_eq!(params.scopes, vec!["openid"]);
        assert_eq!(params.extra["audience"], "https://api.example");
    }
}
