//! OIDC authorization-code + PKCE adapter
//!
//! Implements `ProviderAdapter` against a standard OIDC issuer. Each login
//! gets its own verifier and `state`; the pair lives in memory until the
//! callback consumes it or it expires after `PKCE_EXPIRY_SECS`. A `state`
//! can only be redeemed once, so replayed callbacks are rejected here even
//! if they slip past the session core.

use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use provider::{
    CallbackContext, Identity, LoginParams, LoginStart, ProviderAdapter, ProviderError,
    ProviderFuture, TokenRecord,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::OidcConfig;
use crate::{pkce, token};

/// Maximum age of a pending login before its verifier is discarded.
const PKCE_EXPIRY_SECS: u64 = 600; // 10 minutes

/// Verifier and redirect URI for one login awaiting its callback.
struct PendingLogin {
    verifier: String,
    redirect_uri: String,
    created_at: Instant,
}

/// OIDC adapter backed by a shared `reqwest::Client`.
pub struct OidcProvider {
    config: OidcConfig,
    http_client: reqwest::Client,
    pending: Mutex<HashMap<String, PendingLogin>>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl OidcProvider {
    pub fn new(config: OidcConfig, http_client: reqwest::Client) -> Self {
        Self {
            config,
            http_client,
            pending: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &OidcConfig {
        &self.config
    }

    /// Number of logins awaiting a callback (expired entries included until
    /// the next login prunes them).
    pub async fn pending_logins(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn start_login(&self, params: &LoginParams) -> Result<LoginStart, ProviderError> {
        let verifier = pkce::generate_verifier();
        let challenge = pkce::compute_challenge(&verifier);
        let state = pkce::generate_state();
        let url = pkce::build_authorization_url(&self.config, params, &state, &challenge)?;
        let redirect_uri = params
            .redirect_uri
            .clone()
            .unwrap_or_else(|| self.config.redirect_uri.clone());

        let mut pending = self.pending.lock().await;
        // Lazy cleanup: remove expired entries while holding the lock
        pending.retain(|_, p| p.created_at.elapsed().as_secs() < PKCE_EXPIRY_SECS);
        pending.insert(
            state,
            PendingLogin {
                verifier,
                redirect_uri,
                created_at: Instant::now(),
            },
        );
        info!(pending = pending.len(), "OIDC login initiated");

        Ok(LoginStart::Redirect { url })
    }

    async fn finish_login(&self, context: &CallbackContext) -> Result<TokenRecord, ProviderError> {
        let state = context
            .state()
            .ok_or_else(|| ProviderError::InvalidCallback("callback has no state".into()))?;

        // Consume the pending login first so an error callback also burns it
        let pending = self.pending.lock().await.remove(state);
        let pending = pending.ok_or_else(|| {
            ProviderError::InvalidCallback(
                "no pending login for this state (expired, replayed or never issued)".into(),
            )
        })?;

        if pending.created_at.elapsed() > Duration::from_secs(PKCE_EXPIRY_SECS) {
            return Err(ProviderError::InvalidCallback(
                "login expired (>10 minutes), start a new one".into(),
            ));
        }

        if let Some(error) = context.error() {
            let description = context.error_description().unwrap_or("no description");
            warn!(error, description, "identity provider returned an error callback");
            return Err(ProviderError::InvalidCallback(format!(
                "{error}: {description}"
            )));
        }

        let code = context
            .code()
            .ok_or_else(|| ProviderError::InvalidCallback("callback has no code".into()))?;

        let response = token::exchange_code(
            &self.http_client,
            &self.config,
            code,
            &pending.verifier,
            &pending.redirect_uri,
        )
        .await?;

        debug!(expires_in = response.expires_in, "authorization code exchanged");
        Ok(response.into_record(now_millis()))
    }

    async fn refresh_record(&self, record: &TokenRecord) -> Result<TokenRecord, ProviderError> {
        let refresh = record.refresh_token.as_ref().ok_or_else(|| {
            ProviderError::RefreshUnavailable("token record has no refresh token".into())
        })?;

        let response =
            token::refresh_token(&self.http_client, &self.config, refresh.expose()).await?;
        let mut refreshed = response.into_record(now_millis());

        // Issuers without rotation omit the refresh token; keep the old one
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = record.refresh_token.clone();
        }
        if refreshed.id_token.is_none() {
            refreshed.id_token = record.id_token.clone();
        }
        Ok(refreshed)
    }

    async fn revoke(&self, record: &TokenRecord) -> Result<(), ProviderError> {
        let (Some(endpoint), Some(refresh)) =
            (&self.config.revocation_endpoint, &record.refresh_token)
        else {
            debug!("no revocation endpoint or refresh token, skipping remote logout");
            return Ok(());
        };
        token::revoke_token(&self.http_client, &self.config, endpoint, refresh.expose()).await?;
        Ok(())
    }

    async fn identity(&self, record: &TokenRecord) -> Result<Identity, ProviderError> {
        let claims =
            token::fetch_userinfo(&self.http_client, &self.config, record.access_token.expose())
                .await?;
        Identity::from_claims(claims, record.expires_at)
            .ok_or_else(|| ProviderError::Rejected("userinfo response has no sub claim".into()))
    }
}

impl ProviderAdapter for OidcProvider {
    fn id(&self) -> &str {
        "oidc"
    }

    fn initiate_login<'a>(&'a self, params: &'a LoginParams) -> ProviderFuture<'a, LoginStart> {
        Box::pin(self.start_login(params))
    }

    fn complete_callback<'a>(
        &'a self,
        context: &'a CallbackContext,
    ) -> ProviderFuture<'a, TokenRecord> {
        Box::pin(self.finish_login(context))
    }

    fn refresh<'a>(&'a self, record: &'a TokenRecord) -> ProviderFuture<'a, TokenRecord> {
        Box::pin(self.refresh_record(record))
    }

    fn logout<'a>(&'a self, record: &'a TokenRecord) -> ProviderFuture<'a, ()> {
        Box::pin(self.revoke(record))
    }

    fn fetch_identity<'a>(&'a self, record: &'a TokenRecord) -> ProviderFuture<'a, Identity> {
        Box::pin(self.identity(record))
    }

    fn logout_redirect(&self) -> Option<String> {
        let endpoint = self.config.end_session_endpoint.as_deref()?;
        let mut url = match Url::parse(endpoint) {
            Ok(url) => url,
            Err(e) => {
                warn!(endpoint, error = %e, "invalid end_session_endpoint");
                return None;
            }
        };
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("client_id", &self.config.client_id);
            if let Some(return_to) = &self.config.logout_redirect_uri {
                query
                    .append_pair("returnTo", return_to)
                    .append_pair("post_logout_redirect_uri", return_to);
            }
        }
        Some(url.into())
    }
}
