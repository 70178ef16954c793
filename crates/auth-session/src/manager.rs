//! Public facade over the session state machine
//!
//! `AuthSessionManager` binds one session to one provider adapter, an
//! environment and a token store. Mutating calls delegate to the state
//! machine; the read accessors answer from the last committed snapshot and
//! never block.

use std::sync::Arc;

use provider::{CallbackContext, Identity, LoginParams, ProviderAdapter};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cache::{MemoryTokenStore, TokenCache, TokenStore};
use crate::clock::{Clock, SystemClock};
use crate::config::SessionConfig;
use crate::environment::{Environment, NoopEnvironment};
use crate::error::{Error, Result};
use crate::machine::{LoginOutcome, LogoutReport, SessionStateMachine};
use crate::refresh::spawn_refresh_task;
use crate::session::{Session, SessionId, SessionState};

/// Result of `handle_environment_callback`.
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// The environment's location carries no callback parameters.
    NoCallback,
    Completed(Session),
}

/// Builder for `AuthSessionManager`. Everything but the adapter is optional.
pub struct AuthSessionManagerBuilder {
    adapter: Arc<dyn ProviderAdapter>,
    session_id: Option<SessionId>,
    store: Option<Arc<dyn TokenStore>>,
    clock: Option<Arc<dyn Clock>>,
    environment: Option<Arc<dyn Environment>>,
    config: SessionConfig,
}

impl AuthSessionManagerBuilder {
    /// Stable id, so tokens persisted by an earlier run can be restored.
    #[must_use]
    pub fn session_id(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn token_store(mut self, store: Arc<dyn TokenStore>) -> Self {
        self.store = Some(store);
        self
    }

    #[must_use]
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    #[must_use]
    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the manager. Starts the proactive refresh task when
    /// `auto_refresh` is set and a tokio runtime is available.
    pub fn build(self) -> AuthSessionManager {
        let session_id = self.session_id.unwrap_or_default();
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryTokenStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let cache = TokenCache::new(store, clock);
        let machine = SessionStateMachine::new(
            session_id,
            self.adapter,
            cache,
            self.config.clock_skew_tolerance(),
        );

        let refresh_task = if self.config.auto_refresh {
            match tokio::runtime::Handle::try_current() {
                Ok(_) => Some(spawn_refresh_task(
                    machine.clone(),
                    self.config.refresh_interval(),
                    self.config.refresh_threshold(),
                )),
                Err(_) => {
                    warn!(
                        session_id = %machine.session_id(),
                        "auto_refresh requested outside a tokio runtime, refresh task not started"
                    );
                    None
                }
            }
        } else {
            None
        };

        AuthSessionManager {
            machine,
            environment: self
                .environment
                .unwrap_or_else(|| Arc::new(NoopEnvironment)),
            refresh_task,
        }
    }
}

/// Application-facing session API.
///
/// Dropping the manager disposes the session.
pub struct AuthSessionManager {
    machine: SessionStateMachine,
    environment: Arc<dyn Environment>,
    refresh_task: Option<JoinHandle<()>>,
}

impl AuthSessionManager {
    pub fn builder(adapter: Arc<dyn ProviderAdapter>) -> AuthSessionManagerBuilder {
        AuthSessionManagerBuilder {
            adapter,
            session_id: None,
            store: None,
            clock: None,
            environment: None,
            config: SessionConfig::default(),
        }
    }

    /// Start a login. A redirect is also requested through the environment.
    pub async fn login(&self, params: LoginParams) -> Result<LoginOutcome> {
        let outcome = self.machine.login(params).await?;
        if let LoginOutcome::Redirect { url } = &outcome {
            self.environment.navigate(url);
        }
        Ok(outcome)
    }

    /// Complete a login if the environment's location carries a callback.
    ///
    /// Safe to call unconditionally at startup: without callback parameters
    /// it returns `NoCallback` and does nothing.
    pub async fn handle_environment_callback(&self) -> Result<CallbackOutcome> {
        let Some(context) = self
            .environment
            .current_location()
            .and_then(|location| CallbackContext::from_location(&location))
        else {
            return Ok(CallbackOutcome::NoCallback);
        };
        let session = self.machine.handle_callback(context).await?;
        self.environment.clear_callback();
        Ok(CallbackOutcome::Completed(session))
    }

    pub async fn handle_callback(&self, context: CallbackContext) -> Result<Session> {
        self.machine.handle_callback(context).await
    }

    /// Parse a callback from a URL or `path?query` and complete it.
    pub async fn handle_callback_location(&self, location: &str) -> Result<Session> {
        let context = CallbackContext::from_location(location).ok_or_else(|| {
            Error::CallbackInvalid("location carries no callback parameters".into())
        })?;
        self.machine.handle_callback(context).await
    }

    /// Log out. The provider's end-session URL, if any, is requested through
    /// the environment after local cleanup.
    pub async fn logout(&self) -> Result<LogoutReport> {
        let report = self.machine.logout().await?;
        if let Some(url) = &report.redirect {
            self.environment.navigate(url);
        }
        Ok(report)
    }

    /// Access token of the authenticated session.
    ///
    /// A token within the clock skew tolerance of its expiry is refreshed
    /// first; concurrent callers share that refresh.
    pub async fn get_access_token(&self) -> Result<String> {
        if self.machine.is_disposed() {
            return Err(Error::Cancelled);
        }
        if !matches!(
            self.machine.state(),
            SessionState::Authenticated | SessionState::Refreshing
        ) {
            return Err(Error::NotAuthenticated);
        }

        let cache = self.machine.cache();
        let session_id = self.machine.session_id();
        let tolerance = self.machine.clock_skew_tolerance();
        if let Some(record) = cache.get(session_id).await
            && !cache.is_expired(&record, tolerance)
        {
            return Ok(record.access_token.expose().clone());
        }

        debug!(session_id = %session_id, "access token expired, refreshing");
        self.machine
            .refresh_when_expiring(tolerance, "access_token")
            .await?;
        cache
            .get(session_id)
            .await
            .map(|record| record.access_token.expose().clone())
            .ok_or(Error::NotAuthenticated)
    }

    /// Expiry (unix millis) of the cached token record, if any.
    pub async fn token_expires_at(&self) -> Option<u64> {
        self.machine
            .cache()
            .get(self.machine.session_id())
            .await
            .map(|record| record.expires_at)
    }

    pub async fn refresh(&self) -> Result<Session> {
        self.machine.refresh().await
    }

    /// Re-establish a session from tokens persisted under this session id.
    pub async fn restore(&self) -> Result<Session> {
        self.machine.restore().await
    }

    pub fn get_identity(&self) -> Option<Identity> {
        self.machine.session().identity
    }

    pub fn is_authenticated(&self) -> bool {
        self.machine.state() == SessionState::Authenticated
    }

    pub fn session(&self) -> Session {
        self.machine.session()
    }

    pub fn state(&self) -> SessionState {
        self.machine.state()
    }

    /// Receiver notified on every committed transition.
    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.machine.subscribe()
    }

    pub fn session_id(&self) -> &SessionId {
        self.machine.session_id()
    }

    /// Dispose the session and stop the refresh task. Idempotent.
    pub fn dispose(&self) {
        if let Some(task) = &self.refresh_task {
            task.abort();
        }
        self.machine.dispose();
    }
}

impl Drop for AuthSessionManager {
    fn drop(&mut self) {
        self.dispose();
    }
}
