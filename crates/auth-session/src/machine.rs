//! Session state machine
//!
//! Owns the session's state, drives the provider adapter, and keeps the token
//! cache in step with both. Every state change goes through the pure table in
//! `transition.rs` and is published as a `Session` snapshot on a watch
//! channel, so readers never wait on an operation.
//!
//! Serialization rules:
//! - One mutating operation runs at a time (`op_lock`).
//! - `login` is rejected with `OperationInProgress` when it cannot start right
//!   away; everything else queues on the lock.
//! - Callbacks with the same `state` and concurrent refreshes attach to the
//!   in-flight attempt's shared outcome instead of starting another one.
//! - Consumed callback `state` values are remembered for the machine's
//!   lifetime; replays fail with `DuplicateCallback` before reaching the
//!   adapter. A callback the session state rejects is not consumed.
//!
//! Operations run as spawned tasks. A caller dropping its future never leaves
//! the session in an intermediate state, and `dispose` can settle waiting
//! callers with `Cancelled` while an adapter call finishes in the background.

use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard};
use std::time::Duration;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use provider::{CallbackContext, Identity, LoginParams, LoginStart, ProviderAdapter, TokenRecord};
use tokio::sync::{Mutex, OwnedMutexGuard, oneshot, watch};
use tracing::{debug, error, info, warn};

use crate::cache::TokenCache;
use crate::error::{Error, Result};
use crate::metrics;
use crate::session::{Operation, Session, SessionId, SessionState};
use crate::transition::{SessionEvent, transition};

/// Result of a `login` call.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginOutcome {
    /// The environment must navigate here; the session stays
    /// `Authenticating` until the callback arrives.
    Redirect { url: String },
    /// Already authenticated, or the adapter completed login in place.
    Authenticated(Session),
}

/// Result of a `logout` call. Local state is always cleared.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogoutReport {
    /// Non-fatal failures: remote logout or token store cleanup.
    pub warnings: Vec<Error>,
    /// Provider end-session URL the environment should visit, if any.
    pub redirect: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum RefreshMode {
    Force,
    IfExpiring(Duration),
}

type SharedOutcome = Shared<BoxFuture<'static, Result<Session>>>;

struct InFlight {
    id: u64,
    key: String,
    outcome: SharedOutcome,
}

#[derive(Debug, Clone, Copy)]
enum Slot {
    Callback,
    Refresh,
}

#[derive(Default)]
struct Pending {
    callback: Option<InFlight>,
    refresh: Option<InFlight>,
}

impl Pending {
    fn slot_mut(&mut self, slot: Slot) -> &mut Option<InFlight> {
        match slot {
            Slot::Callback => &mut self.callback,
            Slot::Refresh => &mut self.refresh,
        }
    }
}

struct Inner {
    session_id: SessionId,
    adapter: Arc<dyn ProviderAdapter>,
    cache: TokenCache,
    clock_skew_tolerance: Duration,
    snapshot: watch::Sender<Session>,
    op_lock: Arc<Mutex<()>>,
    pending: StdMutex<Pending>,
    consumed: StdMutex<HashSet<String>>,
    disposed: watch::Sender<bool>,
    next_op_id: AtomicU64,
}

/// Clears an in-flight slot when its task finishes, unwinding included.
struct ClearSlot {
    inner: Arc<Inner>,
    slot: Slot,
    id: u64,
}

impl Drop for ClearSlot {
    fn drop(&mut self) {
        let mut pending = lock(&self.inner.pending);
        let entry = pending.slot_mut(self.slot);
        if entry.as_ref().is_some_and(|flight| flight.id == self.id) {
            *entry = None;
        }
    }
}

/// State machine for a single session. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SessionStateMachine {
    inner: Arc<Inner>,
}

impl SessionStateMachine {
    pub fn new(
        session_id: SessionId,
        adapter: Arc<dyn ProviderAdapter>,
        cache: TokenCache,
        clock_skew_tolerance: Duration,
    ) -> Self {
        let (snapshot, _) = watch::channel(Session::new(session_id.clone()));
        let (disposed, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                session_id,
                adapter,
                cache,
                clock_skew_tolerance,
                snapshot,
                op_lock: Arc::new(Mutex::new(())),
                pending: StdMutex::new(Pending::default()),
                consumed: StdMutex::new(HashSet::new()),
                disposed,
                next_op_id: AtomicU64::new(0),
            }),
        }
    }

    // --- Read accessors (never take the operation lock) ---

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    /// Last committed snapshot.
    pub fn session(&self) -> Session {
        self.inner.snapshot.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.inner.snapshot.borrow().state
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.snapshot.subscribe()
    }

    pub fn is_disposed(&self) -> bool {
        *self.inner.disposed.borrow()
    }

    pub fn clock_skew_tolerance(&self) -> Duration {
        self.inner.clock_skew_tolerance
    }

    pub(crate) fn cache(&self) -> &TokenCache {
        &self.inner.cache
    }

    // --- Login ---

    /// Start a login.
    ///
    /// Returns the current session without contacting the adapter when it is
    /// already authenticated. Rejected with `OperationInProgress` while a
    /// login is awaiting its callback or another operation holds the lock.
    pub async fn login(&self, params: LoginParams) -> Result<LoginOutcome> {
        self.ensure_live()?;
        let current = self.session();
        match current.state {
            SessionState::Authenticated => return Ok(LoginOutcome::Authenticated(current)),
            SessionState::Authenticating | SessionState::PendingCallback => {
                return Err(Error::OperationInProgress(Operation::Login));
            }
            _ => {}
        }
        let guard = self
            .inner
            .op_lock
            .clone()
            .try_lock_owned()
            .map_err(|_| Error::OperationInProgress(Operation::Login))?;

        let this = self.clone();
        self.run(async move { this.login_locked(guard, params).await })
            .await
    }

    async fn login_locked(
        &self,
        _guard: OwnedMutexGuard<()>,
        params: LoginParams,
    ) -> Result<LoginOutcome> {
        self.ensure_live()?;
        let current = self.session();
        match current.state {
            SessionState::Authenticated => return Ok(LoginOutcome::Authenticated(current)),
            SessionState::Unauthenticated | SessionState::Failed => {}
            _ => return Err(Error::OperationInProgress(Operation::Login)),
        }

        self.commit(SessionEvent::LoginRequested, |s| s.last_error = None)?;
        let inner = &self.inner;
        let result = inner.adapter.initiate_login(&params).await;
        self.record_call("initiate_login", result.is_ok());
        self.ensure_live()?;

        match result {
            Ok(LoginStart::Redirect { url }) => {
                debug!(
                    session_id = %inner.session_id,
                    provider = inner.adapter.id(),
                    "login redirect issued"
                );
                Ok(LoginOutcome::Redirect { url })
            }
            Ok(LoginStart::Completed(record)) => {
                let session = self.establish(record, SessionEvent::LoginCompleted).await?;
                info!(session_id = %inner.session_id, "login completed without redirect");
                Ok(LoginOutcome::Authenticated(session))
            }
            Err(e) => {
                let err = Error::from_initiate(e);
                warn!(session_id = %inner.session_id, error = %err, "login initiation failed");
                Err(self.fail(err))
            }
        }
    }

    // --- Callback ---

    /// Complete a login from a callback context.
    ///
    /// Concurrent calls with the same `state` share one exchange. A `state`
    /// that was already consumed fails with `DuplicateCallback` without
    /// reaching the adapter.
    pub async fn handle_callback(&self, context: CallbackContext) -> Result<Session> {
        self.ensure_live()?;
        let Some(key) = context.state().map(str::to_string) else {
            return Err(self.reject_callback("missing state parameter"));
        };
        if context.code().is_none() && context.error().is_none() {
            return Err(self.reject_callback("missing code parameter"));
        }

        let outcome = {
            let mut pending = lock(&self.inner.pending);
            match &pending.callback {
                Some(flight) if flight.key == key => flight.outcome.clone(),
                Some(_) => return Err(Error::OperationInProgress(Operation::Callback)),
                None => {
                    let mut consumed = lock(&self.inner.consumed);
                    if consumed.contains(&key) {
                        debug!(session_id = %self.inner.session_id, "callback state replayed");
                        return Err(Error::DuplicateCallback);
                    }
                    let state = self.state();
                    if matches!(
                        state,
                        SessionState::Authenticated
                            | SessionState::Refreshing
                            | SessionState::LoggingOut
                    ) {
                        return Err(Error::CallbackInvalid(format!("session is {state}")));
                    }
                    consumed.insert(key.clone());
                    drop(consumed);

                    let this = self.clone();
                    self.register(&mut pending, Slot::Callback, key, async move {
                        this.callback_locked(context).await
                    })
                }
            }
        };
        self.settle(outcome).await
    }

    async fn callback_locked(&self, context: CallbackContext) -> Result<Session> {
        let _guard = self.acquire().await?;
        self.ensure_live()?;
        let inner = &self.inner;

        let state = self.state();
        if transition(state, SessionEvent::CallbackReceived).is_none() {
            // Never reached the adapter, so the state stays usable
            if let Some(key) = context.state() {
                lock(&inner.consumed).remove(key);
            }
            return Err(Error::CallbackInvalid(format!("session is {state}")));
        }

        if let Some(code) = context.error() {
            let reason = match context.error_description() {
                Some(description) => format!("{code}: {description}"),
                None => code.to_string(),
            };
            warn!(session_id = %inner.session_id, error = %reason, "provider returned an error callback");
            self.commit(SessionEvent::CallbackReceived, |_| {})?;
            return Err(self.fail(Error::CallbackInvalid(reason)));
        }

        self.commit(SessionEvent::CallbackReceived, |s| s.last_error = None)?;
        let result = inner.adapter.complete_callback(&context).await;
        self.record_call("complete_callback", result.is_ok());

        if self.is_disposed() {
            if let Ok(record) = result {
                self.discard(record).await;
            }
            return Err(Error::Cancelled);
        }

        let record = match result {
            Ok(record) => record,
            Err(e) => {
                let err = Error::from_exchange(e);
                warn!(session_id = %inner.session_id, error = %err, "code exchange failed");
                return Err(self.fail(err));
            }
        };

        let session = self.establish(record, SessionEvent::CallbackSucceeded).await?;
        info!(
            session_id = %inner.session_id,
            provider = inner.adapter.id(),
            subject = session.identity.as_ref().map(|i| i.subject.as_str()).unwrap_or_default(),
            "login completed"
        );
        Ok(session)
    }

    /// Invalid context: reported, and a login awaiting its callback fails.
    fn reject_callback(&self, reason: &str) -> Error {
        let err = Error::CallbackInvalid(reason.to_string());
        warn!(session_id = %self.inner.session_id, reason, "rejected callback context");
        if self.state() == SessionState::Authenticating
            && let Ok(_guard) = self.inner.op_lock.try_lock()
        {
            let failed = err.clone();
            // Cancelled here only means dispose already won
            let _ = self.commit(SessionEvent::LoginFailed, |s| s.last_error = Some(failed));
        }
        err
    }

    /// Cache a freshly issued record and fetch its identity.
    ///
    /// A record whose identity cannot be fetched is invalidated again, so a
    /// `Failed` session never leaves usable tokens behind.
    async fn establish(&self, record: TokenRecord, event: SessionEvent) -> Result<Session> {
        let inner = &self.inner;
        if let Err(e) = inner.cache.put(&inner.session_id, record.clone()).await {
            warn!(session_id = %inner.session_id, error = %e, "failed to cache issued tokens");
            return Err(self.fail(e));
        }

        let identity = inner.adapter.fetch_identity(&record).await;
        self.record_call("fetch_identity", identity.is_ok());
        if self.is_disposed() {
            self.invalidate_quietly().await;
            return Err(Error::Cancelled);
        }

        match identity {
            Ok(identity) => self.commit(event, |s| {
                s.identity = Some(identity);
                s.last_error = None;
            }),
            Err(e) => {
                let err = Error::from_identity(e);
                warn!(session_id = %inner.session_id, error = %err, "identity fetch failed after login");
                self.invalidate_quietly().await;
                Err(self.fail(err))
            }
        }
    }

    // --- Refresh ---

    /// Refresh the session's tokens now.
    ///
    /// Concurrent refresh requests collapse into one adapter call.
    pub async fn refresh(&self) -> Result<Session> {
        self.start_refresh(RefreshMode::Force, "explicit").await
    }

    /// Refresh only if the cached token expires within `window`.
    pub async fn refresh_if_expiring(&self, window: Duration) -> Result<Session> {
        self.start_refresh(RefreshMode::IfExpiring(window), "explicit")
            .await
    }

    pub(crate) async fn refresh_when_expiring(
        &self,
        window: Duration,
        trigger: &'static str,
    ) -> Result<Session> {
        self.start_refresh(RefreshMode::IfExpiring(window), trigger)
            .await
    }

    async fn start_refresh(&self, mode: RefreshMode, trigger: &'static str) -> Result<Session> {
        self.ensure_live()?;
        let outcome = {
            let mut pending = lock(&self.inner.pending);
            match &pending.refresh {
                Some(flight) => {
                    debug!(session_id = %self.inner.session_id, trigger, "joining in-flight refresh");
                    flight.outcome.clone()
                }
                None => {
                    let this = self.clone();
                    self.register(&mut pending, Slot::Refresh, String::new(), async move {
                        this.refresh_locked(mode, trigger).await
                    })
                }
            }
        };
        self.settle(outcome).await
    }

    async fn refresh_locked(&self, mode: RefreshMode, trigger: &'static str) -> Result<Session> {
        let _guard = self.acquire().await?;
        self.ensure_live()?;
        let inner = &self.inner;

        let current = self.session();
        if current.state != SessionState::Authenticated {
            metrics::record_refresh(trigger, Error::NotAuthenticated.label());
            return Err(Error::NotAuthenticated);
        }

        let Some(record) = inner.cache.get(&inner.session_id).await else {
            // Authenticated without a record: the store lost it
            self.commit(SessionEvent::RefreshRequested, |_| {})?;
            let err = self.drop_session(Error::NotAuthenticated).await;
            metrics::record_refresh(trigger, err.label());
            return Err(err);
        };

        if let RefreshMode::IfExpiring(window) = mode
            && !inner.cache.is_expired(&record, window)
        {
            metrics::record_refresh(trigger, "skipped");
            return Ok(current);
        }

        debug!(session_id = %inner.session_id, trigger, "refreshing tokens");
        self.commit(SessionEvent::RefreshRequested, |_| {})?;
        let result = self.refresh_record(&record, current.identity).await;
        match &result {
            Ok(_) => {
                metrics::record_refresh(trigger, "ok");
                info!(session_id = %inner.session_id, trigger, "token refresh succeeded");
            }
            Err(e) => metrics::record_refresh(trigger, e.label()),
        }
        result
    }

    /// Exchange `record` for fresh tokens and re-fetch the identity.
    ///
    /// Runs in `Refreshing`. A retained `prior` identity makes a failed
    /// identity fetch non-fatal; without one (restore) it drops the session.
    async fn refresh_record(
        &self,
        record: &TokenRecord,
        prior: Option<Identity>,
    ) -> Result<Session> {
        let inner = &self.inner;
        let result = inner.adapter.refresh(record).await;
        self.record_call("refresh", result.is_ok());

        if self.is_disposed() {
            if let Ok(fresh) = result {
                self.discard(fresh).await;
            }
            return Err(Error::Cancelled);
        }

        let fresh = match result {
            Ok(fresh) => fresh,
            Err(e) => {
                let err = Error::from_refresh(e);
                warn!(session_id = %inner.session_id, error = %err, "token refresh failed");
                return Err(self.drop_session(err).await);
            }
        };

        if let Err(e) = inner.cache.put(&inner.session_id, fresh.clone()).await {
            return Err(self.drop_session(e).await);
        }

        let identity = inner.adapter.fetch_identity(&fresh).await;
        self.record_call("fetch_identity", identity.is_ok());
        if self.is_disposed() {
            self.invalidate_quietly().await;
            return Err(Error::Cancelled);
        }

        match (identity, prior) {
            (Ok(identity), _) => self.commit(SessionEvent::RefreshSucceeded, |s| {
                s.identity = Some(identity);
                s.last_error = None;
            }),
            (Err(e), Some(prior)) => {
                let err = Error::from_identity(e);
                warn!(
                    session_id = %inner.session_id,
                    error = %err,
                    "identity re-fetch failed after refresh, keeping previous identity"
                );
                self.commit(SessionEvent::RefreshSucceeded, |s| {
                    s.identity = Some(prior);
                    s.last_error = Some(err);
                })
            }
            (Err(e), None) => Err(self.drop_session(Error::from_identity(e)).await),
        }
    }

    // --- Restore ---

    /// Re-establish a session from a record persisted by an earlier run.
    ///
    /// A no-op returning the current snapshot unless the session is
    /// `Unauthenticated`. Fails with `NotAuthenticated` when nothing is
    /// cached. An expired record is refreshed first.
    pub async fn restore(&self) -> Result<Session> {
        self.ensure_live()?;
        let this = self.clone();
        self.run(async move { this.restore_locked().await }).await
    }

    async fn restore_locked(&self) -> Result<Session> {
        let _guard = self.acquire().await?;
        self.ensure_live()?;
        let inner = &self.inner;

        let current = self.session();
        if current.state != SessionState::Unauthenticated {
            return Ok(current);
        }
        let Some(record) = inner.cache.get(&inner.session_id).await else {
            return Err(Error::NotAuthenticated);
        };

        self.commit(SessionEvent::RestoreRequested, |s| s.last_error = None)?;
        let session = if inner.cache.is_expired(&record, inner.clock_skew_tolerance) {
            debug!(session_id = %inner.session_id, "persisted token expired, refreshing");
            self.refresh_record(&record, None).await?
        } else {
            let identity = inner.adapter.fetch_identity(&record).await;
            self.record_call("fetch_identity", identity.is_ok());
            self.ensure_live()?;
            match identity {
                Ok(identity) => self.commit(SessionEvent::RefreshSucceeded, |s| {
                    s.identity = Some(identity);
                })?,
                Err(e) => return Err(self.drop_session(Error::from_identity(e)).await),
            }
        };
        info!(session_id = %inner.session_id, "session restored");
        Ok(session)
    }

    // --- Logout ---

    /// Log out. Always ends `Unauthenticated` with no cached record; remote
    /// and storage failures come back as warnings in the report.
    pub async fn logout(&self) -> Result<LogoutReport> {
        self.ensure_live()?;
        let this = self.clone();
        self.run(async move { this.logout_locked().await }).await
    }

    async fn logout_locked(&self) -> Result<LogoutReport> {
        let _guard = self.acquire().await?;
        self.ensure_live()?;
        let inner = &self.inner;

        let was_authenticated = self.state() == SessionState::Authenticated;
        let record = inner.cache.get(&inner.session_id).await;
        self.commit(SessionEvent::LogoutRequested, |_| {})?;

        let mut warnings = Vec::new();
        if let Some(record) = &record {
            let result = inner.adapter.logout(record).await;
            self.record_call("logout", result.is_ok());
            if let Err(e) = result {
                let err = Error::from_logout(e);
                warn!(session_id = %inner.session_id, error = %err, "remote logout failed, clearing local session anyway");
                warnings.push(err);
            }
        }
        if let Err(err) = inner.cache.invalidate(&inner.session_id).await {
            warn!(session_id = %inner.session_id, error = %err, "failed to clear persisted tokens");
            warnings.push(err);
        }

        let redirect = if record.is_some() || was_authenticated {
            inner.adapter.logout_redirect()
        } else {
            None
        };

        let first_warning = warnings.first().cloned();
        self.commit(SessionEvent::LogoutCompleted, |s| {
            s.identity = None;
            s.last_error = first_warning;
        })?;
        info!(
            session_id = %inner.session_id,
            warnings = warnings.len(),
            "logout completed"
        );
        Ok(LogoutReport { warnings, redirect })
    }

    // --- Disposal ---

    /// Tear the session down.
    ///
    /// Waiting callers settle with `Cancelled`. Adapter calls already in
    /// flight finish in the background; tokens they return are cached and
    /// immediately invalidated. Persisted tokens from earlier operations are
    /// kept so a later instance can `restore` them.
    pub fn dispose(&self) {
        if self.inner.disposed.send_replace(true) {
            return;
        }
        lock(&self.inner.consumed).clear();
        self.inner.snapshot.send_modify(|session| {
            session.state = SessionState::Unauthenticated;
            session.identity = None;
            session.last_error = Some(Error::Cancelled);
        });
        info!(session_id = %self.inner.session_id, "session disposed");
    }

    // --- Internals ---

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Wait for the operation lock, giving up when the session is disposed.
    async fn acquire(&self) -> Result<OwnedMutexGuard<()>> {
        let op_lock = self.inner.op_lock.clone();
        let disposed = self.inner.disposed.subscribe();
        tokio::select! {
            biased;
            _ = disposed_signal(disposed) => Err(Error::Cancelled),
            guard = op_lock.lock_owned() => Ok(guard),
        }
    }

    /// Apply `event` to the snapshot and publish it.
    ///
    /// Fails with `Cancelled` once disposed, so spawned work never publishes
    /// over the disposed snapshot.
    fn commit(&self, event: SessionEvent, update: impl FnOnce(&mut Session)) -> Result<Session> {
        let mut committed = Err(Error::Cancelled);
        self.inner.snapshot.send_if_modified(|session| {
            if *self.inner.disposed.borrow() {
                return false;
            }
            let from = session.state;
            let Some(to) = transition(from, event) else {
                error!(
                    session_id = %session.session_id,
                    state = %from,
                    event = event.label(),
                    "illegal session transition ignored"
                );
                committed = Ok(session.clone());
                return false;
            };
            session.state = to;
            update(session);
            debug!(
                session_id = %session.session_id,
                from = %from,
                to = %to,
                event = event.label(),
                "session transition"
            );
            metrics::record_transition(from, to);
            committed = Ok(session.clone());
            true
        });
        committed
    }

    /// Commit `LoginFailed` with `err` as the last error. Returns the error
    /// the caller should see.
    fn fail(&self, err: Error) -> Error {
        let recorded = err.clone();
        match self.commit(SessionEvent::LoginFailed, |s| {
            s.identity = None;
            s.last_error = Some(recorded);
        }) {
            Ok(_) => err,
            Err(cancelled) => cancelled,
        }
    }

    /// Invalidate the record and commit `RefreshFailed`. Returns the error
    /// the caller should see.
    async fn drop_session(&self, err: Error) -> Error {
        self.invalidate_quietly().await;
        let recorded = err.clone();
        match self.commit(SessionEvent::RefreshFailed, |s| {
            s.identity = None;
            s.last_error = Some(recorded);
        }) {
            Ok(_) => err,
            Err(cancelled) => cancelled,
        }
    }

    /// Cache tokens that can no longer be used, then drop them.
    async fn discard(&self, record: TokenRecord) {
        let inner = &self.inner;
        debug!(session_id = %inner.session_id, "discarding tokens issued after dispose");
        if let Err(e) = inner.cache.put(&inner.session_id, record).await {
            warn!(session_id = %inner.session_id, error = %e, "failed to cache discarded tokens");
        }
        self.invalidate_quietly().await;
    }

    async fn invalidate_quietly(&self) {
        let inner = &self.inner;
        if let Err(e) = inner.cache.invalidate(&inner.session_id).await {
            warn!(session_id = %inner.session_id, error = %e, "failed to invalidate cached tokens");
        }
    }

    /// Apply an initial session state for tests that need a starting point
    /// the public API cannot reach directly.
    #[cfg(test)]
    fn force_state(&self, state: SessionState) {
        self.inner.snapshot.send_modify(|s| s.state = state);
    }

    fn record_call(&self, operation: &'static str, ok: bool) {
        let provider = self.inner.adapter.id();
        metrics::record_adapter_call(provider, operation, ok);
        debug!(
            session_id = %self.inner.session_id,
            provider,
            operation,
            ok,
            "adapter call finished"
        );
    }

    /// Spawn `work` behind a shared outcome stored in `slot`.
    ///
    /// The slot is cleared before the outcome resolves, so a caller that
    /// arrives after completion starts a new attempt.
    fn register<F>(&self, pending: &mut Pending, slot: Slot, key: String, work: F) -> SharedOutcome
    where
        F: Future<Output = Result<Session>> + Send + 'static,
    {
        let id = self.inner.next_op_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        let session_id = self.inner.session_id.clone();
        let outcome = async move {
            match rx.await {
                Ok(result) => result,
                Err(_) => {
                    error!(session_id = %session_id, "session operation task ended without a result");
                    Err(Error::Cancelled)
                }
            }
        }
        .boxed()
        .shared();

        *pending.slot_mut(slot) = Some(InFlight {
            id,
            key,
            outcome: outcome.clone(),
        });

        let clear = ClearSlot {
            inner: self.inner.clone(),
            slot,
            id,
        };
        tokio::spawn(async move {
            let result = work.await;
            drop(clear);
            let _ = tx.send(result);
        });
        outcome
    }

    /// Spawn an unshared operation and settle it.
    async fn run<T, F>(&self, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: Future<Output = Result<T>> + Send + 'static,
    {
        let handle = tokio::spawn(work);
        let session_id = self.inner.session_id.clone();
        self.settle(async move {
            match handle.await {
                Ok(result) => result,
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "session operation task failed");
                    Err(Error::Cancelled)
                }
            }
        })
        .await
    }

    /// Await an outcome, or `Cancelled` as soon as the session is disposed.
    async fn settle<T>(&self, outcome: impl Future<Output = Result<T>>) -> Result<T> {
        let disposed = self.inner.disposed.subscribe();
        tokio::select! {
            biased;
            result = outcome => result,
            _ = disposed_signal(disposed) => Err(Error::Cancelled),
        }
    }
}

/// Resolves once the dispose flag is set.
async fn disposed_signal(mut disposed: watch::Receiver<bool>) {
    let closed = disposed.wait_for(|d| *d).await.is_err();
    if closed {
        // Sender lives as long as the machine; never disposed
        std::future::pending::<()>().await;
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> StdMutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
