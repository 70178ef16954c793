//! Scripted in-memory provider for deterministic tests.
//!
//! `MockProvider` never touches the network. Each operation pops the next
//! scripted result from its queue (falling back to a fixed default), counts
//! the call, and can optionally be held at a gate so tests can line up
//! concurrent callers against a single in-flight adapter call.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Notify, Semaphore};
use tracing::debug;

use crate::{
    CallbackContext, Identity, LoginParams, LoginStart, ProviderAdapter, ProviderError,
    ProviderFuture, Result, TokenRecord,
};

/// Snapshot of how many times each adapter operation ran.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MockCalls {
    pub initiate_login: usize,
    pub complete_callback: usize,
    pub refresh: usize,
    pub logout: usize,
    pub fetch_identity: usize,
}

#[derive(Default)]
struct Counters {
    initiate_login: AtomicUsize,
    complete_callback: AtomicUsize,
    refresh: AtomicUsize,
    logout: AtomicUsize,
    fetch_identity: AtomicUsize,
}

/// Holds an operation until the test releases it.
struct Gate {
    permits: Semaphore,
    entered: Notify,
}

impl Gate {
    fn new() -> Self {
        Self {
            permits: Semaphore::new(0),
            entered: Notify::new(),
        }
    }

    async fn pass(&self) {
        self.entered.notify_one();
        if let Ok(permit) = self.permits.acquire().await {
            permit.forget();
        }
    }
}

/// Deterministic `ProviderAdapter` used by the session core's tests.
pub struct MockProvider {
    id: String,
    logins: Mutex<VecDeque<Result<LoginStart>>>,
    exchanges: Mutex<VecDeque<Result<TokenRecord>>>,
    refreshes: Mutex<VecDeque<Result<TokenRecord>>>,
    logouts: Mutex<VecDeque<Result<()>>>,
    identities: Mutex<VecDeque<Result<Identity>>>,
    last_params: Mutex<Option<LoginParams>>,
    seen_contexts: Mutex<Vec<CallbackContext>>,
    logout_redirect: Option<String>,
    exchange_gate: Option<Gate>,
    refresh_gate: Option<Gate>,
    identity_gate: Option<Gate>,
    counters: Counters,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    pub fn new() -> Self {
        Self {
            id: "mock".to_string(),
            logins: Mutex::new(VecDeque::new()),
            exchanges: Mutex::new(VecDeque::new()),
            refreshes: Mutex::new(VecDeque::new()),
            logouts: Mutex::new(VecDeque::new()),
            identities: Mutex::new(VecDeque::new()),
            last_params: Mutex::new(None),
            seen_contexts: Mutex::new(Vec::new()),
            logout_redirect: None,
            exchange_gate: None,
            refresh_gate: None,
            identity_gate: None,
            counters: Counters::default(),
        }
    }

    /// Hold every `complete_callback` until `release_exchange` is called.
    #[must_use]
    pub fn with_exchange_gate(mut self) -> Self {
        self.exchange_gate = Some(Gate::new());
        self
    }

    /// Hold every `refresh` until `release_refresh` is called.
    #[must_use]
    pub fn with_refresh_gate(mut self) -> Self {
        self.refresh_gate = Some(Gate::new());
        self
    }

    /// Hold every `fetch_identity` until `release_identity` is called.
    #[must_use]
    pub fn with_identity_gate(mut self) -> Self {
        self.identity_gate = Some(Gate::new());
        self
    }

    #[must_use]
    pub fn with_logout_redirect(mut self, url: impl Into<String>) -> Self {
        self.logout_redirect = Some(url.into());
        self
    }

    pub fn push_login(&self, result: Result<LoginStart>) {
        push(&self.logins, result);
    }

    pub fn push_exchange(&self, result: Result<TokenRecord>) {
        push(&self.exchanges, result);
    }

    pub fn push_refresh(&self, result: Result<TokenRecord>) {
        push(&self.refreshes, result);
    }

    pub fn push_logout(&self, result: Result<()>) {
        push(&self.logouts, result);
    }

    pub fn push_identity(&self, result: Result<Identity>) {
        push(&self.identities, result);
    }

    /// Wait until a `complete_callback` call reaches the exchange gate.
    pub async fn exchange_entered(&self) {
        if let Some(gate) = &self.exchange_gate {
            gate.entered.notified().await;
        }
    }

    pub fn release_exchange(&self) {
        if let Some(gate) = &self.exchange_gate {
            gate.permits.add_permits(1);
        }
    }

    /// Wait until a `refresh` call reaches the refresh gate.
    pub async fn refresh_entered(&self) {
        if let Some(gate) = &self.refresh_gate {
            gate.entered.notified().await;
        }
    }

    pub fn release_refresh(&self) {
        if let Some(gate) = &self.refresh_gate {
            gate.permits.add_permits(1);
        }
    }

    /// Wait until a `fetch_identity` call reaches the identity gate.
    pub async fn identity_entered(&self) {
        if let Some(gate) = &self.identity_gate {
            gate.entered.notified().await;
        }
    }

    pub fn release_identity(&self) {
        if let Some(gate) = &self.identity_gate {
            gate.permits.add_permits(1);
        }
    }

    pub fn calls(&self) -> MockCalls {
        MockCalls {
            initiate_login: self.counters.initiate_login.load(Ordering::SeqCst),
            complete_callback: self.counters.complete_callback.load(Ordering::SeqCst),
            refresh: self.counters.refresh.load(Ordering::SeqCst),
            logout: self.counters.logout.load(Ordering::SeqCst),
            fetch_identity: self.counters.fetch_identity.load(Ordering::SeqCst),
        }
    }

    pub fn last_login_params(&self) -> Option<LoginParams> {
        lock(&self.last_params).clone()
    }

    /// Every context passed to `complete_callback`, in call order.
    pub fn seen_contexts(&self) -> Vec<CallbackContext> {
        lock(&self.seen_contexts).clone()
    }
}

impl ProviderAdapter for MockProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn initiate_login<'a>(&'a self, params: &'a LoginParams) -> ProviderFuture<'a, LoginStart> {
        Box::pin(async move {
            let n = self.counters.initiate_login.fetch_add(1, Ordering::SeqCst) + 1;
            *lock(&self.last_params) = Some(params.clone());
            debug!(call = n, "mock initiate_login");
            pop(&self.logins).unwrap_or_else(|| {
                Ok(LoginStart::Redirect {
                    url: format!("https://mock.idp/authorize?state=mock-state-{n}"),
                })
            })
        })
    }

    fn complete_callback<'a>(
        &'a self,
        context: &'a CallbackContext,
    ) -> ProviderFuture<'a, TokenRecord> {
        Box::pin(async move {
            self.counters.complete_callback.fetch_add(1, Ordering::SeqCst);
            lock(&self.seen_contexts).push(context.clone());
            if let Some(gate) = &self.exchange_gate {
                gate.pass().await;
            }
            pop(&self.exchanges).unwrap_or_else(|| {
                Err(ProviderError::Rejected("no scripted exchange".into()))
            })
        })
    }

    fn refresh<'a>(&'a self, _record: &'a TokenRecord) -> ProviderFuture<'a, TokenRecord> {
        Box::pin(async move {
            self.counters.refresh.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.refresh_gate {
                gate.pass().await;
            }
            pop(&self.refreshes).unwrap_or_else(|| {
                Err(ProviderError::RefreshUnavailable("no scripted refresh".into()))
            })
        })
    }

    fn logout<'a>(&'a self, _record: &'a TokenRecord) -> ProviderFuture<'a, ()> {
        Box::pin(async move {
            self.counters.logout.fetch_add(1, Ordering::SeqCst);
            pop(&self.logouts).unwrap_or(Ok(()))
        })
    }

    fn fetch_identity<'a>(&'a self, record: &'a TokenRecord) -> ProviderFuture<'a, Identity> {
        Box::pin(async move {
            self.counters.fetch_identity.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.identity_gate {
                gate.pass().await;
            }
            pop(&self.identities)
                .unwrap_or_else(|| Ok(Identity::new("mock-user", record.expires_at)))
        })
    }

    fn logout_redirect(&self) -> Option<String> {
        self.logout_redirect.clone()
    }
}

// A poisoned script queue only means another test thread panicked; keep going.
fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn push<T>(queue: &Mutex<VecDeque<T>>, item: T) {
    lock(queue).push_back(item);
}

fn pop<T>(queue: &Mutex<VecDeque<T>>) -> Option<T> {
    lock(queue).pop_front()
}
