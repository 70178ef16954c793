//! Token cache and the storage boundary behind it
//!
//! `TokenCache` is what the state machine talks to. It owns no policy: it
//! stores, returns and forgets token records keyed by session id, and answers
//! "is this record expired" against its clock. Expiry is never enforced
//! implicitly; an expired record stays readable until it is invalidated.
//!
//! Persistence is pluggable through `TokenStore`. `MemoryTokenStore` is the
//! default; `FileTokenStore` (see `store.rs`) survives restarts.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use provider::TokenRecord;
use tokio::sync::RwLock;

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::session::SessionId;

/// Boxed future returned by fallible store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Persistence contract for token records.
///
/// Implementations must tolerate concurrent `get`/`invalidate`; the state
/// machine guarantees a single writer per session.
pub trait TokenStore: Send + Sync {
    fn put<'a>(&'a self, session_id: &'a SessionId, record: TokenRecord) -> StoreFuture<'a, ()>;

    fn get<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Option<TokenRecord>> + Send + 'a>>;

    fn invalidate<'a>(&'a self, session_id: &'a SessionId) -> StoreFuture<'a, ()>;
}

/// Process-local store. Nothing survives a restart.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: RwLock<HashMap<SessionId, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TokenStore for MemoryTokenStore {
    fn put<'a>(&'a self, session_id: &'a SessionId, record: TokenRecord) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.records.write().await.insert(session_id.clone(), record);
            Ok(())
        })
    }

    fn get<'a>(
        &'a self,
        session_id: &'a SessionId,
    ) -> Pin<Box<dyn Future<Output = Option<TokenRecord>> + Send + 'a>> {
        Box::pin(async move { self.records.read().await.get(session_id).cloned() })
    }

    fn invalidate<'a>(&'a self, session_id: &'a SessionId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.records.write().await.remove(session_id);
            Ok(())
        })
    }
}

/// Token records keyed by session id, plus the expiry check.
#[derive(Clone)]
pub struct TokenCache {
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
}

impl TokenCache {
    pub fn new(store: Arc<dyn TokenStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Memory-backed cache on the wall clock.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryTokenStore::new()), Arc::new(SystemClock))
    }

    pub async fn put(&self, session_id: &SessionId, record: TokenRecord) -> Result<()> {
        self.store.put(session_id, record).await
    }

    /// A copy of the session's record, if any.
    pub async fn get(&self, session_id: &SessionId) -> Option<TokenRecord> {
        self.store.get(session_id).await
    }

    pub async fn invalidate(&self, session_id: &SessionId) -> Result<()> {
        self.store.invalidate(session_id).await
    }

    /// `now + tolerance >= expires_at`
    pub fn is_expired(&self, record: &TokenRecord, tolerance: Duration) -> bool {
        is_expired_at(record, tolerance, self.clock.now_millis())
    }

    pub fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }
}

/// Expiry check against an explicit `now` (unix milliseconds).
pub fn is_expired_at(record: &TokenRecord, tolerance: Duration, now_millis: u64) -> bool {
    let tolerance_millis = u64::try_from(tolerance.as_millis()).unwrap_or(u64::MAX);
    now_millis.saturating_add(tolerance_millis) >= record.expires_at
}
