//! Provider-agnostic authentication session core
//!
//! Manages one user's authentication lifecycle on top of a swappable
//! `ProviderAdapter`: login (redirect or in-place), callback completion,
//! silent refresh, restore from persisted tokens, and logout. Correctness
//! under concurrency is the point: callbacks are exchanged at most once,
//! refreshes collapse, and every error lands the session in a well-defined
//! state.
//!
//! Session lifecycle:
//! 1. `login()` → adapter issues a redirect, state `Authenticating`
//! 2. Environment returns with a callback → `PendingCallback`, code exchanged
//! 3. Tokens cached, identity fetched → `Authenticated`
//! 4. Token expiring → `Refreshing` → `Authenticated` (or `Unauthenticated` on failure)
//! 5. `logout()` → `LoggingOut` → `Unauthenticated`, cached tokens dropped
//! 6. `dispose()` → pending operations settle `Cancelled`

pub mod cache;
pub mod clock;
pub mod config;
pub mod environment;
pub mod error;
pub mod machine;
pub mod manager;
pub mod metrics;
pub mod refresh;
pub mod session;
pub mod store;
pub mod transition;

pub use cache::{MemoryTokenStore, TokenCache, TokenStore, is_expired_at};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::SessionConfig;
pub use environment::{Environment, MemoryEnvironment, NoopEnvironment};
pub use error::{Error, Result};
pub use machine::{LoginOutcome, LogoutReport, SessionStateMachine};
pub use manager::{AuthSessionManager, AuthSessionManagerBuilder, CallbackOutcome};
pub use refresh::spawn_refresh_task;
pub use session::{Operation, Session, SessionId, SessionState};
pub use store::FileTokenStore;
pub use transition::{SessionEvent, transition};
