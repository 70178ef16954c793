//! Session transition table
//!
//! Pure function: receives the current state and an event, returns the next
//! state or `None` when the pair is illegal. The machine (machine.rs) commits
//! every state change through it and performs the I/O implied by the event.

use crate::session::SessionState;

/// Events that drive session transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// `login()` accepted, adapter asked to initiate
    LoginRequested,
    /// Adapter finished login without a redirect (popup/in-memory flows)
    LoginCompleted,
    /// A callback context is being exchanged
    CallbackReceived,
    /// Exchange and identity fetch succeeded
    CallbackSucceeded,
    /// Initiation, exchange or identity fetch failed
    LoginFailed,
    /// Cached record found at startup, identity being re-established
    RestoreRequested,
    /// Token expiring, or explicit `refresh()`
    RefreshRequested,
    RefreshSucceeded,
    /// Refresh failed; the cached record is dropped
    RefreshFailed,
    LogoutRequested,
    /// Local cleanup done (remote logout outcome does not matter)
    LogoutCompleted,
}

impl SessionEvent {
    pub fn label(&self) -> &'static str {
        match self {
            SessionEvent::LoginRequested => "login_requested",
            SessionEvent::LoginCompleted => "login_completed",
            SessionEvent::CallbackReceived => "callback_received",
            SessionEvent::CallbackSucceeded => "callback_succeeded",
            SessionEvent::LoginFailed => "login_failed",
            SessionEvent::RestoreRequested => "restore_requested",
            SessionEvent::RefreshRequested => "refresh_requested",
            SessionEvent::RefreshSucceeded => "refresh_succeeded",
            SessionEvent::RefreshFailed => "refresh_failed",
            SessionEvent::LogoutRequested => "logout_requested",
            SessionEvent::LogoutCompleted => "logout_completed",
        }
    }
}

/// Next state for `event` in `state`. Pure function: no I/O.
pub fn transition(state: SessionState, event: SessionEvent) -> Option<SessionState> {
    use SessionEvent as E;
    use SessionState as S;

    let next = match (state, event) {
        // --- Login ---
        (S::Unauthenticated | S::Failed, E::LoginRequested) => S::Authenticating,
        (S::Authenticating, E::LoginCompleted) => S::Authenticated,

        // --- Callback ---
        // Accepted without a prior login on this instance: the redirect may
        // have restarted the host.
        (S::Unauthenticated | S::Authenticating | S::Failed, E::CallbackReceived) => {
            S::PendingCallback
        }
        (S::PendingCallback, E::CallbackSucceeded) => S::Authenticated,
        (S::Authenticating | S::PendingCallback, E::LoginFailed) => S::Failed,

        // --- Refresh / restore ---
        (S::Unauthenticated, E::RestoreRequested) => S::Refreshing,
        (S::Authenticated, E::RefreshRequested) => S::Refreshing,
        (S::Refreshing, E::RefreshSucceeded) => S::Authenticated,
        (S::Refreshing, E::RefreshFailed) => S::Unauthenticated,

        // --- Logout ---
        (
            S::Unauthenticated | S::Authenticating | S::Authenticated | S::Failed,
            E::LogoutRequested,
        ) => S::LoggingOut,
        (S::LoggingOut, E::LogoutCompleted) => S::Unauthenticated,

        _ => return None,
    };
    Some(next)
}
