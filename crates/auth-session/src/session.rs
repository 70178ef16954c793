//! Session snapshot types

use std::fmt;

use provider::Identity;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier of the single session a manager owns.
///
/// Token records are keyed by it. A fresh manager gets a random UUID; hosts
/// that persist tokens pass a stable id so `restore` can find them again.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for SessionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Authentication state of a session.
///
/// Exactly one holds at a time. `PendingCallback`, `Refreshing` and
/// `LoggingOut` only exist while the operation lock is held; `Authenticating`
/// persists between a redirect login and its callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Unauthenticated,
    Authenticating,
    PendingCallback,
    Authenticated,
    Refreshing,
    LoggingOut,
    Failed,
}

impl SessionState {
    /// Status label for metrics/logging.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticating => "authenticating",
            SessionState::PendingCallback => "pending_callback",
            SessionState::Authenticated => "authenticated",
            SessionState::Refreshing => "refreshing",
            SessionState::LoggingOut => "logging_out",
            SessionState::Failed => "failed",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Mutating operations, used to name what is already in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Login,
    Callback,
    Refresh,
    Restore,
    Logout,
}

impl Operation {
    pub fn label(&self) -> &'static str {
        match self {
            Operation::Login => "login",
            Operation::Callback => "callback",
            Operation::Refresh => "refresh",
            Operation::Restore => "restore",
            Operation::Logout => "logout",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Last committed view of the session.
///
/// Published after every transition; readers get a clone and never wait on
/// an in-flight operation.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub session_id: SessionId,
    pub state: SessionState,
    pub identity: Option<Identity>,
    pub last_error: Option<Error>,
}

impl Session {
    pub fn new(session_id: SessionId) -> Self {
        Self {
            session_id,
            state: SessionState::Unauthenticated,
            identity: None,
            last_error: None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.state == SessionState::Authenticated
    }
}
