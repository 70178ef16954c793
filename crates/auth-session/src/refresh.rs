//! Proactive background token refresh
//!
//! Spawns a periodic task that refreshes the session's token before it
//! expires. This keeps most `get_access_token` calls off the refresh path.
//! The task goes through the state machine like any other caller, so it
//! shares in-flight refreshes and failure handling with request-time refresh.

use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Error;
use crate::machine::SessionStateMachine;
use crate::session::SessionState;

/// Spawn a background task that proactively refreshes an expiring token.
///
/// Runs every `interval` and refreshes when the cached token expires within
/// `threshold`. A failed refresh leaves the session `Unauthenticated` (the
/// normal refresh transition); the task keeps running and does nothing until
/// the session is authenticated again. Stops once the machine is disposed.
///
/// Returns a `JoinHandle` for the spawned task.
pub fn spawn_refresh_task(
    machine: SessionStateMachine,
    interval: Duration,
    threshold: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // Skip the immediate first tick; the session was just built
        ticker.tick().await;

        loop {
            ticker.tick().await;
            if machine.is_disposed() {
                debug!(session_id = %machine.session_id(), "session disposed, stopping refresh task");
                break;
            }
            refresh_cycle(&machine, threshold).await;
        }
    })
}

/// Run one refresh cycle.
async fn refresh_cycle(machine: &SessionStateMachine, threshold: Duration) {
    if machine.state() != SessionState::Authenticated {
        return;
    }
    match machine.refresh_when_expiring(threshold, "background").await {
        Ok(_) => {}
        Err(Error::Cancelled) => {}
        Err(e) => {
            warn!(session_id = %machine.session_id(), error = %e, "background refresh failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use provider::{CallbackContext, MockProvider, TokenRecord};

    use crate::cache::{MemoryTokenStore, TokenCache};
    use crate::clock::ManualClock;
    use crate::session::SessionId;

    const HOUR: u64 = 3_600_000;

    async fn authenticated_machine(
        expires_at: u64,
    ) -> (SessionStateMachine, Arc<MockProvider>, Arc<ManualClock>) {
        let mock = Arc::new(MockProvider::new());
        let clock = Arc::new(ManualClock::new(0));
        let cache = TokenCache::new(Arc::new(MemoryTokenStore::new()), clock.clone());
        let machine = SessionStateMachine::new(
            SessionId::from("s-1"),
            mock.clone(),
            cache,
            Duration::from_secs(60),
        );
        mock.push_exchange(Ok(
            TokenRecord::new("T1", 0, expires_at).with_refresh_token("R1")
        ));
        machine
            .handle_callback(CallbackContext::new("abc", "xyz"))
            .await
            .unwrap();
        (machine, mock, clock)
    }

    #[tokio::test]
    async fn refresh_cycle_skips_valid_tokens() {
        let (machine, mock, _) = authenticated_machine(10 * HOUR).await;

        refresh_cycle(&machine, Duration::from_secs(900)).await;

        assert_eq!(mock.calls().refresh, 0);
        assert_eq!(machine.state(), SessionState::Authenticated);
    }

    #[tokio::test]
    async fn refresh_cycle_refreshes_expiring_token() {
        let (machine, mock, clock) = authenticated_machine(HOUR).await;
        mock.push_refresh(Ok(TokenRecord::new("T2", 0, 2 * HOUR)));

        // 10 minutes left, inside the 15 minute threshold
        clock.set(HOUR - 600_000);
        refresh_cycle(&machine, Duration::from_secs(900)).await;

        assert_eq!(mock.calls().refresh, 1);
        let record = machine.cache().get(machine.session_id()).await.unwrap();
        assert_eq!(record.access_token.expose(), "T2");
    }

    #[tokio::test]
    async fn refresh_cycle_ignores_unauthenticated_session() {
        let mock = Arc::new(MockProvider::new());
        let machine = SessionStateMachine::new(
            SessionId::from("s-1"),
            mock.clone(),
            TokenCache::in_memory(),
            Duration::from_secs(60),
        );

        refresh_cycle(&machine, Duration::from_secs(900)).await;
        assert_eq!(mock.calls().refresh, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn task_refreshes_on_tick_and_stops_after_dispose() {
        let (machine, mock, clock) = authenticated_machine(HOUR).await;
        mock.push_refresh(Ok(TokenRecord::new("T2", 0, 2 * HOUR)));
        clock.set(HOUR - 60_000);

        let handle = spawn_refresh_task(
            machine.clone(),
            Duration::from_secs(30),
            Duration::from_secs(300),
        );

        // first tick is skipped, second one refreshes
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(mock.calls().refresh, 1);

        machine.dispose();
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(handle.is_finished());
    }
}
