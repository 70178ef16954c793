//! Host environment boundary
//!
//! The session core never navigates or touches history itself. It asks the
//! environment for the current location, requests navigation, and asks for
//! the callback parameters to be cleared once a callback is consumed.

use std::sync::Mutex;

pub trait Environment: Send + Sync {
    /// Current location (absolute URL or path with query), if the host has one.
    fn current_location(&self) -> Option<String>;

    /// Ask the host to navigate to `url`.
    fn navigate(&self, url: &str);

    /// Ask the host to drop callback parameters from its current location.
    fn clear_callback(&self);
}

/// Environment for hosts that handle navigation themselves (e.g. an HTTP
/// server that turns the returned URL into a 302).
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEnvironment;

impl Environment for NoopEnvironment {
    fn current_location(&self) -> Option<String> {
        None
    }

    fn navigate(&self, _url: &str) {}

    fn clear_callback(&self) {}
}

/// In-process environment that records navigation requests.
#[derive(Debug, Default)]
pub struct MemoryEnvironment {
    location: Mutex<Option<String>>,
    navigations: Mutex<Vec<String>>,
}

impl MemoryEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the location, e.g. to simulate returning from the identity provider.
    pub fn set_location(&self, location: impl Into<String>) {
        *lock(&self.location) = Some(location.into());
    }

    pub fn location(&self) -> Option<String> {
        lock(&self.location).clone()
    }

    /// Every URL passed to `navigate`, in order.
    pub fn navigations(&self) -> Vec<String> {
        lock(&self.navigations).clone()
    }
}

impl Environment for MemoryEnvironment {
    fn current_location(&self) -> Option<String> {
        self.location()
    }

    fn navigate(&self, url: &str) {
        lock(&self.navigations).push(url.to_string());
        *lock(&self.location) = Some(url.to_string());
    }

    fn clear_callback(&self) {
        let mut location = lock(&self.location);
        if let Some(current) = location.as_mut()
            && let Some(idx) = current.find('?')
        {
            current.truncate(idx);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
