// In-memory rate limiter for login attempts.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Login attempts allowed per account within [`LOGIN_WINDOW`].
pub const LOGIN_MAX_ATTEMPTS: usize = 10;
pub const LOGIN_WINDOW: Duration = Duration::from_secs(15 * 60);

/// Error returned when a rate limit is exceeded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitError {
    pub max: usize,
    pub window: Duration,
}

impl std::fmt::Display for RateLimitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Too many attempts: max {} per {} minutes",
            self.max,
            self.window.as_secs() / 60
        )
    }
}

/// Thread-safe sliding-window limiter keyed by an arbitrary string (here: account name).
#[derive(Debug, Clone)]
pub struct RateLimiter {
    max: usize,
    window: Duration,
    inner: Arc<Mutex<HashMap<String, Vec<Instant>>>>,
}

impl RateLimiter {
    pub fn new(max: usize, window: Duration) -> Self {
        Self {
            max,
            window,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Limiter with the login defaults.
    pub fn for_logins() -> Self {
        Self::new(LOGIN_MAX_ATTEMPTS, LOGIN_WINDOW)
    }

    /// Check if `key` is within the limit.
    /// If within limits, records the event and returns Ok(()).
    /// If exceeded, returns Err(RateLimitError).
    pub fn check_limit(&self, key: &str) -> Result<(), RateLimitError> {
        let mut map = self.lock();
        let now = Instant::now();
        let window = self.window;

        let entries = map.entry(key.to_string()).or_default();

        // Remove expired entries
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= self.max {
            return Err(RateLimitError {
                max: self.max,
                window,
            });
        }

        entries.push(now);
        Ok(())
    }

    /// Forget every recorded event for `key` (e.g. after a successful login).
    pub fn reset(&self, key: &str) {
        self.lock().remove(key);
    }

    /// Get the current count for a key (for testing/diagnostics).
    pub fn current_count(&self, key: &str) -> usize {
        let mut map = self.lock();
        let now = Instant::now();
        let window = self.window;

        if let Some(entries) = map.get_mut(key) {
            entries.retain(|t| now.duration_since(*t) < window);
            entries.len()
        } else {
            0
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<Instant>>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::for_logins()
    }
}
