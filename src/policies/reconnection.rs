use std::time::Duration;

/// Decides how long the connection waits between connect attempts.
///
/// The connection advances the policy after every failed attempt and resets it
/// once a connection becomes ready. A policy that returns `None` gives up:
/// the connection terminates instead of scheduling another attempt.
pub trait ReconnectionPolicy: Send + Sync {
    /// Advances the policy, returning the delay to wait before the next
    /// attempt, or `None` to stop retrying.
    fn next_delay(&mut self) -> Option<Duration>;

    /// The upcoming delay, without advancing the policy.
    fn delay(&self) -> Duration;

    /// Forgets accumulated failures. Called once per successful connect.
    fn reset(&mut self);
}

const MIN_RECONNECT_BACKOFF: Duration = Duration::from_millis(50);
const MAX_RECONNECT_BACKOFF: Duration = Duration::from_secs(10);
const RECONNECT_BACKOFF_MULTIPLIER: u32 = 2;

/// Exponential backoff between connect attempts, optionally capped at a
/// number of attempts.
pub struct ExponentialReconnectionPolicy {
    current_delay: Duration,
    attempts: usize,
    max_attempts: Option<usize>,
}

impl ExponentialReconnectionPolicy {
    pub fn new() -> Self {
        Self {
            current_delay: MIN_RECONNECT_BACKOFF,
            attempts: 0,
            max_attempts: None,
        }
    }

    /// Gives up once `max_attempts` consecutive attempts have failed.
    pub fn with_max_attempts(max_attempts: usize) -> Self {
        Self {
            max_attempts: Some(max_attempts),
            ..Self::new()
        }
    }
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_attempts) = self.max_attempts {
            if self.attempts >= max_attempts {
                return None;
            }
        }
        self.attempts += 1;

        let delay = self.current_delay;
        self.current_delay = std::cmp::min(
            MAX_RECONNECT_BACKOFF,
            self.current_delay * RECONNECT_BACKOFF_MULTIPLIER,
        );
        Some(delay)
    }

    fn delay(&self) -> Duration {
        self.current_delay
    }

    fn reset(&mut self) {
        self.current_delay = MIN_RECONNECT_BACKOFF;
        self.attempts = 0;
    }
}
