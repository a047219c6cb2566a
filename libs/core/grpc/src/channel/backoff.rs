use std::time::Duration;

/// Initial reconnect delay after the first failure
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);

/// Growth factor applied per consecutive failure
pub const DEFAULT_MULTIPLIER: f64 = 1.6;

/// Randomization factor, +/- 20%
pub const DEFAULT_JITTER: f64 = 0.2;

/// Reconnect backoff curve used by every subchannel of a connection
///
/// The curve is fixed policy (exponential growth from one second by a factor
/// of 1.6 with 20% jitter); only the ceiling comes from
/// [`ConnectionOptions::max_backoff`](super::ConnectionOptions).
///
/// # Example
/// ```ignore
/// let backoff = BackoffPolicy::with_max_delay(Duration::from_secs(10));
/// assert_eq!(backoff.delay(0), Duration::from_secs(1));
/// assert_eq!(backoff.delay(20), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
  pub base_delay: Duration,
  pub multiplier: f64,
  pub jitter: f64,
  pub max_delay: Duration,
}

impl BackoffPolicy {
  /// Standard curve capped at `max_delay`
  pub fn with_max_delay(max_delay: Duration) -> Self {
    Self {
      base_delay: DEFAULT_BASE_DELAY,
      multiplier: DEFAULT_MULTIPLIER,
      jitter: DEFAULT_JITTER,
      max_delay,
    }
  }

  /// Un-jittered delay before the next attempt after `retries` consecutive failures
  pub fn delay(&self, retries: u32) -> Duration {
    let max = self.max_delay.as_secs_f64();
    let mut backoff = self.base_delay.as_secs_f64();
    let mut remaining = retries;

    while backoff < max && remaining > 0 {
      backoff *= self.multiplier;
      remaining -= 1;
    }

    self.clamp(backoff)
  }

  /// Delay with jitter applied, never above `max_delay`
  pub fn jittered_delay(&self, retries: u32) -> Duration {
    let delay = self.delay(retries).as_secs_f64();
    let spread = self.jitter * (rand::random::<f64>() * 2.0 - 1.0);
    let jittered = (delay * (1.0 + spread)).max(0.0);

    self.clamp(jittered)
  }

  /// Seconds to a delay no longer than `max_delay`, even past `Duration`'s range
  fn clamp(&self, seconds: f64) -> Duration {
    Duration::try_from_secs_f64(seconds)
      .map_or(self.max_delay, |delay| delay.min(self.max_delay))
  }
}
