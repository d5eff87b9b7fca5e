//! Poll interval policy for collectors.
//!
//! A collector polls at the base interval while the upstream keeps producing
//! rows. Each empty or failed poll multiplies the interval up to a ceiling;
//! the first productive poll resets it.

use std::time::Duration;

/// Multiplicative poll backoff.
///
/// Growth never decreases the interval and never exceeds the ceiling. There is
/// no jitter so consecutive intervals are monotonic.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use hiri_core::Backoff;
///
/// let mut backoff = Backoff::new(Duration::from_secs(30), 2.0, Duration::from_secs(300));
/// assert_eq!(backoff.grow(), Duration::from_secs(60));
/// assert_eq!(backoff.grow(), Duration::from_secs(120));
/// backoff.reset();
/// assert_eq!(backoff.current(), Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    ceiling: Duration,
    current: Duration,
}

impl Backoff {
    /// Create a backoff starting at `base`.
    ///
    /// A multiplier below 1.0 is treated as 1.0 and a ceiling below the base
    /// is raised to the base.
    pub fn new(base: Duration, multiplier: f64, ceiling: Duration) -> Self {
        let multiplier = if multiplier.is_finite() && multiplier >= 1.0 {
            multiplier
        } else {
            1.0
        };
        let ceiling = ceiling.max(base);
        Self {
            base,
            multiplier,
            ceiling,
            current: base,
        }
    }

    /// The interval to wait before the next poll.
    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn base(&self) -> Duration {
        self.base
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// Record an empty or failed poll and return the grown interval.
    pub fn grow(&mut self) -> Duration {
        let next = self.current.as_secs_f64() * self.multiplier;
        let capped = next.min(self.ceiling.as_secs_f64());
        self.current = Duration::from_secs_f64(capped)
            .min(self.ceiling)
            .max(self.current);
        self.current
    }

    /// Record a productive poll.
    pub fn reset(&mut self) {
        self.current = self.base;
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), 2.0, Duration::from_secs(300))
    }
}
