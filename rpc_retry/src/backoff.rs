use std::time::Duration;

/// Truncated exponential backoff bounded by a total time budget.
///
/// The first interval is `initial_interval`, and each following interval is
/// the previous one times `multiplier`:
///
/// ```text
/// interval(n) = initial * pow(multiplier, n - 1)
/// ```
///
/// The intervals handed out are summed into [`Self::elapsed`]. Once the next
/// interval would push that sum past `max_elapsed`, [`Self::next_backoff`]
/// returns `None` (stop retrying). There's no cap on a single interval other
/// than the budget.
///
/// One `ExponentialBackoff` is meant to be used across all the attempts of a
/// single operation. It is never reset.
#[derive(Clone, Debug)]
pub struct ExponentialBackoff {
    initial_interval: Duration,
    multiplier: f64,
    max_elapsed: Duration,
    /// `None` once the interval has grown past what a `Duration` can hold.
    next_interval: Option<Duration>,
    elapsed: Duration,
}

impl ExponentialBackoff {
    /// `initial_interval` is clamped `>= 1ns`, so that a zero setting still
    /// consumes budget.
    /// `multiplier` is clamped `>= 1.0`.
    pub fn new(initial_interval: Duration, multiplier: f64, max_elapsed: Duration) -> Self {
        let initial_interval = initial_interval.max(Duration::from_nanos(1));
        Self {
            initial_interval,
            multiplier: f64::max(1.0, multiplier),
            max_elapsed,
            next_interval: Some(initial_interval),
            elapsed: Duration::ZERO,
        }
    }

    pub fn initial_interval(&self) -> Duration {
        self.initial_interval
    }

    pub fn multiplier(&self) -> f64 {
        self.multiplier
    }

    pub fn max_elapsed(&self) -> Duration {
        self.max_elapsed
    }

    /// The sum of all the intervals returned so far.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Returns how long to wait before the next attempt, or `None` if the
    /// budget is used up.
    ///
    /// Overflowing the representable range is treated like running out of
    /// budget.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let interval = self.next_interval?;
        let elapsed = self.elapsed.checked_add(interval)?;
        if elapsed > self.max_elapsed {
            return None;
        }
        self.elapsed = elapsed;
        self.next_interval = scale(interval, self.multiplier);
        Some(interval)
    }
}

// Works in whole nanoseconds so that integral multipliers stay exact.
fn scale(interval: Duration, multiplier: f64) -> Option<Duration> {
    let nanos = interval.as_nanos() as f64 * multiplier;
    if nanos.is_finite() && nanos < u64::MAX as f64 {
        Some(Duration::from_nanos(nanos.round() as u64))
    } else {
        None
    }
}
