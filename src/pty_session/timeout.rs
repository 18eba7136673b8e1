use std::time::{Duration, Instant};

/// How long a read or pattern search may wait for more output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// One attempt, return immediately with whatever is there.
    Poll,
    /// Wait as long as it takes.
    Block,
    /// Keep polling until the duration has elapsed.
    After(Duration),
}

impl Timeout {
    /// Map the classic seconds convention: `0` polls, negative blocks, positive bounds.
    #[must_use]
    pub fn from_secs_f64(secs: f64) -> Self {
        if secs.is_nan() || secs == 0.0 {
            Timeout::Poll
        } else if secs < 0.0 {
            Timeout::Block
        } else {
            Timeout::After(Duration::from_secs_f64(secs))
        }
    }

    pub(crate) fn expired(&self, start: Instant) -> bool {
        match self {
            Timeout::Poll => true,
            Timeout::Block => false,
            Timeout::After(limit) => start.elapsed() >= *limit,
        }
    }

    /// Next wait slice no longer than `step`, or zero when nothing may block.
    pub(crate) fn slice(&self, start: Instant, step: Duration) -> Duration {
        match self {
            Timeout::Poll => Duration::ZERO,
            Timeout::Block => step,
            Timeout::After(limit) => step.min(limit.saturating_sub(start.elapsed())),
        }
    }
}

impl From<Duration> for Timeout {
    fn from(duration: Duration) -> Self {
        if duration.is_zero() {
            Timeout::Poll
        } else {
            Timeout::After(duration)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seconds_convention_maps_to_variants() {
        assert_eq!(Timeout::from_secs_f64(0.0), Timeout::Poll);
        assert_eq!(Timeout::from_secs_f64(-1.0), Timeout::Block);
        assert_eq!(
            Timeout::from_secs_f64(0.25),
            Timeout::After(Duration::from_millis(250))
        );
    }

    #[test]
    fn slices_never_exceed_remaining_budget() {
        let start = Instant::now();
        let bounded = Timeout::After(Duration::from_millis(5));
        assert!(bounded.slice(start, Duration::from_secs(1)) <= Duration::from_millis(5));
        assert_eq!(Timeout::Poll.slice(start, Duration::from_secs(1)), Duration::ZERO);
        assert_eq!(
            Timeout::Block.slice(start, Duration::from_millis(50)),
            Duration::from_millis(50)
        );
        assert!(Timeout::Poll.expired(start));
        assert!(!Timeout::Block.expired(start));
    }
}
