//! Accept-loop backoff schedule.

use std::time::Duration;

const INITIAL: Duration = Duration::from_millis(5);
const MAX: Duration = Duration::from_secs(1);

/// Exponential backoff for transient accept errors: 5ms doubling up to a 1s
/// cap, reset on any successful accept.
pub(crate) struct Backoff {
    next: Duration,
}

impl Backoff {
    pub(crate) fn new() -> Backoff {
        Backoff { next: INITIAL }
    }

    /// Returns the delay to sleep before retrying and advances the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = (delay * 2).min(MAX);
        delay
    }

    pub(crate) fn reset(&mut self) {
        self.next = INITIAL;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_to_the_cap_and_resets() {
        let mut backoff = Backoff::new();

        let observed: Vec<u128> = (0..10).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(observed, [5, 10, 20, 40, 80, 160, 320, 640, 1000, 1000]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(5));
    }
}
