use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use log::debug;

/// A fixed poll interval and an explicit cap on the number of waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub attempts: u32,
}

impl PollPolicy {
    pub const fn new(interval_ms: u64, attempts: u32) -> Self {
        Self {
            interval: Duration::from_millis(interval_ms),
            attempts,
        }
    }

    /// Longest time a wait under this policy can block.
    pub fn budget(&self) -> Duration {
        self.interval * self.attempts
    }
}

/// Polls `ready` until it returns true or the policy's attempt cap is spent.
///
/// The predicate is checked once before the first delay, then after every
/// delay, so it runs at most `attempts + 1` times. Returns the last result.
pub fn wait_until<D, F>(label: &str, delay: &mut D, policy: PollPolicy, mut ready: F) -> bool
where
    D: DelayMs<u32>,
    F: FnMut() -> bool,
{
    if ready() {
        return true;
    }

    let interval_ms = policy.interval.as_millis() as u32;
    for attempt in 1..=policy.attempts {
        delay.delay_ms(interval_ms);
        if ready() {
            debug!("{label}: ready after {attempt} waits");
            return true;
        }
        debug!("{label}: not ready ({attempt}/{})", policy.attempts);
    }

    false
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sim::RecordingDelay;

    #[test]
    fn ready_at_once_never_delays() {
        let mut delay = RecordingDelay::default();
        assert!(wait_until("t", &mut delay, PollPolicy::new(100, 5), || true));
        assert_eq!(delay.calls(), 0);
    }

    #[test]
    fn stops_as_soon_as_ready() {
        let mut delay = RecordingDelay::default();
        let mut polls = 0;
        let ok = wait_until("t", &mut delay, PollPolicy::new(100, 10), || {
            polls += 1;
            polls == 4
        });
        assert!(ok);
        assert_eq!(delay.calls(), 3);
        assert_eq!(delay.elapsed_ms(), 300);
    }

    #[test]
    fn gives_up_after_cap() {
        let mut delay = RecordingDelay::default();
        let policy = PollPolicy::new(2000, 20);
        assert!(!wait_until("t", &mut delay, policy, || false));
        assert_eq!(delay.calls(), 20);
        assert_eq!(delay.elapsed_ms() as u128, policy.budget().as_millis());
    }
}
