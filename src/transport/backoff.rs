//! Exponential reconnect backoff with jitter.
//!
//! Delays grow by `factor` from `delay_initial` up to `delay_max`, each
//! with up to `jitter_ms` of random jitter so many clients do not reconnect
//! in lockstep. With `immediate_first` the first attempt after a reset
//! happens without delay.

use std::time::Duration;

use rand::Rng;

use crate::config::BackoffConfig;

#[derive(Debug, Clone)]
pub struct Backoff {
    delay_initial: Duration,
    delay_max: Duration,
    delay_current: Duration,
    factor: f64,
    jitter_ms: u64,
    immediate_first: bool,
    immediate_pending: bool,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let delay_initial = Duration::from_millis(config.delay_initial_ms);
        Self {
            delay_initial,
            delay_max: Duration::from_millis(config.delay_max_ms.max(config.delay_initial_ms)),
            delay_current: delay_initial,
            factor: config.factor.max(1.0),
            jitter_ms: config.jitter_ms,
            immediate_first: config.immediate_first,
            immediate_pending: config.immediate_first,
        }
    }

    /// Delay before the next attempt; advances the schedule.
    pub fn next_duration(&mut self) -> Duration {
        if self.immediate_pending {
            self.immediate_pending = false;
            return Duration::ZERO;
        }

        let jitter = if self.jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=self.jitter_ms)
        };
        let delay = self.delay_current + Duration::from_millis(jitter);

        let next = self.delay_current.as_secs_f64() * self.factor;
        self.delay_current = Duration::from_secs_f64(next.min(self.delay_max.as_secs_f64()));

        delay
    }

    /// Back to the initial schedule, e.g. after a successful connection.
    pub fn reset(&mut self) {
        self.delay_current = self.delay_initial;
        self.immediate_pending = self.immediate_first;
    }

    /// Base delay of the next attempt, without jitter.
    pub fn current_delay(&self) -> Duration {
        self.delay_current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(initial: u64, max: u64, jitter: u64, immediate: bool) -> BackoffConfig {
        BackoffConfig {
            delay_initial_ms: initial,
            delay_max_ms: max,
            factor: 2.0,
            jitter_ms: jitter,
            immediate_first: immediate,
        }
    }

    #[test]
    fn grows_exponentially_up_to_the_cap() {
        let mut backoff = Backoff::new(&config(100, 800, 0, false));
        let delays: Vec<u64> = (0..6)
            .map(|_| backoff.next_duration().as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 800, 800]);
    }

    #[test]
    fn immediate_first_then_initial() {
        let mut backoff = Backoff::new(&config(100, 800, 0, true));
        assert_eq!(backoff.next_duration(), Duration::ZERO);
        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
    }

    #[test]
    fn reset_restores_the_schedule() {
        let mut backoff = Backoff::new(&config(100, 800, 0, true));
        backoff.next_duration();
        backoff.next_duration();
        backoff.next_duration();
        assert_eq!(backoff.current_delay(), Duration::from_millis(400));

        backoff.reset();
        assert_eq!(backoff.next_duration(), Duration::ZERO);
        assert_eq!(backoff.next_duration(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..20 {
            let mut backoff = Backoff::new(&config(100, 1_000, 50, false));
            let delay = backoff.next_duration();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
