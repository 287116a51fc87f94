//! Anti-bot challenge throttle with hysteresis.
//!
//! Trips once when enough challenges land inside the trailing window and
//! restores once after the window has stayed empty for the quiet period.
//! Nothing changes between those two edges.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThrottleConfig {
    pub window: Duration,
    pub trip_count: usize,
    pub quiet_period: Duration,
    pub shrink_by: usize,
    pub min_workers: usize,
    pub delay_factor: f64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(5 * 60),
            trip_count: 3,
            quiet_period: Duration::from_secs(10 * 60),
            shrink_by: 2,
            min_workers: 2,
            delay_factor: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleTransition {
    Reduced {
        workers: usize,
        delay: Duration,
    },
    Restored {
        workers: usize,
        delay: Duration,
    },
}

#[derive(Debug, Clone)]
pub struct CaptchaThrottle {
    config: ThrottleConfig,
    base_workers: usize,
    base_delay: Duration,
    active_workers: usize,
    delay: Duration,
    reduced: bool,
    events: VecDeque<Instant>,
    last_event: Option<Instant>,
}

impl CaptchaThrottle {
    pub fn new(config: ThrottleConfig, workers: usize, delay: Duration) -> Self {
        Self {
            config,
            base_workers: workers,
            base_delay: delay,
            active_workers: workers,
            delay,
            reduced: false,
            events: VecDeque::new(),
            last_event: None,
        }
    }

    pub fn active_workers(&self) -> usize {
        self.active_workers
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn is_reduced(&self) -> bool {
        self.reduced
    }

    pub fn window_len(&self) -> usize {
        self.events.len()
    }

    fn prune(&mut self, now: Instant) {
        while let Some(front) = self.events.front() {
            if now.saturating_duration_since(*front) >= self.config.window {
                self.events.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records one anti-bot challenge observed at `now`.
    pub fn record(&mut self, now: Instant) -> Option<ThrottleTransition> {
        self.prune(now);
        self.events.push_back(now);
        self.last_event = Some(now);
        if self.reduced || self.events.len() < self.config.trip_count {
            return None;
        }
        self.reduced = true;
        self.active_workers = self
            .active_workers
            .saturating_sub(self.config.shrink_by)
            .max(self.config.min_workers)
            .min(self.active_workers);
        self.delay = self.delay.mul_f64(self.config.delay_factor);
        Some(ThrottleTransition::Reduced {
            workers: self.active_workers,
            delay: self.delay,
        })
    }

    /// Advances time without an event; may restore the original settings.
    pub fn tick(&mut self, now: Instant) -> Option<ThrottleTransition> {
        self.prune(now);
        if !self.reduced || !self.events.is_empty() {
            return None;
        }
        let last = self.last_event?;
        // The window emptied when the last event aged out of it.
        let empty_since = last + self.config.window;
        if now.saturating_duration_since(empty_since) < self.config.quiet_period {
            return None;
        }
        self.reduced = false;
        self.active_workers = self.base_workers;
        self.delay = self.base_delay;
        Some(ThrottleTransition::Restored {
            workers: self.active_workers,
            delay: self.delay,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    fn throttle() -> CaptchaThrottle {
        CaptchaThrottle::new(ThrottleConfig::default(), 6, Duration::from_millis(2000))
    }

    #[test]
    fn three_events_in_window_trip_exactly_once() {
        let t0 = Instant::now();
        let mut t = throttle();
        assert_eq!(t.record(t0), None);
        assert_eq!(t.record(t0 + MIN), None);
        assert_eq!(
            t.record(t0 + 2 * MIN),
            Some(ThrottleTransition::Reduced {
                workers: 4,
                delay: Duration::from_millis(3000),
            })
        );
        // Further events while reduced never shrink again.
        for i in 3..8 {
            assert_eq!(t.record(t0 + i * MIN / 2), None);
        }
        assert_eq!(t.active_workers(), 4);
        assert_eq!(t.delay(), Duration::from_millis(3000));
    }

    #[test]
    fn spread_out_events_do_not_trip() {
        let t0 = Instant::now();
        let mut t = throttle();
        assert_eq!(t.record(t0), None);
        assert_eq!(t.record(t0 + 3 * MIN), None);
        assert_eq!(t.record(t0 + 6 * MIN), None);
        assert_eq!(t.window_len(), 2);
        assert!(!t.is_reduced());
    }

    #[test]
    fn ten_quiet_minutes_restore_exactly_once() {
        let t0 = Instant::now();
        let mut t = throttle();
        for i in 0..3 {
            t.record(t0 + i * MIN);
        }
        assert!(t.is_reduced());
        // Last event at t0+2m leaves the window at t0+7m; quiet until t0+17m.
        assert_eq!(t.tick(t0 + 10 * MIN), None);
        assert_eq!(t.tick(t0 + 16 * MIN), None);
        assert_eq!(
            t.tick(t0 + 17 * MIN),
            Some(ThrottleTransition::Restored {
                workers: 6,
                delay: Duration::from_millis(2000),
            })
        );
        assert_eq!(t.tick(t0 + 30 * MIN), None);
        assert!(!t.is_reduced());
    }

    #[test]
    fn an_event_during_the_quiet_period_delays_restoration() {
        let t0 = Instant::now();
        let mut t = throttle();
        for i in 0..3 {
            t.record(t0 + i * MIN);
        }
        assert_eq!(t.record(t0 + 12 * MIN), None);
        assert_eq!(t.tick(t0 + 17 * MIN), None);
        assert_eq!(t.tick(t0 + 26 * MIN), None);
        assert!(matches!(
            t.tick(t0 + 27 * MIN),
            Some(ThrottleTransition::Restored { .. })
        ));
    }

    #[test]
    fn shrink_never_goes_below_two_or_above_current() {
        let t0 = Instant::now();
        let mut small = CaptchaThrottle::new(ThrottleConfig::default(), 3, Duration::from_secs(1));
        for i in 0..3 {
            small.record(t0 + i * MIN);
        }
        assert_eq!(small.active_workers(), 2);

        let mut single = CaptchaThrottle::new(ThrottleConfig::default(), 1, Duration::from_secs(1));
        for i in 0..3 {
            single.record(t0 + i * MIN);
        }
        assert_eq!(single.active_workers(), 1);
    }
}
