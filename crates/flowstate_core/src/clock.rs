//! Time sources and owned timers
//!
//! Components never read the wall clock directly: a `Clock` is injected at
//! construction so tests can move time by hand. Periodic work is spawned
//! through a `TimerSet` owned by the component, which cancels everything on
//! `dispose` (or drop).

use crate::observable::lock;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// `period`, or 1 ms when it is zero. Tokio intervals panic on a zero period.
pub fn nonzero_period(period: Duration) -> Duration {
    if period.is_zero() {
        Duration::from_millis(1)
    } else {
        period
    }
}

pub trait Clock: Send + Sync + std::fmt::Debug {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Hand-driven time for tests and simulations.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn starting_now() -> Self {
        Self::new(Utc::now())
    }

    pub fn advance(&self, by: ChronoDuration) {
        let mut now = lock(&self.now);
        *now += by;
    }

    pub fn advance_minutes(&self, minutes: i64) {
        self.advance(ChronoDuration::minutes(minutes));
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *lock(&self.now) = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// Background tasks owned by one component.
#[derive(Debug, Default)]
pub struct TimerSet {
    handles: Mutex<Vec<JoinHandle<()>>>,
    disposed: Mutex<bool>,
}

impl TimerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `tick` every `period`, first firing one period from now.
    /// The closure returns false to stop its own timer.
    /// Must be called from within a tokio runtime.
    pub fn every<F>(&self, name: &'static str, period: Duration, mut tick: F)
    where
        F: FnMut() -> bool + Send + 'static,
    {
        if self.is_disposed() {
            tracing::debug!("TimerSet: ignoring timer '{}' after dispose", name);
            return;
        }
        let period = nonzero_period(period);
        let handle = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !tick() {
                    tracing::debug!("Timer '{}' stopped", name);
                    break;
                }
            }
        });
        self.track(handle);
    }

    /// Spawn a one-off task owned by this set.
    pub fn spawn<F>(&self, fut: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_disposed() {
            return;
        }
        self.track(tokio::spawn(fut));
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut handles = lock(&self.handles);
        handles.retain(|h| !h.is_finished());
        handles.push(handle);
    }

    pub fn active(&self) -> usize {
        lock(&self.handles).iter().filter(|h| !h.is_finished()).count()
    }

    pub fn is_disposed(&self) -> bool {
        *lock(&self.disposed)
    }

    /// Abort every owned task. Idempotent.
    pub fn dispose(&self) {
        *lock(&self.disposed) = true;
        for handle in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }
}

impl Drop for TimerSet {
    fn drop(&mut self) {
        for handle in lock(&self.handles).drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_manual_clock_advances() {
        let start = Utc::now();
        let clock = ManualClock::new(start);
        clock.advance_minutes(5);
        assert_eq!(clock.now() - start, ChronoDuration::minutes(5));
    }

    #[test]
    fn test_zero_period_floors_to_one_ms() {
        assert_eq!(nonzero_period(Duration::ZERO), Duration::from_millis(1));
        assert_eq!(nonzero_period(Duration::from_secs(2)), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_each_period() {
        let timers = TimerSet::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        timers.every("test", Duration::from_secs(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispose_stops_timers() {
        let timers = TimerSet::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        timers.every("test", Duration::from_secs(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
            true
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        timers.dispose();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);

        timers.every("late", Duration::from_secs(1), || true);
        assert_eq!(timers.active(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_can_stop_itself() {
        let timers = TimerSet::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        timers.every("once", Duration::from_secs(1), move || {
            c.fetch_add(1, Ordering::SeqCst);
            false
        });
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
