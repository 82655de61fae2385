use std::time::Duration;

use tokio::time::{self, Interval, MissedTickBehavior};

/// Allows one event per `period` with a burst of one.
///
/// The first [`Limiter::wait`] returns immediately. Later calls return no
/// sooner than `period` after the previous one returned; a caller that was
/// idle for longer than `period` is let through at once.
#[derive(Debug)]
pub struct Limiter {
    interval: Interval,
}

impl Limiter {
    /// Panics if `period` is zero.
    pub fn new(period: Duration) -> Self {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Self { interval }
    }

    pub async fn wait(&mut self) {
        self.interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use tokio::time::Instant;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn first_wait_is_immediate_then_spaced() {
        let start = Instant::now();
        let mut limiter = Limiter::new(Duration::from_millis(50));

        limiter.wait().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.wait().await;
        assert_eq!(start.elapsed(), Duration::from_millis(50));

        limiter.wait().await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_caller_is_not_delayed() {
        let mut limiter = Limiter::new(Duration::from_millis(50));
        limiter.wait().await;

        time::sleep(Duration::from_secs(1)).await;
        let resumed = Instant::now();
        limiter.wait().await;
        assert_eq!(resumed.elapsed(), Duration::ZERO);

        // No burst of catch-up ticks after the idle period.
        limiter.wait().await;
        assert_eq!(resumed.elapsed(), Duration::from_millis(50));
    }
}
