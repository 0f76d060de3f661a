use crate::prelude::*;

use {
    std::time::Duration,
    tokio::time::{interval, Interval, MissedTickBehavior},
};

/// Per-plugin poll timer. `tick` never completes while stopped, so it can
/// sit in a `select!` arm unconditionally.
#[derive(Debug)]
pub struct PollScheduler {
    period: Duration,
    interval: Option<Interval>,
}

impl PollScheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            interval: None,
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    /// Starts ticking, first tick immediately. Does nothing when running.
    pub fn start(&mut self) {
        if self.interval.is_some() {
            return;
        }
        debug!("poll scheduler started, every {:?}", self.period);
        self.interval = Some(Self::build(self.period));
    }

    pub fn stop(&mut self) {
        if self.interval.take().is_some() {
            debug!("poll scheduler stopped");
        }
    }

    /// Takes effect from the next tick.
    pub fn set_period(&mut self, period: Duration) {
        if period == self.period {
            return;
        }
        self.period = period;
        if let Some(interval) = self.interval.as_mut() {
            *interval = Self::build(period);
            interval.reset();
        }
    }

    pub async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => std::future::pending().await,
        }
    }

    fn build(period: Duration) -> Interval {
        let mut interval = interval(period);
        // a slow device delays the next poll instead of causing a burst
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn ticks_only_while_running() {
        let mut scheduler = PollScheduler::new(Duration::from_secs(5));
        assert!(!scheduler.is_running());

        let stopped = tokio::time::timeout(Duration::from_secs(60), scheduler.tick()).await;
        assert!(stopped.is_err());

        scheduler.start();
        scheduler.tick().await;
        let start = tokio::time::Instant::now();
        scheduler.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(5));

        scheduler.stop();
        assert!(!scheduler.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn new_period_applies_to_next_tick() {
        let mut scheduler = PollScheduler::new(Duration::from_secs(5));
        scheduler.start();
        scheduler.tick().await;

        scheduler.set_period(Duration::from_secs(2));
        let start = tokio::time::Instant::now();
        scheduler.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(2));
        assert_eq!(scheduler.period(), Duration::from_secs(2));
    }
}
