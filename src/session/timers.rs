//! Session Timers
//!
//! The two timers owned by the connection manager task:
//!
//! - [`HeartbeatScheduler`]: periodic keep-alive while the connection is open
//! - [`RetryTimer`]: the single pending reconnect delay
//!
//! Both are polled from the manager's `select!` loop. A stopped timer is a
//! future that never completes, so dropping the inner timer is all it takes
//! to guarantee no further ticks.

use std::future;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::{self, Instant, Interval, MissedTickBehavior, Sleep};

/// Emits a tick every `period` while running
#[derive(Debug)]
pub(crate) struct HeartbeatScheduler {
    period: Duration,
    interval: Option<Interval>,
}

impl HeartbeatScheduler {
    pub(crate) fn new(period: Duration) -> Self {
        Self {
            period: period.max(Duration::from_millis(1)),
            interval: None,
        }
    }

    /// Start ticking; the first tick is one full period from now
    pub(crate) fn start(&mut self) {
        let mut interval = time::interval_at(Instant::now() + self.period, self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.interval = Some(interval);
    }

    /// Stop ticking. No tick can be observed after this returns.
    pub(crate) fn stop(&mut self) {
        self.interval = None;
    }

    pub(crate) fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub(crate) fn period(&self) -> Duration {
        self.period
    }

    /// Wait for the next tick. Pends forever while stopped.
    pub(crate) async fn tick(&mut self) {
        match self.interval.as_mut() {
            Some(interval) => {
                interval.tick().await;
            }
            None => future::pending::<()>().await,
        }
    }
}

/// At most one pending reconnect delay
#[derive(Debug, Default)]
pub(crate) struct RetryTimer {
    sleep: Option<Pin<Box<Sleep>>>,
    attempt: u32,
}

impl RetryTimer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm the timer for retry number `attempt`, replacing any pending one
    pub(crate) fn schedule(&mut self, delay: Duration, attempt: u32) {
        self.sleep = Some(Box::pin(time::sleep(delay)));
        self.attempt = attempt;
    }

    /// Disarm the timer
    pub(crate) fn cancel(&mut self) {
        self.sleep = None;
    }

    pub(crate) fn is_pending(&self) -> bool {
        self.sleep.is_some()
    }

    /// Wait for the armed delay to elapse and return its attempt number.
    ///
    /// Cancel-safe: dropping the future leaves the timer armed. Pends forever
    /// while disarmed.
    pub(crate) async fn fired(&mut self) -> u32 {
        match self.sleep.as_mut() {
            Some(sleep) => {
                sleep.as_mut().await;
                self.sleep = None;
                self.attempt
            }
            None => future::pending::<u32>().await,
        }
    }
}
