use std::time::Duration;

use tokio::time::{Instant, sleep_until};

/// Quiet period after which a stream counts as stalled.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(15);

/// Deadline re-armed on every received frame.
///
/// The watchdog owns no task; the controller awaits [`StallWatchdog::expired`]
/// next to its inbox, so disarming is just clearing the deadline.
#[derive(Debug, Clone)]
pub struct StallWatchdog {
    bound: Duration,
    deadline: Option<Instant>,
}

impl Default for StallWatchdog {
    fn default() -> Self {
        Self::new(DEFAULT_STALL_TIMEOUT)
    }
}

impl StallWatchdog {
    pub fn new(bound: Duration) -> Self {
        Self {
            bound,
            deadline: None,
        }
    }

    pub fn bound(&self) -> Duration {
        self.bound
    }

    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn arm(&mut self) {
        self.deadline = Some(Instant::now() + self.bound);
    }

    pub fn disarm(&mut self) {
        self.deadline = None;
    }

    /// Resolves once the armed deadline passes; pends forever while disarmed.
    pub async fn expired(&self) {
        match self.deadline {
            Some(deadline) => sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fires_after_the_quiet_period() {
        let mut watchdog = StallWatchdog::new(Duration::from_secs(15));
        watchdog.arm();

        let started = Instant::now();
        watchdog.expired().await;
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn rearming_pushes_the_deadline_out() {
        let mut watchdog = StallWatchdog::new(Duration::from_secs(15));
        watchdog.arm();
        let first = watchdog.deadline().expect("armed");

        tokio::time::advance(Duration::from_secs(10)).await;
        watchdog.arm();

        let second = watchdog.deadline().expect("armed");
        assert_eq!(second - first, Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn disarmed_watchdog_never_fires() {
        let mut watchdog = StallWatchdog::new(Duration::from_secs(1));
        watchdog.arm();
        watchdog.disarm();

        let fired = tokio::time::timeout(Duration::from_secs(60), watchdog.expired()).await;
        assert!(fired.is_err());
        assert!(!watchdog.is_armed());
    }
}
