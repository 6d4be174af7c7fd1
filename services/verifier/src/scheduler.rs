//! Periodic capture ticks for live sources.
//!
//! Each tick runs as its own task so that a slow verification never delays
//! the cadence; the tick body itself decides whether to drop (busy) or skip
//! (paused). Shutting the scheduler down aborts any tick still in flight and
//! waits for it to unwind before returning.

use std::future::Future;
use std::time::Duration;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortest cadence the scheduler will run at.
pub const MIN_INTERVAL: Duration = Duration::from_millis(10);

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
    interval: Duration,
}

impl SchedulerHandle {
    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn is_running(&self) -> bool {
        !self.token.is_cancelled()
    }

    /// Cancel the loop and wait until no tick is running any more.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        debug!(interval_ms = self.interval.as_millis() as u64, "Scheduler stopped");
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

/// Start ticking every `interval`; the first tick fires one interval from now.
///
/// Intervals below [`MIN_INTERVAL`] are raised to it.
pub fn spawn<F, Fut>(interval: Duration, tick: F) -> SchedulerHandle
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    if interval < MIN_INTERVAL {
        warn!(
            requested_ms = interval.as_millis() as u64,
            min_ms = MIN_INTERVAL.as_millis() as u64,
            "Capture interval too short, using the minimum"
        );
    }
    let interval = interval.max(MIN_INTERVAL);

    let token = CancellationToken::new();
    let loop_token = token.clone();

    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight = JoinSet::new();

        info!(interval_ms = interval.as_millis() as u64, "Scheduler started");

        loop {
            tokio::select! {
                biased;

                _ = loop_token.cancelled() => break,

                Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}

                _ = ticker.tick() => {
                    in_flight.spawn(tick());
                }
            }
        }

        in_flight.shutdown().await;
    });

    SchedulerHandle {
        token,
        task: Some(task),
        interval,
    }
}
