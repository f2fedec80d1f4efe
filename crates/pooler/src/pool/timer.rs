//! Restart timers for the `expire` strategy.
//!
//! The pool schedules one timer per worker through [`RestartTimers`]. The
//! tokio-backed [`ExpiryTimers`] reports fired timers as [`WorkerKey`]s on a
//! channel drained by the controller's event loop.

use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::record::WorkerKey;

/// TTLs up to this many seconds only ever get extended by jitter.
const SMALL_TTL_SECS: u64 = 10;

/// Width of the jitter window on either side of the TTL, in seconds.
const JITTER_SECS: u64 = 5;

/// Delay before a worker with the given TTL is restarted.
///
/// Small TTLs (≤ 10 s) fall in `[ttl, ttl + 5]`, larger ones in
/// `[ttl - 5, ttl + 5]`, so workers started together do not all restart at
/// the same instant.
pub fn restart_delay(ttl: Duration) -> Duration {
    let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
    let jitter_ms = JITTER_SECS * 1000;

    let lower = if ttl.as_secs() <= SMALL_TTL_SECS {
        ttl_ms
    } else {
        ttl_ms.saturating_sub(jitter_ms)
    };
    let upper = ttl_ms.saturating_add(jitter_ms);

    Duration::from_millis(rand::rng().random_range(lower..=upper))
}

/// Scheduling seam between the pool and an event loop.
pub trait RestartTimers {
    type Timer;

    /// Schedule a one-shot restart of `worker` after `delay`.
    fn add_timer(&mut self, delay: Duration, worker: WorkerKey) -> Self::Timer;

    fn cancel_timer(&mut self, timer: Self::Timer);
}

/// Timers as sleeping tokio tasks; a fired timer sends its worker on `tx`.
pub struct ExpiryTimers {
    tx: mpsc::UnboundedSender<WorkerKey>,
}

impl ExpiryTimers {
    pub fn new(tx: mpsc::UnboundedSender<WorkerKey>) -> Self {
        Self { tx }
    }
}

impl RestartTimers for ExpiryTimers {
    type Timer = AbortHandle;

    fn add_timer(&mut self, delay: Duration, worker: WorkerKey) -> AbortHandle {
        let tx = self.tx.clone();
        tracing::debug!(%worker, delay_secs = delay.as_secs_f64(), "Scheduling worker restart");
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(worker);
        })
        .abort_handle()
    }

    fn cancel_timer(&mut self, timer: AbortHandle) {
        timer.abort();
    }
}
