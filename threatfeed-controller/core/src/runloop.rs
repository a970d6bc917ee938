//! Periodic execution with on-demand reschedule.
//!
//! A [`RunLoop`] yields once immediately and then once per period. A
//! [`Rescheduler`] handle can pull the next execution in to a fixed delay,
//! after which the regular period resumes. Reschedules that arrive while the
//! caller is busy are coalesced into a single pending execution.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
};
use tokio::{
    sync::Notify,
    time::{self, Duration, Instant},
};
use tokio_util::sync::CancellationToken;

/// Returned when a loop stops because its token was cancelled.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("run loop cancelled")]
pub struct Cancelled;

#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RescheduleError {
    #[error("run loop has not started")]
    NotStarted,

    #[error("run loop has stopped")]
    Stopped,
}

#[derive(Debug)]
pub struct RunLoop {
    period: Duration,
    reschedule_delay: Duration,
    next: Option<Instant>,
    shared: Arc<Shared>,
}

/// Requests an out-of-band execution of a running [`RunLoop`].
#[derive(Clone, Debug)]
pub struct Rescheduler {
    shared: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    state: AtomicU8,
    notify: Notify,
}

const NOT_STARTED: u8 = 0;
const RUNNING: u8 = 1;
const STOPPED: u8 = 2;

/// Builds a loop ticking every `period` and a handle that moves the next tick
/// to `reschedule_delay` from now.
pub fn with_reschedule(period: Duration, reschedule_delay: Duration) -> (RunLoop, Rescheduler) {
    let shared = Arc::new(Shared {
        state: AtomicU8::new(NOT_STARTED),
        notify: Notify::new(),
    });
    let rl = RunLoop {
        period,
        reschedule_delay,
        next: None,
        shared: shared.clone(),
    };
    (rl, Rescheduler { shared })
}

/// Calls `f` immediately and then once per `period` until `token` is
/// cancelled.
pub async fn run<F, Fut>(token: CancellationToken, period: Duration, mut f: F) -> Cancelled
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let (mut rl, _) = with_reschedule(period, period);
    while rl.tick(&token).await.is_ok() {
        f().await;
    }
    Cancelled
}

// === impl RunLoop ===

impl RunLoop {
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Waits for the next execution. The first call returns immediately and
    /// marks the loop as running.
    pub async fn tick(&mut self, token: &CancellationToken) -> Result<(), Cancelled> {
        if token.is_cancelled() {
            return Err(Cancelled);
        }

        let next = match self.next {
            Some(next) => next,
            None => {
                self.shared.state.store(RUNNING, Ordering::Release);
                self.next = Some(Instant::now() + self.period);
                return Ok(());
            }
        };

        // A pending reschedule takes precedence over an elapsed tick so that
        // both are served by one execution.
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Cancelled),
            _ = self.shared.notify.notified() => {
                if !self.reschedule_delay.is_zero() {
                    tokio::select! {
                        _ = token.cancelled() => return Err(Cancelled),
                        _ = time::sleep(self.reschedule_delay) => {}
                    }
                }
                self.next = Some(Instant::now() + self.period);
            }
            _ = time::sleep_until(next) => {
                self.next = Some(Instant::now() + self.period);
            }
        }
        Ok(())
    }
}

impl Drop for RunLoop {
    fn drop(&mut self) {
        self.shared.state.store(STOPPED, Ordering::Release);
    }
}

// === impl Rescheduler ===

impl Rescheduler {
    /// Schedules an execution after the reschedule delay, suspending the
    /// regular period until it has run.
    pub fn reschedule(&self) -> Result<(), RescheduleError> {
        match self.shared.state.load(Ordering::Acquire) {
            NOT_STARTED => Err(RescheduleError::NotStarted),
            RUNNING => {
                self.shared.notify.notify_one();
                Ok(())
            }
            _ => Err(RescheduleError::Stopped),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    const PERIOD: Duration = Duration::from_secs(60);
    const DELAY: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn ticks_immediately_then_periodically() {
        let token = CancellationToken::new();
        let (mut rl, _) = with_reschedule(PERIOD, DELAY);

        let start = Instant::now();
        rl.tick(&token).await.unwrap();
        assert_eq!(start.elapsed(), Duration::ZERO);

        rl.tick(&token).await.unwrap();
        assert_eq!(start.elapsed(), PERIOD);

        rl.tick(&token).await.unwrap();
        assert_eq!(start.elapsed(), 2 * PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_requires_running_loop() {
        let token = CancellationToken::new();
        let (mut rl, rs) = with_reschedule(PERIOD, DELAY);
        assert_eq!(rs.reschedule(), Err(RescheduleError::NotStarted));

        rl.tick(&token).await.unwrap();
        assert_eq!(rs.reschedule(), Ok(()));

        drop(rl);
        assert_eq!(rs.reschedule(), Err(RescheduleError::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn reschedule_runs_after_delay_then_resumes_period() {
        let token = CancellationToken::new();
        let (mut rl, rs) = with_reschedule(PERIOD, DELAY);
        rl.tick(&token).await.unwrap();

        let start = Instant::now();
        rs.reschedule().unwrap();
        rl.tick(&token).await.unwrap();
        assert_eq!(start.elapsed(), DELAY);

        rl.tick(&token).await.unwrap();
        assert_eq!(start.elapsed(), DELAY + PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn coalesces_pending_reschedules() {
        let token = CancellationToken::new();
        let (mut rl, rs) = with_reschedule(PERIOD, DELAY);
        rl.tick(&token).await.unwrap();

        // Arrive "while f runs" and after the period has also elapsed.
        rs.reschedule().unwrap();
        rs.reschedule().unwrap();
        rs.reschedule().unwrap();
        time::advance(PERIOD + Duration::from_secs(1)).await;

        let start = Instant::now();
        rl.tick(&token).await.unwrap();
        assert_eq!(start.elapsed(), DELAY);

        // No further queued executions: the next one is a full period away.
        rl.tick(&token).await.unwrap();
        assert_eq!(start.elapsed(), DELAY + PERIOD);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_the_loop() {
        let token = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let task = tokio::spawn({
            let token = token.clone();
            let calls = calls.clone();
            run(token, PERIOD, move || {
                calls.fetch_add(1, Ordering::SeqCst);
                async {}
            })
        });

        time::sleep(PERIOD * 2 + Duration::from_secs(1)).await;
        token.cancel();
        let res = time::timeout(Duration::from_secs(1), task)
            .await
            .expect("loop must stop")
            .expect("loop must not panic");
        assert_eq!(res, Cancelled);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
