//! Deferred callbacks with cancellable handles
//!
//! The engine never sleeps inside an evaluation; exit confirmation is a
//! task handed to a `Scheduler`. `TokioScheduler` runs it on the runtime
//! timer, `ManualScheduler` keeps it until a test advances the clock and
//! calls `run_due()`.

use crate::infra::clock::{Clock, ManualClock};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::debug;

pub type TimerTask = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

pub trait Scheduler: Send + Sync {
    /// Run `task` once `delay` has elapsed, unless the handle is cancelled first
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle;
}

/// Cancellation handle for a scheduled task
///
/// `cancel` is idempotent and a no-op once the task has already run.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    cancelled: Arc<AtomicBool>,
    abort: Option<AbortHandle>,
}

impl TimerHandle {
    fn new(cancelled: Arc<AtomicBool>, abort: Option<AbortHandle>) -> Self {
        Self { cancelled, abort }
    }

    /// Handle that is not bound to any task
    pub fn detached() -> Self {
        Self::new(Arc::new(AtomicBool::new(true)), None)
    }

    pub fn cancel(&self) {
        if !self.cancelled.swap(true, Ordering::AcqRel) {
            if let Some(abort) = &self.abort {
                abort.abort();
            }
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// Runtime-backed scheduler (one sleeping task per timer)
#[derive(Debug, Clone, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let cancelled = Arc::new(AtomicBool::new(false));
        let flag = cancelled.clone();
        let join = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if flag.load(Ordering::Acquire) {
                return;
            }
            task.await;
        });
        TimerHandle::new(cancelled, Some(join.abort_handle()))
    }
}

struct ManualTimer {
    due: DateTime<Utc>,
    seq: u64,
    cancelled: Arc<AtomicBool>,
    task: TimerTask,
}

/// Deterministic scheduler driven by a `ManualClock`
#[derive(Clone)]
pub struct ManualScheduler {
    clock: ManualClock,
    timers: Arc<Mutex<Vec<ManualTimer>>>,
    next_seq: Arc<Mutex<u64>>,
}

impl ManualScheduler {
    pub fn new(clock: ManualClock) -> Self {
        Self { clock, timers: Arc::new(Mutex::new(Vec::new())), next_seq: Arc::new(Mutex::new(0)) }
    }

    /// Timers neither fired nor cancelled
    pub fn pending(&self) -> usize {
        self.timers.lock().iter().filter(|t| !t.cancelled.load(Ordering::Acquire)).count()
    }

    /// Run every live timer whose due time has passed, earliest first
    ///
    /// Returns the number of tasks executed.
    pub async fn run_due(&self) -> usize {
        let now = self.clock.now();
        let mut due: Vec<ManualTimer> = {
            let mut timers = self.timers.lock();
            let (ready, waiting): (Vec<_>, Vec<_>) =
                std::mem::take(&mut *timers).into_iter().partition(|t| t.due <= now);
            *timers = waiting;
            ready
        };
        due.sort_by_key(|t| (t.due, t.seq));

        let mut ran = 0;
        for timer in due {
            // Mark as consumed before running; a cancel after this is a no-op
            if timer.cancelled.swap(true, Ordering::AcqRel) {
                continue;
            }
            timer.task.await;
            ran += 1;
        }
        debug!(ran = %ran, "manual_scheduler_run_due");
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn after(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365));
        let cancelled = Arc::new(AtomicBool::new(false));
        let seq = {
            let mut next = self.next_seq.lock();
            *next += 1;
            *next
        };
        self.timers.lock().push(ManualTimer {
            due: self.clock.now() + delay,
            seq,
            cancelled: cancelled.clone(),
            task,
        });
        TimerHandle::new(cancelled, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting_task(counter: &Arc<AtomicUsize>) -> TimerTask {
        let counter = counter.clone();
        Box::pin(async move {
            counter.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test]
    async fn test_manual_scheduler_fires_only_when_due() {
        let clock = ManualClock::at_epoch();
        let scheduler = ManualScheduler::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.after(Duration::from_secs(30), counting_task(&fired));
        assert_eq!(scheduler.pending(), 1);

        clock.advance_secs(29);
        assert_eq!(scheduler.run_due().await, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        clock.advance_secs(1);
        assert_eq!(scheduler.run_due().await, 1);
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        // Already consumed
        assert_eq!(scheduler.run_due().await, 0);
        assert_eq!(scheduler.pending(), 0);
    }

    #[tokio::test]
    async fn test_manual_cancel_is_idempotent() {
        let clock = ManualClock::at_epoch();
        let scheduler = ManualScheduler::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.after(Duration::from_secs(30), counting_task(&fired));
        handle.cancel();
        handle.cancel();
        assert!(handle.is_cancelled());

        clock.advance_secs(60);
        assert_eq!(scheduler.run_due().await, 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancel_after_fire_is_noop() {
        let clock = ManualClock::at_epoch();
        let scheduler = ManualScheduler::new(clock.clone());
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.after(Duration::from_secs(1), counting_task(&fired));
        clock.advance_secs(1);
        scheduler.run_due().await;
        handle.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_fires_after_delay() {
        let scheduler = TokioScheduler;
        let fired = Arc::new(AtomicUsize::new(0));

        scheduler.after(Duration::from_secs(30), counting_task(&fired));
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_tokio_scheduler_cancel() {
        let scheduler = TokioScheduler;
        let fired = Arc::new(AtomicUsize::new(0));

        let handle = scheduler.after(Duration::from_secs(30), counting_task(&fired));
        tokio::time::sleep(Duration::from_secs(10)).await;
        handle.cancel();
        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
