//! Background-job scheduler (C8): a delayed, coalescing job primitive used
//! by the downloader/inserter (own-identity re-insertion debounce), the
//! subscription delivery workers, and the introduction subsystem's puzzle
//! maintenance.
//!
//! Coroutine-like polling loops become one explicit state machine per job:
//! `Idle` → `Scheduled(deadline)` → `Running` →
//! (`Idle` | `RunningPending(next_deadline)` if another trigger arrived
//! mid-run) → ... Cancellation flows through a single per-job
//! `Arc<AtomicBool>` handed to the runnable, checked at its own suspension
//! points — the scheduler itself never knows how to interrupt the
//! runnable's internals.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// The runnable body of a job. Receives its own cancellation flag so it can
/// check it at suspension points.
pub type JobRunnable =
    Arc<dyn Fn(Arc<AtomicBool>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

#[derive(Clone, Copy, Debug)]
enum JobState {
    Idle,
    Scheduled(Instant),
    Running,
    RunningPending(Instant),
    Terminated,
}

struct Shared {
    runnable: JobRunnable,
    cancel: Arc<AtomicBool>,
    state: Mutex<JobState>,
    wake: Notify,
    idle: Notify,
    completions: AtomicU64,
}

/// A delayed background job: multiple `trigger_execution` calls within the
/// delay window coalesce into a single run at the earliest requested
/// deadline; concurrent executions of the same job are forbidden — a
/// second trigger that arrives while one is running schedules exactly one
/// follow-up.
pub struct DelayedJob {
    shared: Arc<Shared>,
    driver: JoinHandle<()>,
}

impl DelayedJob {
    pub fn spawn(runnable: JobRunnable) -> Self {
        let shared = Arc::new(Shared {
            runnable,
            cancel: Arc::new(AtomicBool::new(false)),
            state: Mutex::new(JobState::Idle),
            wake: Notify::new(),
            idle: Notify::new(),
            completions: AtomicU64::new(0),
        });
        let driver_shared = shared.clone();
        let driver = tokio::spawn(async move { drive(driver_shared).await });
        Self { shared, driver }
    }

    /// Coalescing trigger: schedules a run at `now + delay`, or pulls an
    /// already-scheduled run's deadline earlier if `delay` would fire
    /// sooner. A trigger that arrives mid-run schedules exactly one
    /// follow-up at the earliest requested deadline.
    pub fn trigger_execution(&self, delay: Duration) {
        let deadline = Instant::now() + delay;
        let mut state = self.shared.state.lock();
        match *state {
            JobState::Terminated => {}
            JobState::Idle => {
                *state = JobState::Scheduled(deadline);
                self.shared.wake.notify_one();
            }
            JobState::Scheduled(existing) => {
                if deadline < existing {
                    *state = JobState::Scheduled(deadline);
                    self.shared.wake.notify_one();
                }
            }
            JobState::Running => {
                *state = JobState::RunningPending(deadline);
            }
            JobState::RunningPending(existing) => {
                if deadline < existing {
                    *state = JobState::RunningPending(deadline);
                }
            }
        }
    }

    /// Immediate trigger (no debounce).
    pub fn trigger_now(&self) {
        self.trigger_execution(Duration::ZERO);
    }

    /// Synchronous variant: triggers immediately and blocks until the
    /// resulting execution has completed. Used in tests, where the
    /// `DelayedJob`'s async executor pool would otherwise race the
    /// assertions that follow.
    pub async fn trigger_execution_sync(&self) {
        let target = {
            let mut state = self.shared.state.lock();
            let already_running =
                matches!(*state, JobState::Running | JobState::RunningPending(_));
            let base = self.shared.completions.load(Ordering::Acquire);
            let target = if already_running { base + 2 } else { base + 1 };
            match *state {
                JobState::Terminated => return,
                JobState::Idle | JobState::Scheduled(_) => {
                    *state = JobState::Scheduled(Instant::now());
                    self.shared.wake.notify_one();
                }
                JobState::Running | JobState::RunningPending(_) => {
                    *state = JobState::RunningPending(Instant::now());
                }
            }
            target
        };
        loop {
            if self.shared.completions.load(Ordering::Acquire) >= target {
                return;
            }
            self.shared.idle.notified().await;
        }
    }

    /// Interrupts a running execution via the cooperative cancellation
    /// flag and prevents further scheduling.
    pub fn terminate(&self) {
        self.shared.cancel.store(true, Ordering::Release);
        let mut state = self.shared.state.lock();
        *state = JobState::Terminated;
        self.shared.wake.notify_one();
    }

    /// Blocks until the currently running execution, if any, completes, or
    /// `timeout` elapses first. Returns `true` if the job reached a
    /// non-running state before the timeout.
    pub async fn wait_for_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let state = self.shared.state.lock();
                if !matches!(*state, JobState::Running | JobState::RunningPending(_)) {
                    return true;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, self.shared.idle.notified()).await;
        }
    }

    pub fn completions(&self) -> u64 {
        self.shared.completions.load(Ordering::Acquire)
    }
}

impl Drop for DelayedJob {
    fn drop(&mut self) {
        self.shared.cancel.store(true, Ordering::Release);
        self.driver.abort();
    }
}

async fn drive(shared: Arc<Shared>) {
    loop {
        let deadline = {
            let state = shared.state.lock();
            match *state {
                JobState::Terminated => return,
                JobState::Idle => None,
                JobState::Scheduled(d) => Some(d),
                JobState::Running | JobState::RunningPending(_) => None,
            }
        };

        match deadline {
            None => shared.wake.notified().await,
            Some(d) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(d) => {}
                    _ = shared.wake.notified() => continue,
                }
            }
        }

        {
            let mut state = shared.state.lock();
            match *state {
                JobState::Terminated => return,
                JobState::Idle => continue,
                JobState::Scheduled(d) if d > Instant::now() => continue,
                JobState::Scheduled(_) => *state = JobState::Running,
                JobState::Running | JobState::RunningPending(_) => continue,
            }
        }

        shared.cancel.store(false, Ordering::Release);
        (shared.runnable)(shared.cancel.clone()).await;
        shared.completions.fetch_add(1, Ordering::AcqRel);

        {
            let mut state = shared.state.lock();
            match *state {
                JobState::Terminated => {}
                JobState::RunningPending(next) => *state = JobState::Scheduled(next),
                _ => *state = JobState::Idle,
            }
        }
        shared.idle.notify_waiters();
    }
}
