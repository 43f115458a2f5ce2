//! Background rebuild worker.
//!
//! One thread named `semcache-rebuild` waits for rebuild requests and runs
//! the rebuild job. Requests coalesce: any number of `request()` calls made
//! while a run is pending or in flight produce at most one further run.

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error};

use semcache_core::{SemcacheError, SemcacheResult};

/// Scheduler metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Requests received, coalesced ones included.
    pub requests: u64,
    /// Job runs finished (including ones that panicked).
    pub runs_completed: u64,
}

#[derive(Default)]
struct WorkState {
    pending: bool,
    running: bool,
}

struct SchedulerInner {
    state: Mutex<WorkState>,
    work_ready: Condvar,
    idle: Condvar,
    shutdown: AtomicBool,
    requests: AtomicU64,
    runs_completed: AtomicU64,
}

/// Cloneable handle that only requests rebuilds.
///
/// Handed to the eviction coordinator as its rebuild signal.
#[derive(Clone)]
pub struct RebuildTrigger {
    inner: Arc<SchedulerInner>,
}

impl RebuildTrigger {
    /// Ask for a rebuild; returns false after shutdown.
    pub fn request(&self) -> bool {
        if self.inner.shutdown.load(Ordering::Acquire) {
            return false;
        }
        self.inner.requests.fetch_add(1, Ordering::Relaxed);
        let mut state = self.inner.state.lock();
        state.pending = true;
        self.inner.work_ready.notify_one();
        true
    }
}

/// Single-worker scheduler running rebuilds off the caller's thread.
pub struct RebuildScheduler {
    trigger: RebuildTrigger,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl RebuildScheduler {
    /// Spawn the worker; `job` runs once per (coalesced) request.
    ///
    /// # Errors
    ///
    /// `Io` if the thread cannot be spawned.
    pub fn spawn(job: impl Fn() + Send + 'static) -> SemcacheResult<Self> {
        let inner = Arc::new(SchedulerInner {
            state: Mutex::new(WorkState::default()),
            work_ready: Condvar::new(),
            idle: Condvar::new(),
            shutdown: AtomicBool::new(false),
            requests: AtomicU64::new(0),
            runs_completed: AtomicU64::new(0),
        });

        let inner_clone = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("semcache-rebuild".to_string())
            .spawn(move || worker_loop(&inner_clone, job))
            .map_err(SemcacheError::Io)?;

        Ok(Self {
            trigger: RebuildTrigger { inner },
            worker: Mutex::new(Some(handle)),
        })
    }

    /// A handle that can request rebuilds.
    pub fn trigger(&self) -> RebuildTrigger {
        self.trigger.clone()
    }

    /// Ask for a rebuild; returns false after shutdown.
    pub fn request(&self) -> bool {
        self.trigger.request()
    }

    /// Block until no run is pending or in flight.
    pub fn drain(&self) {
        let inner = &self.trigger.inner;
        let mut state = inner.state.lock();
        while (state.pending || state.running) && !inner.shutdown.load(Ordering::Acquire) {
            inner.idle.wait(&mut state);
        }
    }

    /// Stop the worker after the current run and join it.
    ///
    /// A pending request that has not started is dropped. Idempotent.
    pub fn shutdown(&self) {
        let inner = &self.trigger.inner;
        inner.shutdown.store(true, Ordering::Release);
        {
            // Lock before notifying so a worker between its shutdown check
            // and wait() cannot miss the wakeup.
            let _state = inner.state.lock();
            inner.work_ready.notify_all();
            inner.idle.notify_all();
        }
        if let Some(handle) = self.worker.lock().take() {
            let _ = handle.join();
        }
    }

    /// Return a snapshot of scheduler metrics.
    pub fn stats(&self) -> SchedulerStats {
        let inner = &self.trigger.inner;
        SchedulerStats {
            requests: inner.requests.load(Ordering::Relaxed),
            runs_completed: inner.runs_completed.load(Ordering::Relaxed),
        }
    }
}

impl Drop for RebuildScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(inner: &SchedulerInner, job: impl Fn()) {
    loop {
        {
            let mut state = inner.state.lock();
            loop {
                if inner.shutdown.load(Ordering::Acquire) {
                    state.pending = false;
                    inner.idle.notify_all();
                    return;
                }
                if state.pending {
                    state.pending = false;
                    state.running = true;
                    break;
                }
                inner.work_ready.wait(&mut state);
            }
        }

        debug!("background rebuild starting");
        // A panicking job must not kill the worker.
        if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(&job)) {
            error!(
                "background rebuild panicked: {:?}",
                e.downcast_ref::<&str>().copied().unwrap_or("(non-string panic)")
            );
        }
        inner.runs_completed.fetch_add(1, Ordering::Relaxed);

        let mut state = inner.state.lock();
        state.running = false;
        if !state.pending {
            inner.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;

    #[test]
    fn test_request_and_drain() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let scheduler = RebuildScheduler::spawn(move || {
            c.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        assert!(scheduler.request());
        scheduler.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        scheduler.shutdown();
    }

    #[test]
    fn test_requests_coalesce_while_running() {
        let barrier = Arc::new(Barrier::new(2));
        let counter = Arc::new(AtomicUsize::new(0));
        let (b, c) = (Arc::clone(&barrier), Arc::clone(&counter));
        let scheduler = RebuildScheduler::spawn(move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                b.wait();
            }
        })
        .unwrap();

        scheduler.request();
        // Wait until the worker is blocked inside the first run
        while counter.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }
        for _ in 0..10 {
            scheduler.request();
        }
        barrier.wait();
        scheduler.drain();

        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.stats().requests, 11);
        assert_eq!(scheduler.stats().runs_completed, 2);
        scheduler.shutdown();
    }

    #[test]
    fn test_worker_thread_name() {
        let name = Arc::new(Mutex::new(None));
        let n = Arc::clone(&name);
        let scheduler = RebuildScheduler::spawn(move || {
            *n.lock() = std::thread::current().name().map(str::to_string);
        })
        .unwrap();
        scheduler.request();
        scheduler.drain();
        assert_eq!(name.lock().as_deref(), Some("semcache-rebuild"));
    }

    #[test]
    fn test_panicking_job_does_not_kill_worker() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let scheduler = RebuildScheduler::spawn(move || {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("intentional test panic");
            }
        })
        .unwrap();

        scheduler.request();
        scheduler.drain();
        scheduler.request();
        scheduler.drain();
        assert_eq!(counter.load(Ordering::SeqCst), 2);
        assert_eq!(scheduler.stats().runs_completed, 2);
    }

    #[test]
    fn test_request_after_shutdown_rejected() {
        let scheduler = RebuildScheduler::spawn(|| {}).unwrap();
        let trigger = scheduler.trigger();
        scheduler.shutdown();
        scheduler.shutdown();
        assert!(!scheduler.request());
        assert!(!trigger.request());
    }

    #[test]
    fn test_drain_returns_when_idle() {
        let scheduler = RebuildScheduler::spawn(|| {}).unwrap();
        scheduler.drain();
    }
}
