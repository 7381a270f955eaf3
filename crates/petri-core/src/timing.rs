//! Cancellable periodic timers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Runs a closure every `interval`, on a dedicated thread.
///
/// The timer is pausable, its interval can be retuned while running, and
/// `cancel()` joins the worker so jobs can tear down deterministically on
/// disconnect. Dropping the handle also cancels.
pub struct RepeatedTimer {
    shared: Arc<TimerShared>,
    handle: Option<JoinHandle<()>>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    wake: Condvar,
    cancelled: AtomicBool,
}

struct TimerState {
    interval: Duration,
    paused: bool,
    /// Run the closure at the next wakeup regardless of the schedule.
    fire_now: bool,
}

impl RepeatedTimer {
    pub fn new<F>(interval: Duration, run_immediately: bool, mut f: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                interval,
                paused: false,
                fire_now: run_immediately,
            }),
            wake: Condvar::new(),
            cancelled: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let handle = std::thread::spawn(move || {
            loop {
                let mut state = worker_shared.state.lock().unwrap();
                loop {
                    if worker_shared.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    if state.fire_now && !state.paused {
                        state.fire_now = false;
                        break;
                    }
                    let interval = state.interval;
                    let (next, timed_out) = worker_shared
                        .wake
                        .wait_timeout(state, interval)
                        .unwrap_or_else(|e| {
                            let (g, t) = e.into_inner();
                            (g, t)
                        });
                    state = next;
                    if worker_shared.cancelled.load(Ordering::SeqCst) {
                        return;
                    }
                    if timed_out.timed_out() && !state.paused {
                        break;
                    }
                    // woken for a config change; re-evaluate
                }
                drop(state);
                f();
            }
        });

        Self {
            shared,
            handle: Some(handle),
        }
    }

    /// Skip executions until `unpause`.
    pub fn pause(&self) {
        self.shared.state.lock().unwrap().paused = true;
        self.shared.wake.notify_all();
    }

    pub fn unpause(&self) {
        self.shared.state.lock().unwrap().paused = false;
        self.shared.wake.notify_all();
    }

    /// Retune the period; takes effect at the next wakeup.
    pub fn set_interval(&self, interval: Duration) {
        self.shared.state.lock().unwrap().interval = interval;
        self.shared.wake.notify_all();
    }

    /// Request one execution as soon as possible.
    pub fn fire_now(&self) {
        self.shared.state.lock().unwrap().fire_now = true;
        self.shared.wake.notify_all();
    }

    /// Stop the schedule and join the worker. Idempotent. When called from
    /// inside the timer's own callback the join is skipped; the worker exits
    /// as soon as the callback returns.
    pub fn cancel(&mut self) {
        self.shared.cancelled.store(true, Ordering::SeqCst);
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            let _ = handle.join();
        }
    }
}

impl Drop for RepeatedTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn run_immediately_fires_without_waiting() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let mut t = RepeatedTimer::new(Duration::from_secs(3600), true, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(50));
        t.cancel();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn fires_repeatedly_at_interval() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let mut t = RepeatedTimer::new(Duration::from_millis(10), false, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        t.cancel();
        let n = count.load(Ordering::SeqCst);
        assert!(n >= 3, "expected several firings, saw {n}");
    }

    #[test]
    fn paused_timer_does_not_fire() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let mut t = RepeatedTimer::new(Duration::from_millis(5), false, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        t.pause();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), 0);
        t.unpause();
        std::thread::sleep(Duration::from_millis(50));
        t.cancel();
        assert!(count.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn cancel_is_idempotent_and_joins() {
        let mut t = RepeatedTimer::new(Duration::from_millis(5), false, || {});
        t.cancel();
        t.cancel();
        assert!(t.handle.is_none());
    }

    #[test]
    fn set_interval_takes_effect() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);
        let mut t = RepeatedTimer::new(Duration::from_secs(3600), false, move || {
            c.fetch_add(1, Ordering::SeqCst);
        });
        t.set_interval(Duration::from_millis(10));
        std::thread::sleep(Duration::from_millis(80));
        t.cancel();
        assert!(count.load(Ordering::SeqCst) >= 2);
    }
}
