//! Debouncer: coalesce a burst of triggers into one delayed action.
//!
//! After the last `trigger()`, if no further trigger lands within the
//! quiet period and nobody cancels, the action runs exactly once on the
//! debouncer's worker thread. A trigger that arrives while the action is
//! running re-arms exactly one follow-up fire; fires never overlap.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

pub type Action = Box<dyn Fn() + Send + 'static>;

#[derive(Default)]
struct State {
    /// When the pending fire is due. `None` = idle.
    deadline: Option<Instant>,
    /// Re-arm deadline recorded by a trigger that raced the action.
    rearm: Option<Instant>,
    firing: bool,
    shutdown: bool,
}

struct Inner {
    state: Mutex<State>,
    cv: Condvar,
    quiet: Duration,
}

pub struct Debouncer {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
}

impl Debouncer {
    pub fn new(quiet: Duration, action: Action) -> Self {
        let inner = Arc::new(Inner {
            state: Mutex::new(State::default()),
            cv: Condvar::new(),
            quiet,
        });

        let worker_inner = Arc::clone(&inner);
        let worker = std::thread::Builder::new()
            .name("debounce".into())
            .spawn(move || worker_loop(worker_inner, action))
            .expect("spawning debounce worker");

        Debouncer {
            inner,
            worker: Some(worker),
        }
    }

    /// Start (or restart) the countdown. Never runs the action
    /// synchronously and never blocks beyond a short lock.
    pub fn trigger(&self) {
        let mut state = self.lock();
        let due = Instant::now() + self.inner.quiet;
        if state.firing {
            state.rearm = Some(due);
        } else {
            state.deadline = Some(due);
        }
        self.inner.cv.notify_all();
    }

    /// Suppress any pending fire.
    pub fn cancel(&self) {
        let mut state = self.lock();
        state.deadline = None;
        state.rearm = None;
        self.inner.cv.notify_all();
    }

    /// Force a pending fire to run now and wait until the debouncer is
    /// idle. Returns false if it was still busy when `timeout` elapsed.
    pub fn flush(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        if state.deadline.is_some() {
            state.deadline = Some(Instant::now());
            self.inner.cv.notify_all();
        }
        while state.deadline.is_some() || state.firing || state.rearm.is_some() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (next, _) = self
                .inner
                .cv
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = next;
        }
        true
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        {
            let mut state = self.lock();
            // Dropping cancels anything still pending.
            state.deadline = None;
            state.rearm = None;
            state.shutdown = true;
            self.inner.cv.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: Arc<Inner>, action: Action) {
    let mut state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
    loop {
        if state.shutdown {
            return;
        }
        match state.deadline {
            None => {
                let (next, _) = inner
                    .cv
                    .wait_timeout(state, Duration::from_secs(3600))
                    .unwrap_or_else(|e| e.into_inner());
                state = next;
            }
            Some(due) => {
                let now = Instant::now();
                if now < due {
                    let (next, _) = inner
                        .cv
                        .wait_timeout(state, due - now)
                        .unwrap_or_else(|e| e.into_inner());
                    state = next;
                    continue;
                }

                state.deadline = None;
                state.firing = true;
                drop(state);

                action();

                state = inner.state.lock().unwrap_or_else(|e| e.into_inner());
                state.firing = false;
                // A trigger that raced the action scheduled a follow-up.
                state.deadline = state.rearm.take();
                inner.cv.notify_all();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn counting(quiet: Duration) -> (Debouncer, Arc<AtomicU32>) {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let debouncer = Debouncer::new(
            quiet,
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (debouncer, count)
    }

    /// Poll until the condition holds; more robust than sleeps under load.
    fn await_condition(timeout: Duration, what: &str, cond: impl Fn() -> bool) {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        panic!("timeout waiting for {what}");
    }

    #[test]
    fn batches_multiple_triggers() {
        let (debouncer, count) = counting(Duration::from_millis(50));

        debouncer.trigger();
        debouncer.trigger();
        debouncer.trigger();

        // Never synchronous.
        assert_eq!(count.load(Ordering::SeqCst), 0);

        await_condition(Duration::from_millis(500), "single fire", || {
            count.load(Ordering::SeqCst) == 1
        });
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn resets_timer_on_subsequent_triggers() {
        let fired_at: Arc<Mutex<Option<Instant>>> = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&fired_at);
        // Quiet period much larger than the inter-trigger sleep so the
        // reset is observable even on a loaded machine.
        let debouncer = Debouncer::new(
            Duration::from_millis(150),
            Box::new(move || {
                *sink.lock().unwrap() = Some(Instant::now());
            }),
        );

        let start = Instant::now();
        debouncer.trigger();
        std::thread::sleep(Duration::from_millis(20));
        debouncer.trigger();

        await_condition(Duration::from_millis(800), "fire", || {
            fired_at.lock().unwrap().is_some()
        });
        let elapsed = fired_at.lock().unwrap().unwrap() - start;
        assert!(
            elapsed >= Duration::from_millis(100),
            "fired too early ({elapsed:?}), timer was not reset"
        );
    }

    #[test]
    fn cancel_during_wait() {
        let (debouncer, count) = counting(Duration::from_millis(50));
        debouncer.trigger();
        std::thread::sleep(Duration::from_millis(10));
        debouncer.cancel();

        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn cancel_with_nothing_pending_then_trigger() {
        let (debouncer, count) = counting(Duration::from_millis(50));
        debouncer.cancel();
        debouncer.trigger();
        await_condition(Duration::from_millis(500), "fire after no-op cancel", || {
            count.load(Ordering::SeqCst) == 1
        });
    }

    #[test]
    fn concurrent_trigger_storm_fires_once() {
        let (debouncer, count) = counting(Duration::from_millis(50));
        let debouncer = Arc::new(debouncer);

        let mut handles = Vec::new();
        for _ in 0..100 {
            let d = Arc::clone(&debouncer);
            handles.push(std::thread::spawn(move || d.trigger()));
        }
        for h in handles {
            h.join().unwrap();
        }

        await_condition(Duration::from_millis(500), "fire", || {
            count.load(Ordering::SeqCst) >= 1
        });
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn concurrent_cancel_and_trigger_is_zero_or_one() {
        let (debouncer, count) = counting(Duration::from_millis(50));
        let debouncer = Arc::new(debouncer);

        let mut handles = Vec::new();
        for i in 0..50 {
            let d = Arc::clone(&debouncer);
            handles.push(std::thread::spawn(move || {
                if i % 2 == 0 {
                    d.trigger();
                } else {
                    d.cancel();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        debouncer.cancel();

        std::thread::sleep(Duration::from_millis(120));
        let fired = count.load(Ordering::SeqCst);
        assert!(fired <= 1, "got {fired}, want 0 or 1");
    }

    #[test]
    fn sequential_trigger_cycles() {
        let (debouncer, count) = counting(Duration::from_millis(30));
        for want in 1..=3 {
            debouncer.trigger();
            await_condition(Duration::from_millis(500), "cycle fire", || {
                count.load(Ordering::SeqCst) >= want
            });
        }
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancel_immediately_after_trigger() {
        let (debouncer, count) = counting(Duration::from_millis(50));
        debouncer.trigger();
        debouncer.cancel();
        std::thread::sleep(Duration::from_millis(80));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn trigger_during_fire_rearms_once() {
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let count = Arc::new(AtomicU32::new(0));

        let gate_in_action = Arc::clone(&gate);
        let counter = Arc::clone(&count);
        let debouncer = Debouncer::new(
            Duration::from_millis(10),
            Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                // First fire blocks until the test opens the gate.
                if counter.load(Ordering::SeqCst) == 1 {
                    let (lock, cv) = &*gate_in_action;
                    let mut open = lock.lock().unwrap();
                    while !*open {
                        open = cv.wait(open).unwrap();
                    }
                }
            }),
        );

        debouncer.trigger();
        await_condition(Duration::from_millis(500), "first fire to start", || {
            count.load(Ordering::SeqCst) == 1
        });

        // Arrives mid-fire: must schedule exactly one more.
        debouncer.trigger();
        {
            let (lock, cv) = &*gate;
            *lock.lock().unwrap() = true;
            cv.notify_all();
        }

        await_condition(Duration::from_millis(500), "re-armed fire", || {
            count.load(Ordering::SeqCst) == 2
        });
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn flush_forces_pending_fire() {
        let (debouncer, count) = counting(Duration::from_secs(3600));
        debouncer.trigger();
        assert!(debouncer.flush(Duration::from_secs(2)));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // Idle flush is a fast no-op.
        assert!(debouncer.flush(Duration::from_millis(100)));
    }
}
