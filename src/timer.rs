//! One-shot timers with cancellation and quiescence.
//!
//! Every endpoint owns four of these (retransmit, persist, delayed-ack,
//! time-wait). A timer is armed at an absolute deadline; re-arming replaces
//! the previous deadline, and [`Timer::cancel`] prevents any firing that has
//! not already been dispatched. A callback that was already dispatched when
//! the cancel came in may still run; callbacks therefore re-acquire their
//! endpoint's lock and re-check state before acting. [`Timer::wait_quiescent`]
//! lets an owner tear down knowing no callback is mid-flight.

use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

struct TimerState {
    deadline: Option<Instant>,
    firing: bool,
    shutdown: bool,
}

struct TimerShared {
    name: &'static str,
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// A one-shot wakeup backed by a dedicated worker thread.
pub struct Timer {
    shared: Arc<TimerShared>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Timer {
    pub fn new<F>(name: &'static str, callback: F) -> Self
    where
        F: Fn() + Send + 'static,
    {
        let shared = Arc::new(TimerShared {
            name,
            state: Mutex::new(TimerState {
                deadline: None,
                firing: false,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });
        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name(format!("tcp timer: {name}"))
            .spawn(move || run_timer(worker_shared, callback))
            .expect("failed to spawn timer thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Arms the timer to fire `delay` from now, replacing any earlier
    /// deadline.
    pub fn schedule(&self, delay: Duration) {
        tracing::trace!(timer = self.shared.name, ?delay, "timer set");
        let mut state = self.shared.state.lock().unwrap();
        state.deadline = Some(Instant::now() + delay);
        self.shared.condvar.notify_all();
    }

    /// Disarms the timer. Returns whether it was armed. A callback already
    /// dispatched keeps running; use [`Timer::wait_quiescent`] to wait it
    /// out.
    pub fn cancel(&self) -> bool {
        let mut state = self.shared.state.lock().unwrap();
        let was_armed = state.deadline.take().is_some();
        if was_armed {
            tracing::trace!(timer = self.shared.name, "timer canceled");
            self.shared.condvar.notify_all();
        }
        was_armed
    }

    pub fn is_armed(&self) -> bool {
        self.shared.state.lock().unwrap().deadline.is_some()
    }

    /// Blocks until no callback is executing.
    pub fn wait_quiescent(&self) {
        let mut state = self.shared.state.lock().unwrap();
        while state.firing {
            state = self.shared.condvar.wait(state).unwrap();
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            state.deadline = None;
            state.shutdown = true;
            self.shared.condvar.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl std::fmt::Debug for Timer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timer")
            .field("name", &self.shared.name)
            .field("armed", &self.is_armed())
            .finish()
    }
}

fn run_timer<F: Fn()>(shared: Arc<TimerShared>, callback: F) {
    let mut state = shared.state.lock().unwrap();
    loop {
        if state.shutdown {
            return;
        }
        let Some(deadline) = state.deadline else {
            state = shared.condvar.wait(state).unwrap();
            continue;
        };

        let now = Instant::now();
        if now < deadline {
            let (next, _) = shared
                .condvar
                .wait_timeout(state, deadline - now)
                .unwrap();
            state = next;
            continue;
        }

        // due: disarm before dispatching so that a re-arm from the callback
        // (or anyone else) is seen as a fresh schedule
        state.deadline = None;
        state.firing = true;
        drop(state);

        tracing::trace!(timer = shared.name, "timer fired");
        callback();

        state = shared.state.lock().unwrap();
        state.firing = false;
        shared.condvar.notify_all();
    }
}
