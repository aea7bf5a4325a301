use crate::context::{ExpirationCallback, TransactionTimer};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// A [`TransactionTimer`] backed by a dedicated thread.
///
/// [`DeadlineTimer::start`] arms the timer, the expiration callback runs on
/// the timer thread once the deadline passes.
pub struct DeadlineTimer {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
    expired: AtomicBool,
    callback: Mutex<Option<ExpirationCallback>>,
}

#[derive(Default)]
struct TimerState {
    deadline: Option<Instant>,
    shutdown: bool,
}

impl DeadlineTimer {
    /// Starts the timer thread. The timer is not armed.
    pub fn new() -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState::default()),
            wake: Condvar::new(),
            expired: AtomicBool::new(false),
            callback: Mutex::new(None),
        });
        let thread = thread::Builder::new()
            .name("sysvmoc-deadline".into())
            .spawn({
                let shared = shared.clone();
                move || shared.run()
            })?;
        Ok(Self {
            shared,
            thread: Some(thread),
        })
    }

    /// Arms the timer for `deadline`, clearing a previous expiration.
    pub fn start(&self, deadline: Instant) {
        let mut state = self.shared.state.lock();
        self.shared.expired.store(false, Ordering::Release);
        state.deadline = Some(deadline);
        self.shared.wake.notify_one();
    }

    /// Disarms the timer.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        state.deadline = None;
        self.shared.expired.store(false, Ordering::Release);
        self.shared.wake.notify_one();
    }
}

impl Shared {
    fn run(&self) {
        let mut state = self.state.lock();
        while !state.shutdown {
            match state.deadline {
                None => self.wake.wait(&mut state),
                Some(deadline) if Instant::now() >= deadline => {
                    state.deadline = None;
                    self.expired.store(true, Ordering::Release);
                    MutexGuard::unlocked(&mut state, || {
                        if let Some(callback) = self.callback.lock().as_ref() {
                            callback();
                        }
                    });
                }
                Some(deadline) => {
                    self.wake.wait_until(&mut state, deadline);
                }
            }
        }
    }
}

impl TransactionTimer for DeadlineTimer {
    fn expired(&self) -> bool {
        self.shared.expired.load(Ordering::Acquire)
    }

    fn set_expiration_callback(&self, callback: Option<ExpirationCallback>) {
        *self.shared.callback.lock() = callback;
    }
}

impl Drop for DeadlineTimer {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.wake.notify_one();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}
