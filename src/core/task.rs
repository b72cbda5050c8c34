//! Cooperative task runner: a dedicated thread driving `iterate` ticks.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

/// A unit of cooperative work. `iterate` runs one bounded pass and
/// reports whether more work is immediately available.
pub trait Task: Send + Sync {
    fn iterate(&self) -> bool;
}

#[derive(Debug, Default)]
struct RunnerState {
    pending: bool,
    shutdown: bool,
}

#[derive(Debug)]
struct RunnerShared {
    state: Mutex<RunnerState>,
    wake: Condvar,
}

/// Runs a task on its own named thread. The runner holds only a weak
/// handle to the task, so dropping the task ends the thread.
pub struct DedicatedTaskRunner {
    shared: Arc<RunnerShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DedicatedTaskRunner {
    pub fn new(task: Weak<dyn Task>, name: &str) -> Self {
        let shared = Arc::new(RunnerShared {
            state: Mutex::new(RunnerState::default()),
            wake: Condvar::new(),
        });
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || Self::run(task, thread_shared))
            .expect("failed to spawn task runner thread");
        Self {
            shared,
            handle: Mutex::new(Some(handle)),
        }
    }

    fn run(task: Weak<dyn Task>, shared: Arc<RunnerShared>) {
        loop {
            {
                let mut state = shared.state.lock();
                while !state.pending && !state.shutdown {
                    shared.wake.wait(&mut state);
                }
                if state.shutdown {
                    break;
                }
                state.pending = false;
            }
            let Some(task) = task.upgrade() else { break };
            while task.iterate() {
                if shared.state.lock().shutdown {
                    break;
                }
            }
        }
        trace!("task runner thread exiting");
    }

    /// Schedules another pass. A wakeup after `shutdown` is a no-op.
    pub fn wakeup(&self) {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return;
        }
        state.pending = true;
        self.shared.wake.notify_all();
    }

    /// Completes any in-flight pass and stops the thread.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            state.shutdown = true;
            self.shared.wake.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for DedicatedTaskRunner {
    fn drop(&mut self) {
        self.shutdown();
    }
}
