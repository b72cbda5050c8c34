//! Counting gate that lets topology changes quiesce in-flight dispatches
//! without a coarse lock around the whole dispatch path.

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct ValveState {
    on: bool,
    users: usize,
}

/// Dispatch paths bracket their work with `increment`/`decrement`;
/// topology-mutating operations call `turn_off`, which blocks new entries
/// and waits for every prior `increment` to pair with its `decrement`.
#[derive(Debug)]
pub struct DispatchValve {
    state: Mutex<ValveState>,
    changed: Condvar,
}

impl DispatchValve {
    pub fn new(on: bool) -> Self {
        Self {
            state: Mutex::new(ValveState { on, users: 0 }),
            changed: Condvar::new(),
        }
    }

    /// Enters the valve, blocking while it is turned off.
    pub fn increment(&self) {
        let mut state = self.state.lock();
        while !state.on {
            self.changed.wait(&mut state);
        }
        state.users += 1;
    }

    pub fn decrement(&self) {
        let mut state = self.state.lock();
        state.users = state.users.saturating_sub(1);
        self.changed.notify_all();
    }

    /// Shuts the valve. When this returns, no user is inside and no new
    /// `increment` succeeds until `turn_on`.
    pub fn turn_off(&self) {
        let mut state = self.state.lock();
        state.on = false;
        while state.users > 0 {
            self.changed.wait(&mut state);
        }
    }

    /// Re-admits dispatchers.
    pub fn turn_on(&self) {
        self.state.lock().on = true;
        self.changed.notify_all();
    }

    pub fn is_on(&self) -> bool {
        self.state.lock().on
    }
}

impl Default for DispatchValve {
    fn default() -> Self {
        Self::new(true)
    }
}
