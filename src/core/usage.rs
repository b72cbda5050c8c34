//! Byte-budget accountant gating producer sends.
//!
//! Each queue carries its own accountant that delegates upward to the
//! broker-level one, so a queue can be capped individually while the
//! broker cap still applies across destinations.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};

#[derive(Debug)]
struct UsageState {
    usage: u64,
    limit: u64,
    send_fail_if_no_space: bool,
}

/// Tracks bytes in flight against a limit, with blocking and fail-fast
/// admission modes.
#[derive(Debug)]
pub struct UsageAccountant {
    parent: Option<Arc<UsageAccountant>>,
    state: Mutex<UsageState>,
    released: Condvar,
}

impl UsageAccountant {
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            parent: None,
            state: Mutex::new(UsageState {
                usage: 0,
                limit,
                send_fail_if_no_space: false,
            }),
            released: Condvar::new(),
        })
    }

    pub fn with_parent(parent: &Arc<UsageAccountant>, limit: u64) -> Arc<Self> {
        Arc::new(Self {
            parent: Some(Arc::clone(parent)),
            state: Mutex::new(UsageState {
                usage: 0,
                limit,
                send_fail_if_no_space: false,
            }),
            released: Condvar::new(),
        })
    }

    pub fn set_limit(&self, limit: u64) {
        self.state.lock().limit = limit;
        self.released.notify_all();
    }

    pub fn set_send_fail_if_no_space(&self, fail_fast: bool) {
        self.state.lock().send_fail_if_no_space = fail_fast;
    }

    pub fn is_send_fail_if_no_space(&self) -> bool {
        self.state.lock().send_fail_if_no_space
    }

    pub fn increase(&self, bytes: u64) {
        self.state.lock().usage += bytes;
        if let Some(parent) = &self.parent {
            parent.increase(bytes);
        }
    }

    pub fn decrease(&self, bytes: u64) {
        {
            let mut state = self.state.lock();
            state.usage = state.usage.saturating_sub(bytes);
        }
        if let Some(parent) = &self.parent {
            parent.decrease(bytes);
        }
        self.released.notify_all();
    }

    pub fn usage(&self) -> u64 {
        self.state.lock().usage
    }

    pub fn is_full(&self) -> bool {
        let full = {
            let state = self.state.lock();
            state.usage >= state.limit
        };
        full || self.parent.as_ref().is_some_and(|p| p.is_full())
    }

    pub fn percent_usage(&self) -> u32 {
        let state = self.state.lock();
        if state.limit == 0 {
            return 100;
        }
        ((state.usage.saturating_mul(100)) / state.limit) as u32
    }

    /// Blocks until space frees up or `cancelled` reports true. Returns
    /// whether space is available; a `false` return means the wait was
    /// cancelled.
    ///
    /// The wait polls in short slices rather than relying purely on
    /// notification, since a parent accountant freed by another queue has
    /// no handle on this condvar.
    pub fn wait_for_space_while(&self, cancelled: impl Fn() -> bool) -> bool {
        loop {
            if cancelled() {
                return !self.is_full();
            }
            if !self.is_full() {
                return true;
            }
            let mut state = self.state.lock();
            self.released
                .wait_for(&mut state, Duration::from_millis(20));
        }
    }

    pub fn wait_for_space(&self) {
        self.wait_for_space_while(|| false);
    }
}
