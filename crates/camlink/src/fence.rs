// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Au-Zone Technologies

//! Per-buffer completion fences.
//!
//! One fence is created for every outstanding buffer. Exactly one owner
//! signals it (the event path, on request completion); any number of waiters
//! may block on it. Double signaling is a state error, never silent.

use crate::Error;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

/// Outcome carried by a signaled fence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FenceStatus {
    /// The associated request completed.
    Success,
    /// The associated request failed with a hardware error type.
    Failed(u32),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FenceState {
    Pending,
    Signaled(FenceStatus),
}

struct FenceInner {
    state: Mutex<FenceState>,
    cond: Condvar,
}

/// A completion fence. Cloning produces another waiter on the same fence;
/// the signal contract is unaffected by cloning.
#[derive(Clone)]
pub struct Fence {
    inner: Arc<FenceInner>,
}

impl Fence {
    pub fn new() -> Self {
        Fence {
            inner: Arc::new(FenceInner {
                state: Mutex::new(FenceState::Pending),
                cond: Condvar::new(),
            }),
        }
    }

    /// Signal the fence. Exactly one signal is permitted; a second signal is
    /// a state error and leaves the original status in place.
    pub fn signal(&self, status: FenceStatus) -> Result<(), Error> {
        let mut state = self.lock();
        if matches!(*state, FenceState::Signaled(_)) {
            return Err(Error::InvalidState("fence already signaled"));
        }
        *state = FenceState::Signaled(status);
        self.inner.cond.notify_all();
        Ok(())
    }

    /// Block until the fence is signaled.
    pub fn wait(&self) -> FenceStatus {
        let mut state = self.lock();
        loop {
            if let FenceState::Signaled(status) = *state {
                return status;
            }
            state = self
                .inner
                .cond
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Block until the fence is signaled or `timeout` elapses. Returns
    /// `None` on timeout. Deadline enforcement belongs to the calling layer;
    /// the core itself always uses unbounded waits.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FenceStatus> {
        let deadline = std::time::Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if let FenceState::Signaled(status) = *state {
                return Some(status);
            }
            let now = std::time::Instant::now();
            if now >= deadline {
                return None;
            }
            let (guard, _) = self
                .inner
                .cond
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    pub fn is_signaled(&self) -> bool {
        matches!(*self.lock(), FenceState::Signaled(_))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FenceState> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Fence {
    fn default() -> Self {
        Fence::new()
    }
}

impl fmt::Debug for Fence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fence")
            .field("signaled", &self.is_signaled())
            .finish()
    }
}
