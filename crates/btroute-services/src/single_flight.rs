//! At most one instance of an operation kind runs at a time.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

#[derive(Debug, Clone, Default)]
pub struct SingleFlight {
    state: Arc<AtomicU8>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the flag. `None` when another holder is still running.
    pub fn try_begin(&self) -> Option<FlightGuard> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| FlightGuard {
                state: self.state.clone(),
            })
    }

    pub fn is_running(&self) -> bool {
        self.state.load(Ordering::Acquire) == RUNNING
    }
}

/// Releases the flag when dropped, including on panic or task abort.
#[derive(Debug)]
pub struct FlightGuard {
    state: Arc<AtomicU8>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.state.store(IDLE, Ordering::Release);
    }
}
