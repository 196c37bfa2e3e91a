//! Small shared helpers: temp-file naming and worker-pool primitives.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

use crate::Error;

/// Generates a collision-resistant temp file name, always `tmp`-prefixed.
///
/// The prefix is load-bearing: resume scans treat every `tmp*` name in a
/// staging directory as removable garbage.
pub(crate) fn tmp_fname(hint: &str) -> String {
    let rnd: u32 = rand::random();
    format!("tmp_{hint}_{rnd:08x}")
}

/// Counting semaphore gating pending worker-pool submissions.
pub(crate) struct Semaphore {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        Self {
            permits: Mutex::new(permits),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn acquire(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        while *permits == 0 {
            permits = self.cv.wait(permits).unwrap_or_else(|e| e.into_inner());
        }
        *permits -= 1;
    }

    pub(crate) fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(|e| e.into_inner());
        *permits += 1;
        self.cv.notify_one();
    }
}

/// First-failure latch shared between a dispatcher and its workers.
///
/// The first worker to fail stores its error; the dispatcher polls
/// `is_set` before each new submission and stops dispatching. In-flight
/// tasks run to completion.
pub(crate) struct FailLatch {
    failed: AtomicBool,
    slot: Mutex<Option<Error>>,
}

impl FailLatch {
    pub(crate) fn new() -> Self {
        Self {
            failed: AtomicBool::new(false),
            slot: Mutex::new(None),
        }
    }

    pub(crate) fn is_set(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, err: Error) {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(err);
        }
        self.failed.store(true, Ordering::Release);
    }

    /// Takes the stored error, if any.
    pub(crate) fn take(&self) -> Option<Error> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}
