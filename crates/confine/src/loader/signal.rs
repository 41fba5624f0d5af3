//! Blocking handshake cell between the guest thread and the host resolver.

use parking_lot::{Condvar, Mutex};

/// Single-slot binary semaphore.
///
/// The guest thread parks in [`wait`](Self::wait) after posting a resolution
/// request; the host calls [`notify`](Self::notify) once the response batch is
/// staged. The waiting side rearms the cell to unsignaled before returning, so
/// one cell serves every sequential `require` call an isolate makes.
#[derive(Default)]
pub struct SharedSignal {
    cell: Mutex<bool>,
    cond: Condvar,
}

impl SharedSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until signaled, then rearm.
    pub fn wait(&self) {
        let mut signaled = self.cell.lock();
        while !*signaled {
            self.cond.wait(&mut signaled);
        }
        *signaled = false;
    }

    /// Signal the cell, waking the waiter (or letting the next `wait` pass
    /// straight through if nobody is parked yet).
    pub fn notify(&self) {
        let mut signaled = self.cell.lock();
        *signaled = true;
        self.cond.notify_one();
    }
}
