use std::cell::RefCell;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::kernel::Kernel;
use crate::thread::Thread;

/// The process-wide scheduler lock.
///
/// Every thread-state transition and every wait-tree mutation happens while
/// this lock is held. Lock order: scheduler lock, then any per-structure
/// mutex (wait tree, arbiter slot, timer state); nothing suspends while
/// holding it except the release-and-park performed by
/// [`SchedulerLockAndSleep`] on scope exit.
pub struct SchedulerLock {
    inner: Mutex<()>,
}

impl SchedulerLock {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(()),
        }
    }

    pub fn lock(&self) -> SchedulerGuard<'_> {
        SchedulerGuard {
            _token: self.inner.lock(),
        }
    }
}

/// RAII token proving the scheduler lock is held.
pub struct SchedulerGuard<'a> {
    _token: MutexGuard<'a, ()>,
}

thread_local! {
    static CURRENT_THREAD: RefCell<Option<Arc<Thread>>> = const { RefCell::new(None) };
}

/// Binds a guest thread to the calling host thread for the guard's lifetime.
///
/// The system-call dispatch layer establishes one of these before forwarding
/// into the kernel; tests bind it explicitly. Nested activations restore the
/// previous binding on drop.
pub struct ThreadActivation {
    prev: Option<Arc<Thread>>,
}

impl ThreadActivation {
    pub fn new(thread: Arc<Thread>) -> Self {
        let prev = CURRENT_THREAD.with(|slot| slot.borrow_mut().replace(thread));
        Self { prev }
    }
}

impl Drop for ThreadActivation {
    fn drop(&mut self) {
        let prev = self.prev.take();
        CURRENT_THREAD.with(|slot| *slot.borrow_mut() = prev);
    }
}

/// The guest thread bound to the calling host thread, if any.
pub(crate) fn current_thread() -> Option<Arc<Thread>> {
    CURRENT_THREAD.with(|slot| slot.borrow().clone())
}

/// Scoped scheduler lock that puts the current thread to sleep on scope exit.
///
/// Unless [`cancel_sleep`](Self::cancel_sleep) was called, dropping the guard
/// publishes the wakeup deadline to the time manager (finite timeouts only),
/// releases the scheduler lock, and parks the calling host thread until a
/// wake is delivered. With the sleep cancelled, dropping simply releases the
/// lock.
pub struct SchedulerLockAndSleep<'a> {
    kernel: &'a Kernel,
    thread: &'a Arc<Thread>,
    timeout_ns: i64,
    guard: Option<SchedulerGuard<'a>>,
    cancelled: bool,
}

impl<'a> SchedulerLockAndSleep<'a> {
    /// Acquires the scheduler lock. `timeout_ns` follows the guest ABI:
    /// zero never sleeps, negative means no deadline.
    pub fn new(kernel: &'a Kernel, thread: &'a Arc<Thread>, timeout_ns: i64) -> Self {
        let guard = kernel.lock_scheduler();
        Self {
            kernel,
            thread,
            timeout_ns,
            guard: Some(guard),
            cancelled: false,
        }
    }

    /// Skips the deferred sleep; the drop will only release the lock.
    pub fn cancel_sleep(&mut self) {
        self.cancelled = true;
    }
}

impl Drop for SchedulerLockAndSleep<'_> {
    fn drop(&mut self) {
        if self.cancelled {
            self.guard.take();
            return;
        }
        if self.timeout_ns >= 0 {
            let deadline_ns = self
                .kernel
                .time()
                .now_ns()
                .saturating_add(self.timeout_ns as u64);
            self.kernel.time().schedule_wakeup(self.thread, deadline_ns);
        }
        // Release the lock, then block. The parker absorbs a wake that lands
        // in between.
        self.guard.take();
        self.thread.park();
    }
}
