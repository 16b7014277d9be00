use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::memory::GuestMemory;
use crate::monitor::ExclusiveMonitor;
use crate::scheduler::{self, SchedulerGuard, SchedulerLock};
use crate::thread::{Thread, ThreadState, WakeResult};
use crate::time::TimeManager;

/// The emulator kernel's shared core: guest memory, the exclusive monitor,
/// the scheduler lock, and the wakeup timer.
///
/// One `Kernel` per emulated system. Synchronization objects such as the
/// address arbiter hold an `Arc<Kernel>` and reach their collaborators
/// through it.
pub struct Kernel {
    memory: Arc<dyn GuestMemory>,
    monitor: Arc<dyn ExclusiveMonitor>,
    scheduler: Arc<SchedulerLock>,
    time: TimeManager,
    next_thread_id: AtomicU64,
}

impl Kernel {
    pub fn new(memory: Arc<dyn GuestMemory>, monitor: Arc<dyn ExclusiveMonitor>) -> Arc<Self> {
        let scheduler = Arc::new(SchedulerLock::new());
        let time = TimeManager::start(scheduler.clone());
        Arc::new(Self {
            memory,
            monitor,
            scheduler,
            time,
            next_thread_id: AtomicU64::new(1),
        })
    }

    pub fn memory(&self) -> &dyn GuestMemory {
        &*self.memory
    }

    pub fn monitor(&self) -> &dyn ExclusiveMonitor {
        &*self.monitor
    }

    pub fn time(&self) -> &TimeManager {
        &self.time
    }

    pub fn lock_scheduler(&self) -> SchedulerGuard<'_> {
        self.scheduler.lock()
    }

    /// Creates a guest thread pinned to `core` with the given priority
    /// (higher values wake first).
    pub fn create_thread(&self, core: usize, priority: u32) -> Arc<Thread> {
        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        Thread::new(id, core, priority)
    }

    /// The guest thread bound to the calling host thread.
    ///
    /// Panics if no [`ThreadActivation`](crate::scheduler::ThreadActivation)
    /// is in scope; entering the kernel without one is a dispatch-layer bug.
    pub fn current_thread(&self) -> Arc<Thread> {
        scheduler::current_thread().expect("no guest thread is active on this host thread")
    }

    /// Monitor slot to use for exclusive accesses issued on this host thread.
    /// Host-side service contexts without an active guest thread share slot 0.
    pub(crate) fn current_core(&self) -> usize {
        scheduler::current_thread().map(|t| t.core()).unwrap_or(0)
    }

    /// Marks `thread` for termination and forces it out of any wait.
    ///
    /// A thread parked on a synchronization object observes
    /// `TerminationRequested` as its wait result and unlinks its own wait
    /// record on the way out.
    pub fn request_termination(&self, thread: &Arc<Thread>) {
        let _sl = self.lock_scheduler();
        thread.mark_termination_requested();
        if thread.state() == ThreadState::Waiting {
            debug!(thread = thread.id(), "terminating a waiting thread");
            thread.set_wake_result(WakeResult::TerminationRequested);
            thread.wakeup();
        }
    }
}
