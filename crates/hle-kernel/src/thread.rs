use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::arbiter::WaitKey;
use crate::error::{SvcError, SvcResult};

/// Run state of a guest thread, as seen by the scheduler.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadState {
    Runnable = 0,
    Waiting = 1,
}

impl From<u8> for ThreadState {
    fn from(val: u8) -> Self {
        match val {
            1 => ThreadState::Waiting,
            _ => ThreadState::Runnable,
        }
    }
}

/// Debug annotation naming what a waiting thread is parked on.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WaitReason {
    None = 0,
    Arbitration = 1,
}

impl From<u8> for WaitReason {
    fn from(val: u8) -> Self {
        match val {
            1 => WaitReason::Arbitration,
            _ => WaitReason::None,
        }
    }
}

/// Outcome published to a waiter by whichever party woke it.
///
/// The wait prelude primes `TimedOut`; a signaller overwrites it with
/// `Success`, the termination path with `TerminationRequested`. The timer
/// leaves the primed value in place.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeResult {
    Success = 0,
    TimedOut = 1,
    TerminationRequested = 2,
}

impl WakeResult {
    /// Maps the stored outcome onto the supervisor-call result.
    pub fn into_result(self) -> SvcResult<()> {
        match self {
            WakeResult::Success => Ok(()),
            WakeResult::TimedOut => Err(SvcError::TimedOut),
            WakeResult::TerminationRequested => Err(SvcError::TerminationRequested),
        }
    }
}

impl From<u8> for WakeResult {
    fn from(val: u8) -> Self {
        match val {
            1 => WakeResult::TimedOut,
            2 => WakeResult::TerminationRequested,
            _ => WakeResult::Success,
        }
    }
}

/// A guest thread as the synchronization core sees it.
///
/// Scheduler-visible fields (`state`, `wait_result`, the arbiter slot) are
/// only mutated under the scheduler lock; the fields are atomics so the
/// owning host thread can observe them without taking it.
pub struct Thread {
    id: u64,
    core: usize,
    priority: AtomicU32,
    state: AtomicU8,
    wait_reason: AtomicU8,
    termination_requested: AtomicBool,
    wait_result: AtomicU8,
    /// `Some(key)` iff this thread is currently linked into an arbiter tree.
    pub(crate) arbiter_slot: Mutex<Option<WaitKey>>,
    /// Generation counter validating pending wakeup timers.
    pub(crate) timer_token: AtomicU64,
    parker: Parker,
}

impl Thread {
    pub(crate) fn new(id: u64, core: usize, priority: u32) -> Arc<Self> {
        Arc::new(Self {
            id,
            core,
            priority: AtomicU32::new(priority),
            state: AtomicU8::new(ThreadState::Runnable as u8),
            wait_reason: AtomicU8::new(WaitReason::None as u8),
            termination_requested: AtomicBool::new(false),
            wait_result: AtomicU8::new(WakeResult::Success as u8),
            arbiter_slot: Mutex::new(None),
            timer_token: AtomicU64::new(0),
            parker: Parker::new(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Index of the emulated core this thread runs on.
    pub fn core(&self) -> usize {
        self.core
    }

    /// Scheduler priority; higher values wake first.
    pub fn priority(&self) -> u32 {
        self.priority.load(Ordering::Relaxed)
    }

    pub fn set_priority(&self, priority: u32) {
        self.priority.store(priority, Ordering::Relaxed);
    }

    pub fn state(&self) -> ThreadState {
        self.state.load(Ordering::Acquire).into()
    }

    pub(crate) fn set_state(&self, state: ThreadState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn wait_reason(&self) -> WaitReason {
        self.wait_reason.load(Ordering::Relaxed).into()
    }

    pub(crate) fn set_wait_reason(&self, reason: WaitReason) {
        self.wait_reason.store(reason as u8, Ordering::Relaxed);
    }

    pub fn is_termination_requested(&self) -> bool {
        self.termination_requested.load(Ordering::Acquire)
    }

    pub(crate) fn mark_termination_requested(&self) {
        self.termination_requested.store(true, Ordering::Release);
    }

    pub(crate) fn set_wake_result(&self, result: WakeResult) {
        self.wait_result.store(result as u8, Ordering::Release);
    }

    pub(crate) fn wake_result(&self) -> WakeResult {
        self.wait_result.load(Ordering::Acquire).into()
    }

    /// Transitions the thread out of `Waiting` and unparks it.
    ///
    /// Caller holds the scheduler lock. Only the first wake after a park
    /// takes effect; later calls are no-ops.
    pub(crate) fn wakeup(&self) {
        if self
            .state
            .compare_exchange(
                ThreadState::Waiting as u8,
                ThreadState::Runnable as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.set_wait_reason(WaitReason::None);
            self.parker.unpark();
        }
    }

    /// Blocks the host thread until `wakeup` is delivered.
    ///
    /// Called without any kernel lock held; a wake that raced ahead of the
    /// park is not lost.
    pub(crate) fn park(&self) {
        self.parker.park();
    }
}

/// Condvar-backed one-shot park/unpark pair.
struct Parker {
    signaled: Mutex<bool>,
    cvar: Condvar,
}

impl Parker {
    fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cvar: Condvar::new(),
        }
    }

    fn park(&self) {
        let mut signaled = self.signaled.lock();
        while !*signaled {
            self.cvar.wait(&mut signaled);
        }
        *signaled = false;
    }

    fn unpark(&self) {
        let mut signaled = self.signaled.lock();
        *signaled = true;
        self.cvar.notify_one();
    }
}
