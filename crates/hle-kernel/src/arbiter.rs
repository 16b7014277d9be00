use std::cmp::Ordering as CmpOrdering;
use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::error::{SvcError, SvcResult};
use crate::kernel::Kernel;
use crate::memory::GuestMemory;
use crate::monitor::ExclusiveMonitor;
use crate::scheduler::SchedulerLockAndSleep;
use crate::thread::{Thread, ThreadState, WaitReason, WakeResult};

/// Sort key for parked waiters.
///
/// Ordered by address ascending, then priority descending (higher numeric
/// priority wakes first), then insertion sequence so equal-priority waiters
/// wake FIFO. For a given address the smallest key is therefore the next
/// thread to wake.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WaitKey {
    pub(crate) addr: u64,
    pub(crate) priority: u32,
    pub(crate) seq: u64,
}

impl WaitKey {
    /// Lower bound covering every waiter parked on `addr`.
    fn first_for(addr: u64) -> Self {
        Self {
            addr,
            priority: u32::MAX,
            seq: 0,
        }
    }
}

impl Ord for WaitKey {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.addr
            .cmp(&other.addr)
            .then_with(|| other.priority.cmp(&self.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for WaitKey {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

struct WaitTree {
    entries: BTreeMap<WaitKey, Arc<Thread>>,
    next_seq: u64,
}

impl WaitTree {
    fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            next_seq: 0,
        }
    }

    /// Next thread to wake on `addr`, if any.
    fn front(&self, addr: u64) -> Option<(WaitKey, &Arc<Thread>)> {
        self.entries
            .range(WaitKey::first_for(addr)..)
            .next()
            .filter(|(key, _)| key.addr == addr)
            .map(|(key, thread)| (*key, thread))
    }
}

/// Rendezvous point between guest-memory atomics and the thread scheduler.
///
/// Guest threads block here on a 32-bit word of their address space and are
/// woken by signal operations, a timeout, or termination. All tree mutations
/// and wake transitions happen under the kernel's scheduler lock; the tree
/// mutex below is only ever taken while that lock is held.
pub struct AddressArbiter {
    kernel: Arc<Kernel>,
    tree: Mutex<WaitTree>,
}

impl AddressArbiter {
    pub fn new(kernel: Arc<Kernel>) -> Self {
        Self {
            kernel,
            tree: Mutex::new(WaitTree::new()),
        }
    }

    /// Wakes up to `count` waiters parked on `addr` (`count <= 0` wakes all).
    /// Returns the number of threads woken.
    pub fn signal(&self, addr: u64, count: i32) -> SvcResult<usize> {
        let _sl = self.kernel.lock_scheduler();
        let mut tree = self.tree.lock();
        Ok(wake_waiters(&mut tree, addr, count))
    }

    /// Atomically bumps `*addr` from `value` to `value + 1`, then wakes up to
    /// `count` waiters. Fails with `InvalidState` (and wakes nobody) when the
    /// observed value differs.
    pub fn signal_and_increment_if_equal(
        &self,
        addr: u64,
        value: i32,
        count: i32,
    ) -> SvcResult<usize> {
        let _sl = self.kernel.lock_scheduler();

        let user_value = update_if_equal(
            &self.kernel,
            self.kernel.current_core(),
            addr,
            value,
            value.wrapping_add(1),
        )?;
        if user_value != value {
            return Err(SvcError::InvalidState);
        }

        let mut tree = self.tree.lock();
        Ok(wake_waiters(&mut tree, addr, count))
    }

    /// Updates `*addr` based on how many threads are parked on it, then wakes
    /// up to `count` waiters.
    ///
    /// The new value encodes the guest convention: with no waiters the word
    /// is incremented (fast path may continue); waking everyone (`count <=
    /// 0`) decrements by two (contended, slow-path wake); waking a bounded
    /// batch decrements by one only if the batch covers every waiter.
    pub fn signal_and_modify_by_waiting_count_if_equal(
        &self,
        addr: u64,
        value: i32,
        count: i32,
    ) -> SvcResult<usize> {
        let _sl = self.kernel.lock_scheduler();
        let mut tree = self.tree.lock();

        let new_value = {
            let mut waiters = tree
                .entries
                .range(WaitKey::first_for(addr)..)
                .take_while(|(key, _)| key.addr == addr);
            let has_waiters = waiters.next().is_some();

            if count <= 0 {
                if has_waiters {
                    value.wrapping_sub(2)
                } else {
                    value.wrapping_add(1)
                }
            } else if has_waiters {
                let mut extra = 0;
                for _ in waiters {
                    if extra >= count {
                        break;
                    }
                    extra += 1;
                }
                if extra < count {
                    value.wrapping_sub(1)
                } else {
                    value
                }
            } else {
                value.wrapping_add(1)
            }
        };

        let user_value = if new_value != value {
            update_if_equal(
                &self.kernel,
                self.kernel.current_core(),
                addr,
                value,
                new_value,
            )?
        } else {
            read_from_user(&self.kernel, addr)?
        };
        if user_value != value {
            return Err(SvcError::InvalidState);
        }

        Ok(wake_waiters(&mut tree, addr, count))
    }

    /// Blocks the current thread on `addr` while `*addr < value`, optionally
    /// decrementing the word first. `timeout_ns` of zero never blocks;
    /// negative waits without a deadline.
    pub fn wait_if_less_than(
        &self,
        addr: u64,
        value: i32,
        decrement: bool,
        timeout_ns: i64,
    ) -> SvcResult<()> {
        let thread = self.kernel.current_thread();

        {
            let mut slp = SchedulerLockAndSleep::new(&self.kernel, &thread, timeout_ns);

            if thread.is_termination_requested() {
                slp.cancel_sleep();
                return Err(SvcError::TerminationRequested);
            }

            thread.set_wake_result(WakeResult::TimedOut);

            let read = if decrement {
                decrement_if_less_than(&self.kernel, thread.core(), addr, value)
            } else {
                read_from_user(&self.kernel, addr)
            };
            let user_value = match read {
                Ok(user_value) => user_value,
                Err(err) => {
                    slp.cancel_sleep();
                    return Err(err);
                }
            };

            if user_value >= value {
                slp.cancel_sleep();
                return Err(SvcError::InvalidState);
            }
            if timeout_ns == 0 {
                slp.cancel_sleep();
                return Err(SvcError::TimedOut);
            }

            self.insert_waiter(&thread, addr);
        }

        self.finish_wait(&thread)
    }

    /// Blocks the current thread on `addr` while `*addr == value`.
    /// `timeout_ns` of zero never blocks; negative waits without a deadline.
    pub fn wait_if_equal(&self, addr: u64, value: i32, timeout_ns: i64) -> SvcResult<()> {
        let thread = self.kernel.current_thread();

        {
            let mut slp = SchedulerLockAndSleep::new(&self.kernel, &thread, timeout_ns);

            if thread.is_termination_requested() {
                slp.cancel_sleep();
                return Err(SvcError::TerminationRequested);
            }

            thread.set_wake_result(WakeResult::TimedOut);

            let user_value = match read_from_user(&self.kernel, addr) {
                Ok(user_value) => user_value,
                Err(err) => {
                    slp.cancel_sleep();
                    return Err(err);
                }
            };

            if user_value != value {
                slp.cancel_sleep();
                return Err(SvcError::InvalidState);
            }
            if timeout_ns == 0 {
                slp.cancel_sleep();
                return Err(SvcError::TimedOut);
            }

            self.insert_waiter(&thread, addr);
        }

        self.finish_wait(&thread)
    }

    /// Number of threads currently parked on `addr`. Test and introspection
    /// aid; the count is stale the moment the scheduler lock is released.
    pub fn waiter_count(&self, addr: u64) -> usize {
        let _sl = self.kernel.lock_scheduler();
        self.tree
            .lock()
            .entries
            .range(WaitKey::first_for(addr)..)
            .take_while(|(key, _)| key.addr == addr)
            .count()
    }

    /// Links the current thread into the tree and parks it logically.
    /// Caller holds the scheduler lock; the host thread blocks at guard drop.
    fn insert_waiter(&self, thread: &Arc<Thread>, addr: u64) {
        let mut tree = self.tree.lock();
        let key = WaitKey {
            addr,
            priority: thread.priority(),
            seq: tree.next_seq,
        };
        tree.next_seq += 1;
        tree.entries.insert(key, thread.clone());
        *thread.arbiter_slot.lock() = Some(key);
        thread.set_state(ThreadState::Waiting);
        thread.set_wait_reason(WaitReason::Arbitration);
    }

    /// Post-sleep cleanup: cancel the timer and, if no signaller unlinked the
    /// record (timeout or termination wake), unlink it here.
    fn finish_wait(&self, thread: &Arc<Thread>) -> SvcResult<()> {
        self.kernel.time().unschedule_wakeup(thread);

        {
            let _sl = self.kernel.lock_scheduler();
            let mut tree = self.tree.lock();
            let mut slot = thread.arbiter_slot.lock();
            if let Some(key) = slot.take() {
                tree.entries.remove(&key);
            }
        }

        thread.wake_result().into_result()
    }
}

/// Common signal tail: wake waiters on `addr` in tree order until the budget
/// is exhausted (`count <= 0` means all). Caller holds the scheduler lock.
fn wake_waiters(tree: &mut WaitTree, addr: u64, count: i32) -> usize {
    let mut woken: usize = 0;
    while count <= 0 || woken < count as usize {
        let Some((key, thread)) = tree.front(addr) else {
            break;
        };
        let thread = thread.clone();
        thread.set_wake_result(WakeResult::Success);
        debug_assert_eq!(thread.wait_reason(), WaitReason::Arbitration);
        thread.wakeup();
        tree.entries.remove(&key);
        *thread.arbiter_slot.lock() = None;
        woken += 1;
    }
    if woken > 0 {
        trace!(addr, woken, "woke address arbiter waiters");
    }
    woken
}

/// Plain (non-exclusive) signed read of the guest word.
fn read_from_user(kernel: &Kernel, addr: u64) -> SvcResult<i32> {
    Ok(kernel.memory().read32(addr)? as i32)
}

/// Exclusive read/decrement pair: if `*addr < value`, store `*addr - 1`.
/// A lost reservation restarts the pair; the pre-write value is returned
/// either way.
fn decrement_if_less_than(kernel: &Kernel, core: usize, addr: u64, value: i32) -> SvcResult<i32> {
    let monitor = kernel.monitor();
    loop {
        let current = monitor.exclusive_read32(core, addr)? as i32;
        if current < value {
            if monitor.exclusive_write32(core, addr, current.wrapping_sub(1) as u32)? {
                return Ok(current);
            }
            continue;
        }
        monitor.clear_exclusive(core);
        return Ok(current);
    }
}

/// Exclusive compare-and-swap: if `*addr == value`, store `new_value`.
/// A lost reservation restarts the pair; the observed value is returned
/// either way.
fn update_if_equal(
    kernel: &Kernel,
    core: usize,
    addr: u64,
    value: i32,
    new_value: i32,
) -> SvcResult<i32> {
    let monitor = kernel.monitor();
    loop {
        let current = monitor.exclusive_read32(core, addr)? as i32;
        if current == value {
            if monitor.exclusive_write32(core, addr, new_value as u32)? {
                return Ok(current);
            }
            continue;
        }
        monitor.clear_exclusive(core);
        return Ok(current);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::error::MemoryError;
    use crate::memory::{GuestMemory, LinearMemory};
    use crate::monitor::{ExclusiveMonitor, ReservationMonitor};
    use crate::scheduler::ThreadActivation;

    const BASE: u64 = 0x1000;
    const WORD: u64 = BASE + 0x10;

    fn fixture() -> (Arc<LinearMemory>, Arc<Kernel>, AddressArbiter) {
        let memory = Arc::new(LinearMemory::new(BASE, 0x100));
        let monitor = Arc::new(ReservationMonitor::new(
            memory.clone() as Arc<dyn GuestMemory>,
            2,
        ));
        let kernel = Kernel::new(memory.clone(), monitor);
        let arbiter = AddressArbiter::new(kernel.clone());
        (memory, kernel, arbiter)
    }

    #[test]
    fn wait_key_orders_high_priority_first_then_fifo() {
        let low = WaitKey {
            addr: WORD,
            priority: 10,
            seq: 0,
        };
        let high = WaitKey {
            addr: WORD,
            priority: 30,
            seq: 1,
        };
        let high_later = WaitKey {
            addr: WORD,
            priority: 30,
            seq: 2,
        };
        let other_addr = WaitKey {
            addr: WORD + 4,
            priority: u32::MAX,
            seq: 0,
        };

        assert!(high < low);
        assert!(high < high_later);
        assert!(high_later < low);
        assert!(low < other_addr);
        assert!(WaitKey::first_for(WORD) <= high);
    }

    #[test]
    fn zero_timeout_wait_never_blocks() {
        let (_memory, kernel, arbiter) = fixture();
        let thread = kernel.create_thread(0, 10);
        let _activation = ThreadActivation::new(thread);

        assert_eq!(arbiter.wait_if_equal(WORD, 0, 0), Err(SvcError::TimedOut));
        assert_eq!(arbiter.waiter_count(WORD), 0);
    }

    #[test]
    fn wait_if_equal_rejects_mismatched_value() {
        let (_memory, kernel, arbiter) = fixture();
        let thread = kernel.create_thread(0, 10);
        let _activation = ThreadActivation::new(thread);

        assert_eq!(
            arbiter.wait_if_equal(WORD, 7, 1_000_000_000),
            Err(SvcError::InvalidState)
        );
        assert_eq!(arbiter.waiter_count(WORD), 0);
    }

    #[test]
    fn wait_on_unmapped_memory_fails() {
        let (_memory, kernel, arbiter) = fixture();
        let thread = kernel.create_thread(0, 10);
        let _activation = ThreadActivation::new(thread);

        assert_eq!(
            arbiter.wait_if_equal(0x9000, 0, 1_000_000_000),
            Err(SvcError::InvalidCurrentMemory)
        );
        assert_eq!(
            arbiter.wait_if_less_than(0x9000, 1, true, 1_000_000_000),
            Err(SvcError::InvalidCurrentMemory)
        );
    }

    #[test]
    fn decrement_applies_before_the_zero_timeout_return() {
        let (memory, kernel, arbiter) = fixture();
        let thread = kernel.create_thread(0, 10);
        let _activation = ThreadActivation::new(thread);

        memory.write32(WORD, 3).unwrap();
        assert_eq!(
            arbiter.wait_if_less_than(WORD, 5, true, 0),
            Err(SvcError::TimedOut)
        );
        assert_eq!(memory.read32(WORD).unwrap(), 2);
    }

    #[test]
    fn rejected_predicate_leaves_the_word_untouched() {
        let (memory, kernel, arbiter) = fixture();
        let thread = kernel.create_thread(0, 10);
        let _activation = ThreadActivation::new(thread);

        memory.write32(WORD, 9).unwrap();
        assert_eq!(
            arbiter.wait_if_less_than(WORD, 5, true, 1_000_000_000),
            Err(SvcError::InvalidState)
        );
        assert_eq!(memory.read32(WORD).unwrap(), 9);
    }

    #[test]
    fn less_than_comparison_is_signed() {
        let (memory, kernel, arbiter) = fixture();
        let thread = kernel.create_thread(0, 10);
        let _activation = ThreadActivation::new(thread);

        memory.write32(WORD, -5i32 as u32).unwrap();
        assert_eq!(
            arbiter.wait_if_less_than(WORD, 0, true, 0),
            Err(SvcError::TimedOut)
        );
        assert_eq!(memory.read32(WORD).unwrap() as i32, -6);
    }

    #[test]
    fn signal_with_no_waiters_wakes_nobody() {
        let (_memory, _kernel, arbiter) = fixture();
        assert_eq!(arbiter.signal(WORD, 1), Ok(0));
        assert_eq!(arbiter.signal(WORD, -1), Ok(0));
    }

    #[test]
    fn increment_if_equal_updates_and_reports_mismatch() {
        let (memory, _kernel, arbiter) = fixture();

        assert_eq!(arbiter.signal_and_increment_if_equal(WORD, 0, 10), Ok(0));
        assert_eq!(memory.read32(WORD).unwrap(), 1);

        assert_eq!(
            arbiter.signal_and_increment_if_equal(WORD, 9, 10),
            Err(SvcError::InvalidState)
        );
        assert_eq!(memory.read32(WORD).unwrap(), 1);

        assert_eq!(
            arbiter.signal_and_increment_if_equal(0x9000, 0, 10),
            Err(SvcError::InvalidCurrentMemory)
        );
    }

    #[test]
    fn modify_by_waiting_count_increments_when_nobody_waits() {
        let (memory, _kernel, arbiter) = fixture();

        assert_eq!(
            arbiter.signal_and_modify_by_waiting_count_if_equal(WORD, 0, 2),
            Ok(0)
        );
        assert_eq!(memory.read32(WORD).unwrap(), 1);

        assert_eq!(
            arbiter.signal_and_modify_by_waiting_count_if_equal(WORD, 1, -1),
            Ok(0)
        );
        assert_eq!(memory.read32(WORD).unwrap(), 2);

        assert_eq!(
            arbiter.signal_and_modify_by_waiting_count_if_equal(WORD, 7, 2),
            Err(SvcError::InvalidState)
        );
        assert_eq!(memory.read32(WORD).unwrap(), 2);
    }

    /// Monitor wrapper that loses the reservation a fixed number of times.
    struct FlakyMonitor {
        inner: ReservationMonitor,
        failures: AtomicUsize,
    }

    impl ExclusiveMonitor for FlakyMonitor {
        fn exclusive_read32(&self, core: usize, addr: u64) -> Result<u32, MemoryError> {
            self.inner.exclusive_read32(core, addr)
        }

        fn exclusive_write32(
            &self,
            core: usize,
            addr: u64,
            value: u32,
        ) -> Result<bool, MemoryError> {
            let stole = self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if stole {
                self.inner.clear_exclusive(core);
                return Ok(false);
            }
            self.inner.exclusive_write32(core, addr, value)
        }

        fn clear_exclusive(&self, core: usize) {
            self.inner.clear_exclusive(core);
        }
    }

    #[test]
    fn spurious_store_failures_are_retried_not_reported() {
        let memory = Arc::new(LinearMemory::new(BASE, 0x100));
        let monitor = Arc::new(FlakyMonitor {
            inner: ReservationMonitor::new(memory.clone() as Arc<dyn GuestMemory>, 2),
            failures: AtomicUsize::new(3),
        });
        let kernel = Kernel::new(memory.clone(), monitor);
        let arbiter = AddressArbiter::new(kernel.clone());

        assert_eq!(arbiter.signal_and_increment_if_equal(WORD, 0, 1), Ok(0));
        assert_eq!(memory.read32(WORD).unwrap(), 1);

        let thread = kernel.create_thread(0, 10);
        let _activation = ThreadActivation::new(thread);
        memory.write32(WORD, 3).unwrap();
        assert_eq!(
            arbiter.wait_if_less_than(WORD, 5, true, 0),
            Err(SvcError::TimedOut)
        );
        assert_eq!(memory.read32(WORD).unwrap(), 2);
    }
}
