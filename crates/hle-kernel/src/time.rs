use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::scheduler::SchedulerLock;
use crate::thread::{Thread, ThreadState};

/// Deadline-driven wakeup service for sleeping threads.
///
/// One background timer thread serves a deadline-ordered set of pending
/// wakeups. Expiry delivery takes the scheduler lock and wakes the target
/// only if its timer token still matches and it is still `Waiting`; the
/// wait prelude's primed timed-out result then surfaces to the waiter.
/// `unschedule_wakeup` is idempotent and also invalidates an expiry that is
/// already in flight.
pub struct TimeManager {
    shared: Arc<TimerShared>,
    worker: Option<JoinHandle<()>>,
}

struct TimerShared {
    state: Mutex<TimerState>,
    cvar: Condvar,
    epoch: Instant,
    scheduler: Arc<SchedulerLock>,
}

struct TimerState {
    /// Pending wakeups keyed by `(deadline_ns, seq)`.
    queue: BTreeMap<(u64, u64), PendingWakeup>,
    /// Reverse index: thread id to its queue key.
    by_thread: HashMap<u64, (u64, u64)>,
    next_seq: u64,
    shutdown: bool,
}

struct PendingWakeup {
    thread: Weak<Thread>,
    token: u64,
}

impl TimeManager {
    pub(crate) fn start(scheduler: Arc<SchedulerLock>) -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                queue: BTreeMap::new(),
                by_thread: HashMap::new(),
                next_seq: 0,
                shutdown: false,
            }),
            cvar: Condvar::new(),
            epoch: Instant::now(),
            scheduler,
        });
        let worker_shared = shared.clone();
        let worker = std::thread::Builder::new()
            .name("hle-timer".into())
            .spawn(move || worker_shared.run())
            .expect("failed to spawn the wakeup timer thread");
        Self {
            shared,
            worker: Some(worker),
        }
    }

    /// Monotonic kernel clock, nanoseconds since kernel start.
    pub fn now_ns(&self) -> u64 {
        self.shared.now_ns()
    }

    /// Arms (or re-arms) the wakeup timer for `thread`.
    pub(crate) fn schedule_wakeup(&self, thread: &Arc<Thread>, deadline_ns: u64) {
        let token = thread.timer_token.fetch_add(1, Ordering::AcqRel) + 1;
        let mut state = self.shared.state.lock();
        if let Some(key) = state.by_thread.remove(&thread.id()) {
            state.queue.remove(&key);
        }
        let key = (deadline_ns, state.next_seq);
        state.next_seq += 1;
        state.queue.insert(
            key,
            PendingWakeup {
                thread: Arc::downgrade(thread),
                token,
            },
        );
        state.by_thread.insert(thread.id(), key);
        drop(state);
        self.shared.cvar.notify_all();
    }

    /// Cancels any pending wakeup for `thread`. Safe to call when none is
    /// armed or when the deadline already fired.
    pub(crate) fn unschedule_wakeup(&self, thread: &Arc<Thread>) {
        thread.timer_token.fetch_add(1, Ordering::AcqRel);
        let mut state = self.shared.state.lock();
        if let Some(key) = state.by_thread.remove(&thread.id()) {
            state.queue.remove(&key);
        }
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.shared.state.lock().queue.len()
    }
}

impl Drop for TimeManager {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.cvar.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

impl TimerShared {
    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }

    fn run(self: Arc<Self>) {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                break;
            }

            let now = self.now_ns();
            let due: Vec<(u64, u64)> = state
                .queue
                .range(..=(now, u64::MAX))
                .map(|(key, _)| *key)
                .collect();

            if !due.is_empty() {
                let mut expired = Vec::with_capacity(due.len());
                for key in due {
                    if let Some(pending) = state.queue.remove(&key) {
                        expired.push(pending);
                    }
                    state.by_thread.retain(|_, v| *v != key);
                }
                // Deliver without the timer lock; delivery takes the
                // scheduler lock and the lock order is scheduler first.
                drop(state);
                for pending in expired {
                    self.deliver(pending);
                }
                state = self.state.lock();
                continue;
            }

            match state.queue.keys().next().copied() {
                None => {
                    self.cvar.wait(&mut state);
                }
                Some((deadline_ns, _)) => {
                    let wait = Duration::from_nanos(deadline_ns.saturating_sub(now));
                    let _ = self.cvar.wait_for(&mut state, wait);
                }
            }
        }
    }

    fn deliver(&self, pending: PendingWakeup) {
        let Some(thread) = pending.thread.upgrade() else {
            return;
        };
        let _sl = self.scheduler.lock();
        if thread.timer_token.load(Ordering::Acquire) != pending.token {
            // Cancelled or re-armed after this expiry was queued.
            return;
        }
        if thread.state() == ThreadState::Waiting {
            trace!(thread = thread.id(), "wakeup deadline expired");
            thread.wakeup();
        }
    }
}
