//! Kernel-side synchronization core for a guest-OS emulator.
//!
//! This crate implements the rendezvous point between guest userspace
//! atomics and the emulator kernel's thread scheduler: the **address
//! arbiter**, plus the collaborators it needs to run on a host machine.
//!
//! ## Architecture Overview
//!
//! - **Address arbiter** ([`AddressArbiter`]): guest threads block on a
//!   32-bit word of their own address space and are woken by signal
//!   operations, a timeout, or termination. Waiters are held in an ordered
//!   tree keyed by `(address, priority)`, highest priority first, FIFO
//!   within a priority.
//! - **Scheduler lock** ([`scheduler`]): one process-wide lock serializes
//!   every thread-state transition and every wait-tree mutation. The scoped
//!   lock-and-sleep guard atomically publishes a thread as blocked and
//!   releases the lock on scope exit.
//! - **Exclusive monitor** ([`monitor`]): per-core load/store-exclusive
//!   reservations giving the arbiter its cross-core compare-and-swap. Lost
//!   reservations are retried, never reported.
//! - **Wakeup timer** ([`time`]): a background timer thread delivers
//!   timed-out wakeups under the scheduler lock, with idempotent
//!   cancellation.
//!
//! ## Thread Safety
//!
//! All public APIs are safe for concurrent use from multiple host threads,
//! each driving one emulated core. Blocking happens on the calling host
//! thread; signal operations never suspend.

pub mod arbiter;
pub mod error;
pub mod kernel;
pub mod memory;
pub mod monitor;
pub mod scheduler;
pub mod thread;
pub mod time;

pub use arbiter::AddressArbiter;
pub use error::{MemoryError, SvcError, SvcResult};
pub use kernel::Kernel;
pub use memory::{GuestMemory, LinearMemory};
pub use monitor::{ExclusiveMonitor, ReservationMonitor};
pub use scheduler::{SchedulerGuard, SchedulerLock, SchedulerLockAndSleep, ThreadActivation};
pub use thread::{Thread, ThreadState, WaitReason, WakeResult};
pub use time::TimeManager;
