use thiserror::Error;

/// Result alias for supervisor-call level kernel operations.
pub type SvcResult<T> = Result<T, SvcError>;

/// Error kinds surfaced by kernel synchronization calls.
///
/// A successful wait or signal is `Ok`; everything else maps onto one of the
/// guest-visible result codes below.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SvcError {
    /// Guest memory at the target address could not be accessed.
    #[error("guest memory at the target address is inaccessible")]
    InvalidCurrentMemory,
    /// The guest word did not satisfy the operation's predicate; the guest
    /// must re-check and retry.
    #[error("the value at the target address did not match")]
    InvalidState,
    /// The wait reached its deadline without a wake.
    #[error("the wait timed out")]
    TimedOut,
    /// The calling thread was torn down before or during the wait.
    #[error("termination was requested for the calling thread")]
    TerminationRequested,
}

/// Guest-memory access failures reported by the memory subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum MemoryError {
    /// No mapping covers the requested address.
    #[error("unmapped guest address {addr:#x}")]
    Unmapped { addr: u64 },
    /// 32-bit accesses must be 4-byte aligned.
    #[error("unaligned 32-bit guest access at {addr:#x}")]
    Unaligned { addr: u64 },
}

impl From<MemoryError> for SvcError {
    fn from(_: MemoryError) -> Self {
        SvcError::InvalidCurrentMemory
    }
}
