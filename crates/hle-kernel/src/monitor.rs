use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::MemoryError;
use crate::memory::GuestMemory;

/// Per-core exclusive-monitor interface of the simulated CPU.
///
/// `exclusive_read32` marks a reservation for the calling core;
/// `exclusive_write32` completes it and returns `false` when the reservation
/// has been lost in the meantime (the caller retries the whole pair). A lost
/// reservation is never an error; only an inaccessible address is.
pub trait ExclusiveMonitor: Send + Sync {
    /// Begin an exclusive access: read the word and mark the reservation.
    fn exclusive_read32(&self, core: usize, addr: u64) -> Result<u32, MemoryError>;

    /// Complete an exclusive access. Returns `true` if the store was
    /// performed, `false` if the reservation was lost.
    fn exclusive_write32(&self, core: usize, addr: u64, value: u32) -> Result<bool, MemoryError>;

    /// Drop the calling core's reservation without storing.
    fn clear_exclusive(&self, core: usize);
}

/// Reservation-table monitor backing the load/store-exclusive pair.
///
/// One reservation slot per core. A successful exclusive store performs the
/// memory write while the reservation table is locked and invalidates every
/// other core's reservation on the same word, which is what makes the pair a
/// cross-core compare-and-swap.
pub struct ReservationMonitor {
    memory: Arc<dyn GuestMemory>,
    reservations: Mutex<Vec<Option<u64>>>,
}

impl ReservationMonitor {
    /// Creates a monitor for `cores` cores backed by `memory`.
    pub fn new(memory: Arc<dyn GuestMemory>, cores: usize) -> Self {
        Self {
            memory,
            reservations: Mutex::new(vec![None; cores]),
        }
    }
}

impl ExclusiveMonitor for ReservationMonitor {
    fn exclusive_read32(&self, core: usize, addr: u64) -> Result<u32, MemoryError> {
        let mut reservations = self.reservations.lock();
        let value = self.memory.read32(addr)?;
        reservations[core] = Some(addr);
        Ok(value)
    }

    fn exclusive_write32(&self, core: usize, addr: u64, value: u32) -> Result<bool, MemoryError> {
        let mut reservations = self.reservations.lock();
        if reservations[core] != Some(addr) {
            return Ok(false);
        }
        self.memory.write32(addr, value)?;
        for slot in reservations.iter_mut() {
            if *slot == Some(addr) {
                *slot = None;
            }
        }
        Ok(true)
    }

    fn clear_exclusive(&self, core: usize) {
        self.reservations.lock()[core] = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::LinearMemory;

    fn monitor() -> (Arc<LinearMemory>, ReservationMonitor) {
        let memory = Arc::new(LinearMemory::new(0x1000, 0x100));
        let monitor = ReservationMonitor::new(memory.clone() as Arc<dyn GuestMemory>, 4);
        (memory, monitor)
    }

    #[test]
    fn exclusive_pair_performs_the_store() {
        let (memory, monitor) = monitor();
        memory.write32(0x1000, 7).unwrap();

        assert_eq!(monitor.exclusive_read32(0, 0x1000).unwrap(), 7);
        assert!(monitor.exclusive_write32(0, 0x1000, 8).unwrap());
        assert_eq!(memory.read32(0x1000).unwrap(), 8);
    }

    #[test]
    fn store_without_reservation_fails() {
        let (memory, monitor) = monitor();
        assert!(!monitor.exclusive_write32(0, 0x1000, 1).unwrap());
        assert_eq!(memory.read32(0x1000).unwrap(), 0);
    }

    #[test]
    fn clear_drops_the_reservation() {
        let (_memory, monitor) = monitor();
        monitor.exclusive_read32(1, 0x1004).unwrap();
        monitor.clear_exclusive(1);
        assert!(!monitor.exclusive_write32(1, 0x1004, 1).unwrap());
    }

    #[test]
    fn winning_store_invalidates_other_cores() {
        let (_memory, monitor) = monitor();
        monitor.exclusive_read32(0, 0x1008).unwrap();
        monitor.exclusive_read32(1, 0x1008).unwrap();

        assert!(monitor.exclusive_write32(1, 0x1008, 5).unwrap());
        assert!(!monitor.exclusive_write32(0, 0x1008, 6).unwrap());
    }

    #[test]
    fn reservations_are_per_word() {
        let (_memory, monitor) = monitor();
        monitor.exclusive_read32(0, 0x1000).unwrap();
        monitor.exclusive_read32(1, 0x1004).unwrap();

        assert!(monitor.exclusive_write32(0, 0x1000, 1).unwrap());
        assert!(monitor.exclusive_write32(1, 0x1004, 2).unwrap());
    }

    #[test]
    fn unmapped_exclusive_access_reports_failure() {
        let (_memory, monitor) = monitor();
        assert!(matches!(
            monitor.exclusive_read32(0, 0x9000),
            Err(MemoryError::Unmapped { .. })
        ));
    }
}
