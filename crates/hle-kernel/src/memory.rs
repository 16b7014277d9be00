use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::MemoryError;

/// 32-bit guest memory access as the kernel sees it.
///
/// Implementations must be safe to call from any emulated core concurrently;
/// word accesses are atomic with respect to each other.
pub trait GuestMemory: Send + Sync {
    /// Non-exclusive 32-bit read.
    fn read32(&self, addr: u64) -> Result<u32, MemoryError>;

    /// Non-exclusive 32-bit write.
    fn write32(&self, addr: u64, value: u32) -> Result<(), MemoryError>;
}

/// Flat guest RAM: a contiguous range of 32-bit words starting at `base`.
///
/// Accesses outside the range or off word alignment fail; in-range accesses
/// go through atomic words so racing cores observe whole values.
pub struct LinearMemory {
    base: u64,
    words: Vec<AtomicU32>,
}

impl LinearMemory {
    /// Creates a zeroed region of `len_bytes` (rounded down to whole words)
    /// mapped at `base`. `base` must be 4-byte aligned.
    pub fn new(base: u64, len_bytes: usize) -> Self {
        assert!(base % 4 == 0, "region base must be word aligned");
        let words = (0..len_bytes / 4).map(|_| AtomicU32::new(0)).collect();
        Self { base, words }
    }

    /// Base address of the mapped range.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Size of the mapped range in bytes.
    pub fn len_bytes(&self) -> usize {
        self.words.len() * 4
    }

    fn word(&self, addr: u64) -> Result<&AtomicU32, MemoryError> {
        if addr % 4 != 0 {
            return Err(MemoryError::Unaligned { addr });
        }
        let offset = addr
            .checked_sub(self.base)
            .ok_or(MemoryError::Unmapped { addr })?;
        self.words
            .get((offset / 4) as usize)
            .ok_or(MemoryError::Unmapped { addr })
    }
}

impl GuestMemory for LinearMemory {
    fn read32(&self, addr: u64) -> Result<u32, MemoryError> {
        Ok(self.word(addr)?.load(Ordering::SeqCst))
    }

    fn write32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.word(addr)?.store(value, Ordering::SeqCst);
        Ok(())
    }
}
