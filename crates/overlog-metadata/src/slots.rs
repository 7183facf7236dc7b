//! Free-slot tracking for directory entries
//!
//! Uses one bit per slot: 0 = free, 1 = used. Allocation always returns
//! the lowest free slot, so a freed slot is the next one handed out when
//! every slot below it is taken.

use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};

/// Bitmap of occupied directory slots
pub struct SlotBitmap {
    /// Bitmap data
    data: RwLock<Vec<u8>>,
    /// Total number of slots
    capacity: u32,
    /// Number of free slots (cached)
    free: AtomicU32,
}

impl SlotBitmap {
    /// Create a bitmap of `capacity` slots, all free
    #[must_use]
    pub fn new(capacity: u32) -> Self {
        Self {
            data: RwLock::new(vec![0u8; capacity.div_ceil(8) as usize]),
            capacity,
            free: AtomicU32::new(capacity),
        }
    }

    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    #[must_use]
    pub fn free_count(&self) -> u32 {
        self.free.load(Ordering::Relaxed)
    }

    const fn locate(slot: u32) -> (usize, u8) {
        ((slot / 8) as usize, 1 << (slot % 8))
    }

    /// Check if a slot is in use; out-of-range slots count as used
    #[must_use]
    pub fn is_used(&self, slot: u32) -> bool {
        if slot >= self.capacity {
            return true;
        }
        let (byte, mask) = Self::locate(slot);
        self.data.read()[byte] & mask != 0
    }

    /// Allocate the lowest free slot
    pub fn allocate(&self) -> Option<u32> {
        let mut data = self.data.write();
        let slot = (0..self.capacity).find(|&slot| {
            let (byte, mask) = Self::locate(slot);
            data[byte] & mask == 0
        })?;
        let (byte, mask) = Self::locate(slot);
        data[byte] |= mask;
        self.free.fetch_sub(1, Ordering::Relaxed);
        Some(slot)
    }

    /// Mark a specific slot as used; returns false if it already was
    pub fn mark_used(&self, slot: u32) -> bool {
        if slot >= self.capacity {
            return false;
        }
        let (byte, mask) = Self::locate(slot);
        let mut data = self.data.write();
        if data[byte] & mask != 0 {
            return false;
        }
        data[byte] |= mask;
        self.free.fetch_sub(1, Ordering::Relaxed);
        true
    }

    /// Return a slot to the free pool; returns false if it was not in use
    pub fn free(&self, slot: u32) -> bool {
        if slot >= self.capacity {
            return false;
        }
        let (byte, mask) = Self::locate(slot);
        let mut data = self.data.write();
        if data[byte] & mask == 0 {
            return false;
        }
        data[byte] &= !mask;
        self.free.fetch_add(1, Ordering::Relaxed);
        true
    }
}
