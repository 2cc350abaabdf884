//! # Swap Store
//!
//! Fixed-size overflow storage for evicted pages that have no live file
//! backing. The block device is carved into page-sized slots; slot `i`
//! owns sectors `[i * SECTORS_PER_PAGE, (i + 1) * SECTORS_PER_PAGE)`.
//! A slot is a single bit of state: free or allocated. There is no
//! compaction and no growth; a full device is a fatal condition.
//!
//! The bitmap has its own lock with short critical sections. Sector I/O
//! happens outside that lock — overlapping transfers on *different*
//! slots are fine, and a given slot is only ever read or written while
//! it is allocated, so its sectors cannot be concurrently reused.

use crate::platform::BlockDevice;
use crate::{PAGE_BYTES, SECTOR_SIZE, SECTORS_PER_PAGE, VmError};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use kernel_sync::SpinLock;

/// Index of one page-sized slot in the swap region.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct SwapSlot(u32);

impl SwapSlot {
    #[inline]
    #[must_use]
    pub const fn index(self) -> u32 {
        self.0
    }

    /// First sector of this slot on the device.
    #[inline]
    #[must_use]
    const fn first_sector(self) -> u64 {
        self.0 as u64 * SECTORS_PER_PAGE as u64
    }
}

impl fmt::Display for SwapSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot {}", self.0)
    }
}

/// Free/allocated state of every slot, one bit each.
struct Bitmap {
    words: Vec<u64>,
    len: usize,
}

impl Bitmap {
    fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)],
            len,
        }
    }

    fn get(&self, bit: usize) -> bool {
        debug_assert!(bit < self.len);
        self.words[bit / 64] & (1 << (bit % 64)) != 0
    }

    fn set(&mut self, bit: usize, value: bool) {
        debug_assert!(bit < self.len);
        if value {
            self.words[bit / 64] |= 1 << (bit % 64);
        } else {
            self.words[bit / 64] &= !(1 << (bit % 64));
        }
    }

    /// First-fit: find the lowest clear bit, set it, return its index.
    fn scan_and_flip(&mut self) -> Option<usize> {
        for (i, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = (!*word).trailing_zeros() as usize;
                let index = i * 64 + bit;
                if index >= self.len {
                    return None;
                }
                *word |= 1 << bit;
                return Some(index);
            }
        }
        None
    }

    fn count_set(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }
}

/// Bitmap-indexed slot storage on a block device.
pub struct SwapStore<D> {
    device: D,
    map: SpinLock<Bitmap>,
}

impl<D: BlockDevice> SwapStore<D> {
    /// Carve `device` into as many whole page-sized slots as fit.
    pub fn new(device: D) -> Self {
        let slots = device.sector_count() / SECTORS_PER_PAGE as u64;
        let slots = usize::try_from(slots).unwrap_or(usize::MAX);
        Self {
            device,
            map: SpinLock::new(Bitmap::new(slots)),
        }
    }

    /// Total number of slots on the device.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.map.lock().len
    }

    /// Number of currently allocated slots.
    #[must_use]
    pub fn allocated_count(&self) -> usize {
        self.map.lock().count_set()
    }

    /// Whether `slot` is currently allocated.
    #[must_use]
    pub fn is_allocated(&self, slot: SwapSlot) -> bool {
        self.map.lock().get(slot.index() as usize)
    }

    /// Claim a free slot.
    ///
    /// # Errors
    ///
    /// [`VmError::SwapExhausted`] when the device is full; the caller
    /// must treat this as fatal.
    pub fn allocate_slot(&self) -> Result<SwapSlot, VmError> {
        let index = self.map.lock().scan_and_flip();
        index.map_or(Err(VmError::SwapExhausted), |index| {
            Ok(SwapSlot(index as u32))
        })
    }

    /// Return `slot` to the free pool.
    ///
    /// # Panics
    ///
    /// If `slot` is not currently allocated — freeing a free slot means
    /// two owners believed they held it.
    pub fn free_slot(&self, slot: SwapSlot) {
        let mut map = self.map.lock();
        assert!(
            map.get(slot.index() as usize),
            "freeing unallocated swap {slot}"
        );
        map.set(slot.index() as usize, false);
    }

    /// Write one page of bytes into `slot`.
    pub fn write_page(&self, slot: SwapSlot, bytes: &[u8; PAGE_BYTES]) {
        debug_assert!(self.is_allocated(slot), "writing unallocated swap {slot}");
        let mut sector_buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            sector_buf.copy_from_slice(&bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            self.device
                .write_sector(slot.first_sector() + i as u64, &sector_buf);
        }
    }

    /// Read `slot` back into `bytes`.
    ///
    /// # Panics
    ///
    /// If `slot` is not currently allocated.
    pub fn read_page(&self, slot: SwapSlot, bytes: &mut [u8; PAGE_BYTES]) {
        assert!(self.is_allocated(slot), "reading unallocated swap {slot}");
        let mut sector_buf = [0u8; SECTOR_SIZE];
        for i in 0..SECTORS_PER_PAGE {
            self.device
                .read_sector(slot.first_sector() + i as u64, &mut sector_buf);
            bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector_buf);
        }
    }
}
