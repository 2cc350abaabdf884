//! Contracts to the rest of the kernel.
//!
//! The paging core never talks to hardware or drivers directly; the
//! embedder implements these traits and hands the implementations to
//! [`Vm::new`](crate::Vm::new). The hosted test suite substitutes
//! in-memory doubles for all of them.

use crate::PAGE_BYTES;
use core::fmt;
use kernel_addresses::{PhysicalPage, VirtualPage};

/// Identifies one user process (the owner of an address space).
///
/// Owners are compared and stored by id; the core never dereferences a
/// process structure, which keeps the frame table free of pointer cycles.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ProcessId(pub u32);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

/// Identifies an open backing file in the [`FileStore`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct FileHandle(pub u32);

/// The physical page pool.
///
/// `alloc_page(true)` must return an already-zeroed page. Exhaustion is
/// an `Option`, not an error: the frame table answers it with eviction.
pub trait PageAllocator {
    fn alloc_page(&mut self, zero: bool) -> Option<PhysicalPage>;
    fn free_page(&mut self, page: PhysicalPage);
}

/// The raw hardware page-table primitives.
///
/// One implementation covers every process; all calls are keyed by the
/// owning [`ProcessId`]. Besides the user-visible translation, each
/// resident frame also has a *kernel alias* (the direct-map view the
/// kernel itself uses while filling or spilling the frame) with its own
/// accessed/dirty bits; the eviction clock must probe both sides, so the
/// alias bits are part of this contract, keyed by physical page.
pub trait HardwarePageTable {
    /// Install `owner`'s translation `page → frame`.
    ///
    /// Returns `false` when the page-table structure itself could not be
    /// grown (metadata allocation failure).
    fn map(&mut self, owner: ProcessId, page: VirtualPage, frame: PhysicalPage, writable: bool)
    -> bool;

    /// Drop `owner`'s translation for `page`. Missing translations are a
    /// no-op.
    fn unmap(&mut self, owner: ProcessId, page: VirtualPage);

    /// Current translation for `page`, if present.
    fn translate(&self, owner: ProcessId, page: VirtualPage) -> Option<PhysicalPage>;

    fn accessed(&self, owner: ProcessId, page: VirtualPage) -> bool;
    fn set_accessed(&mut self, owner: ProcessId, page: VirtualPage, value: bool);
    fn dirty(&self, owner: ProcessId, page: VirtualPage) -> bool;
    fn set_dirty(&mut self, owner: ProcessId, page: VirtualPage, value: bool);

    fn kernel_accessed(&self, frame: PhysicalPage) -> bool;
    fn set_kernel_accessed(&mut self, frame: PhysicalPage, value: bool);
    fn kernel_dirty(&self, frame: PhysicalPage) -> bool;
    fn set_kernel_dirty(&mut self, frame: PhysicalPage, value: bool);
}

/// Direct-map access to the bytes of a physical page.
pub trait PhysMapper {
    /// Borrow the frame's bytes through the kernel's direct mapping.
    ///
    /// # Safety
    ///
    /// `frame` must be a page the caller owns (allocated and tracked by
    /// the frame table, or freshly handed out by the allocator). The
    /// returned borrow is unchecked; the caller must not hold two
    /// overlapping borrows of the same frame. The core only ever touches
    /// a frame's bytes while it is pinned or while holding the
    /// frame-table lock, which makes the accesses exclusive.
    unsafe fn frame_bytes<'a>(&self, frame: PhysicalPage) -> &'a mut [u8; PAGE_BYTES];
}

/// Positional access to backing files (executables and mmap'd files).
///
/// Callers serialize all calls through the VM's file-access lock; an
/// implementation does not need internal locking. Short transfers are
/// reported through the return count, not an error type.
pub trait FileStore {
    /// File length in bytes.
    fn length(&mut self, file: FileHandle) -> u64;

    /// Read up to `buf.len()` bytes at `offset`; returns the count read.
    fn read_at(&mut self, file: FileHandle, offset: u64, buf: &mut [u8]) -> usize;

    /// Write `buf` at `offset`; returns the count written.
    fn write_at(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> usize;
}

/// Sector I/O on the swap block device.
///
/// Calls take `&self`: slot I/O may overlap across different slots, and
/// the swap store guarantees a given slot is only touched while it is
/// allocated, so implementations only need per-sector atomicity.
pub trait BlockDevice {
    /// Total number of sectors on the device.
    fn sector_count(&self) -> u64;

    fn read_sector(&self, sector: u64, buf: &mut [u8; crate::SECTOR_SIZE]);
    fn write_sector(&self, sector: u64, buf: &[u8; crate::SECTOR_SIZE]);
}
