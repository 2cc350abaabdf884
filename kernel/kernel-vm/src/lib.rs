//! # Demand-Paged Virtual Memory Core
//!
//! This crate backs user virtual pages with physical frames on demand,
//! evicts frames under memory pressure and persists evicted data to a
//! backing store (file or swap). It is the meeting point of four tightly
//! coupled pieces:
//!
//! ```text
//!                      hardware page fault
//!                              │
//!                              ▼
//!                   ┌─────────────────────┐
//!                   │ Page-Fault Resolver │  classify: lazy load?
//!                   │      (fault)        │  stack growth? real fault?
//!                   └──────┬───────┬──────┘
//!                          │       │
//!             lookup/update│       │acquire/release frames
//!                          ▼       ▼
//!        ┌────────────────────┐  ┌───────────────────┐
//!        │ Supplemental Page  │  │    Frame Table    │  clock eviction,
//!        │   Table (page)     │◄─┤      (frame)      │  pin/unpin,
//!        └────────────────────┘  └─────────┬─────────┘  writeback
//!          "how do I rebuild               │
//!           this page?"                    │ spill dirty pages
//!                                          ▼
//!                                ┌───────────────────┐
//!                                │    Swap Store     │  bitmap slots on
//!                                │      (swap)       │  a block device
//!                                └───────────────────┘
//! ```
//!
//! The [`Vm`] service object ties the pieces together and is constructed
//! once at VM-subsystem startup, then passed by reference into the trap
//! and syscall glue.
//!
//! ## What this crate does *not* do
//!
//! Process lifecycle, scheduling, the raw page-table walker, physical
//! page allocation, the file system and the block driver all live
//! elsewhere. They are consumed through the contracts in [`platform`]:
//!
//! - [`PageAllocator`] — hands out and takes back raw physical pages.
//! - [`HardwarePageTable`] — installs/clears translations and exposes
//!   the accessed/dirty bits the eviction clock feeds on.
//! - [`PhysMapper`] — direct-map access to a frame's bytes.
//! - [`FileStore`] — positional reads/writes against backing files.
//! - [`BlockDevice`] — sector I/O for the swap region.
//!
//! Hosted unit tests drive the whole core against in-memory doubles of
//! all five contracts.
//!
//! ## Locking
//!
//! Three locks, strictly ordered:
//!
//! 1. the **frame-table lock** ([`Vm`]'s state lock, which also guards
//!    every process's supplemental table — eviction may touch a *victim*
//!    process's entries while a *different* process faults),
//! 2. the **swap-bitmap lock** (inside [`SwapStore`]),
//! 3. the **file-access lock** (around the [`FileStore`] collaborator).
//!
//! Lock 1 is always taken before 2 or 3 when more than one is needed.
//! Lazy-load fills run with the target frame pinned and *without* the
//! frame-table lock, so page-in I/O does not serialize the whole VM.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod fault;
mod frame;
mod page;
pub mod platform;
mod swap;
#[cfg(test)]
mod testkit;
mod vm;

pub use fault::{FaultDescriptor, FaultFlags, FaultOutcome, RealFault};
pub use frame::FrameBacking;
pub use kernel_addresses::{
    PAGE_SHIFT, PAGE_SIZE, PhysicalAddress, PhysicalPage, VirtualAddress, VirtualPage,
};
pub use page::{PageSource, SupplementalPageTable};
pub use platform::{
    BlockDevice, FileHandle, FileStore, HardwarePageTable, PageAllocator, PhysMapper, ProcessId,
};
pub use swap::{SwapSlot, SwapStore};
pub use vm::{FileBackedKind, Vm, VmConfig, VmStats};

/// [`PAGE_SIZE`] as a `usize`, for buffer types.
pub const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// Size of one block-device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sectors occupied by one page-sized swap slot.
pub const SECTORS_PER_PAGE: usize = PAGE_BYTES / SECTOR_SIZE;

/// Fatal VM failures.
///
/// Every variant is unrecoverable for the operation that hit it: the
/// caller either kills the requesting process or treats it as a kernel
/// defect. Nothing in this crate retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// Physical memory is exhausted and a full clock cycle found no
    /// evictable frame.
    #[error("physical memory exhausted and no evictable frame")]
    OutOfMemory,

    /// The swap device has no free slot left.
    #[error("swap device full")]
    SwapExhausted,

    /// The hardware page table could not install a mapping (its own
    /// metadata allocation failed).
    #[error("hardware mapping failed")]
    MapFailed,

    /// A backing-file read or write moved fewer bytes than required.
    #[error("backing file transfer failed")]
    FileIo,
}
