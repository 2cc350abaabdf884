//! # Supplemental Page Table
//!
//! Per-process record of how to rebuild every declared virtual page that
//! is not currently resident. The hardware page table only knows about
//! resident pages; this table is the authoritative answer to "what do I
//! put in a frame when this page faults in?".
//!
//! Exactly one entry exists per declared page. A page with no entry and
//! no stack-growth claim is an illegal address. Entries are created when
//! a segment is loaded, a file is mapped or the stack grows; they mutate
//! when the page is evicted or reloaded; they die on unmap or process
//! exit (returning their swap slot first).

use crate::frame::FrameBacking;
use crate::platform::{BlockDevice, FileHandle};
use crate::swap::{SwapSlot, SwapStore};
use alloc::collections::BTreeMap;
use kernel_addresses::VirtualPage;

/// Where a non-resident page's contents come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSource {
    /// Read-only executable text: `read_size` bytes at `offset`, rest
    /// zero. Never written back anywhere.
    Code {
        file: FileHandle,
        offset: u64,
        read_size: u32,
    },

    /// Shared file mapping: loads like [`Code`](Self::Code) but is
    /// writable, and dirty contents go back to the file.
    Mmap {
        file: FileHandle,
        offset: u64,
        read_size: u32,
    },

    /// Private writable segment data: first load comes from the file,
    /// but once dirtied the file is no longer the truth — eviction moves
    /// the page to swap instead.
    Data {
        file: FileHandle,
        offset: u64,
        read_size: u32,
    },

    /// A resident page whose only copy is RAM: it was reloaded from
    /// swap (the slot is released at reload) or its file origin has been
    /// overwritten. Evicting it must spill to swap even if the hardware
    /// dirty bit is clear.
    DataModified,

    /// Stack page: zero-filled on first touch.
    Stack,

    /// Currently parked in a swap slot.
    Swapped { slot: SwapSlot },
}

impl PageSource {
    /// Whether the page's mapping is installed writable.
    #[inline]
    #[must_use]
    pub const fn writable(&self) -> bool {
        !matches!(self, Self::Code { .. })
    }

    /// The frame backing that a frame holding this page gets: where the
    /// contents must go if the frame is evicted dirty.
    #[must_use]
    pub(crate) const fn backing(&self) -> FrameBacking {
        match *self {
            Self::Code { .. } => FrameBacking::Code,
            Self::Mmap {
                file,
                offset,
                read_size,
            } => FrameBacking::Mmap {
                file,
                offset,
                len: read_size,
            },
            Self::Data { .. } | Self::DataModified | Self::Stack | Self::Swapped { .. } => {
                FrameBacking::Swap
            }
        }
    }
}

/// One process's page-recoverability map.
#[derive(Default)]
pub struct SupplementalPageTable {
    entries: BTreeMap<VirtualPage, PageSource>,
}

impl SupplementalPageTable {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Record how `page` is materialized.
    ///
    /// # Panics
    ///
    /// If `page` is already declared. Segment and mmap setup never
    /// overlap regions; a duplicate is a caller bug, not a runtime
    /// condition.
    pub fn declare(&mut self, page: VirtualPage, source: PageSource) {
        let previous = self.entries.insert(page, source);
        assert!(previous.is_none(), "duplicate declaration for {page}");
    }

    /// Pure read. `None` means the page was never declared — the fault
    /// resolver treats that as "maybe stack growth", not as an error.
    #[must_use]
    pub fn lookup(&self, page: VirtualPage) -> Option<&PageSource> {
        self.entries.get(&page)
    }

    pub(crate) fn lookup_mut(&mut self, page: VirtualPage) -> Option<&mut PageSource> {
        self.entries.get_mut(&page)
    }

    /// Drop `page`'s entry, returning its swap slot to `swap` first if
    /// it was parked there.
    ///
    /// # Panics
    ///
    /// If `page` was never declared — callers must know whether a page
    /// exists before forgetting it.
    pub fn forget<D: BlockDevice>(&mut self, page: VirtualPage, swap: &SwapStore<D>) {
        let source = self
            .entries
            .remove(&page)
            .unwrap_or_else(|| panic!("forgetting undeclared {page}"));
        if let PageSource::Swapped { slot } = source {
            swap.free_slot(slot);
        }
    }

    /// Bulk teardown on process exit: every swapped entry's slot goes
    /// back to the store and the table empties. Must run *after* the
    /// process's resident frames are torn down — a resident page is
    /// never `Swapped`, so ordering the frames first means no slot is
    /// handled twice.
    pub fn clear_all<D: BlockDevice>(&mut self, swap: &SwapStore<D>) {
        for (_, source) in core::mem::take(&mut self.entries) {
            if let PageSource::Swapped { slot } = source {
                swap.free_slot(slot);
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate declared pages in address order.
    pub fn iter(&self) -> impl Iterator<Item = (VirtualPage, &PageSource)> {
        self.entries.iter().map(|(page, source)| (*page, source))
    }
}
