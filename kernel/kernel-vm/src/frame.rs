//! # Frame Table
//!
//! Global map from physical frame to the virtual page(s) it currently
//! backs, plus the eviction machinery that frees a frame when the
//! allocator runs dry.
//!
//! Eviction is second-chance clock: candidates are visited in frame
//! order behind a cursor that persists across calls (a field of the
//! table, governed by the same lock — not a hidden static). A candidate
//! whose accessed bit is set anywhere (any user mapping, or the kernel
//! alias of the frame) gets that bit cleared and is passed over once; the
//! first fully idle, unpinned candidate is the victim. One whole cycle
//! without a victim reports [`VmError::OutOfMemory`] instead of spinning
//! — under adversarial access patterns the policy gives up rather than
//! starving the faulting thread forever.
//!
//! All operations here run under the frame-table lock; see the crate
//! docs for the lock order against the swap bitmap and file store.

use crate::page::PageSource;
use crate::platform::{
    BlockDevice, FileHandle, FileStore, HardwarePageTable, PageAllocator, PhysMapper, ProcessId,
};
use crate::swap::SwapSlot;
use crate::vm::{Backends, VmState};
use crate::VmError;
use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;
use kernel_addresses::{PhysicalPage, VirtualPage};

/// Where a frame's contents must go if it is evicted while dirty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameBacking {
    /// Read-only text. Never dirty, never written back.
    Code,

    /// Shared file mapping: `len` bytes belong at `offset` in `file`.
    Mmap {
        file: FileHandle,
        offset: u64,
        len: u32,
    },

    /// No live file backing; dirty contents spill to a swap slot chosen
    /// at eviction time.
    Swap,
}

impl FrameBacking {
    /// Persist the frame's contents according to the backing kind.
    ///
    /// `preserve` is the swap-kind decision (dirty, or RAM-only page, and
    /// the owner is not exiting); returns the slot when contents were
    /// spilled to swap so the caller can repoint the supplemental entry.
    ///
    /// Runs before any destructive step, so an `Err` leaves the frame
    /// fully intact.
    ///
    /// # Errors
    ///
    /// [`VmError::FileIo`] on a short file write, [`VmError::SwapExhausted`]
    /// when no swap slot is left.
    fn write_back<M: PhysMapper, F: FileStore, D: BlockDevice>(
        self,
        frame: PhysicalPage,
        dirty: bool,
        preserve: bool,
        io: &Backends<'_, M, F, D>,
    ) -> Result<Option<SwapSlot>, VmError> {
        // Safety: the frame is tracked by the table and the frame-table
        // lock is held; nobody else touches its bytes.
        let bytes = unsafe { io.phys.frame_bytes(frame) };
        match self {
            Self::Code => {
                assert!(!dirty, "code frames are never dirty");
                Ok(None)
            }
            Self::Mmap { file, offset, len } => {
                if dirty {
                    let written = io.files.lock().write_at(file, offset, &bytes[..len as usize]);
                    if written != len as usize {
                        return Err(VmError::FileIo);
                    }
                }
                Ok(None)
            }
            Self::Swap => {
                if preserve {
                    let slot = io.swap.allocate_slot()?;
                    io.swap.write_page(slot, bytes);
                    Ok(Some(slot))
                } else {
                    Ok(None)
                }
            }
        }
    }
}

/// One resident physical page and what maps to it.
#[derive(Debug)]
pub(crate) struct Frame {
    pub(crate) backing: FrameBacking,
    /// `(owner, virtual page)` pairs translated to this frame. The data
    /// model leaves room for sharing but this core never creates more
    /// than one; destructive paths assert exactly one.
    pub(crate) mappings: Vec<(ProcessId, VirtualPage)>,
    /// Excluded from eviction while contents are being populated.
    pub(crate) pinned: bool,
}

/// The table proper: resident frames plus the clock cursor.
#[derive(Default)]
pub(crate) struct FrameTable {
    pub(crate) entries: BTreeMap<PhysicalPage, Frame>,
    /// Clock hand: the next scan resumes at the first frame at or above
    /// this address, wrapping around.
    pub(crate) cursor: Option<PhysicalPage>,
}

impl FrameTable {
    /// Candidate frames in clock order: one full cycle starting at the
    /// cursor.
    pub(crate) fn scan_order(&self) -> Vec<PhysicalPage> {
        let mut order = Vec::with_capacity(self.entries.len());
        match self.cursor {
            Some(cursor) => {
                order.extend(self.entries.range(cursor..).map(|(page, _)| *page));
                order.extend(self.entries.range(..cursor).map(|(page, _)| *page));
            }
            None => order.extend(self.entries.keys().copied()),
        }
        order
    }

    /// Virtual pages of `owner` that are currently frame-backed.
    pub(crate) fn pages_mapped_by(&self, owner: ProcessId) -> Vec<VirtualPage> {
        self.entries
            .values()
            .flat_map(|frame| frame.mappings.iter())
            .filter(|(mapped_owner, _)| *mapped_owner == owner)
            .map(|(_, page)| *page)
            .collect()
    }
}

impl<H: HardwarePageTable, A: PageAllocator> VmState<H, A> {
    /// Obtain a frame for `(owner, page)`: straight from the allocator,
    /// or by evicting a victim when the pool is dry. The new frame is
    /// inserted pinned — the caller populates it, maps it, then unpins.
    ///
    /// # Errors
    ///
    /// Propagates eviction failure ([`VmError::OutOfMemory`] after a full
    /// fruitless clock cycle, or a writeback error for the victim).
    pub(crate) fn acquire_frame<M: PhysMapper, F: FileStore, D: BlockDevice>(
        &mut self,
        owner: ProcessId,
        page: VirtualPage,
        backing: FrameBacking,
        zero_fill: bool,
        io: &Backends<'_, M, F, D>,
    ) -> Result<PhysicalPage, VmError> {
        let frame = match self.alloc.alloc_page(zero_fill) {
            Some(frame) => frame,
            None => {
                let reused = self.evict_one(io)?;
                // Safety: just evicted; ours alone under the lock.
                let bytes = unsafe { io.phys.frame_bytes(reused) };
                if zero_fill {
                    bytes.fill(0);
                } else if cfg!(debug_assertions) {
                    // Poison so stale victim data cannot masquerade as a
                    // successful fill.
                    bytes.fill(0xCC);
                }
                reused
            }
        };

        debug_assert!(
            !self.frames.entries.contains_key(&frame),
            "allocator handed out a tracked frame"
        );
        self.frames.entries.insert(
            frame,
            Frame {
                backing,
                mappings: vec![(owner, page)],
                pinned: true,
            },
        );
        Ok(frame)
    }

    /// Second-chance scan, victim teardown, and release of the victim's
    /// physical page to the caller — one atomic unit under the
    /// frame-table lock.
    pub(crate) fn evict_one<M: PhysMapper, F: FileStore, D: BlockDevice>(
        &mut self,
        io: &Backends<'_, M, F, D>,
    ) -> Result<PhysicalPage, VmError> {
        let mut victim = None;
        for candidate in self.frames.scan_order() {
            let Some(frame) = self.frames.entries.get(&candidate) else {
                continue;
            };
            if frame.pinned {
                continue;
            }
            let mut accessed = false;
            for &(owner, page) in &frame.mappings {
                if self.hw.accessed(owner, page) {
                    accessed = true;
                }
                self.hw.set_accessed(owner, page, false);
            }
            if self.hw.kernel_accessed(candidate) {
                accessed = true;
            }
            self.hw.set_kernel_accessed(candidate, false);
            if !accessed {
                victim = Some(candidate);
                break;
            }
        }
        let Some(victim) = victim else {
            log::error!("eviction: full clock cycle found no victim");
            return Err(VmError::OutOfMemory);
        };
        self.frames.cursor = Some(victim.advance(1));

        let frame = &self.frames.entries[&victim];
        assert_eq!(
            frame.mappings.len(),
            1,
            "eviction victim with unexpected mapping count"
        );
        let backing = frame.backing;
        let (owner, page) = frame.mappings[0];

        let mut dirty = self.hw.dirty(owner, page);
        dirty |= self.hw.kernel_dirty(victim);
        self.hw.set_dirty(owner, page, false);
        self.hw.set_kernel_dirty(victim, false);

        let preserve = self.must_preserve(owner, page, dirty);
        let spilled = backing.write_back(victim, dirty, preserve, io)?;
        if let Some(slot) = spilled {
            self.repoint_to_swap(owner, page, slot);
        }
        log::debug!("eviction: {owner} loses {page} (frame {victim}, dirty {dirty})");

        self.hw.unmap(owner, page);
        self.frames.entries.remove(&victim);
        self.stats.evictions += 1;
        Ok(victim)
    }

    /// Remove the `(owner, page)` association; tear the frame down if it
    /// was the last one. Returns whether a teardown happened.
    ///
    /// `exiting` skips swap preservation — nobody will read it back.
    ///
    /// # Errors
    ///
    /// Writeback errors, with the frame left fully intact.
    pub(crate) fn release_mapping<M: PhysMapper, F: FileStore, D: BlockDevice>(
        &mut self,
        owner: ProcessId,
        page: VirtualPage,
        exiting: bool,
        io: &Backends<'_, M, F, D>,
    ) -> Result<bool, VmError> {
        let Some(frame_page) = self.hw.translate(owner, page) else {
            return Ok(false);
        };
        let frame = self
            .frames
            .entries
            .get_mut(&frame_page)
            .expect("resident page missing from frame table");
        let index = frame
            .mappings
            .iter()
            .position(|mapping| *mapping == (owner, page))
            .expect("hardware mapping unknown to frame table");

        if frame.mappings.len() > 1 {
            frame.mappings.remove(index);
            self.hw.unmap(owner, page);
            return Ok(false);
        }

        let mut dirty = self.hw.dirty(owner, page);
        dirty |= self.hw.kernel_dirty(frame_page);
        let backing = frame.backing;
        let preserve = !exiting && self.must_preserve(owner, page, dirty);
        let spilled = backing.write_back(frame_page, dirty, preserve, io)?;
        if let Some(slot) = spilled {
            self.repoint_to_swap(owner, page, slot);
        }

        self.hw.unmap(owner, page);
        self.frames.entries.remove(&frame_page);
        self.alloc.free_page(frame_page);
        Ok(true)
    }

    /// Exclude `frame` from eviction while its contents are in flight.
    pub(crate) fn set_pinned(&mut self, frame: PhysicalPage, pinned: bool) {
        self.frames
            .entries
            .get_mut(&frame)
            .expect("pin target not in frame table")
            .pinned = pinned;
    }

    /// Drop a half-built frame on a failed fault resolution: clears any
    /// mapping that made it in, returns the physical page, removes the
    /// record. The error-path twin of [`acquire_frame`](Self::acquire_frame).
    pub(crate) fn discard_frame(&mut self, frame: PhysicalPage) {
        let record = self
            .frames
            .entries
            .remove(&frame)
            .expect("discard target not in frame table");
        for &(owner, page) in &record.mappings {
            self.hw.unmap(owner, page);
        }
        self.alloc.free_page(frame);
    }

    /// Swap-kind preservation rule: hardware-dirty, or the page's only
    /// copy is RAM (`DataModified` — e.g. reloaded from swap with the
    /// slot already released), it must not be dropped even if the
    /// hardware bit is clear.
    fn must_preserve(&self, owner: ProcessId, page: VirtualPage, dirty: bool) -> bool {
        dirty
            || matches!(
                self.procs.get(&owner).and_then(|table| table.lookup(page)),
                Some(PageSource::DataModified)
            )
    }

    fn repoint_to_swap(&mut self, owner: ProcessId, page: VirtualPage, slot: SwapSlot) {
        let entry = self
            .procs
            .get_mut(&owner)
            .and_then(|table| table.lookup_mut(page))
            .expect("swapped-out page has no supplemental entry");
        *entry = PageSource::Swapped { slot };
    }
}
