//! # VM service object
//!
//! [`Vm`] owns the four subsystems and is the only thing the rest of the
//! kernel talks to. It is constructed once at startup — before any user
//! process runs — and passed by reference into the trap and syscall glue;
//! there are no global tables and no teardown during normal operation.

use crate::frame::FrameTable;
use crate::page::{PageSource, SupplementalPageTable};
use crate::platform::{
    BlockDevice, FileHandle, FileStore, HardwarePageTable, PageAllocator, PhysMapper, ProcessId,
};
use crate::swap::SwapStore;
use crate::VmError;
use alloc::collections::BTreeMap;
use kernel_addresses::{VirtualAddress, VirtualPage, PAGE_SIZE};
use kernel_sync::SpinLock;

/// Tunables fixed at subsystem startup.
#[derive(Debug, Clone, Copy)]
pub struct VmConfig {
    /// Exclusive upper bound of user-space addresses.
    pub user_top: VirtualAddress,

    /// Maximum stack size; the stack region floor sits this many bytes
    /// below [`user_top`](Self::user_top).
    pub max_stack_bytes: u64,

    /// How far below the captured stack pointer an access may land and
    /// still count as stack growth. This bound comes from the calling
    /// convention's largest single push below the stack pointer and must
    /// be validated against the target architecture.
    pub stack_slop_bytes: u64,
}

impl VmConfig {
    /// Lowest address the stack region may ever grow down to.
    #[inline]
    #[must_use]
    pub const fn stack_floor(&self) -> VirtualAddress {
        VirtualAddress::new(self.user_top.as_u64() - self.max_stack_bytes)
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            user_top: VirtualAddress::new(0x0000_8000_0000_0000),
            max_stack_bytes: 8 * 1024 * 1024,
            stack_slop_bytes: 32,
        }
    }
}

/// Counters exported through [`Vm::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VmStats {
    pub page_faults: u64,
    pub lazy_loads: u64,
    pub stack_growths: u64,
    pub evictions: u64,
    pub real_faults: u64,
}

/// How a file-backed region behaves once mapped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileBackedKind {
    /// Read-only executable text.
    Code,
    /// Private writable data: diverges to swap once dirtied.
    Data,
    /// Shared mapping: dirty pages go back to the file.
    Mmap,
}

/// Everything guarded by the frame-table lock: the frame table itself,
/// the hardware page table and allocator handles it drives, every
/// process's supplemental table, and the counters.
///
/// Keeping the supplemental tables in here is deliberate: eviction
/// mutates the *victim's* table while some other process faults, and
/// this lock is the one guard against the victim's own fault handler.
pub(crate) struct VmState<H, A> {
    pub(crate) hw: H,
    pub(crate) alloc: A,
    pub(crate) frames: FrameTable,
    pub(crate) procs: BTreeMap<ProcessId, SupplementalPageTable>,
    pub(crate) stats: VmStats,
}

/// Lock-free collaborator bundle threaded through the frame/fault paths.
pub(crate) struct Backends<'a, M, F, D> {
    pub(crate) phys: &'a M,
    pub(crate) files: &'a SpinLock<F>,
    pub(crate) swap: &'a SwapStore<D>,
}

/// The virtual-memory manager.
pub struct Vm<H, A, M, F, D> {
    pub(crate) state: SpinLock<VmState<H, A>>,
    swap: SwapStore<D>,
    files: SpinLock<F>,
    phys: M,
    pub(crate) config: VmConfig,
}

impl<H, A, M, F, D> Vm<H, A, M, F, D>
where
    H: HardwarePageTable,
    A: PageAllocator,
    M: PhysMapper,
    F: FileStore,
    D: BlockDevice,
{
    /// Wire the subsystem up. `device` becomes the swap region.
    pub fn new(config: VmConfig, hw: H, alloc: A, phys: M, files: F, device: D) -> Self {
        Self {
            state: SpinLock::new(VmState {
                hw,
                alloc,
                frames: FrameTable::default(),
                procs: BTreeMap::new(),
                stats: VmStats::default(),
            }),
            swap: SwapStore::new(device),
            files: SpinLock::new(files),
            phys,
            config,
        }
    }

    #[must_use]
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// The swap store (slot accounting is visible to the embedder).
    #[must_use]
    pub const fn swap(&self) -> &SwapStore<D> {
        &self.swap
    }

    /// The file-access lock. Syscall code that reads or writes backing
    /// files directly must serialize through this same lock.
    #[must_use]
    pub const fn files(&self) -> &SpinLock<F> {
        &self.files
    }

    #[must_use]
    pub fn stats(&self) -> VmStats {
        self.state.lock().stats
    }

    pub(crate) const fn backends(&self) -> Backends<'_, M, F, D> {
        Backends {
            phys: &self.phys,
            files: &self.files,
            swap: &self.swap,
        }
    }

    /// Create the (empty) supplemental table for a new process.
    ///
    /// # Panics
    ///
    /// If `owner` is already registered.
    pub fn register_process(&self, owner: ProcessId) {
        let mut st = self.state.lock();
        let previous = st.procs.insert(owner, SupplementalPageTable::new());
        assert!(previous.is_none(), "{owner} registered twice");
    }

    /// Whole-process teardown: release every resident frame the process
    /// still owns (skipping pointless swap preservation), then drop its
    /// supplemental table, returning swap slots to the store.
    ///
    /// Calling this for an unknown (or already torn down) process is a
    /// no-op, so a defensive double call cannot double-free anything.
    pub fn teardown_process(&self, owner: ProcessId) {
        let io = self.backends();
        let mut st = self.state.lock();
        if !st.procs.contains_key(&owner) {
            return;
        }
        for page in st.frames.pages_mapped_by(owner) {
            if let Err(error) = st.release_mapping(owner, page, true, &io) {
                // Reclaim the frame even when exit writeback fails; the
                // process is gone either way.
                log::error!("exit writeback for {owner} {page} failed: {error}");
                if let Some(frame) = st.hw.translate(owner, page) {
                    st.discard_frame(frame);
                }
            }
        }
        let mut table = st.procs.remove(&owner).expect("checked above");
        table.clear_all(io.swap);
        log::trace!("{owner} torn down");
    }

    /// Declare a lazily-loaded file range: full pages, then one partial
    /// tail page whose remainder is zero-filled on load. Nothing is read
    /// until the pages fault in. Returns the number of pages declared.
    ///
    /// # Panics
    ///
    /// If `owner` is unregistered, `length` is zero, or the range
    /// overlaps an existing declaration — region setup must never
    /// overlap, so these are caller bugs.
    pub fn map_file_region(
        &self,
        owner: ProcessId,
        base: VirtualPage,
        file: FileHandle,
        offset: u64,
        length: u64,
        kind: FileBackedKind,
    ) -> u64 {
        assert!(length > 0, "empty file region");
        let page_count = length.div_ceil(PAGE_SIZE);

        let mut st = self.state.lock();
        let table = st
            .procs
            .get_mut(&owner)
            .unwrap_or_else(|| panic!("{owner} not registered"));
        for i in 0..page_count {
            let page_offset = offset + i * PAGE_SIZE;
            let read_size = (length - i * PAGE_SIZE).min(PAGE_SIZE) as u32;
            let source = match kind {
                FileBackedKind::Code => PageSource::Code {
                    file,
                    offset: page_offset,
                    read_size,
                },
                FileBackedKind::Data => PageSource::Data {
                    file,
                    offset: page_offset,
                    read_size,
                },
                FileBackedKind::Mmap => PageSource::Mmap {
                    file,
                    offset: page_offset,
                    read_size,
                },
            };
            table.declare(base.advance(i), source);
        }
        page_count
    }

    /// Undo `page_count` pages starting at `base`: tear down any
    /// resident frames (dirty shared mappings go back to their file) and
    /// forget the declarations (parked swap slots are released).
    ///
    /// # Errors
    ///
    /// A writeback failure aborts the walk with the remaining pages
    /// still mapped.
    ///
    /// # Panics
    ///
    /// If `owner` is unregistered or a page in the range was never
    /// declared.
    pub fn unmap_region(
        &self,
        owner: ProcessId,
        base: VirtualPage,
        page_count: u64,
    ) -> Result<(), VmError> {
        let io = self.backends();
        let mut st = self.state.lock();
        for i in 0..page_count {
            let page = base.advance(i);
            st.release_mapping(owner, page, false, &io)?;
            st.procs
                .get_mut(&owner)
                .unwrap_or_else(|| panic!("{owner} not registered"))
                .forget(page, io.swap);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn state_for_tests(&self) -> kernel_sync::SpinLockGuard<'_, VmState<H, A>> {
        self.state.lock()
    }
}
