//! # Page-Fault Resolver
//!
//! Interrupt-time entry point. The trap stub captures the faulting
//! address and error word with interrupts disabled, re-enables them, and
//! calls [`Vm::handle_page_fault`]; everything here runs preemptibly in
//! the faulting thread and relies on the VM locks, not interrupt
//! disabling.
//!
//! Each fault is classified once and then driven to a terminal state:
//!
//! ```text
//! CLASSIFY ──► LAZY_LOAD     declared page: fill a pinned frame from
//!        │                   file or swap, map, resume
//!        ├───► STACK_GROWTH  undeclared, just below the stack pointer
//!        │                   inside the stack region: install a zeroed
//!        │                   page, declare it, resume
//!        └───► REAL_FAULT    everything else: report and let the glue
//!                            kill the process (or flag a kernel defect)
//! ```
//!
//! Failures mid-transition roll the partial frame/entry state back and
//! fall through to the real-fault report; nothing half-built survives.

use crate::page::PageSource;
use crate::platform::{
    BlockDevice, FileStore, HardwarePageTable, PageAllocator, PhysMapper, ProcessId,
};
use crate::vm::{Backends, Vm, VmState};
use crate::VmError;
use core::fmt;
use kernel_addresses::{PhysicalPage, VirtualAddress, VirtualPage};
use kernel_sync::SpinLockGuard;

bitflags::bitflags! {
    /// Decoded hardware page-fault error word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FaultFlags: u32 {
        /// Set: the translation was present and the access violated its
        /// rights. Clear: no translation existed.
        const PRESENT = 1 << 0;
        /// The faulting access was a write.
        const WRITE = 1 << 1;
        /// The fault originated in user mode.
        const USER = 1 << 2;
    }
}

/// Everything the resolver needs to know about one fault, captured by
/// the trap stub.
#[derive(Debug, Clone, Copy)]
pub struct FaultDescriptor {
    /// The accessed address — not necessarily the faulting instruction.
    pub addr: VirtualAddress,
    /// User stack pointer at fault time, for the stack-growth check.
    pub stack_pointer: VirtualAddress,
    pub flags: FaultFlags,
    /// The syscall layer was deliberately touching user memory from
    /// kernel mode; a miss is the user's fault, not the kernel's.
    pub sanctioned_kernel_access: bool,
}

impl FaultDescriptor {
    #[inline]
    #[must_use]
    pub const fn not_present(&self) -> bool {
        !self.flags.contains(FaultFlags::PRESENT)
    }

    #[inline]
    #[must_use]
    pub const fn write(&self) -> bool {
        self.flags.contains(FaultFlags::WRITE)
    }

    #[inline]
    #[must_use]
    pub const fn user(&self) -> bool {
        self.flags.contains(FaultFlags::USER)
    }
}

/// Terminal description of an unresolvable fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RealFault {
    pub addr: VirtualAddress,
    pub not_present: bool,
    pub write: bool,
    pub user: bool,
}

impl RealFault {
    const fn from_descriptor(fault: &FaultDescriptor) -> Self {
        Self {
            addr: fault.addr,
            not_present: fault.not_present(),
            write: fault.write(),
            user: fault.user(),
        }
    }
}

impl fmt::Display for RealFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "page fault at {}: {} error {} page in {} context",
            self.addr,
            if self.not_present { "not present" } else { "rights violation" },
            if self.write { "writing" } else { "reading" },
            if self.user { "user" } else { "kernel" },
        )
    }
}

/// What the trap glue must do after resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultOutcome {
    /// Mapping installed; retry the faulting instruction.
    Resolved,
    /// Illegal user access: terminate the faulting process.
    UserFault(RealFault),
    /// Unsanctioned fault in kernel mode: an unrecoverable kernel defect.
    KernelFault(RealFault),
    /// Resource exhaustion or collaborator failure; not survivable for
    /// the requester.
    Fatal(VmError),
}

impl<H, A, M, F, D> Vm<H, A, M, F, D>
where
    H: HardwarePageTable,
    A: PageAllocator,
    M: PhysMapper,
    F: FileStore,
    D: BlockDevice,
{
    /// Resolve one hardware page fault for `owner`.
    pub fn handle_page_fault(&self, owner: ProcessId, fault: &FaultDescriptor) -> FaultOutcome {
        log::trace!(
            "page fault: {owner} at {} (sp {}, {:?})",
            fault.addr,
            fault.stack_pointer,
            fault.flags
        );
        let io = self.backends();
        let mut st = self.state.lock();
        st.stats.page_faults += 1;

        // A write to a present read-only page is never resolvable, and
        // neither is a kernel-mode miss outside a sanctioned window.
        if !fault.not_present() {
            return real_fault(&mut st, fault);
        }
        if !fault.user() && !fault.sanctioned_kernel_access {
            return real_fault(&mut st, fault);
        }

        let page = fault.addr.page();
        let declared = st
            .procs
            .get(&owner)
            .and_then(|table| table.lookup(page))
            .copied();

        match declared {
            Some(source) => self.lazy_load(st, owner, page, source, fault, &io),
            None if self.is_stack_growth(fault) => self.grow_stack(&mut st, owner, page, fault, &io),
            None => real_fault(&mut st, fault),
        }
    }

    /// Undeclared page: a stack-growth candidate only if it sits inside
    /// the stack region and at most `stack_slop_bytes` below the stack
    /// pointer (accesses at or above the pointer always qualify — a push
    /// touches strictly at or just below the current top of stack).
    fn is_stack_growth(&self, fault: &FaultDescriptor) -> bool {
        let addr = fault.addr.as_u64();
        if addr >= self.config.user_top.as_u64() || addr < self.config.stack_floor().as_u64() {
            return false;
        }
        let sp = fault.stack_pointer.as_u64();
        sp <= addr || sp - addr <= self.config.stack_slop_bytes
    }

    /// LAZY_LOAD: acquire a pinned frame, fill it from the declared
    /// source, then map and publish it.
    fn lazy_load(
        &self,
        mut st: SpinLockGuard<'_, VmState<H, A>>,
        owner: ProcessId,
        page: VirtualPage,
        source: PageSource,
        fault: &FaultDescriptor,
        io: &Backends<'_, M, F, D>,
    ) -> FaultOutcome {
        let zero = matches!(source, PageSource::Stack);
        let frame = match st.acquire_frame(owner, page, source.backing(), zero, io) {
            Ok(frame) => frame,
            Err(error) => {
                log::error!("no frame for {owner} {page}: {error}");
                return FaultOutcome::Fatal(error);
            }
        };

        // The frame is pinned and unmapped: eviction cannot take it and
        // nobody else can see it, so the fill may run preemptibly
        // without the frame-table lock.
        drop(st);
        // Safety: pinned frame, exclusively ours until mapped.
        let bytes = unsafe { io.phys.frame_bytes(frame) };
        let filled = match source {
            PageSource::Code {
                file,
                offset,
                read_size,
            }
            | PageSource::Mmap {
                file,
                offset,
                read_size,
            }
            | PageSource::Data {
                file,
                offset,
                read_size,
            } => {
                let wanted = read_size as usize;
                let read = io.files.lock().read_at(file, offset, &mut bytes[..wanted]);
                if read == wanted {
                    bytes[wanted..].fill(0);
                    Ok(())
                } else {
                    Err(VmError::FileIo)
                }
            }
            PageSource::Swapped { slot } => {
                io.swap.read_page(slot, bytes);
                Ok(())
            }
            // Zeroed at acquisition.
            PageSource::Stack => Ok(()),
            PageSource::DataModified => {
                unreachable!("a RAM-only page cannot be non-resident")
            }
        };

        let mut st = self.state.lock();
        if let Err(error) = filled {
            log::warn!("filling {page} for {owner} failed: {error}");
            st.discard_frame(frame);
            return real_fault(&mut st, fault);
        }
        if let PageSource::Swapped { slot } = source {
            // The slot goes back to the store; RAM is the only copy now.
            io.swap.free_slot(slot);
            let entry = st
                .procs
                .get_mut(&owner)
                .and_then(|table| table.lookup_mut(page))
                .expect("faulting page lost its supplemental entry");
            *entry = PageSource::DataModified;
        }
        if !st.hw.map(owner, page, frame, source.writable()) {
            st.discard_frame(frame);
            log::error!("installing {page} for {owner} failed");
            return FaultOutcome::Fatal(VmError::MapFailed);
        }
        publish(&mut st, owner, page, frame);
        st.stats.lazy_loads += 1;
        FaultOutcome::Resolved
    }

    /// STACK_GROWTH: a zeroed swap-backed frame plus a fresh `Stack`
    /// declaration, all under the frame-table lock (no I/O on the happy
    /// path).
    fn grow_stack(
        &self,
        st: &mut VmState<H, A>,
        owner: ProcessId,
        page: VirtualPage,
        fault: &FaultDescriptor,
        io: &Backends<'_, M, F, D>,
    ) -> FaultOutcome {
        if !st.procs.contains_key(&owner) {
            return real_fault(st, fault);
        }
        let frame = match st.acquire_frame(owner, page, crate::frame::FrameBacking::Swap, true, io)
        {
            Ok(frame) => frame,
            Err(error) => {
                log::error!("no frame for {owner} stack {page}: {error}");
                return FaultOutcome::Fatal(error);
            }
        };
        st.procs
            .get_mut(&owner)
            .expect("checked above")
            .declare(page, PageSource::Stack);
        if !st.hw.map(owner, page, frame, true) {
            st.procs
                .get_mut(&owner)
                .expect("checked above")
                .forget(page, io.swap);
            st.discard_frame(frame);
            log::error!("installing stack {page} for {owner} failed");
            return FaultOutcome::Fatal(VmError::MapFailed);
        }
        publish(st, owner, page, frame);
        st.stats.stack_growths += 1;
        log::trace!("stack grown: {owner} gains {page}");
        FaultOutcome::Resolved
    }
}

/// Freshly installed mappings start with clean history: accessed and
/// dirty cleared on both the user mapping and the kernel alias, then the
/// frame becomes evictable.
fn publish<H: HardwarePageTable, A: PageAllocator>(
    st: &mut VmState<H, A>,
    owner: ProcessId,
    page: VirtualPage,
    frame: PhysicalPage,
) {
    st.hw.set_accessed(owner, page, false);
    st.hw.set_dirty(owner, page, false);
    st.hw.set_kernel_accessed(frame, false);
    st.hw.set_kernel_dirty(frame, false);
    st.set_pinned(frame, false);
}

fn real_fault<H: HardwarePageTable, A: PageAllocator>(
    st: &mut VmState<H, A>,
    fault: &FaultDescriptor,
) -> FaultOutcome {
    st.stats.real_faults += 1;
    let report = RealFault::from_descriptor(fault);
    if fault.user() || fault.sanctioned_kernel_access {
        log::warn!("{report}");
        FaultOutcome::UserFault(report)
    } else {
        log::error!("{report}");
        FaultOutcome::KernelFault(report)
    }
}
