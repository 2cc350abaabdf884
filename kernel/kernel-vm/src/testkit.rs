//! In-memory doubles for every platform contract, plus a pre-wired
//! [`Harness`]. Physical RAM is a vector of page buffers, the hardware
//! page table is a recording map, the allocator is a free list with a
//! failure toggle, files and the swap device are byte vectors.
//!
//! The doubles hand out `Rc`-shared handles so a test can keep poking
//! at (and asserting on) state after moving the doubles into the [`Vm`].

use crate::platform::{
    BlockDevice, FileHandle, FileStore, HardwarePageTable, PageAllocator, PhysMapper, ProcessId,
};
use crate::vm::{Vm, VmConfig};
use crate::{PAGE_BYTES, SECTOR_SIZE, SECTORS_PER_PAGE};
use kernel_addresses::{PhysicalAddress, PhysicalPage, VirtualPage, PAGE_SHIFT};
use std::cell::{RefCell, UnsafeCell};
use std::collections::BTreeMap;
use std::rc::Rc;

/// Base physical address of the simulated RAM window.
pub(crate) const RAM_BASE: u64 = 0x10_0000;

// =========================================================================
// Physical RAM + mapper
// =========================================================================

/// Simulated physical memory: `frame_count` page buffers starting at
/// [`RAM_BASE`]. Clones share the same storage.
#[derive(Clone)]
pub(crate) struct TestRam {
    frames: Rc<Vec<UnsafeCell<[u8; PAGE_BYTES]>>>,
}

impl TestRam {
    pub(crate) fn new(frame_count: usize) -> Self {
        let frames = (0..frame_count)
            .map(|_| UnsafeCell::new([0u8; PAGE_BYTES]))
            .collect();
        Self {
            frames: Rc::new(frames),
        }
    }

    fn index(&self, frame: PhysicalPage) -> usize {
        let index = ((frame.base().as_u64() - RAM_BASE) >> PAGE_SHIFT) as usize;
        assert!(index < self.frames.len(), "frame {frame} outside test RAM");
        index
    }

    /// Physical page of the `index`-th test frame.
    pub(crate) fn page(index: usize) -> PhysicalPage {
        PhysicalPage::containing(PhysicalAddress::new(
            RAM_BASE + index as u64 * PAGE_BYTES as u64,
        ))
    }

    /// Snapshot a frame's bytes.
    pub(crate) fn read(&self, frame: PhysicalPage) -> [u8; PAGE_BYTES] {
        // Safety: tests are single-threaded; no borrow outlives this call.
        unsafe { *self.frames[self.index(frame)].get() }
    }

    /// Poke one byte, as a user store through the mapping would.
    pub(crate) fn write(&self, frame: PhysicalPage, offset: usize, value: u8) {
        // Safety: as in `read`.
        unsafe {
            (*self.frames[self.index(frame)].get())[offset] = value;
        }
    }

    fn zero(&self, frame: PhysicalPage) {
        // Safety: as in `read`.
        unsafe {
            (*self.frames[self.index(frame)].get()).fill(0);
        }
    }
}

impl PhysMapper for TestRam {
    unsafe fn frame_bytes<'a>(&self, frame: PhysicalPage) -> &'a mut [u8; PAGE_BYTES] {
        // Safety: the caller upholds exclusivity per the trait contract.
        unsafe { &mut *self.frames[self.index(frame)].get() }
    }
}

// =========================================================================
// Physical allocator
// =========================================================================

#[derive(Default)]
struct AllocState {
    free: Vec<PhysicalPage>,
    refuse: bool,
}

/// Free-list allocator over the [`TestRam`] frames with a toggle that
/// simulates total memory pressure.
#[derive(Clone)]
pub(crate) struct TestAlloc {
    state: Rc<RefCell<AllocState>>,
    ram: TestRam,
}

impl TestAlloc {
    pub(crate) fn new(ram: &TestRam, frame_count: usize) -> Self {
        // Reverse so allocation hands out ascending addresses.
        let free = (0..frame_count).rev().map(TestRam::page).collect();
        Self {
            state: Rc::new(RefCell::new(AllocState {
                free,
                refuse: false,
            })),
            ram: ram.clone(),
        }
    }

    /// When set, `alloc_page` always reports exhaustion.
    pub(crate) fn set_refuse(&self, refuse: bool) {
        self.state.borrow_mut().refuse = refuse;
    }

    pub(crate) fn free_count(&self) -> usize {
        self.state.borrow().free.len()
    }
}

impl PageAllocator for TestAlloc {
    fn alloc_page(&mut self, zero: bool) -> Option<PhysicalPage> {
        let mut state = self.state.borrow_mut();
        if state.refuse {
            return None;
        }
        let page = state.free.pop()?;
        if zero {
            self.ram.zero(page);
        }
        Some(page)
    }

    fn free_page(&mut self, page: PhysicalPage) {
        let mut state = self.state.borrow_mut();
        assert!(
            !state.free.contains(&page),
            "double free of frame {page}"
        );
        state.free.push(page);
    }
}

// =========================================================================
// Hardware page table
// =========================================================================

#[derive(Debug, Clone, Copy)]
struct Mapping {
    frame: PhysicalPage,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

#[derive(Default)]
struct HwState {
    maps: BTreeMap<(ProcessId, VirtualPage), Mapping>,
    kernel_bits: BTreeMap<PhysicalPage, (bool, bool)>,
    fail_next_map: bool,
}

/// Recording page table: keeps every installed translation and its
/// accessed/dirty bits, plus per-frame kernel-alias bits.
#[derive(Clone, Default)]
pub(crate) struct MockHw {
    state: Rc<RefCell<HwState>>,
}

impl MockHw {
    /// Make the next `map` call report a metadata allocation failure.
    pub(crate) fn fail_next_map(&self) {
        self.state.borrow_mut().fail_next_map = true;
    }

    pub(crate) fn frame_of(&self, owner: ProcessId, page: VirtualPage) -> Option<PhysicalPage> {
        self.state
            .borrow()
            .maps
            .get(&(owner, page))
            .map(|mapping| mapping.frame)
    }

    pub(crate) fn writable(&self, owner: ProcessId, page: VirtualPage) -> bool {
        self.state.borrow().maps[&(owner, page)].writable
    }

    pub(crate) fn accessed_bit(&self, owner: ProcessId, page: VirtualPage) -> bool {
        self.state.borrow().maps[&(owner, page)].accessed
    }

    pub(crate) fn dirty_bit(&self, owner: ProcessId, page: VirtualPage) -> bool {
        self.state.borrow().maps[&(owner, page)].dirty
    }

    /// Pretend the CPU touched the mapping.
    pub(crate) fn set_bits(
        &self,
        owner: ProcessId,
        page: VirtualPage,
        accessed: bool,
        dirty: bool,
    ) {
        let mut state = self.state.borrow_mut();
        let mapping = state
            .maps
            .get_mut(&(owner, page))
            .expect("setting bits on an unmapped page");
        mapping.accessed = accessed;
        mapping.dirty = dirty;
    }

    /// Snapshot of every installed translation.
    pub(crate) fn mappings(&self) -> Vec<((ProcessId, VirtualPage), PhysicalPage)> {
        self.state
            .borrow()
            .maps
            .iter()
            .map(|(key, mapping)| (*key, mapping.frame))
            .collect()
    }
}

impl HardwarePageTable for MockHw {
    fn map(
        &mut self,
        owner: ProcessId,
        page: VirtualPage,
        frame: PhysicalPage,
        writable: bool,
    ) -> bool {
        let mut state = self.state.borrow_mut();
        if state.fail_next_map {
            state.fail_next_map = false;
            return false;
        }
        let previous = state.maps.insert(
            (owner, page),
            Mapping {
                frame,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        assert!(previous.is_none(), "double mapping of {page}");
        true
    }

    fn unmap(&mut self, owner: ProcessId, page: VirtualPage) {
        self.state.borrow_mut().maps.remove(&(owner, page));
    }

    fn translate(&self, owner: ProcessId, page: VirtualPage) -> Option<PhysicalPage> {
        self.frame_of(owner, page)
    }

    fn accessed(&self, owner: ProcessId, page: VirtualPage) -> bool {
        self.state
            .borrow()
            .maps
            .get(&(owner, page))
            .is_some_and(|mapping| mapping.accessed)
    }

    fn set_accessed(&mut self, owner: ProcessId, page: VirtualPage, value: bool) {
        if let Some(mapping) = self.state.borrow_mut().maps.get_mut(&(owner, page)) {
            mapping.accessed = value;
        }
    }

    fn dirty(&self, owner: ProcessId, page: VirtualPage) -> bool {
        self.state
            .borrow()
            .maps
            .get(&(owner, page))
            .is_some_and(|mapping| mapping.dirty)
    }

    fn set_dirty(&mut self, owner: ProcessId, page: VirtualPage, value: bool) {
        if let Some(mapping) = self.state.borrow_mut().maps.get_mut(&(owner, page)) {
            mapping.dirty = value;
        }
    }

    fn kernel_accessed(&self, frame: PhysicalPage) -> bool {
        self.state
            .borrow()
            .kernel_bits
            .get(&frame)
            .is_some_and(|bits| bits.0)
    }

    fn set_kernel_accessed(&mut self, frame: PhysicalPage, value: bool) {
        self.state
            .borrow_mut()
            .kernel_bits
            .entry(frame)
            .or_default()
            .0 = value;
    }

    fn kernel_dirty(&self, frame: PhysicalPage) -> bool {
        self.state
            .borrow()
            .kernel_bits
            .get(&frame)
            .is_some_and(|bits| bits.1)
    }

    fn set_kernel_dirty(&mut self, frame: PhysicalPage, value: bool) {
        self.state
            .borrow_mut()
            .kernel_bits
            .entry(frame)
            .or_default()
            .1 = value;
    }
}

// =========================================================================
// Files and swap device
// =========================================================================

/// Byte-vector file store.
#[derive(Clone, Default)]
pub(crate) struct MemFiles {
    state: Rc<RefCell<BTreeMap<FileHandle, Vec<u8>>>>,
    next: Rc<RefCell<u32>>,
}

impl MemFiles {
    pub(crate) fn create(&self, content: Vec<u8>) -> FileHandle {
        let mut next = self.next.borrow_mut();
        let handle = FileHandle(*next);
        *next += 1;
        self.state.borrow_mut().insert(handle, content);
        handle
    }

    pub(crate) fn content(&self, file: FileHandle) -> Vec<u8> {
        self.state.borrow()[&file].clone()
    }
}

impl FileStore for MemFiles {
    fn length(&mut self, file: FileHandle) -> u64 {
        self.state
            .borrow()
            .get(&file)
            .map_or(0, |content| content.len() as u64)
    }

    fn read_at(&mut self, file: FileHandle, offset: u64, buf: &mut [u8]) -> usize {
        let state = self.state.borrow();
        let Some(content) = state.get(&file) else {
            return 0;
        };
        let offset = offset as usize;
        let available = content.len().saturating_sub(offset);
        let count = buf.len().min(available);
        buf[..count].copy_from_slice(&content[offset..offset + count]);
        count
    }

    fn write_at(&mut self, file: FileHandle, offset: u64, buf: &[u8]) -> usize {
        let mut state = self.state.borrow_mut();
        let Some(content) = state.get_mut(&file) else {
            return 0;
        };
        let offset = offset as usize;
        if content.len() < offset + buf.len() {
            content.resize(offset + buf.len(), 0);
        }
        content[offset..offset + buf.len()].copy_from_slice(buf);
        buf.len()
    }
}

/// RAM-backed sector device for the swap region.
pub(crate) struct MemBlockDevice {
    sectors: RefCell<Vec<u8>>,
}

impl MemBlockDevice {
    pub(crate) fn new(sector_count: usize) -> Self {
        Self {
            sectors: RefCell::new(vec![0; sector_count * SECTOR_SIZE]),
        }
    }
}

impl BlockDevice for MemBlockDevice {
    fn sector_count(&self) -> u64 {
        (self.sectors.borrow().len() / SECTOR_SIZE) as u64
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8; SECTOR_SIZE]) {
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&self.sectors.borrow()[start..start + SECTOR_SIZE]);
    }

    fn write_sector(&self, sector: u64, buf: &[u8; SECTOR_SIZE]) {
        let start = sector as usize * SECTOR_SIZE;
        self.sectors.borrow_mut()[start..start + SECTOR_SIZE].copy_from_slice(buf);
    }
}

// =========================================================================
// Harness
// =========================================================================

/// A fully wired [`Vm`] plus handles to all of its doubles.
pub(crate) struct Harness {
    pub(crate) vm: Vm<MockHw, TestAlloc, TestRam, MemFiles, MemBlockDevice>,
    pub(crate) hw: MockHw,
    pub(crate) alloc: TestAlloc,
    pub(crate) files: MemFiles,
    pub(crate) ram: TestRam,
}

impl Harness {
    pub(crate) fn new(frame_count: usize, swap_slots: usize) -> Self {
        let ram = TestRam::new(frame_count);
        let alloc = TestAlloc::new(&ram, frame_count);
        let hw = MockHw::default();
        let files = MemFiles::default();
        let vm = Vm::new(
            VmConfig::default(),
            hw.clone(),
            alloc.clone(),
            ram.clone(),
            files.clone(),
            MemBlockDevice::new(swap_slots * SECTORS_PER_PAGE),
        );
        Self {
            vm,
            hw,
            alloc,
            files,
            ram,
        }
    }
}
