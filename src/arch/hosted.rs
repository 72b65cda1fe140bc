//! Hosted platform
//!
//! Runs the kernel core inside an ordinary process. Context switches are
//! recorded instead of performed (task bodies are step functions driven by
//! [`Kernel::run_current_task`]), heap regions are real memory from the
//! global allocator and user address spaces are sparse page maps.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::arch::Platform;
use crate::config::KernelConfig;
use crate::error::{KResult, KernelError};
use crate::kern::copyio::{CpuFault, UserMemory};
use crate::kern::heap::{create_heap, Heap, HeapConfig, Mappable};
use crate::kern::kalloc::{HeapDirectory, HeapProvider, HeapRegion};
use crate::kern::thread::TaskContext;
use crate::scheduler::Kernel;
use crate::types::{TaskId, PAGE_SIZE};

/// Size of the boot heap of [`hosted_kernel`]
pub const BOOT_HEAP_SIZE: usize = 1 << 20;

// ============================================================================
// Address space
// ============================================================================

#[derive(Debug, Default)]
struct VmState {
    regions: BTreeMap<usize, Layout>,
    mapped_pages: usize,
    page_limit: Option<usize>,
}

impl Drop for VmState {
    fn drop(&mut self) {
        for (&addr, &layout) in self.regions.iter() {
            // SAFETY: allocated in `HostedVm::alloc_region` with this layout
            unsafe { dealloc(addr as *mut u8, layout) };
        }
    }
}

/// Host memory handed out as heap regions, with page-mapping accounting.
///
/// Clones share the same state. Regions stay valid until released or
/// until the last clone (including the mappers it handed out) is dropped.
#[derive(Debug, Clone, Default)]
pub struct HostedVm {
    state: Arc<Mutex<VmState>>,
}

impl HostedVm {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_region(&self, size: usize) -> Option<usize> {
        let align = size.clamp(PAGE_SIZE, 1 << 21);
        let layout = Layout::from_size_align(size, align).ok()?;
        // SAFETY: size is non-zero, checked by the callers
        let ptr = unsafe { alloc_zeroed(layout) };
        if ptr.is_null() {
            return None;
        }
        self.state.lock().regions.insert(ptr as usize, layout);
        Some(ptr as usize)
    }

    fn free_region(&self, vaddr: usize) {
        if let Some(layout) = self.state.lock().regions.remove(&vaddr) {
            // SAFETY: allocated in `alloc_region` with this layout
            unsafe { dealloc(vaddr as *mut u8, layout) };
        }
    }

    fn mapper(&self) -> Box<dyn Mappable> {
        Box::new(HostedMapper { vm: self.clone() })
    }

    /// A fully backed heap of `size` bytes
    pub fn linear_heap(&self, size: usize, min_block_size: usize) -> KResult<Heap> {
        if !size.is_power_of_two() {
            return Err(KernelError::InvalidConfig("heap size is not a power of two"));
        }
        let vaddr = self.alloc_region(size).ok_or(KernelError::OutOfMemory)?;
        create_heap(&HeapConfig::linear(vaddr, size, min_block_size), None, None).inspect_err(|_| self.free_region(vaddr))
    }

    /// A heap whose pages are mapped `granule` bytes at a time
    pub fn on_demand_heap(&self, size: usize, min_block_size: usize, granule: usize) -> KResult<Heap> {
        if !size.is_power_of_two() {
            return Err(KernelError::InvalidConfig("heap size is not a power of two"));
        }
        let vaddr = self.alloc_region(size).ok_or(KernelError::OutOfMemory)?;
        create_heap(
            &HeapConfig::on_demand(vaddr, size, min_block_size, granule),
            None,
            Some(self.mapper()),
        )
        .inspect_err(|_| self.free_region(vaddr))
    }

    /// Regions currently handed out
    pub fn region_count(&self) -> usize {
        self.state.lock().regions.len()
    }

    /// Pages currently mapped through the mappers of this vm
    pub fn mapped_pages(&self) -> usize {
        self.state.lock().mapped_pages
    }

    /// Fail mappings that would exceed `limit` mapped pages
    pub fn set_page_limit(&self, limit: Option<usize>) {
        self.state.lock().page_limit = limit;
    }
}

// SAFETY: regions are host allocations owned by the vm state until released,
// and the whole region is backed from the start.
unsafe impl HeapProvider for HostedVm {
    fn reserve(&mut self, size: usize) -> Option<HeapRegion> {
        if size == 0 {
            return None;
        }
        let vaddr = self.alloc_region(size)?;
        Some(HeapRegion {
            vaddr,
            mapper: self.mapper(),
        })
    }

    fn release(&mut self, vaddr: usize, _size: usize) {
        self.free_region(vaddr);
    }
}

#[derive(Debug)]
struct HostedMapper {
    vm: HostedVm,
}

impl Mappable for HostedMapper {
    fn map(&mut self, _vaddr: usize, page_count: usize) -> bool {
        let mut state = self.vm.state.lock();
        if let Some(limit) = state.page_limit {
            if state.mapped_pages + page_count > limit {
                return false;
            }
        }
        state.mapped_pages += page_count;
        true
    }

    fn unmap(&mut self, _vaddr: usize, page_count: usize) {
        // duplicated heaps share the counter with their source
        let mut state = self.vm.state.lock();
        state.mapped_pages = state.mapped_pages.saturating_sub(page_count);
    }

    fn duplicate(&self) -> Box<dyn Mappable> {
        self.vm.mapper()
    }
}

// ============================================================================
// Platform
// ============================================================================

/// Something the hosted platform was asked to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlatformEvent {
    Save(TaskId),
    Restore(TaskId),
    Fault { tid: TaskId, fault: CpuFault, resumable: bool },
    Idle,
}

/// Events kept by a [`HostedTrace`]; older ones are dropped first
pub const TRACE_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct TraceLog {
    events: heapless::Deque<PlatformEvent, TRACE_CAPACITY>,
    dropped: u64,
}

/// Shared log of the most recent platform events
#[derive(Debug, Clone, Default)]
pub struct HostedTrace {
    log: Arc<Mutex<TraceLog>>,
}

impl HostedTrace {
    fn record(&self, event: PlatformEvent) {
        let mut log = self.log.lock();
        if log.events.is_full() {
            log.events.pop_front();
            log.dropped += 1;
        }
        // cannot fail, a slot was just freed
        let _ = log.events.push_back(event);
    }

    /// Retained events, oldest first
    pub fn events(&self) -> Vec<PlatformEvent> {
        self.log.lock().events.iter().copied().collect()
    }

    /// Events that fell off the front of the log
    pub fn dropped(&self) -> u64 {
        self.log.lock().dropped
    }

    /// Tasks switched to, in order
    pub fn switches(&self) -> Vec<TaskId> {
        self.log
            .lock()
            .events
            .iter()
            .filter_map(|e| match e {
                PlatformEvent::Restore(tid) => Some(*tid),
                _ => None,
            })
            .collect()
    }

    pub fn faults(&self) -> Vec<(TaskId, CpuFault, bool)> {
        self.log
            .lock()
            .events
            .iter()
            .filter_map(|e| match *e {
                PlatformEvent::Fault { tid, fault, resumable } => Some((tid, fault, resumable)),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        let mut log = self.log.lock();
        log.events.clear();
        log.dropped = 0;
    }
}

/// Platform that records what a real one would do
#[derive(Debug, Default)]
pub struct HostedPlatform {
    trace: HostedTrace,
}

impl HostedPlatform {
    pub fn new(trace: HostedTrace) -> Self {
        Self { trace }
    }
}

impl Platform for HostedPlatform {
    fn init_context(&mut self, ctx: &mut TaskContext, entry: usize, arg: usize, stack_top: usize) {
        *ctx = TaskContext {
            ip: entry,
            sp: stack_top,
            arg,
            ..TaskContext::default()
        };
    }

    fn save_context(&mut self, tid: TaskId, _ctx: &mut TaskContext) {
        self.trace.record(PlatformEvent::Save(tid));
    }

    fn restore_context(&mut self, tid: TaskId, _ctx: &TaskContext) {
        self.trace.record(PlatformEvent::Restore(tid));
    }

    fn enter_fault_handler(&mut self, tid: TaskId, fault: CpuFault, resumable: bool) {
        self.trace.record(PlatformEvent::Fault { tid, fault, resumable });
    }

    fn idle(&mut self) {
        self.trace.record(PlatformEvent::Idle);
    }
}

/// A kernel on the hosted platform: a 1 MiB linear boot heap, dynamic
/// heaps from a [`HostedVm`] and a [`HostedPlatform`] whose trace is
/// returned alongside
pub fn hosted_kernel(config: KernelConfig) -> KResult<(Kernel, HostedTrace)> {
    let vm = HostedVm::new();
    let boot = vm.linear_heap(BOOT_HEAP_SIZE, config.heap.min_block_size)?;

    let mut heaps = HeapDirectory::new(config.heap, Some(Box::new(vm)))?;
    // SAFETY: the boot region is a host allocation owned by the vm, which
    // the directory keeps alive as its provider
    unsafe { heaps.add_heap(boot)? };

    let trace = HostedTrace::default();
    let kernel = Kernel::new(config, heaps, Box::new(HostedPlatform::new(trace.clone())))?;
    Ok((kernel, trace))
}

// ============================================================================
// User memory
// ============================================================================

struct UserPage {
    data: Box<[u8]>,
    writable: bool,
}

/// Sparse user address space: unmapped pages raise page faults, writes to
/// read-only pages raise protection faults
#[derive(Default)]
pub struct HostedUserMemory {
    pages: BTreeMap<usize, UserPage>,
}

impl HostedUserMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `count` zeroed pages at the page-aligned address `vaddr`
    pub fn map(&mut self, vaddr: usize, count: usize, writable: bool) {
        assert_eq!(vaddr % PAGE_SIZE, 0, "user map: {:#x} is not page aligned", vaddr);
        for i in 0..count {
            self.pages.insert(
                vaddr + i * PAGE_SIZE,
                UserPage {
                    data: vec![0u8; PAGE_SIZE].into_boxed_slice(),
                    writable,
                },
            );
        }
    }

    pub fn unmap(&mut self, vaddr: usize, count: usize) {
        for i in 0..count {
            self.pages.remove(&(vaddr + i * PAGE_SIZE));
        }
    }
}

impl UserMemory for HostedUserMemory {
    fn read(&self, addr: usize, buf: &mut [u8]) -> Result<(), CpuFault> {
        for (i, byte) in buf.iter_mut().enumerate() {
            let a = addr + i;
            let page = self.pages.get(&(a & !(PAGE_SIZE - 1))).ok_or(CpuFault::PAGE_FAULT)?;
            *byte = page.data[a % PAGE_SIZE];
        }
        Ok(())
    }

    fn write(&mut self, addr: usize, data: &[u8]) -> Result<(), CpuFault> {
        for (i, &byte) in data.iter().enumerate() {
            let a = addr + i;
            let page = self.pages.get_mut(&(a & !(PAGE_SIZE - 1))).ok_or(CpuFault::PAGE_FAULT)?;
            if !page.writable {
                return Err(CpuFault::GENERAL_PROTECTION);
            }
            page.data[a % PAGE_SIZE] = byte;
        }
        Ok(())
    }
}
