//! General Kernel Memory Allocator
//!
//! The heap directory: a fixed-capacity table of buddy heaps tried in
//! creation order. When every heap declines a request, a new on-demand
//! heap is obtained from the [`HeapProvider`] and the request is retried
//! once on it. A single allocation never spans two heaps.
//!
//! Dynamically created heaps are reclaimable: once empty, all but
//! `max_empty_heaps` of them are destroyed and their region released.
//!
//! Requests up to [`SMALL_HEAP_MAX_ALLOC`] bytes go to small heaps: 8-page
//! heaps with 16-byte blocks whose memory is itself a kmalloc block of the
//! main heaps. A small heap is created when none has room and destroyed as
//! soon as it is empty again.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::config::{
    HeapDirectoryConfig, KMALLOC_HEAPS_COUNT, SMALL_HEAP_MAX_ALLOC, SMALL_HEAP_MIN_BLOCK, SMALL_HEAP_SIZE,
};
use crate::error::{KResult, KernelError};
use crate::kern::heap::{create_heap, AllocFlags, Allocation, FreeFlags, Heap, HeapConfig, Mappable};
use crate::types::{round_up_pow2, HeapId};

// ============================================================================
// Heap Provider
// ============================================================================

/// A virtual region reserved for a new heap
pub struct HeapRegion {
    pub vaddr: usize,
    /// Backing-memory capability for the region
    pub mapper: Box<dyn Mappable>,
}

/// Source of address space for dynamically created heaps
///
/// # Safety
///
/// A region returned by `reserve` must belong to the directory until it
/// is released, and every page its mapper reports as mapped must be
/// valid, writable memory.
pub unsafe trait HeapProvider: Send {
    /// Reserve `size` bytes (a power of two), aligned to `size` or at
    /// least to a page
    fn reserve(&mut self, size: usize) -> Option<HeapRegion>;

    /// Give back a region obtained from `reserve`
    fn release(&mut self, vaddr: usize, size: usize);
}

// ============================================================================
// Statistics
// ============================================================================

/// Kalloc statistics
#[derive(Debug, Default)]
pub struct KallocStats {
    /// Total allocations
    pub alloc_count: AtomicU64,
    /// Total frees
    pub free_count: AtomicU64,
    /// Bytes currently allocated
    pub bytes_allocated: AtomicU64,
    /// Requests no heap could satisfy
    pub failed_allocs: AtomicU64,
    /// Heaps created on demand
    pub heaps_created: AtomicU64,
    /// Heaps destroyed
    pub heaps_destroyed: AtomicU64,
    /// Small heaps created
    pub small_heaps_created: AtomicU64,
    /// Small heaps destroyed
    pub small_heaps_destroyed: AtomicU64,
}

impl KallocStats {
    fn record_alloc(&self, size: usize) {
        self.alloc_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn record_free(&self, size: usize) {
        self.free_count.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_sub(size as u64, Ordering::Relaxed);
    }

    /// Snapshot of the counters
    pub fn snapshot(&self) -> KallocStatsCopy {
        KallocStatsCopy {
            alloc_count: self.alloc_count.load(Ordering::Relaxed),
            free_count: self.free_count.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
            failed_allocs: self.failed_allocs.load(Ordering::Relaxed),
            heaps_created: self.heaps_created.load(Ordering::Relaxed),
            heaps_destroyed: self.heaps_destroyed.load(Ordering::Relaxed),
            small_heaps_created: self.small_heaps_created.load(Ordering::Relaxed),
            small_heaps_destroyed: self.small_heaps_destroyed.load(Ordering::Relaxed),
        }
    }
}

/// Copy of kalloc statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KallocStatsCopy {
    pub alloc_count: u64,
    pub free_count: u64,
    pub bytes_allocated: u64,
    pub failed_allocs: u64,
    pub heaps_created: u64,
    pub heaps_destroyed: u64,
    pub small_heaps_created: u64,
    pub small_heaps_destroyed: u64,
}

// ============================================================================
// Heap Directory
// ============================================================================

struct HeapSlot {
    id: HeapId,
    heap: Heap,
}

/// Table of heaps serving kmalloc
pub struct HeapDirectory {
    heaps: heapless::Vec<HeapSlot, KMALLOC_HEAPS_COUNT>,
    /// Small heaps in creation order
    small: Vec<Heap>,
    provider: Option<Box<dyn HeapProvider>>,
    config: HeapDirectoryConfig,
    next_id: u32,
    stats: KallocStats,
}

impl HeapDirectory {
    /// Empty directory. Without a provider the directory never grows past
    /// the heaps added with [`HeapDirectory::add_heap`].
    pub fn new(config: HeapDirectoryConfig, provider: Option<Box<dyn HeapProvider>>) -> KResult<Self> {
        config.validate()?;
        Ok(Self {
            heaps: heapless::Vec::new(),
            small: Vec::new(),
            provider,
            config,
            next_id: 0,
            stats: KallocStats::default(),
        })
    }

    /// Register an existing heap.
    ///
    /// # Safety
    ///
    /// The heap's range must be memory the directory may hand out: writable
    /// once mapped and used by nothing else while the heap is registered.
    pub unsafe fn add_heap(&mut self, heap: Heap) -> KResult<HeapId> {
        self.insert(heap).map_err(|(err, _)| err)
    }

    fn insert(&mut self, heap: Heap) -> Result<HeapId, (KernelError, Heap)> {
        if heap.vaddr() == 0 {
            return Err((KernelError::InvalidConfig("heap at address zero"), heap));
        }
        if self.heaps.len() >= self.config.max_heaps {
            return Err((KernelError::TooManyHeaps, heap));
        }
        if self.heaps.iter().any(|s| s.heap.overlaps(heap.vaddr(), heap.size())) {
            return Err((KernelError::HeapOverlap, heap));
        }

        let id = HeapId(self.next_id);
        log::debug!("kmalloc: {} registered at {:#x} ({} KB)", id, heap.vaddr(), heap.size() / 1024);
        self.heaps
            .push(HeapSlot { id, heap })
            .map_err(|slot| (KernelError::TooManyHeaps, slot.heap))?;
        self.next_id += 1;
        Ok(id)
    }

    pub fn config(&self) -> &HeapDirectoryConfig {
        &self.config
    }

    pub fn heap_count(&self) -> usize {
        self.heaps.len()
    }

    pub fn heap(&self, id: HeapId) -> Option<&Heap> {
        self.heaps.iter().find(|s| s.id == id).map(|s| &s.heap)
    }

    /// Heaps in creation order
    pub fn iter(&self) -> impl Iterator<Item = (HeapId, &Heap)> {
        self.heaps.iter().map(|s| (s.id, &s.heap))
    }

    /// Main heap whose range holds `ptr`. Small heaps live inside the
    /// main heaps, so this is also the heap holding a small heap's block.
    pub fn heap_of(&self, ptr: NonNull<u8>) -> Option<HeapId> {
        let addr = ptr.as_ptr() as usize;
        self.heaps.iter().find(|s| s.heap.contains(addr)).map(|s| s.id)
    }

    pub fn small_heap_count(&self) -> usize {
        self.small.len()
    }

    /// Small heaps in creation order
    pub fn small_heaps(&self) -> impl Iterator<Item = &Heap> {
        self.small.iter()
    }

    /// Bytes handed out to callers. The block backing a small heap counts
    /// as what is allocated inside it.
    pub fn mem_allocated(&self) -> usize {
        let main: usize = self.heaps.iter().map(|s| s.heap.mem_allocated()).sum();
        let small: usize = self.small.iter().map(|h| h.mem_allocated()).sum();
        main - self.small.len() * SMALL_HEAP_SIZE + small
    }

    pub fn stats(&self) -> KallocStatsCopy {
        self.stats.snapshot()
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate `size` bytes. Returns `None` on global exhaustion.
    pub fn kmalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.kmalloc_ex(size, AllocFlags::empty()).map(|(ptr, _)| ptr)
    }

    /// Allocate with flags; also returns the bytes charged
    pub fn kmalloc_ex(&mut self, size: usize, flags: AllocFlags) -> Option<(NonNull<u8>, usize)> {
        if size == 0 {
            return None;
        }

        let result = if self.config.small_heaps && size <= SMALL_HEAP_MAX_ALLOC {
            self.small_alloc(size, flags)
        } else {
            self.main_alloc(size, flags)
        };
        match result {
            Some(a) => {
                self.stats.record_alloc(a.size);
                NonNull::new(a.addr as *mut u8).map(|p| (p, a.size))
            }
            None => {
                self.stats.failed_allocs.fetch_add(1, Ordering::Relaxed);
                log::warn!("kmalloc: out of memory ({} bytes requested)", size);
                None
            }
        }
    }

    /// Allocate `size` zeroed bytes
    pub fn kzmalloc(&mut self, size: usize) -> Option<NonNull<u8>> {
        let ptr = self.kmalloc(size)?;
        // SAFETY: heaps only hand out memory their registration contract
        // declares writable, and the block is at least `size` bytes.
        unsafe {
            core::ptr::write_bytes(ptr.as_ptr(), 0, size);
        }
        Some(ptr)
    }

    fn main_alloc(&mut self, size: usize, flags: AllocFlags) -> Option<Allocation> {
        for slot in self.heaps.iter_mut() {
            if slot.heap.size() < size || slot.heap.free_bytes() < size {
                continue;
            }
            if let Some(a) = slot.heap.alloc_ex(size, flags) {
                return Some(a);
            }
        }

        let idx = self.grow(size)?;
        let result = self.heaps[idx].heap.alloc_ex(size, flags);
        if result.is_none() {
            // the new heap cannot serve the request it was made for
            let id = self.heaps[idx].id;
            self.remove(idx);
            log::debug!("kmalloc: dropped unusable {}", id);
        }
        result
    }

    /// Create an on-demand heap able to hold `request` bytes
    fn grow(&mut self, request: usize) -> Option<usize> {
        if self.provider.is_none() || self.heaps.len() >= self.config.max_heaps {
            return None;
        }
        let size = round_up_pow2(request, self.config.min_block_size)?
            .checked_mul(2)?
            .max(self.config.dynamic_heap_size);

        let provider = self.provider.as_mut()?;
        let region = provider.reserve(size)?;
        let vaddr = region.vaddr;

        let config = HeapConfig::on_demand(vaddr, size, self.config.min_block_size, self.config.alloc_granule)
            .reclaimable();
        let heap = match create_heap(&config, None, Some(region.mapper)) {
            Ok(heap) => heap,
            Err(err) => {
                log::warn!("kmalloc: cannot create heap at {:#x}: {}", vaddr, err);
                provider.release(vaddr, size);
                return None;
            }
        };

        match self.insert(heap) {
            Ok(_) => {
                self.stats.heaps_created.fetch_add(1, Ordering::Relaxed);
                Some(self.heaps.len() - 1)
            }
            Err((err, heap)) => {
                log::warn!("kmalloc: cannot register heap at {:#x}: {}", vaddr, err);
                drop(heap);
                if let Some(provider) = self.provider.as_mut() {
                    provider.release(vaddr, size);
                }
                None
            }
        }
    }

    // ========================================================================
    // Small heaps
    // ========================================================================

    fn small_alloc(&mut self, size: usize, flags: AllocFlags) -> Option<Allocation> {
        for heap in self.small.iter_mut() {
            if heap.free_bytes() < size {
                continue;
            }
            if let Some(a) = heap.alloc_ex(size, flags) {
                return Some(a);
            }
        }

        let idx = self.new_small_heap()?;
        let result = self.small[idx].alloc_ex(size, flags);
        if result.is_none() {
            self.destroy_small_heap(idx);
        }
        result
    }

    fn new_small_heap(&mut self) -> Option<usize> {
        let block = self.main_alloc(SMALL_HEAP_SIZE, AllocFlags::empty())?;
        let config = HeapConfig::linear(block.addr, SMALL_HEAP_SIZE, SMALL_HEAP_MIN_BLOCK);
        match create_heap(&config, None, None) {
            Ok(heap) => {
                self.small.push(heap);
                self.stats.small_heaps_created.fetch_add(1, Ordering::Relaxed);
                log::debug!("kmalloc: small heap at {:#x}", block.addr);
                Some(self.small.len() - 1)
            }
            Err(err) => {
                log::warn!("kmalloc: cannot create small heap at {:#x}: {}", block.addr, err);
                self.main_free(block.addr, SMALL_HEAP_SIZE, FreeFlags::empty());
                None
            }
        }
    }

    fn destroy_small_heap(&mut self, idx: usize) {
        let heap = self.small.remove(idx);
        let vaddr = heap.vaddr();
        drop(heap);
        self.main_free(vaddr, SMALL_HEAP_SIZE, FreeFlags::empty());
        self.stats.small_heaps_destroyed.fetch_add(1, Ordering::Relaxed);
        log::debug!("kmalloc: small heap at {:#x} destroyed", vaddr);
    }

    // ========================================================================
    // Free
    // ========================================================================

    /// Free a block whose size is looked up in the heap metadata.
    ///
    /// # Safety
    ///
    /// `ptr` must come from this directory and must not be used afterwards.
    pub unsafe fn kfree(&mut self, ptr: NonNull<u8>) {
        self.kfree_ex(ptr, 0, FreeFlags::empty());
    }

    /// Free a block of `size` bytes (the size passed to kmalloc).
    ///
    /// # Safety
    ///
    /// Same as [`HeapDirectory::kfree`].
    pub unsafe fn kfree2(&mut self, ptr: NonNull<u8>, size: usize) {
        self.kfree_ex(ptr, size, FreeFlags::empty());
    }

    /// Free with flags. [`FreeFlags::ALLOW_SPLIT`] releases every live
    /// block inside the power-of-two range at `ptr`.
    ///
    /// # Safety
    ///
    /// Same as [`HeapDirectory::kfree`].
    pub unsafe fn kfree_ex(&mut self, ptr: NonNull<u8>, size: usize, flags: FreeFlags) {
        let addr = ptr.as_ptr() as usize;
        let freed = match self.small.iter().position(|h| h.contains(addr)) {
            Some(idx) => {
                let freed = self.small[idx].free_ex(addr, size, flags);
                if self.small[idx].is_empty() {
                    self.destroy_small_heap(idx);
                }
                freed
            }
            None => self.main_free(addr, size, flags),
        };
        self.stats.record_free(freed);
    }

    fn main_free(&mut self, addr: usize, size: usize, flags: FreeFlags) -> usize {
        let idx = match self.heaps.iter().position(|s| s.heap.contains(addr)) {
            Some(idx) => idx,
            None => panic!("kfree: no heap contains {:#x}", addr),
        };

        let freed = self.heaps[idx].heap.free_ex(addr, size, flags);
        self.reclaim(idx);
        freed
    }

    /// Destroy the heap at `idx` if it is an empty reclaimable heap and
    /// enough other empty ones are kept.
    fn reclaim(&mut self, idx: usize) {
        let heap = &self.heaps[idx].heap;
        if !heap.is_reclaimable() || !heap.is_empty() {
            return;
        }
        let empty = self
            .heaps
            .iter()
            .filter(|s| s.heap.is_reclaimable() && s.heap.is_empty())
            .count();
        if empty > self.config.max_empty_heaps {
            let id = self.heaps[idx].id;
            self.remove(idx);
            log::debug!("kmalloc: reclaimed empty {}", id);
        }
    }

    /// Remove a heap with no live allocations
    pub fn destroy_heap(&mut self, id: HeapId) -> KResult<()> {
        let idx = self
            .heaps
            .iter()
            .position(|s| s.id == id)
            .ok_or(KernelError::NoSuchHeap(id.0))?;

        let allocated = self.heaps[idx].heap.mem_allocated();
        if allocated != 0 {
            return Err(KernelError::HeapBusy { id: id.0, allocated });
        }
        self.remove(idx);
        log::debug!("kmalloc: destroyed {}", id);
        Ok(())
    }

    fn remove(&mut self, idx: usize) {
        let slot = self.heaps.remove(idx);
        if slot.heap.is_reclaimable() {
            if let Some(provider) = self.provider.as_mut() {
                provider.release(slot.heap.vaddr(), slot.heap.size());
            }
        }
        self.stats.heaps_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Resize a block, moving its contents.
    ///
    /// # Safety
    ///
    /// `old` must come from this directory; it is invalid after a
    /// successful call.
    pub unsafe fn krealloc(&mut self, old: Option<NonNull<u8>>, new_size: usize) -> Option<NonNull<u8>> {
        let new_ptr = self.kmalloc(new_size)?;

        if let Some(old) = old {
            let addr = old.as_ptr() as usize;
            let small = self.small.iter().find(|h| h.contains(addr));
            let main = self.heaps.iter().map(|s| &s.heap).find(|h| h.contains(addr));
            let old_size = match small.or(main) {
                Some(heap) => heap.block_size(addr),
                None => panic!("krealloc: no heap contains {:#x}", addr),
            };
            core::ptr::copy_nonoverlapping(old.as_ptr(), new_ptr.as_ptr(), old_size.min(new_size));
            self.kfree(old);
        }

        Some(new_ptr)
    }
}

impl Drop for HeapDirectory {
    fn drop(&mut self) {
        self.small.clear();
        while !self.heaps.is_empty() {
            self.remove(self.heaps.len() - 1);
        }
    }
}
