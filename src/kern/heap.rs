//! Buddy Heap Block Allocator
//!
//! A heap is one contiguous arena split into power-of-two blocks, from the
//! whole heap down to `min_block_size`. The blocks form an implicit binary
//! tree stored as one metadata byte per node:
//!
//! ```text
//!   node 0            whole heap
//!   node 1, 2         halves
//!   node 2n+1, 2n+2   children of n
//! ```
//!
//! The tree has `2 * size / min_block_size - 1` nodes. A node is FREE
//! when neither SPLIT nor FULL is set, SPLIT when its children carry the
//! state, and an allocated block is a FULL node that is not SPLIT.
//! A SPLIT node is also marked FULL once both of its children are full,
//! which lets the descent skip exhausted subtrees.
//!
//! Heaps may be linearly mapped (backing memory always present) or
//! on-demand: backing memory is requested one `alloc_granule` at a time
//! through a [`Mappable`] the first time a block touching the granule is
//! handed out, and released when the granule becomes entirely free again.
//!
//! Ties are broken leftmost-first: among equally sized free blocks the one
//! with the lowest address wins.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Deref, DerefMut};

use bitflags::bitflags;

use crate::error::{KResult, KernelError};
use crate::types::{round_up_pow2, PAGE_SIZE};

bitflags! {
    /// Per-node metadata state
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    #[repr(transparent)]
    pub struct BlockNode: u8 {
        /// The block is divided into two halves
        const SPLIT = 1 << 0;
        /// The block is allocated, or both halves are full
        const FULL = 1 << 1;
        /// Granule-sized node whose backing memory is mapped
        const ALLOCATED = 1 << 2;
        /// Mapping the granule failed; cleared when the block is released
        const ALLOC_FAILED = 1 << 3;
    }
}

impl BlockNode {
    #[inline]
    pub fn is_free(self) -> bool {
        !self.intersects(BlockNode::SPLIT | BlockNode::FULL)
    }
}

bitflags! {
    /// Heap-wide flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HeapFlags: u32 {
        /// Backing memory is always present
        const LINEAR_MAPPING = 1 << 0;
        /// Created on demand by the directory; destroyed when empty
        const RECLAIMABLE = 1 << 1;
    }
}

bitflags! {
    /// Allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct AllocFlags: u32 {
        /// Reserve the rounded-up region but only allocate the
        /// power-of-two pieces covering the requested size
        const MULTI_STEP = 1 << 0;
    }
}

bitflags! {
    /// Free flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FreeFlags: u32 {
        /// The block was allocated with [`AllocFlags::MULTI_STEP`]
        const MULTI_STEP = 1 << 0;
        /// The freed range may cover several live blocks, or be only
        /// partly allocated; every live block inside it is released
        const ALLOW_SPLIT = 1 << 1;
    }
}

/// Backing-memory capability of an on-demand heap
pub trait Mappable: Send {
    /// Make `page_count` pages starting at `vaddr` usable. Returns false
    /// when no physical memory is left.
    fn map(&mut self, vaddr: usize, page_count: usize) -> bool;

    /// Release pages previously mapped with [`Mappable::map`]
    fn unmap(&mut self, vaddr: usize, page_count: usize);

    /// Mapper for a duplicate of this heap
    fn duplicate(&self) -> Box<dyn Mappable>;
}

/// Heap creation parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    pub vaddr: usize,
    pub size: usize,
    pub min_block_size: usize,
    /// Mapping granule of on-demand heaps, ignored by linear heaps
    pub alloc_granule: usize,
    pub linear_mapping: bool,
    pub reclaimable: bool,
}

impl HeapConfig {
    /// Heap whose whole range is already backed
    pub const fn linear(vaddr: usize, size: usize, min_block_size: usize) -> Self {
        Self {
            vaddr,
            size,
            min_block_size,
            alloc_granule: 0,
            linear_mapping: true,
            reclaimable: false,
        }
    }

    /// Heap backed lazily, `alloc_granule` bytes at a time
    pub const fn on_demand(vaddr: usize, size: usize, min_block_size: usize, alloc_granule: usize) -> Self {
        Self {
            vaddr,
            size,
            min_block_size,
            alloc_granule,
            linear_mapping: false,
            reclaimable: false,
        }
    }

    pub const fn reclaimable(mut self) -> Self {
        self.reclaimable = true;
        self
    }
}

/// Metadata bytes needed for a heap of `heap_size` bytes
#[inline]
pub const fn metadata_size(heap_size: usize, min_block_size: usize) -> usize {
    2 * heap_size / min_block_size
}

/// A successful allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub addr: usize,
    /// Bytes charged to the heap
    pub size: usize,
}

enum Metadata {
    Borrowed(&'static mut [BlockNode]),
    Owned(Box<[BlockNode]>),
}

impl Deref for Metadata {
    type Target = [BlockNode];

    fn deref(&self) -> &[BlockNode] {
        match self {
            Metadata::Borrowed(nodes) => nodes,
            Metadata::Owned(nodes) => nodes,
        }
    }
}

impl DerefMut for Metadata {
    fn deref_mut(&mut self) -> &mut [BlockNode] {
        match self {
            Metadata::Borrowed(nodes) => nodes,
            Metadata::Owned(nodes) => nodes,
        }
    }
}

fn alloc_metadata(len: usize) -> KResult<Box<[BlockNode]>> {
    let mut nodes = Vec::new();
    nodes
        .try_reserve_exact(len)
        .map_err(|_| KernelError::OutOfMemory)?;
    nodes.resize(len, BlockNode::empty());
    Ok(nodes.into_boxed_slice())
}

#[inline]
const fn left(n: usize) -> usize {
    2 * n + 1
}

#[inline]
const fn right(n: usize) -> usize {
    2 * n + 2
}

#[inline]
const fn parent(n: usize) -> usize {
    (n - 1) / 2
}

#[inline]
const fn align_up(n: usize, align: usize) -> usize {
    (n + align - 1) & !(align - 1)
}

/// One buddy heap
pub struct Heap {
    vaddr: usize,
    size: usize,
    min_block_size: usize,
    alloc_granule: usize,
    size_log2: u32,
    flags: HeapFlags,
    nodes: Metadata,
    mem_allocated: usize,
    mapper: Option<Box<dyn Mappable>>,
}

/// Create a heap over `[vaddr, vaddr + size)`.
///
/// `metadata` may supply the node array (at least
/// [`metadata_size`] entries, e.g. a static buffer for the boot heap);
/// otherwise it is allocated from the global allocator. On-demand heaps
/// need a `mapper`.
pub fn create_heap(
    config: &HeapConfig,
    metadata: Option<&'static mut [BlockNode]>,
    mapper: Option<Box<dyn Mappable>>,
) -> KResult<Heap> {
    let HeapConfig {
        vaddr,
        size,
        min_block_size,
        alloc_granule,
        linear_mapping,
        reclaimable,
    } = *config;

    if !size.is_power_of_two() {
        return Err(KernelError::InvalidConfig("heap size is not a power of two"));
    }
    if !min_block_size.is_power_of_two() {
        return Err(KernelError::InvalidConfig("min block size is not a power of two"));
    }
    if size < min_block_size {
        return Err(KernelError::InvalidConfig("heap smaller than its min block size"));
    }
    if vaddr % min_block_size != 0 {
        return Err(KernelError::InvalidConfig("heap base not aligned to the min block size"));
    }
    if vaddr.checked_add(size).is_none() {
        return Err(KernelError::InvalidConfig("heap range overflows the address space"));
    }

    let granule = if linear_mapping {
        0
    } else {
        if !alloc_granule.is_power_of_two() || alloc_granule % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidConfig("alloc granule is not a power-of-two multiple of the page size"));
        }
        if size < alloc_granule {
            return Err(KernelError::InvalidConfig("heap smaller than its alloc granule"));
        }
        if alloc_granule < min_block_size {
            return Err(KernelError::InvalidConfig("alloc granule smaller than the min block size"));
        }
        if mapper.is_none() {
            return Err(KernelError::InvalidConfig("on-demand heap without a mapper"));
        }
        alloc_granule
    };

    let md_size = metadata_size(size, min_block_size);
    let nodes = match metadata {
        Some(buf) => {
            if buf.len() < md_size {
                return Err(KernelError::InvalidConfig("metadata buffer too small"));
            }
            buf.fill(BlockNode::empty());
            Metadata::Borrowed(buf)
        }
        None => Metadata::Owned(alloc_metadata(md_size)?),
    };

    let mut flags = HeapFlags::empty();
    flags.set(HeapFlags::LINEAR_MAPPING, linear_mapping);
    flags.set(HeapFlags::RECLAIMABLE, reclaimable);

    log::debug!(
        "heap: created {:#x}..{:#x} min_block {} granule {} {}",
        vaddr,
        vaddr + size,
        min_block_size,
        granule,
        if linear_mapping { "linear" } else { "on-demand" }
    );

    Ok(Heap {
        vaddr,
        size,
        min_block_size,
        alloc_granule: granule,
        size_log2: size.trailing_zeros(),
        flags,
        nodes,
        mem_allocated: 0,
        mapper: if linear_mapping { None } else { mapper },
    })
}

impl Heap {
    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn vaddr(&self) -> usize {
        self.vaddr
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn end(&self) -> usize {
        self.vaddr + self.size
    }

    pub fn min_block_size(&self) -> usize {
        self.min_block_size
    }

    pub fn alloc_granule(&self) -> usize {
        self.alloc_granule
    }

    pub fn flags(&self) -> HeapFlags {
        self.flags
    }

    pub fn is_linear(&self) -> bool {
        self.flags.contains(HeapFlags::LINEAR_MAPPING)
    }

    pub fn is_reclaimable(&self) -> bool {
        self.flags.contains(HeapFlags::RECLAIMABLE)
    }

    /// Bytes currently handed out
    pub fn mem_allocated(&self) -> usize {
        self.mem_allocated
    }

    pub fn free_bytes(&self) -> usize {
        self.size - self.mem_allocated
    }

    pub fn is_empty(&self) -> bool {
        self.mem_allocated == 0
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.vaddr && addr < self.end()
    }

    pub fn overlaps(&self, vaddr: usize, size: usize) -> bool {
        vaddr < self.end() && self.vaddr < vaddr.saturating_add(size)
    }

    /// Size of the metadata node array
    pub fn metadata_len(&self) -> usize {
        self.nodes.len()
    }

    /// Block size a request of `size` bytes is rounded to, `None` if no
    /// block of this heap is that large
    pub fn round_size(&self, size: usize) -> Option<usize> {
        round_up_pow2(size, self.min_block_size).filter(|&block| block <= self.size)
    }

    // ========================================================================
    // Tree arithmetic
    // ========================================================================

    #[inline]
    fn node_of(&self, offset: usize, block_size: usize) -> usize {
        let log = block_size.trailing_zeros();
        let nodes_before = (1usize << (self.size_log2 - log)) - 1;
        nodes_before + (offset >> log)
    }

    #[inline]
    fn offset_of(&self, node: usize, block_size: usize) -> usize {
        let log = block_size.trailing_zeros();
        let nodes_before = (1usize << (self.size_log2 - log)) - 1;
        (node - nodes_before) << log
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a block of at least `size` bytes. Returns `None` when the
    /// heap cannot satisfy the request.
    pub fn alloc(&mut self, size: usize) -> Option<usize> {
        self.alloc_ex(size, AllocFlags::empty()).map(|a| a.addr)
    }

    /// Allocate with explicit flags, reporting the bytes charged
    pub fn alloc_ex(&mut self, size: usize, flags: AllocFlags) -> Option<Allocation> {
        if size == 0 {
            return None;
        }
        let rounded = self.round_size(size)?;
        if rounded > self.free_bytes() {
            return None;
        }

        if flags.contains(AllocFlags::MULTI_STEP) {
            let desired = align_up(size, self.min_block_size);
            if desired < rounded {
                return self.alloc_multi_step(desired, rounded);
            }
        }

        let node = self.claim_node(0, self.size, rounded)?;
        let offset = self.offset_of(node, rounded);
        if !self.map_granules(offset, rounded) {
            self.release_block(offset, rounded);
            log::warn!("heap {:#x}: backing memory exhausted for {} bytes", self.vaddr, rounded);
            return None;
        }
        self.mem_allocated += rounded;
        Some(Allocation {
            addr: self.vaddr + offset,
            size: rounded,
        })
    }

    /// Descend from `node` (of `node_size` bytes) looking for a free block
    /// of exactly `size` bytes, leftmost first. Marks the block FULL and
    /// updates the SPLIT/FULL state of every node on the path.
    fn claim_node(&mut self, node: usize, node_size: usize, size: usize) -> Option<usize> {
        let state = self.nodes[node];
        if state.contains(BlockNode::FULL) {
            return None;
        }

        if node_size / 2 < size {
            if state.contains(BlockNode::SPLIT) {
                return None;
            }
            self.nodes[node].insert(BlockNode::FULL);
            return Some(node);
        }

        let was_split = state.contains(BlockNode::SPLIT);
        self.nodes[node].insert(BlockNode::SPLIT);

        let half = node_size / 2;
        let found = self
            .claim_node(left(node), half, size)
            .or_else(|| self.claim_node(right(node), half, size));

        match found {
            Some(_) => {
                if self.nodes[left(node)].contains(BlockNode::FULL)
                    && self.nodes[right(node)].contains(BlockNode::FULL)
                {
                    self.nodes[node].insert(BlockNode::FULL);
                }
            }
            None if !was_split => self.nodes[node].remove(BlockNode::SPLIT),
            None => {}
        }
        found
    }

    /// Like [`Heap::claim_node`] but without touching the metadata
    fn peek_free_node(&self, node: usize, node_size: usize, size: usize) -> Option<usize> {
        let state = self.nodes[node];
        if state.contains(BlockNode::FULL) {
            return None;
        }
        if node_size / 2 < size {
            return if state.contains(BlockNode::SPLIT) { None } else { Some(node) };
        }
        if !state.contains(BlockNode::SPLIT) {
            // free subtree: its leftmost block of the right size
            let mut n = node;
            let mut s = node_size;
            while s > size {
                n = left(n);
                s /= 2;
            }
            return Some(n);
        }
        let half = node_size / 2;
        self.peek_free_node(left(node), half, size)
            .or_else(|| self.peek_free_node(right(node), half, size))
    }

    /// Reserve a `rounded`-sized region and allocate the power-of-two pieces
    /// of `desired`, largest first, contiguously from its start.
    fn alloc_multi_step(&mut self, desired: usize, rounded: usize) -> Option<Allocation> {
        let big_node = self.peek_free_node(0, self.size, rounded)?;
        let big_offset = self.offset_of(big_node, rounded);

        let mut n = big_node;
        while n != 0 {
            n = parent(n);
            self.nodes[n].insert(BlockNode::SPLIT);
        }

        let mut done = 0;
        let mut bit = rounded >> 1;
        while bit >= self.min_block_size {
            if desired & bit != 0 {
                let node = self.claim_node(big_node, rounded, bit);
                let offset = node.map(|n| self.offset_of(n, bit));
                let ok = match offset {
                    Some(off) => {
                        debug_assert_eq!(off, big_offset + done);
                        if self.map_granules(off, bit) {
                            true
                        } else {
                            self.release_block(off, bit);
                            false
                        }
                    }
                    None => false,
                };
                if !ok {
                    self.free_multi_step(big_offset, done, false);
                    if done == 0 {
                        self.collapse_ancestors(big_node);
                    }
                    log::warn!("heap {:#x}: multi-step allocation of {} bytes failed", self.vaddr, desired);
                    return None;
                }
                self.mem_allocated += bit;
                done += bit;
            }
            bit >>= 1;
        }

        let mut n = big_node;
        while n != 0 {
            let p = parent(n);
            if self.nodes[left(p)].contains(BlockNode::FULL)
                && self.nodes[right(p)].contains(BlockNode::FULL)
            {
                self.nodes[p].insert(BlockNode::FULL);
            } else {
                break;
            }
            n = p;
        }

        Some(Allocation {
            addr: self.vaddr + big_offset,
            size: desired,
        })
    }

    /// Undo SPLIT marks above `node` whose children are both free
    fn collapse_ancestors(&mut self, mut node: usize) {
        while node != 0 {
            let p = parent(node);
            if self.nodes[left(p)].is_free() && self.nodes[right(p)].is_free() {
                self.nodes[p].remove(BlockNode::SPLIT | BlockNode::FULL);
            } else {
                break;
            }
            node = p;
        }
    }

    // ========================================================================
    // Backing memory
    // ========================================================================

    /// Map every granule touched by `[offset, offset + block_size)` that is
    /// not backed yet.
    fn map_granules(&mut self, offset: usize, block_size: usize) -> bool {
        if self.is_linear() {
            return true;
        }
        let granule = self.alloc_granule;
        let first = offset & !(granule - 1);
        let count = 1 + (block_size - 1) / granule;
        let mut ok = true;

        for i in 0..count {
            let g_offset = first + i * granule;
            let g_node = self.node_of(g_offset, granule);
            if self.nodes[g_node].contains(BlockNode::ALLOCATED) {
                continue;
            }
            let vaddr = self.vaddr + g_offset;
            let mapped = match self.mapper.as_mut() {
                Some(mapper) => mapper.map(vaddr, granule / PAGE_SIZE),
                None => false,
            };
            if mapped {
                self.nodes[g_node].remove(BlockNode::ALLOC_FAILED);
                self.nodes[g_node].insert(BlockNode::ALLOCATED);
            } else {
                self.nodes[g_node].insert(BlockNode::ALLOC_FAILED);
                ok = false;
                break;
            }
        }
        ok
    }

    /// Unmap the granules touched by a block whose coalesced free region
    /// reached the granule size.
    fn unmap_granules(&mut self, offset: usize, block_size: usize) {
        let granule = self.alloc_granule;
        let first = offset & !(granule - 1);
        let count = 1 + (block_size - 1) / granule;

        for i in 0..count {
            let g_offset = first + i * granule;
            let g_node = self.node_of(g_offset, granule);
            let state = self.nodes[g_node];
            if state.contains(BlockNode::ALLOCATED) {
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.unmap(self.vaddr + g_offset, granule / PAGE_SIZE);
                }
            }
            self.nodes[g_node].remove(BlockNode::ALLOCATED | BlockNode::ALLOC_FAILED);
        }
    }

    // ========================================================================
    // Free
    // ========================================================================

    /// Free the block at `addr`. A `size` of 0 means "look it up in the
    /// metadata". Returns the number of bytes released.
    ///
    /// Freeing an address that is not the start of a live block of that
    /// size is a contract violation and panics.
    pub fn free(&mut self, addr: usize, size: usize) -> usize {
        self.free_ex(addr, size, FreeFlags::empty())
    }

    pub fn free_ex(&mut self, addr: usize, size: usize, flags: FreeFlags) -> usize {
        assert!(
            self.contains(addr),
            "heap {:#x}: free of {:#x} outside the heap",
            self.vaddr,
            addr
        );
        let offset = addr - self.vaddr;
        let allow_split = flags.contains(FreeFlags::ALLOW_SPLIT);
        assert!(
            size != 0 || !(allow_split || flags.contains(FreeFlags::MULTI_STEP)),
            "heap {:#x}: {:?} free needs the size",
            self.vaddr,
            flags
        );

        if flags.contains(FreeFlags::MULTI_STEP) {
            assert!(size <= self.size, "heap {:#x}: free of {} bytes, larger than the heap", self.vaddr, size);
            let desired = align_up(size, self.min_block_size);
            return self.free_multi_step(offset, desired, allow_split);
        }

        let block = if size == 0 {
            self.block_size_at(offset)
        } else {
            match self.round_size(size) {
                Some(block) => block,
                None => panic!("heap {:#x}: free of {} bytes, larger than the heap", self.vaddr, size),
            }
        };
        assert!(
            offset % block == 0 && offset + block <= self.size,
            "heap {:#x}: misaligned free of {:#x} (block size {})",
            self.vaddr,
            addr,
            block
        );
        self.free_block(offset, block, allow_split)
    }

    fn free_multi_step(&mut self, offset: usize, desired: usize, allow_split: bool) -> usize {
        let mut done = 0;
        let mut freed = 0;
        let mut bit = self.round_size(desired).unwrap_or(self.size);
        while bit >= self.min_block_size {
            if desired & bit != 0 {
                freed += self.free_block(offset + done, bit, allow_split);
                done += bit;
            }
            bit >>= 1;
        }
        freed
    }

    fn free_block(&mut self, offset: usize, block: usize, allow_split: bool) -> usize {
        let node = self.node_of(offset, block);
        let live = if allow_split && self.nodes[node].contains(BlockNode::SPLIT) {
            let live = self.live_bytes(node, block);
            self.clear_subtree(node, block);
            self.nodes[node].insert(BlockNode::FULL);
            live
        } else {
            self.check_allocated(offset, block);
            block
        };
        self.mem_allocated -= live;
        self.release_block(offset, block);
        live
    }

    /// Bytes of the live blocks inside the subtree of `node`
    fn live_bytes(&self, node: usize, size: usize) -> usize {
        let state = self.nodes[node];
        if !state.contains(BlockNode::SPLIT) {
            return if state.contains(BlockNode::FULL) { size } else { 0 };
        }
        self.live_bytes(left(node), size / 2) + self.live_bytes(right(node), size / 2)
    }

    /// Forget every block below `node`, keeping the granule mapping state
    fn clear_subtree(&mut self, node: usize, size: usize) {
        let mut first = node;
        let mut count = 1;
        let mut s = size;
        while s >= self.min_block_size {
            for n in first..first + count {
                self.nodes[n].remove(BlockNode::SPLIT | BlockNode::FULL);
            }
            first = left(first);
            count <<= 1;
            s >>= 1;
        }
    }

    fn check_allocated(&self, offset: usize, block: usize) {
        let state = self.nodes[self.node_of(offset, block)];
        assert!(
            state.contains(BlockNode::FULL) && !state.contains(BlockNode::SPLIT),
            "heap {:#x}: block {:#x} of {} bytes is not allocated (double free or size mismatch)",
            self.vaddr,
            self.vaddr + offset,
            block
        );
    }

    /// Mark the block free, coalesce upwards and drop backing memory that
    /// is no longer needed.
    fn release_block(&mut self, offset: usize, block: usize) {
        let node = self.node_of(offset, block);
        let biggest_free = self.set_free_uplevels(node, block);
        if !self.is_linear() && biggest_free >= self.alloc_granule {
            self.unmap_granules(offset, block);
        }
    }

    /// Returns the size of the largest free block now containing `node`
    fn set_free_uplevels(&mut self, node: usize, size: usize) -> usize {
        self.nodes[node].remove(BlockNode::FULL);
        let mut biggest = size;
        let mut n = node;

        while n != 0 {
            let p = parent(n);
            if !(self.nodes[left(p)].is_free() && self.nodes[right(p)].is_free()) {
                break;
            }
            self.nodes[p].remove(BlockNode::SPLIT | BlockNode::FULL);
            biggest <<= 1;
            n = p;
        }

        // one free descendant is enough for every ancestor to be non-full
        while n != 0 {
            n = parent(n);
            self.nodes[n].remove(BlockNode::FULL);
        }
        biggest
    }

    /// Size of the allocated block starting at `addr`
    pub fn block_size(&self, addr: usize) -> usize {
        assert!(self.contains(addr), "heap {:#x}: {:#x} outside the heap", self.vaddr, addr);
        self.block_size_at(addr - self.vaddr)
    }

    fn block_size_at(&self, offset: usize) -> usize {
        let mut node = 0;
        let mut base = 0;
        let mut size = self.size;
        while size > self.min_block_size && self.nodes[node].contains(BlockNode::SPLIT) {
            size >>= 1;
            if offset >= base + size {
                base += size;
                node = right(node);
            } else {
                node = left(node);
            }
        }
        size
    }

    /// Give back the backing memory of every mapped granule, live blocks
    /// included. Used when the heap's address space goes away. Returns
    /// the number of granules unmapped.
    pub fn unmap_all(&mut self) -> usize {
        if self.is_linear() {
            return 0;
        }
        let granule = self.alloc_granule;
        let mut count = 0;
        for g_offset in (0..self.size).step_by(granule) {
            let g_node = self.node_of(g_offset, granule);
            if self.nodes[g_node].contains(BlockNode::ALLOCATED) {
                if let Some(mapper) = self.mapper.as_mut() {
                    mapper.unmap(self.vaddr + g_offset, granule / PAGE_SIZE);
                }
                self.nodes[g_node].remove(BlockNode::ALLOCATED);
                count += 1;
            }
        }
        count
    }

    // ========================================================================
    // Duplication
    // ========================================================================

    /// Copy of this heap's metadata over the same range
    pub fn dup(&self) -> KResult<Heap> {
        self.dup_expanded(self.size)
    }

    /// Copy of this heap grown to `new_size` bytes. The extra space is
    /// free; every live block keeps its address.
    pub fn dup_expanded(&self, new_size: usize) -> KResult<Heap> {
        if !new_size.is_power_of_two() || new_size < self.size {
            return Err(KernelError::InvalidConfig("expanded heap size must be a larger power of two"));
        }
        if self.vaddr.checked_add(new_size).is_none() {
            return Err(KernelError::InvalidConfig("heap range overflows the address space"));
        }

        let md_size = metadata_size(new_size, self.min_block_size);
        let mut heap = Heap {
            vaddr: self.vaddr,
            size: new_size,
            min_block_size: self.min_block_size,
            alloc_granule: self.alloc_granule,
            size_log2: new_size.trailing_zeros(),
            flags: self.flags,
            nodes: Metadata::Owned(alloc_metadata(md_size)?),
            mem_allocated: self.mem_allocated,
            mapper: self.mapper.as_ref().map(|m| m.duplicate()),
        };

        let old_root_free = self.nodes[0].is_free();
        let mut per_row = 1;
        let mut block = new_size;
        while block >= self.min_block_size {
            let new_first = heap.node_of(0, block);
            if block > self.size {
                if !old_root_free {
                    heap.nodes[new_first].insert(BlockNode::SPLIT);
                }
            } else {
                let old_first = self.node_of(0, block);
                heap.nodes[new_first..new_first + per_row]
                    .copy_from_slice(&self.nodes[old_first..old_first + per_row]);
                per_row *= 2;
            }
            block >>= 1;
        }

        log::debug!(
            "heap: duplicated {:#x} ({} -> {} bytes, {} allocated)",
            self.vaddr,
            self.size,
            new_size,
            self.mem_allocated
        );
        Ok(heap)
    }
}

impl fmt::Debug for Heap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("vaddr", &format_args!("{:#x}", self.vaddr))
            .field("size", &self.size)
            .field("min_block_size", &self.min_block_size)
            .field("alloc_granule", &self.alloc_granule)
            .field("flags", &self.flags)
            .field("mem_allocated", &self.mem_allocated)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use spin::Mutex;

    const BASE: usize = 0x4000_0000;

    fn linear_heap(size: usize, min_block: usize) -> Heap {
        create_heap(&HeapConfig::linear(BASE, size, min_block), None, None).unwrap()
    }

    #[derive(Default)]
    struct MapLog {
        mapped: Vec<(usize, usize)>,
        unmapped: Vec<(usize, usize)>,
        fail: bool,
    }

    struct TestMapper(Arc<Mutex<MapLog>>);

    impl Mappable for TestMapper {
        fn map(&mut self, vaddr: usize, page_count: usize) -> bool {
            let mut log = self.0.lock();
            if log.fail {
                return false;
            }
            log.mapped.push((vaddr, page_count));
            true
        }

        fn unmap(&mut self, vaddr: usize, page_count: usize) {
            self.0.lock().unmapped.push((vaddr, page_count));
        }

        fn duplicate(&self) -> Box<dyn Mappable> {
            Box::new(TestMapper(self.0.clone()))
        }
    }

    fn on_demand_heap(size: usize, granule: usize) -> (Heap, Arc<Mutex<MapLog>>) {
        let log = Arc::new(Mutex::new(MapLog::default()));
        let heap = create_heap(
            &HeapConfig::on_demand(BASE, size, 32, granule),
            None,
            Some(Box::new(TestMapper(log.clone()))),
        )
        .unwrap();
        (heap, log)
    }

    #[test]
    fn test_create_heap_validation() {
        let bad = |cfg: HeapConfig| create_heap(&cfg, None, None).unwrap_err();

        assert!(matches!(bad(HeapConfig::linear(BASE, 3000, 32)), KernelError::InvalidConfig(_)));
        assert!(matches!(bad(HeapConfig::linear(BASE, 4096, 48)), KernelError::InvalidConfig(_)));
        assert!(matches!(bad(HeapConfig::linear(BASE + 8, 4096, 32)), KernelError::InvalidConfig(_)));
        assert!(matches!(bad(HeapConfig::linear(BASE, 16, 32)), KernelError::InvalidConfig(_)));
        // on-demand heaps need a mapper and a page-multiple granule
        assert!(matches!(
            bad(HeapConfig::on_demand(BASE, 65536, 32, 4 * PAGE_SIZE)),
            KernelError::InvalidConfig(_)
        ));
        let log = Arc::new(Mutex::new(MapLog::default()));
        let err = create_heap(
            &HeapConfig::on_demand(BASE, 65536, 32, 1000),
            None,
            Some(Box::new(TestMapper(log.clone()))),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
        let err = create_heap(
            &HeapConfig::on_demand(BASE, 4096, 32, 2 * PAGE_SIZE),
            None,
            Some(Box::new(TestMapper(log))),
        )
        .unwrap_err();
        assert!(matches!(err, KernelError::InvalidConfig(_)));
    }

    #[test]
    fn test_supplied_metadata() {
        let buf: &'static mut [BlockNode] = Box::leak(alloc::vec![BlockNode::FULL; 256].into_boxed_slice());
        let heap = create_heap(&HeapConfig::linear(BASE, 4096, 32), Some(buf), None).unwrap();
        assert_eq!(heap.metadata_len(), 256);
        assert!(heap.is_empty());

        let small: &'static mut [BlockNode] = Box::leak(alloc::vec![BlockNode::empty(); 100].into_boxed_slice());
        let err = create_heap(&HeapConfig::linear(BASE, 4096, 32), Some(small), None).unwrap_err();
        assert_eq!(err, KernelError::InvalidConfig("metadata buffer too small"));
    }

    #[test]
    fn test_metadata_size() {
        assert_eq!(metadata_size(1 << 20, 32), 65536);
        let heap = linear_heap(4096, 32);
        assert_eq!(heap.metadata_len(), 256);
    }

    #[test]
    fn test_power_of_two_rounding() {
        let mut heap = linear_heap(1 << 16, 32);
        for (req, block) in [(1, 32), (17, 32), (32, 32), (33, 64), (40, 64), (100, 128), (4097, 8192)] {
            let addr = heap.alloc(req).unwrap();
            assert_eq!(heap.block_size(addr), block, "request {}", req);
            assert_eq!(addr % block, 0);
            assert_eq!(heap.free(addr, req), block);
        }
        assert_eq!(heap.mem_allocated(), 0);
    }

    #[test]
    fn test_leftmost_fit() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        let c = heap.alloc(64).unwrap();
        assert_eq!(a, BASE);
        assert_eq!(b, BASE + 32);
        assert_eq!(c, BASE + 64);

        heap.free(a, 32);
        assert_eq!(heap.alloc(32), Some(BASE));
    }

    #[test]
    fn test_exhaustion_and_recovery() {
        let mut heap = linear_heap(4096, 32);
        assert_eq!(heap.alloc(8192), None);
        assert_eq!(heap.alloc(usize::MAX), None);
        assert_eq!(heap.round_size(usize::MAX), None);

        let whole = heap.alloc(4096).unwrap();
        assert_eq!(heap.alloc(32), None);
        heap.free(whole, 4096);

        let a = heap.alloc(2048).unwrap();
        let b = heap.alloc(2048).unwrap();
        assert_eq!(heap.alloc(2048), None);
        assert_eq!(heap.alloc(32), None);
        assert_eq!(heap.free_bytes(), 0);

        heap.free(b, 2048);
        let small = heap.alloc(32).unwrap();
        assert_eq!(small, BASE + 2048);
        assert_eq!(heap.alloc(2048), None);
        assert!(heap.alloc(1024).is_some());

        heap.free(a, 2048);
        assert_eq!(heap.mem_allocated(), 32 + 1024);
    }

    #[test]
    fn test_coalescing() {
        let mut heap = linear_heap(4096, 32);
        let blocks: Vec<usize> = (0..4).map(|_| heap.alloc(1024).unwrap()).collect();
        assert_eq!(heap.alloc(32), None);
        for (i, addr) in blocks.iter().enumerate().rev() {
            heap.free(*addr, 1024);
            assert_eq!(heap.mem_allocated(), i * 1024);
        }
        assert_eq!(heap.alloc(4096), Some(BASE));
    }

    #[test]
    fn test_free_without_size() {
        let mut heap = linear_heap(8192, 32);
        let a = heap.alloc(100).unwrap();
        let b = heap.alloc(1000).unwrap();
        let c = heap.alloc(20).unwrap();
        assert_eq!(heap.free(b, 0), 1024);
        assert_eq!(heap.free(a, 0), 128);
        assert_eq!(heap.free(c, 0), 32);
        assert!(heap.is_empty());
        assert_eq!(heap.alloc(8192), Some(BASE));
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_double_free_panics() {
        let mut heap = linear_heap(4096, 32);
        let _keep = heap.alloc(64).unwrap();
        let a = heap.alloc(64).unwrap();
        heap.free(a, 64);
        heap.free(a, 64);
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_size_mismatch_panics() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc(256).unwrap();
        heap.free(a, 64);
    }

    #[test]
    #[should_panic(expected = "misaligned")]
    fn test_misaligned_free_panics() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc(256).unwrap();
        heap.free(a + 32, 256);
    }

    #[test]
    #[should_panic(expected = "outside the heap")]
    fn test_free_outside_heap_panics() {
        let mut heap = linear_heap(4096, 32);
        heap.free(BASE + 4096, 32);
    }

    #[test]
    fn test_multi_step() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc_ex(1056, AllocFlags::MULTI_STEP).unwrap();
        assert_eq!(a, Allocation { addr: BASE, size: 1056 });
        assert_eq!(heap.mem_allocated(), 1056);

        // the tail of the reserved 2048 bytes stays usable
        assert_eq!(heap.alloc(512), Some(BASE + 1536));
        assert_eq!(heap.alloc(32), Some(BASE + 1056));
        assert_eq!(heap.alloc(2048), Some(BASE + 2048));

        assert_eq!(heap.free_ex(a.addr, 1056, FreeFlags::MULTI_STEP), 1056);
        heap.free(BASE + 1536, 512);
        heap.free(BASE + 1056, 32);
        heap.free(BASE + 2048, 2048);
        assert!(heap.is_empty());
        assert_eq!(heap.alloc(4096), Some(BASE));
    }

    #[test]
    fn test_multi_step_exact_power_is_single_step() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc_ex(1024, AllocFlags::MULTI_STEP).unwrap();
        assert_eq!(a.size, 1024);
        assert_eq!(heap.block_size(a.addr), 1024);
        heap.free(a.addr, 1024);
        assert!(heap.is_empty());
    }

    #[test]
    fn test_split_free_of_whole_heap() {
        let mut heap = linear_heap(4096, 32);
        for _ in 0..3 {
            heap.alloc(1024).unwrap();
        }
        assert_eq!(heap.free_ex(BASE, 4096, FreeFlags::ALLOW_SPLIT), 3072);
        assert!(heap.is_empty());
        assert_eq!(heap.alloc(4096), Some(BASE));
    }

    #[test]
    fn test_split_free_of_partly_allocated_range() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc_ex(1056, AllocFlags::MULTI_STEP).unwrap();
        let other = heap.alloc(2048).unwrap();
        assert_eq!(other, BASE + 2048);

        // 1056 live bytes in the first half, the rest of it never handed out
        assert_eq!(heap.free_ex(a.addr, 2048, FreeFlags::ALLOW_SPLIT), 1056);
        assert_eq!(heap.mem_allocated(), 2048);
        assert_eq!(heap.block_size(other), 2048);
        assert_eq!(heap.alloc(2048), Some(BASE));
    }

    #[test]
    fn test_split_free_of_single_block() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc(512).unwrap();
        assert_eq!(heap.free_ex(a, 512, FreeFlags::ALLOW_SPLIT | FreeFlags::MULTI_STEP), 512);
        assert!(heap.is_empty());
    }

    #[test]
    #[should_panic(expected = "not allocated")]
    fn test_split_free_inside_a_block_panics() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc(2048).unwrap();
        heap.free_ex(a, 1024, FreeFlags::ALLOW_SPLIT);
    }

    #[test]
    #[should_panic(expected = "needs the size")]
    fn test_split_free_without_size_panics() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc(64).unwrap();
        heap.free_ex(a, 0, FreeFlags::ALLOW_SPLIT);
    }

    #[test]
    fn test_split_free_unmaps_granules() {
        let granule = 4 * PAGE_SIZE;
        let (mut heap, log) = on_demand_heap(1 << 16, granule);
        heap.alloc(32).unwrap();
        heap.alloc(32).unwrap();
        heap.alloc(granule).unwrap();
        assert_eq!(log.lock().mapped.len(), 2);

        assert_eq!(heap.free_ex(BASE, 2 * granule, FreeFlags::ALLOW_SPLIT), granule + 64);
        assert!(heap.is_empty());
        assert_eq!(log.lock().unmapped.as_slice(), &[(BASE, 4), (BASE + granule, 4)]);
    }

    #[test]
    fn test_lazy_mapping() {
        let granule = 4 * PAGE_SIZE;
        let (mut heap, log) = on_demand_heap(1 << 16, granule);

        let a = heap.alloc(32).unwrap();
        let b = heap.alloc(32).unwrap();
        assert_eq!(log.lock().mapped.as_slice(), &[(BASE, 4)]);

        let big = heap.alloc(granule).unwrap();
        assert_eq!(big, BASE + granule);
        assert_eq!(log.lock().mapped.len(), 2);

        heap.free(a, 32);
        assert!(log.lock().unmapped.is_empty());
        heap.free(b, 32);
        assert_eq!(log.lock().unmapped.as_slice(), &[(BASE, 4)]);

        heap.free(big, granule);
        assert_eq!(log.lock().unmapped.len(), 2);

        // granule 0 is mapped again on the next allocation
        heap.alloc(64).unwrap();
        assert_eq!(log.lock().mapped.len(), 3);
    }

    #[test]
    fn test_unmap_all() {
        let granule = 4 * PAGE_SIZE;
        let (mut heap, log) = on_demand_heap(1 << 16, granule);
        heap.alloc(32).unwrap();
        heap.alloc(2 * granule).unwrap();
        assert_eq!(log.lock().mapped.len(), 3);

        assert_eq!(heap.unmap_all(), 3);
        assert_eq!(log.lock().unmapped.len(), 3);
        assert_eq!(heap.unmap_all(), 0);
        assert_eq!(linear_heap(4096, 32).unmap_all(), 0);
    }

    #[test]
    fn test_map_failure_rolls_back() {
        let (mut heap, log) = on_demand_heap(1 << 16, 4 * PAGE_SIZE);
        log.lock().fail = true;
        assert_eq!(heap.alloc(32), None);
        assert_eq!(heap.alloc_ex(3 * 4096 + 32, AllocFlags::MULTI_STEP), None);
        assert!(heap.is_empty());

        log.lock().fail = false;
        assert_eq!(heap.alloc(1 << 16), Some(BASE));
        assert_eq!(log.lock().mapped.len(), 4);
    }

    #[test]
    fn test_dup_is_independent() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc(64).unwrap();
        let b = heap.alloc(512).unwrap();

        let mut copy = heap.dup().unwrap();
        assert_eq!(copy.mem_allocated(), 64 + 512);
        assert_eq!(copy.block_size(b), 512);

        copy.free(a, 64);
        copy.free(b, 512);
        assert!(copy.is_empty());
        assert_eq!(heap.mem_allocated(), 64 + 512);
        // the source heap still owns both blocks
        heap.free(a, 64);
        heap.free(b, 512);
    }

    #[test]
    fn test_dup_expanded() {
        let mut heap = linear_heap(4096, 32);
        let a = heap.alloc(4096).unwrap();

        let mut big = heap.dup_expanded(16384).unwrap();
        assert_eq!(big.size(), 16384);
        assert_eq!(big.alloc(4096), Some(BASE + 4096));
        assert_eq!(big.alloc(8192), Some(BASE + 8192));
        assert_eq!(big.alloc(32), None);

        big.free(a, 4096);
        assert_eq!(big.alloc(2048), Some(BASE));

        let empty = linear_heap(4096, 32);
        let mut grown = empty.dup_expanded(8192).unwrap();
        assert_eq!(grown.alloc(8192), Some(BASE));

        assert!(heap.dup_expanded(2048).is_err());
        assert!(heap.dup_expanded(6000).is_err());
    }

    #[test]
    fn test_dup_shares_mapper_capability() {
        let (mut heap, log) = on_demand_heap(1 << 16, 4 * PAGE_SIZE);
        heap.alloc(32).unwrap();
        let mut copy = heap.dup().unwrap();
        // granule 0 is already backed in the copy
        copy.alloc(32).unwrap();
        assert_eq!(log.lock().mapped.len(), 1);
        copy.alloc(4 * PAGE_SIZE).unwrap();
        assert_eq!(log.lock().mapped.len(), 2);
    }
}
