//! Kernel configuration
//!
//! Compile-time capacities live here as constants; everything that can
//! vary between kernel instances goes into [`KernelConfig`].

use crate::error::{KResult, KernelError};
use crate::types::PAGE_SIZE;

/// Capacity of the heap directory
pub const KMALLOC_HEAPS_COUNT: usize = 16;

/// Capacity of the tasklet runner table
pub const MAX_TASKLET_RUNNERS: usize = 8;

/// Task ids wrap around at this value
pub const MAX_TID: u32 = 32768;

/// Largest tasklet queue the packed ring state can describe
pub const TASKLET_QUEUE_MAX: u16 = 32768;

/// Size of a small heap, carved out of the main heaps with kmalloc
pub const SMALL_HEAP_SIZE: usize = 8 * PAGE_SIZE;

/// Minimum block size of small heaps
pub const SMALL_HEAP_MIN_BLOCK: usize = 16;

/// Largest request served by the small heaps, about a sixteenth of
/// their size
pub const SMALL_HEAP_MAX_ALLOC: usize = SMALL_HEAP_SIZE / 16 - 1;

/// Heap directory settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapDirectoryConfig {
    /// Minimum block size of dynamically created heaps
    pub min_block_size: usize,
    /// Default size of a dynamically created heap
    pub dynamic_heap_size: usize,
    /// Mapping granule of dynamically created heaps
    pub alloc_granule: usize,
    /// Maximum number of heaps (capped at [`KMALLOC_HEAPS_COUNT`])
    pub max_heaps: usize,
    /// Empty reclaimable heaps kept around before destroying them
    pub max_empty_heaps: usize,
    /// Serve requests up to [`SMALL_HEAP_MAX_ALLOC`] bytes from small heaps
    pub small_heaps: bool,
}

impl HeapDirectoryConfig {
    pub const fn new() -> Self {
        Self {
            min_block_size: 32,
            dynamic_heap_size: 512 * 1024,
            alloc_granule: 32 * PAGE_SIZE,
            max_heaps: KMALLOC_HEAPS_COUNT,
            max_empty_heaps: 1,
            small_heaps: true,
        }
    }

    pub fn validate(&self) -> KResult<()> {
        if !self.min_block_size.is_power_of_two() {
            return Err(KernelError::InvalidConfig("min block size is not a power of two"));
        }
        if !self.dynamic_heap_size.is_power_of_two() {
            return Err(KernelError::InvalidConfig("dynamic heap size is not a power of two"));
        }
        if !self.alloc_granule.is_power_of_two() || self.alloc_granule % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidConfig("alloc granule is not a power-of-two multiple of the page size"));
        }
        if self.dynamic_heap_size < self.alloc_granule {
            return Err(KernelError::InvalidConfig("dynamic heap smaller than its alloc granule"));
        }
        if self.max_heaps == 0 || self.max_heaps > KMALLOC_HEAPS_COUNT {
            return Err(KernelError::InvalidConfig("max heaps out of range"));
        }
        Ok(())
    }
}

impl Default for HeapDirectoryConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-instance kernel settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelConfig {
    pub heap: HeapDirectoryConfig,
    /// Ticks a task may run before it is preempted
    pub time_slice_ticks: u32,
    /// Upper bound on live tasks, idle task included
    pub max_tasks: usize,
    /// Kernel stack size of every task, allocated with kmalloc
    pub kernel_stack_size: usize,
    /// Queue size of the default tasklet runner
    pub tasklet_queue_size: u16,
}

impl KernelConfig {
    pub const fn new() -> Self {
        Self {
            heap: HeapDirectoryConfig::new(),
            time_slice_ticks: 10,
            max_tasks: 1024,
            kernel_stack_size: 2 * PAGE_SIZE,
            tasklet_queue_size: 128,
        }
    }

    pub const fn with_time_slice(mut self, ticks: u32) -> Self {
        self.time_slice_ticks = ticks;
        self
    }

    pub const fn with_max_tasks(mut self, max_tasks: usize) -> Self {
        self.max_tasks = max_tasks;
        self
    }

    pub const fn with_kernel_stack_size(mut self, size: usize) -> Self {
        self.kernel_stack_size = size;
        self
    }

    pub const fn with_tasklet_queue_size(mut self, size: u16) -> Self {
        self.tasklet_queue_size = size;
        self
    }

    pub const fn with_heap(mut self, heap: HeapDirectoryConfig) -> Self {
        self.heap = heap;
        self
    }

    pub fn validate(&self) -> KResult<()> {
        self.heap.validate()?;
        if self.time_slice_ticks == 0 {
            return Err(KernelError::InvalidConfig("time slice must be at least one tick"));
        }
        // idle + boot task + default tasklet runner
        if self.max_tasks < 3 || self.max_tasks > MAX_TID as usize {
            return Err(KernelError::InvalidConfig("max tasks out of range"));
        }
        if self.kernel_stack_size == 0 || self.kernel_stack_size % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidConfig("kernel stack size is not a multiple of the page size"));
        }
        if self.tasklet_queue_size == 0 || self.tasklet_queue_size > TASKLET_QUEUE_MAX {
            return Err(KernelError::InvalidConfig("tasklet queue size out of range"));
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_configs() {
        let cfg = KernelConfig::new().with_time_slice(0);
        assert!(matches!(cfg.validate(), Err(KernelError::InvalidConfig(_))));

        let cfg = KernelConfig::new().with_kernel_stack_size(1000);
        assert!(cfg.validate().is_err());

        let mut heap = HeapDirectoryConfig::new();
        heap.dynamic_heap_size = 3 * PAGE_SIZE;
        assert!(KernelConfig::new().with_heap(heap).validate().is_err());

        let mut heap = HeapDirectoryConfig::new();
        heap.max_heaps = KMALLOC_HEAPS_COUNT + 1;
        assert!(heap.validate().is_err());
    }
}
