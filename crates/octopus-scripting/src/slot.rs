//! Per-worker storage
//!
//! Script state is not shared between workers. Configuration allocates one slot per script
//! up front, holding one value per worker, and each filter reads the value for the worker it
//! runs on.

/// Hands out per-worker slots
#[derive(Debug, Clone, Copy)]
pub struct SlotAllocator {
    worker_count: usize,
}

impl SlotAllocator {
    /// Allocator for `worker_count` workers (at least one)
    pub fn new(worker_count: usize) -> Self {
        Self {
            worker_count: worker_count.max(1),
        }
    }

    /// Number of workers
    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    /// Allocate a slot, building each worker's value with `init(worker)`
    pub fn allocate_slot<T>(&self, init: impl FnMut(usize) -> T) -> ThreadLocalSlot<T> {
        ThreadLocalSlot {
            values: (0..self.worker_count).map(init).collect(),
        }
    }
}

impl Default for SlotAllocator {
    fn default() -> Self {
        Self::new(1)
    }
}

/// One value per worker
#[derive(Debug)]
pub struct ThreadLocalSlot<T> {
    values: Vec<T>,
}

impl<T> ThreadLocalSlot<T> {
    /// Value owned by `worker`
    pub fn get(&self, worker: usize) -> Option<&T> {
        self.values.get(worker)
    }

    /// Number of workers covered by the slot
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether the slot covers no worker
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Values of every worker
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.values.iter()
    }
}
