use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Tallest tower a node can have.
pub const MAX_HEIGHT: usize = 20;

/// Memory footprint of a full-height node. Write batches are limited by
/// this so a batch always fits the arena headroom reserved for it.
pub const MAX_NODE_SIZE: usize = std::mem::size_of::<Node>();

/// A skiplist node, laid out inside the arena.
///
/// Most nodes never use the full tower: the probability of each successive
/// level decreases exponentially, so the allocation is truncated to the
/// drawn height and the trailing tower slots are never touched.
#[repr(C)]
pub(crate) struct Node {
    /// Offset and size of the current value, packed so they can be loaded
    /// and replaced with one atomic operation:
    /// bits 0-31 offset, bits 32-63 size.
    value: AtomicU64,

    // Immutable after the node is linked; no synchronization needed.
    pub(crate) key_offset: u32,
    pub(crate) key_size: u16,
    pub(crate) height: u16,

    /// Next-node offsets, one per level. All accesses go through
    /// load/compare-exchange.
    tower: [AtomicU32; MAX_HEIGHT],
}

pub(crate) fn encode_value(offset: u32, size: u32) -> u64 {
    (size as u64) << 32 | offset as u64
}

pub(crate) fn decode_value(value: u64) -> (u32, u32) {
    (value as u32, (value >> 32) as u32)
}

impl Node {
    pub(crate) fn value_address(&self) -> (u32, u32) {
        decode_value(self.value.load(Ordering::SeqCst))
    }

    pub(crate) fn set_value_address(&self, offset: u32, size: u32) {
        self.value.store(encode_value(offset, size), Ordering::SeqCst);
    }

    pub(crate) fn next_offset(&self, height: usize) -> u32 {
        self.tower[height].load(Ordering::SeqCst)
    }

    pub(crate) fn set_next_offset(&self, height: usize, offset: u32) {
        self.tower[height].store(offset, Ordering::SeqCst);
    }

    pub(crate) fn cas_next_offset(&self, height: usize, old: u32, new: u32) -> bool {
        self.tower[height]
            .compare_exchange(old, new, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}
