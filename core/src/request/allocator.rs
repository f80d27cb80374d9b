use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Provides the memory reads are written into.
///
/// Buffers are allocated when a read request is created. A buffer is handed back
/// through `release` if the caller never claims it, either because the read didn't
/// finish or because the request handle was dropped without claiming the result.
pub trait RequestMemoryAllocator: Send + Sync {
    /// Allocate a buffer of at least `size` bytes.
    fn allocate(&self, size: usize) -> Vec<u8>;

    fn release(&self, buffer: Vec<u8>);
}

/// Where a read writes its data.
pub enum ReadOutput {
    /// Read into a caller-provided buffer. It is grown to the read size if needed.
    Buffer(Vec<u8>),
    /// Allocate the buffer through an allocator.
    Allocator(Arc<dyn RequestMemoryAllocator>),
}

impl fmt::Debug for ReadOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadOutput::Buffer(buffer) => write!(f, "Buffer({} bytes)", buffer.len()),
            ReadOutput::Allocator(_) => write!(f, "Allocator"),
        }
    }
}

/// A heap allocator that keeps track of how many of its buffers are still out.
#[derive(Debug, Default)]
pub struct DefaultRequestMemoryAllocator {
    outstanding: AtomicUsize,
}

impl DefaultRequestMemoryAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of buffers that were allocated and not released yet. Buffers that
    /// were claimed by a caller count as outstanding.
    pub fn num_outstanding_allocations(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl RequestMemoryAllocator for DefaultRequestMemoryAllocator {
    fn allocate(&self, size: usize) -> Vec<u8> {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        vec![0; size]
    }

    fn release(&self, buffer: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        drop(buffer);
    }
}
