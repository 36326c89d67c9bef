//! Shared pool of reusable I/O operations.
//!
//! Operations are allocated once and recycled to avoid a heap allocation per
//! request. The pool only grows: when the free list is empty a fresh operation
//! is created, and every operation ever created stays owned by the pool (free
//! list or checked out) until the pool is dropped.

use crate::runtime::operation::{IoOperation, OpId};
use parking_lot::Mutex;
use tracing::{trace, warn};

/// Pool of fixed-capacity operations shared by one engine.
///
/// The free list is a stack, so the most recently released operation is handed
/// out next while its buffer is still warm in cache.
pub struct OperationPool {
    inner: Mutex<PoolInner>,
    buffer_size: usize,
}

struct PoolInner {
    /// Stack of available operations.
    free_list: Vec<IoOperation>,
    /// Checked-out flag per operation handle.
    checked_out: Vec<bool>,
    outstanding: usize,
    next_token: u64,
}

impl OperationPool {
    /// Create a pool with `initial` operations of `buffer_size` bytes each.
    /// Buffers hold at least one byte.
    pub fn new(initial: usize, buffer_size: usize) -> Self {
        let buffer_size = buffer_size.max(1);
        let mut free_list = Vec::with_capacity(initial);
        for i in 0..initial {
            free_list.push(IoOperation::new(OpId(i), buffer_size));
        }

        Self {
            inner: Mutex::new(PoolInner {
                free_list,
                checked_out: vec![false; initial],
                outstanding: 0,
                next_token: 1,
            }),
            buffer_size,
        }
    }

    /// Check an operation out of the pool, growing it if the free list is empty.
    pub fn allocate(&self) -> IoOperation {
        let mut inner = self.inner.lock();

        let mut op = match inner.free_list.pop() {
            Some(op) => op,
            None => {
                let id = OpId(inner.checked_out.len());
                inner.checked_out.push(false);
                trace!(op = id.index(), "Growing operation pool");
                IoOperation::new(id, self.buffer_size)
            }
        };

        inner.checked_out[op.id().index()] = true;
        inner.outstanding += 1;
        let token = inner.next_token;
        inner.next_token += 1;
        op.stamp(token);
        op
    }

    /// Return an operation to the pool.
    ///
    /// The buffer and metadata are blanked before the operation becomes
    /// available again. Operations that were not checked out of this pool are
    /// rejected.
    pub fn release(&self, mut op: IoOperation) {
        let idx = op.id().index();
        op.reset();

        let mut inner = self.inner.lock();
        if !inner.checked_out.get(idx).copied().unwrap_or(false) {
            drop(inner);
            warn!(op = idx, "Rejected release of an operation not checked out");
            return;
        }

        inner.checked_out[idx] = false;
        inner.outstanding -= 1;
        inner.free_list.push(op);
    }

    /// Size of each operation buffer.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Total number of operations ever created.
    pub fn allocated(&self) -> usize {
        self.inner.lock().checked_out.len()
    }

    /// Number of operations sitting in the free list.
    pub fn available(&self) -> usize {
        self.inner.lock().free_list.len()
    }

    /// Number of operations currently checked out.
    pub fn outstanding(&self) -> usize {
        self.inner.lock().outstanding
    }
}
