//! Accounting memory arena for stream containers
//!
//! Arrow buffers live on the global heap; the allocator tracks how many bytes
//! each stream's container currently holds so the transport can cap memory
//! per node and detect containers that outlive shutdown.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StreamError, StreamResult};

/// Allocator implementation selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AllocatorKind {
    /// Reservations beyond the limit fail with `OutOfMemory`.
    #[default]
    Accounting,
    /// Usage is tracked but never refused.
    Unbounded,
}

/// Shared, cloneable handle to an allocator node.
#[derive(Clone)]
pub struct BufferAllocator {
    inner: Arc<AllocatorInner>,
}

struct AllocatorInner {
    name: String,
    kind: AllocatorKind,
    limit: usize,
    allocated: AtomicUsize,
    peak: AtomicUsize,
    closed: AtomicBool,
    parent: Option<BufferAllocator>,
}

impl BufferAllocator {
    /// Create a root allocator.
    #[must_use]
    pub fn root(name: impl Into<String>, kind: AllocatorKind, limit: usize) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                name: name.into(),
                kind,
                limit,
                allocated: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                parent: None,
            }),
        }
    }

    /// Create a child allocator whose reservations also count against every
    /// ancestor.
    #[must_use]
    pub fn new_child(&self, name: impl Into<String>, limit: usize) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                name: name.into(),
                kind: self.inner.kind,
                limit: limit.min(self.inner.limit),
                allocated: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
                parent: Some(self.clone()),
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[must_use]
    pub fn limit(&self) -> usize {
        self.inner.limit
    }

    #[must_use]
    pub fn allocated(&self) -> usize {
        self.inner.allocated.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Reserve `bytes`; the returned guard gives them back on drop.
    pub fn reserve(&self, bytes: usize) -> StreamResult<Reservation> {
        self.try_acquire(bytes)?;
        Ok(Reservation {
            allocator: self.clone(),
            bytes,
        })
    }

    fn try_acquire(&self, bytes: usize) -> StreamResult<()> {
        if self.is_closed() {
            return Err(StreamError::Unavailable(format!(
                "allocator '{}' is closed",
                self.inner.name
            )));
        }

        let enforce = self.inner.kind == AllocatorKind::Accounting;
        let mut current = self.inner.allocated.load(Ordering::Acquire);
        loop {
            let next = current.saturating_add(bytes);
            if enforce && next > self.inner.limit {
                return Err(StreamError::OutOfMemory(format!(
                    "allocator '{}' cannot reserve {bytes} bytes ({current} of {} in use)",
                    self.inner.name, self.inner.limit
                )));
            }
            match self.inner.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.inner.peak.fetch_max(next, Ordering::AcqRel);
                    break;
                }
                Err(actual) => current = actual,
            }
        }

        if let Some(parent) = &self.inner.parent {
            if let Err(e) = parent.try_acquire(bytes) {
                self.inner.allocated.fetch_sub(bytes, Ordering::AcqRel);
                return Err(e);
            }
        }
        Ok(())
    }

    fn release(&self, bytes: usize) {
        let previous = self.inner.allocated.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(previous >= bytes, "allocator released more than reserved");
        if let Some(parent) = &self.inner.parent {
            parent.release(bytes);
        }
    }

    /// Close the allocator. Outstanding reservations are reported as a leak;
    /// the bytes stay accounted until their guards drop.
    pub fn close(&self) -> StreamResult<()> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let outstanding = self.allocated();
        if outstanding > 0 {
            warn!(
                allocator = %self.inner.name,
                outstanding,
                "Allocator closed with outstanding memory"
            );
            return Err(StreamError::Internal(format!(
                "memory leaked: {outstanding} bytes outstanding in allocator '{}'",
                self.inner.name
            )));
        }
        debug!(allocator = %self.inner.name, peak = self.peak(), "Allocator closed");
        Ok(())
    }
}

impl std::fmt::Debug for BufferAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferAllocator")
            .field("name", &self.inner.name)
            .field("kind", &self.inner.kind)
            .field("limit", &self.inner.limit)
            .field("allocated", &self.allocated())
            .finish()
    }
}

/// Bytes held against an allocator until dropped.
#[derive(Debug)]
pub struct Reservation {
    allocator: BufferAllocator,
    bytes: usize,
}

impl Reservation {
    #[must_use]
    pub const fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.allocator.release(self.bytes);
    }
}
