use std::fmt;
use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;

/// A read-only media buffer shared between a producer and its subscribers.
///
/// Each handle represents one hold on the underlying bytes. Creating the
/// buffer takes the initial hold; [`SharedBuffer::hold`] (and `Clone`) take
/// another; dropping a handle releases its hold. When the last hold is
/// released the optional release callback runs, exactly once.
pub struct SharedBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    data: Bytes,
    holds: AtomicUsize,
    on_release: Option<Box<dyn Fn() + Send + Sync>>,
}

impl SharedBuffer {
    /// Wrap `data` with an initial hold count of one.
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: data.into(),
                holds: AtomicUsize::new(1),
                on_release: None,
            }),
        }
    }

    /// Wrap `data` and register a callback to run when the last hold drops.
    pub fn with_release(
        data: impl Into<Bytes>,
        on_release: impl Fn() + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                data: data.into(),
                holds: AtomicUsize::new(1),
                on_release: Some(Box::new(on_release)),
            }),
        }
    }

    /// Take an additional hold on the buffer.
    pub fn hold(&self) -> SharedBuffer {
        self.inner.holds.fetch_add(1, Ordering::Relaxed);
        SharedBuffer {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.data.is_empty()
    }

    /// Current hold count (diagnostics and tests).
    pub fn holds(&self) -> usize {
        self.inner.holds.load(Ordering::Relaxed)
    }
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        self.hold()
    }
}

impl Deref for SharedBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.inner.data
    }
}

impl Drop for SharedBuffer {
    fn drop(&mut self) {
        if self.inner.holds.fetch_sub(1, Ordering::AcqRel) == 1
            && let Some(cb) = &self.inner.on_release
        {
            cb();
        }
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("holds", &self.holds())
            .finish()
    }
}
