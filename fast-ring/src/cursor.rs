use std::sync::atomic::{AtomicUsize, Ordering};

/// A monotonically increasing ring cursor on its own cache line.
///
/// The padding on both sides keeps the producer-owned and consumer-owned
/// cursors from false-sharing a line under concurrent traffic.
#[repr(C, align(128))]
pub(crate) struct PaddedCursor {
    value: AtomicUsize,
    _pad: [u8; 120],
}

impl PaddedCursor {
    pub(crate) const fn new() -> Self {
        Self {
            value: AtomicUsize::new(0),
            _pad: [0; 120],
        }
    }

    #[inline]
    pub(crate) fn load_acquire(&self) -> usize {
        self.value.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn load_relaxed(&self) -> usize {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn store_release(&self, value: usize) {
        self.value.store(value, Ordering::Release);
    }
}

const _: () = assert!(std::mem::size_of::<PaddedCursor>() == 128);
