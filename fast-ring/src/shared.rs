use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::consumer::RingConsumer;
use crate::cursor::PaddedCursor;
use crate::producer::RingProducer;

/// The shared dual-ring storage: an `i32` slab for fixed-size field slots
/// and a byte blob for variable-length payloads.
///
/// Both capacities are powers of two; positions are monotonically
/// increasing counters masked on access, so `head - tail` is always the
/// live occupancy even across wraparound.
pub struct DualRing {
    shared: Arc<Shared>,
}

impl DualRing {
    /// Allocate a ring with `1 << slab_bits` slab slots and
    /// `1 << blob_bits` blob bytes.
    ///
    /// # Panics
    ///
    /// Panics unless `2 <= slab_bits <= 30` and `blob_bits <= 30`. Hosts
    /// configure tighter bounds; the ring only guards its own arithmetic.
    pub fn with_bits(slab_bits: u32, blob_bits: u32) -> Self {
        assert!(
            (2..=30).contains(&slab_bits),
            "slab_bits out of range: {slab_bits}"
        );
        assert!(blob_bits <= 30, "blob_bits out of range: {blob_bits}");
        let slab_len = 1usize << slab_bits;
        let blob_len = 1usize << blob_bits;
        let shared = Shared {
            slab: (0..slab_len).map(|_| UnsafeCell::new(0)).collect(),
            blob: (0..blob_len).map(|_| UnsafeCell::new(0)).collect(),
            slab_mask: slab_len - 1,
            blob_mask: blob_len - 1,
            slab_head: PaddedCursor::new(),
            slab_tail: PaddedCursor::new(),
            blob_head: PaddedCursor::new(),
            blob_tail: PaddedCursor::new(),
            shutdown: AtomicBool::new(false),
        };
        Self {
            shared: Arc::new(shared),
        }
    }

    /// Split into the two single-owner halves.
    pub fn split(self) -> (RingProducer, RingConsumer) {
        let producer = RingProducer::new(Arc::clone(&self.shared));
        let consumer = RingConsumer::new(self.shared);
        (producer, consumer)
    }
}

pub(crate) struct Shared {
    slab: Box<[UnsafeCell<i32>]>,
    blob: Box<[UnsafeCell<u8>]>,
    slab_mask: usize,
    blob_mask: usize,
    pub(crate) slab_head: PaddedCursor,
    pub(crate) slab_tail: PaddedCursor,
    pub(crate) blob_head: PaddedCursor,
    pub(crate) blob_tail: PaddedCursor,
    pub(crate) shutdown: AtomicBool,
}

// SAFETY: the buffers are plain memory behind UnsafeCell. Exactly one
// RingProducer writes the region between the published tail and its working
// head, and exactly one RingConsumer reads the region between its working
// tail and the published head; the regions are disjoint and hand over only
// through release/acquire cursor stores.
unsafe impl Send for Shared {}
unsafe impl Sync for Shared {}

impl Shared {
    #[inline]
    pub(crate) fn slab_capacity(&self) -> usize {
        self.slab_mask + 1
    }

    #[inline]
    pub(crate) fn blob_capacity(&self) -> usize {
        self.blob_mask + 1
    }

    /// # Safety
    ///
    /// `pos` must lie in the region currently owned by the caller's side.
    #[inline]
    pub(crate) unsafe fn slab_write(&self, pos: usize, value: i32) {
        *self.slab[pos & self.slab_mask].get() = value;
    }

    /// # Safety
    ///
    /// `pos` must lie in the region currently owned by the caller's side.
    #[inline]
    pub(crate) unsafe fn slab_read(&self, pos: usize) -> i32 {
        *self.slab[pos & self.slab_mask].get()
    }

    /// Copy `src` into the blob at `pos`, wrapping once if needed.
    ///
    /// # Safety
    ///
    /// `[pos, pos + src.len())` must lie in the producer-owned blob region
    /// and `src.len()` must not exceed the blob capacity.
    pub(crate) unsafe fn blob_write(&self, pos: usize, src: &[u8]) {
        let base = self.blob.as_ptr() as *mut u8;
        let start = pos & self.blob_mask;
        let first = src.len().min(self.blob_capacity() - start);
        std::ptr::copy_nonoverlapping(src.as_ptr(), base.add(start), first);
        if first < src.len() {
            std::ptr::copy_nonoverlapping(src.as_ptr().add(first), base, src.len() - first);
        }
    }

    /// Borrow `[pos, pos + len)` of the blob as at most two slices.
    ///
    /// # Safety
    ///
    /// The range must lie in the consumer-owned blob region and `len` must
    /// not exceed the blob capacity.
    pub(crate) unsafe fn blob_slices(&self, pos: usize, len: usize) -> (&[u8], &[u8]) {
        let base = self.blob.as_ptr() as *const u8;
        let start = pos & self.blob_mask;
        let first = len.min(self.blob_capacity() - start);
        (
            std::slice::from_raw_parts(base.add(start), first),
            std::slice::from_raw_parts(base, len - first),
        )
    }

    #[inline]
    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}
