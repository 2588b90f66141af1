use std::sync::Arc;

use crate::error::RingError;
use crate::shared::Shared;
use crate::{EOF_MSG_IDX, EOF_SLOTS};

/// Length slot value marking an absent variable-length field.
pub(crate) const NULL_LEN: i32 = -1;

/// Writer half of a [`crate::DualRing`].
///
/// A fragment is written as: `begin_fragment` (reserves slab space and
/// writes the message-index header), the field slots in script order, then
/// `end_fragment` (writes the blob-bytes-consumed trailer). Completed
/// fragments become visible to the consumer on [`RingProducer::publish`],
/// which batching may defer for up to `batch_publish` fragments.
pub struct RingProducer {
    shared: Arc<Shared>,
    /// Working slab head; slots below it are written, above are free.
    head: usize,
    /// Working blob head.
    blob_head: usize,
    /// Slab head after the last completed fragment; what `publish` releases.
    completed_head: usize,
    /// Blob head after the last completed fragment.
    blob_mark: usize,
    cached_slab_tail: usize,
    cached_blob_tail: usize,
    fragment_base: usize,
    in_fragment: bool,
    batch_publish: u32,
    publish_count_down: u32,
}

impl RingProducer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            head: 0,
            blob_head: 0,
            completed_head: 0,
            blob_mark: 0,
            cached_slab_tail: 0,
            cached_blob_tail: 0,
            fragment_base: 0,
            in_fragment: false,
            batch_publish: 1,
            publish_count_down: 1,
        }
    }

    /// Defer publication for up to `n` completed fragments. The publish is
    /// still forced before the producer ever blocks on ring space, so the
    /// consumer cannot be starved by a large batch.
    pub fn set_batch_publish(&mut self, n: u32) {
        self.batch_publish = n.max(1);
        self.publish_count_down = self.batch_publish;
    }

    /// Begin a fragment of `slots` slab slots (header and trailer
    /// included), blocking on slab space. Fails only on shutdown.
    pub fn begin_fragment(&mut self, msg_idx: i32, slots: usize) -> Result<(), RingError> {
        debug_assert!(!self.in_fragment, "fragment already open");
        debug_assert!(slots >= 2 && slots <= self.shared.slab_capacity());
        self.reserve_slab(slots)?;
        self.fragment_base = self.head;
        self.in_fragment = true;
        // SAFETY: reserve_slab established ownership of `slots` slots.
        unsafe { self.shared.slab_write(self.head, msg_idx) };
        self.head += 1;
        Ok(())
    }

    /// Non-blocking [`RingProducer::begin_fragment`].
    pub fn try_begin_fragment(&mut self, msg_idx: i32, slots: usize) -> Result<(), RingError> {
        debug_assert!(!self.in_fragment, "fragment already open");
        if self.shared.is_shutdown() {
            return Err(RingError::Shutdown);
        }
        if self.slab_free() < slots {
            self.publish();
            self.cached_slab_tail = self.shared.slab_tail.load_acquire();
            if self.slab_free() < slots {
                return Err(RingError::Overflow);
            }
        }
        self.fragment_base = self.head;
        self.in_fragment = true;
        // SAFETY: the free-space check above established ownership.
        unsafe { self.shared.slab_write(self.head, msg_idx) };
        self.head += 1;
        Ok(())
    }

    /// Write one int slot.
    #[inline]
    pub fn write_int(&mut self, value: i32) {
        debug_assert!(self.in_fragment);
        // SAFETY: within the region reserved by begin_fragment.
        unsafe { self.shared.slab_write(self.head, value) };
        self.head += 1;
    }

    /// Write a long as two slots, MSB first.
    #[inline]
    pub fn write_long(&mut self, value: i64) {
        self.write_int((value >> 32) as i32);
        self.write_int(value as i32);
    }

    /// Write a decimal as an exponent slot followed by a mantissa long.
    #[inline]
    pub fn write_decimal(&mut self, exponent: i32, mantissa: i64) {
        self.write_int(exponent);
        self.write_long(mantissa);
    }

    /// Append `data` to the blob and write its `{meta, length}` slot pair,
    /// blocking on blob space. Fails only on shutdown.
    pub fn append_bytes(&mut self, data: &[u8]) -> Result<(), RingError> {
        debug_assert!(self.in_fragment);
        self.reserve_blob(data.len())?;
        // The meta slot is the low bits of the absolute blob position; the
        // consumer masks it back onto the buffer. Blob capacity is bounded
        // well below 2^31 so the truncation is lossless.
        unsafe {
            self.shared.slab_write(self.head, self.blob_head as i32);
            self.shared.slab_write(self.head + 1, data.len() as i32);
            self.shared.blob_write(self.blob_head, data);
        }
        self.head += 2;
        self.blob_head += data.len();
        Ok(())
    }

    /// Write a `{meta, length}` pair referencing catalog constant
    /// `const_idx` instead of blob storage.
    pub fn write_const_ref(&mut self, const_idx: u32, len: i32) {
        debug_assert!(self.in_fragment);
        let meta = -(const_idx as i32) - 1;
        self.write_int(meta);
        self.write_int(len);
    }

    /// Write the `{meta, length}` pair for an absent variable-length field.
    pub fn write_null_bytes(&mut self) {
        debug_assert!(self.in_fragment);
        self.write_int(0);
        self.write_int(NULL_LEN);
    }

    /// Close the fragment: writes the blob-bytes-consumed trailer and,
    /// when the publish batch is exhausted, releases the new heads.
    pub fn end_fragment(&mut self) {
        debug_assert!(self.in_fragment);
        let consumed = (self.blob_head - self.blob_mark) as i32;
        // SAFETY: the trailer slot was reserved by begin_fragment.
        unsafe { self.shared.slab_write(self.head, consumed) };
        self.head += 1;
        self.in_fragment = false;
        self.completed_head = self.head;
        self.blob_mark = self.blob_head;
        self.publish_count_down -= 1;
        if self.publish_count_down == 0 {
            self.publish();
        }
    }

    /// Discard every slot and blob byte of the open fragment.
    pub fn abandon(&mut self) {
        debug_assert!(self.in_fragment);
        self.head = self.fragment_base;
        self.blob_head = self.blob_mark;
        self.in_fragment = false;
    }

    /// [`RingProducer::abandon`] if a fragment is open; error paths call
    /// this without tracking whether one is.
    pub fn abandon_if_open(&mut self) {
        if self.in_fragment {
            self.abandon();
        }
    }

    /// Release all completed fragments to the consumer.
    ///
    /// The blob head is stored first; the release-store on the slab head
    /// is what carries the happens-before for both buffers.
    pub fn publish(&mut self) {
        self.shared.blob_head.store_release(self.blob_mark);
        self.shared.slab_head.store_release(self.completed_head);
        self.publish_count_down = self.batch_publish;
    }

    /// Publish the end-of-stream sentinel and flush.
    pub fn publish_eof(&mut self) -> Result<(), RingError> {
        self.begin_fragment(EOF_MSG_IDX, EOF_SLOTS)?;
        self.end_fragment();
        self.publish();
        tracing::debug!("published end-of-stream sentinel");
        Ok(())
    }

    /// Raise the shared shutdown flag.
    pub fn request_shutdown(&self) {
        self.shared.request_shutdown();
    }

    /// Whether the shared shutdown flag is raised.
    pub fn is_shutdown(&self) -> bool {
        self.shared.is_shutdown()
    }

    #[inline]
    fn slab_free(&self) -> usize {
        self.shared.slab_capacity() - (self.head - self.cached_slab_tail)
    }

    #[inline]
    fn blob_free(&self) -> usize {
        self.shared.blob_capacity() - (self.blob_head - self.cached_blob_tail)
    }

    fn reserve_slab(&mut self, slots: usize) -> Result<(), RingError> {
        if self.slab_free() >= slots {
            return Ok(());
        }
        // Completed work must be visible before this side blocks, or the
        // two stages deadlock with a full batch in flight.
        self.publish();
        loop {
            self.cached_slab_tail = self.shared.slab_tail.load_acquire();
            if self.slab_free() >= slots {
                return Ok(());
            }
            if self.shared.is_shutdown() {
                return Err(RingError::Shutdown);
            }
            std::thread::yield_now();
        }
    }

    fn reserve_blob(&mut self, len: usize) -> Result<(), RingError> {
        if len > self.shared.blob_capacity() {
            return Err(RingError::Overflow);
        }
        if self.blob_free() >= len {
            return Ok(());
        }
        self.publish();
        loop {
            self.cached_blob_tail = self.shared.blob_tail.load_acquire();
            if self.blob_free() >= len {
                return Ok(());
            }
            if self.shared.is_shutdown() {
                return Err(RingError::Shutdown);
            }
            std::thread::yield_now();
        }
    }
}
