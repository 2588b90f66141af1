//! Lock-free single-producer/single-consumer dual-ring.
//!
//! The ring carries structured message fragments between one codec stage and
//! one neighbour. It is two buffers: a *slab* of `i32` slots for fixed-size
//! field data and a *blob* of bytes for variable-length payloads. Four
//! cache-line-padded cursors coordinate the two sides; the producer advances
//! the heads, the consumer advances the tails, and publication is a
//! release-store on the slab head observed by an acquire-load.
//!
//! A fragment is a header slot (the message index), the field slots, and a
//! trailing slot recording how many blob bytes the fragment consumed. The
//! trailer makes read release O(1): the consumer never rescans field slots
//! to learn how far the blob tail moves.
//!
//! ```
//! use fast_ring::DualRing;
//!
//! let (mut producer, mut consumer) = DualRing::with_bits(7, 6).split();
//! producer.begin_fragment(3, 3).unwrap();
//! producer.write_int(42);
//! producer.end_fragment();
//! producer.publish();
//!
//! let idx = consumer.try_peek().unwrap();
//! assert_eq!(idx, 3);
//! assert!(consumer.begin_fragment(3));
//! assert_eq!(consumer.read_int(), 42);
//! consumer.release_fragment();
//! ```

#![warn(missing_docs)]

mod consumer;
mod cursor;
mod error;
mod producer;
mod shared;

pub use consumer::{BlobSlices, RingConsumer};
pub use error::RingError;
pub use producer::RingProducer;
pub use shared::DualRing;

/// Message index published as the end-of-stream sentinel.
pub const EOF_MSG_IDX: i32 = -1;

/// Slab slots the end-of-stream sentinel occupies (header + trailer).
pub const EOF_SLOTS: usize = 2;
