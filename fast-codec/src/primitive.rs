//! Primitive wire codec: stop-bit varints, presence maps, buffered I/O.
//!
//! The wire format is canonical FAST 1.1: big-endian integers at 7 data
//! bits per byte with the high bit set on the terminating byte, and
//! presence maps as the same stop-bit byte run read one bit at a time
//! MSB-first. Signed values sign-extend from bit 6 of the first byte.

mod pmap;
mod reader;
mod writer;

pub use pmap::{PmapReader, PmapWriter};
pub use reader::{AsciiWire, PrimitiveReader};
pub use writer::PrimitiveWriter;

/// Widest stop-bit encoding of a 64-bit value.
pub const MAX_VARINT_BYTES: u8 = 10;

pub(crate) fn unsigned_varint_len(value: u64) -> usize {
    let bits = (64 - value.leading_zeros()).max(1);
    bits.div_ceil(7) as usize
}

pub(crate) fn signed_varint_len(value: i64) -> usize {
    // One extra bit for the sign on top of the significant magnitude bits.
    let magnitude = if value >= 0 { value as u64 } else { !(value as u64) };
    let bits = 65 - magnitude.leading_zeros();
    bits.div_ceil(7) as usize
}
