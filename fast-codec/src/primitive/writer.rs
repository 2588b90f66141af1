//! Buffered stop-bit writer over a pluggable byte sink.

use crate::error::{CodecError, Violation};
use crate::io::{ByteSink, ShutdownFlag, SinkError};
use crate::primitive::pmap::PmapWriter;
use crate::primitive::{signed_varint_len, unsigned_varint_len};

/// Encode-side primitive codec.
///
/// While a presence map is open, field bytes are staged under it (a map's
/// bytes precede its group body on the wire); at the outermost scope they
/// accumulate in the main buffer until [`PrimitiveWriter::flush`].
pub struct PrimitiveWriter<S> {
    sink: S,
    shutdown: ShutdownFlag,
    buf: Vec<u8>,
    flushed: u64,
    pmap: PmapWriter,
}

impl<S: ByteSink> PrimitiveWriter<S> {
    /// Writer staging up to roughly `capacity` bytes between flushes,
    /// with presence maps nested up to `max_pmap_depth` deep.
    pub fn new(sink: S, capacity: usize, max_pmap_depth: usize, shutdown: ShutdownFlag) -> Self {
        Self {
            sink,
            shutdown,
            buf: Vec::with_capacity(capacity.max(64)),
            flushed: 0,
            pmap: PmapWriter::new(max_pmap_depth),
        }
    }

    /// Bytes emitted so far, including unflushed ones. Bytes staged under
    /// an open presence map are not yet counted.
    pub fn position(&self) -> u64 {
        self.flushed + self.buf.len() as u64
    }

    #[inline]
    fn emit(&mut self, byte: u8) {
        if self.pmap.is_staging() {
            self.pmap.stage(byte);
        } else {
            self.buf.push(byte);
        }
    }

    #[inline]
    fn emit_slice(&mut self, bytes: &[u8]) {
        if self.pmap.is_staging() {
            self.pmap.stage_slice(bytes);
        } else {
            self.buf.extend_from_slice(bytes);
        }
    }

    /// Write an unsigned stop-bit varint (1..=10 bytes).
    pub fn write_u64(&mut self, value: u64) {
        let len = unsigned_varint_len(value);
        for group in (1..len).rev() {
            self.emit(((value >> (7 * group)) & 0x7F) as u8);
        }
        self.emit((value & 0x7F) as u8 | 0x80);
    }

    /// Write a signed stop-bit varint (1..=10 bytes).
    pub fn write_i64(&mut self, value: i64) {
        let len = signed_varint_len(value);
        for group in (1..len).rev() {
            self.emit(((value >> (7 * group)) & 0x7F) as u8);
        }
        self.emit((value & 0x7F) as u8 | 0x80);
    }

    /// Write an unsigned 32-bit varint.
    pub fn write_u32(&mut self, value: u32) {
        self.write_u64(u64::from(value));
    }

    /// Write a signed 32-bit varint.
    pub fn write_i32(&mut self, value: i32) {
        self.write_i64(i64::from(value));
    }

    /// Optional unsigned varint: null is wire `0`, values shift up by one.
    pub fn write_u64_optional(&mut self, value: Option<u64>) -> Result<(), CodecError> {
        match value {
            None => self.write_u64(0),
            Some(v) => {
                let shifted = v
                    .checked_add(1)
                    .ok_or_else(|| CodecError::violation(Violation::VarintOverflow))?;
                self.write_u64(shifted);
            }
        }
        Ok(())
    }

    /// Optional signed varint: null is wire `0`, non-negatives shift up
    /// by one, negatives pass through.
    pub fn write_i64_optional(&mut self, value: Option<i64>) -> Result<(), CodecError> {
        match value {
            None => self.write_i64(0),
            Some(v) if v >= 0 => {
                let shifted = v
                    .checked_add(1)
                    .ok_or_else(|| CodecError::violation(Violation::VarintOverflow))?;
                self.write_i64(shifted);
            }
            Some(v) => self.write_i64(v),
        }
        Ok(())
    }

    /// Write an ASCII run with the stop bit on the final character.
    /// `text` must be non-empty; the zero-payload forms have their own
    /// entry points.
    pub fn write_ascii(&mut self, text: &[u8]) {
        debug_assert!(!text.is_empty());
        let (last, head) = text.split_last().expect("non-empty ascii");
        self.emit_slice(head);
        self.emit(last | 0x80);
    }

    /// Write the zero-payload byte: empty for mandatory strings, null for
    /// optional ones.
    pub fn write_ascii_zero_byte(&mut self) {
        self.emit(0x80);
    }

    /// Write the explicit empty form of an optional string.
    pub fn write_ascii_empty(&mut self) {
        self.emit(0x00);
        self.emit(0x80);
    }

    /// Write raw payload bytes (length is carried separately).
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.emit_slice(bytes);
    }

    /// Open a presence map of at most `max_bytes`; subsequent field bytes
    /// are staged behind it until the matching [`Self::close_pmap`].
    pub fn open_pmap(&mut self, max_bytes: usize) -> Result<(), CodecError> {
        self.pmap.open(max_bytes)
    }

    /// Append one bit to the innermost open map.
    #[inline]
    pub fn push_pmap_bit(&mut self, bit: bool) -> Result<(), CodecError> {
        self.pmap.push_bit(bit)
    }

    /// Close the innermost map, emitting its stop-bit run and staged body
    /// into the enclosing scope.
    pub fn close_pmap(&mut self) -> Result<(), CodecError> {
        self.pmap.close(&mut self.buf)
    }

    /// Current presence-map nesting depth.
    pub fn pmap_depth(&self) -> usize {
        self.pmap.depth()
    }

    /// Discard any open maps and their staged bytes (message abandon).
    pub fn abandon_pmaps(&mut self) {
        self.pmap.clear();
    }

    /// Drain the main buffer into the sink, yielding through `WouldBlock`
    /// and polling the shutdown flag.
    pub fn flush(&mut self) -> Result<(), CodecError> {
        debug_assert_eq!(self.pmap.depth(), 0, "flush with an open pmap");
        let mut written = 0;
        while written < self.buf.len() {
            if self.shutdown.is_raised() {
                // Keep the unwritten tail for a resumed flush.
                self.buf.drain(..written);
                self.flushed += written as u64;
                return Err(CodecError::Shutdown);
            }
            match self.sink.write(&self.buf[written..]) {
                Ok(n) => written += n,
                Err(SinkError::WouldBlock) => std::thread::yield_now(),
                Err(SinkError::Io(e)) => return Err(CodecError::Io(e)),
            }
        }
        self.flushed += written as u64;
        self.buf.clear();
        loop {
            if self.shutdown.is_raised() {
                return Err(CodecError::Shutdown);
            }
            match self.sink.flush() {
                Ok(()) => return Ok(()),
                Err(SinkError::WouldBlock) => std::thread::yield_now(),
                Err(SinkError::Io(e)) => return Err(CodecError::Io(e)),
            }
        }
    }

    /// Hand the sink back (tests and pipe teardown).
    pub fn into_sink(self) -> S {
        self.sink
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::{ShutdownFlag, VecSink};

    fn writer() -> PrimitiveWriter<VecSink> {
        PrimitiveWriter::new(VecSink::new(), 128, 4, ShutdownFlag::new())
    }

    fn written(mut w: PrimitiveWriter<VecSink>) -> Vec<u8> {
        w.flush().unwrap();
        w.into_sink().into_bytes()
    }

    #[test]
    fn unsigned_canonical_vectors() {
        let mut w = writer();
        w.write_u64(0);
        w.write_u64(127);
        w.write_u64(128);
        w.write_u64(1023);
        assert_eq!(written(w), [0x80, 0xFF, 0x01, 0x80, 0x07, 0xFF]);
    }

    #[test]
    fn signed_canonical_vectors() {
        let mut w = writer();
        w.write_i64(0);
        w.write_i64(63);
        w.write_i64(64);
        w.write_i64(-1);
        w.write_i64(-64);
        w.write_i64(-65);
        assert_eq!(
            written(w),
            [0x80, 0xBF, 0x00, 0xC0, 0xFF, 0xC0, 0x7F, 0xBF]
        );
    }

    #[test]
    fn null_shift_is_writers_mirror_of_readers() {
        let mut w = writer();
        w.write_u64_optional(None).unwrap();
        w.write_u64_optional(Some(0)).unwrap();
        w.write_i64_optional(Some(-1)).unwrap();
        assert_eq!(written(w), [0x80, 0x81, 0xFF]);
    }

    #[test]
    fn ascii_forms() {
        let mut w = writer();
        w.write_ascii(b"abc");
        w.write_ascii_zero_byte();
        w.write_ascii_empty();
        assert_eq!(written(w), [b'a', b'b', b'c' | 0x80, 0x80, 0x00, 0x80]);
    }

    #[test]
    fn pmap_precedes_staged_body() {
        let mut w = writer();
        w.write_u64(1); // before the group
        w.open_pmap(2).unwrap();
        w.push_pmap_bit(true).unwrap();
        w.write_u64(2); // group body, staged
        w.close_pmap().unwrap();
        w.write_u64(3); // after the group
        assert_eq!(written(w), [0x81, 0xC0, 0x82, 0x83]);
    }

    #[test]
    fn position_counts_emitted_bytes() {
        let mut w = writer();
        w.write_u64(128);
        assert_eq!(w.position(), 2);
        w.flush().unwrap();
        assert_eq!(w.position(), 2);
    }
}
