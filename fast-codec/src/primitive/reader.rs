//! Buffered stop-bit reader over a pluggable byte source.

use crate::error::{CodecError, ErrorContext, Violation};
use crate::io::{ByteSource, ShutdownFlag, SourceError};
use crate::primitive::pmap::PmapReader;
use crate::primitive::MAX_VARINT_BYTES;

/// Wire shape of an ASCII field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsciiWire {
    /// Single `0x80` byte: null for optional fields, empty for mandatory.
    ZeroByte,
    /// The `0x00 0x80` escape: an explicitly empty optional string.
    Empty,
    /// Payload bytes were appended to the caller's buffer.
    Text,
}

/// Decode-side primitive codec.
///
/// Owns the refill buffer, the in-flight varint accumulator (so a read
/// interrupted by `WouldBlock` or shutdown resumes without re-consuming
/// bytes) and the presence-map stack.
pub struct PrimitiveReader<S> {
    source: S,
    shutdown: ShutdownFlag,
    buf: Box<[u8]>,
    pos: usize,
    limit: usize,
    /// Stream offset of `buf[0]`; `byte_offset()` is diagnostics-grade.
    base_offset: u64,
    pending_acc: u64,
    pending_count: u8,
    pmap: PmapReader,
    pmap_run: Vec<u8>,
}

impl<S: ByteSource> PrimitiveReader<S> {
    /// Reader with a `capacity`-byte refill buffer, sized for maps of
    /// `max_pmap_bytes` nested up to `max_pmap_depth` deep.
    pub fn new(
        source: S,
        capacity: usize,
        max_pmap_depth: usize,
        max_pmap_bytes: usize,
        shutdown: ShutdownFlag,
    ) -> Self {
        Self {
            source,
            shutdown,
            buf: vec![0; capacity.max(64)].into_boxed_slice(),
            pos: 0,
            limit: 0,
            base_offset: 0,
            pending_acc: 0,
            pending_count: 0,
            pmap: PmapReader::new(max_pmap_depth, max_pmap_bytes),
            pmap_run: Vec::with_capacity(max_pmap_bytes.max(1)),
        }
    }

    /// Stream offset of the next unread byte.
    pub fn byte_offset(&self) -> u64 {
        self.base_offset + self.pos as u64
    }

    /// Whether more bytes exist, refilling if the buffer is drained.
    /// `Ok(false)` is a clean end of stream.
    pub fn has_more(&mut self) -> Result<bool, CodecError> {
        if self.pos < self.limit {
            return Ok(true);
        }
        match self.refill() {
            Ok(()) => Ok(true),
            Err(CodecError::UnexpectedEndOfStream(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn refill(&mut self) -> Result<(), CodecError> {
        if self.pos == self.limit {
            self.base_offset += self.limit as u64;
            self.pos = 0;
            self.limit = 0;
        } else if self.pos > 0 {
            self.buf.copy_within(self.pos..self.limit, 0);
            self.base_offset += self.pos as u64;
            self.limit -= self.pos;
            self.pos = 0;
        }
        loop {
            if self.shutdown.is_raised() {
                return Err(CodecError::Shutdown);
            }
            match self.source.read(&mut self.buf[self.limit..]) {
                Ok(0) | Err(SourceError::Eof) => {
                    return Err(CodecError::UnexpectedEndOfStream(ErrorContext {
                        byte_offset: Some(self.byte_offset()),
                        ..ErrorContext::default()
                    }))
                }
                Ok(n) => {
                    self.limit += n;
                    return Ok(());
                }
                Err(SourceError::WouldBlock) => std::thread::yield_now(),
                Err(SourceError::Io(e)) => return Err(CodecError::Io(e)),
            }
        }
    }

    #[inline]
    fn read_byte(&mut self) -> Result<u8, CodecError> {
        if self.pos == self.limit {
            self.refill()?;
        }
        let byte = self.buf[self.pos];
        self.pos += 1;
        Ok(byte)
    }

    /// Read an unsigned stop-bit varint.
    pub fn read_u64(&mut self) -> Result<u64, CodecError> {
        let mut acc = self.pending_acc;
        let mut count = self.pending_count;
        loop {
            let byte = match self.read_byte() {
                Ok(byte) => byte,
                Err(e) => {
                    self.pending_acc = acc;
                    self.pending_count = count;
                    return Err(e);
                }
            };
            if count >= MAX_VARINT_BYTES || acc & 0xFE00_0000_0000_0000 != 0 {
                return Err(CodecError::violation(Violation::VarintOverflow));
            }
            acc = (acc << 7) | u64::from(byte & 0x7F);
            count += 1;
            if byte & 0x80 != 0 {
                self.pending_acc = 0;
                self.pending_count = 0;
                return Ok(acc);
            }
        }
    }

    /// Read a signed stop-bit varint, sign-extending from bit 6 of the
    /// first byte.
    pub fn read_i64(&mut self) -> Result<i64, CodecError> {
        let mut acc = self.pending_acc;
        let mut count = self.pending_count;
        loop {
            let byte = match self.read_byte() {
                Ok(byte) => byte,
                Err(e) => {
                    self.pending_acc = acc;
                    self.pending_count = count;
                    return Err(e);
                }
            };
            if count == 0 && byte & 0x40 != 0 {
                acc = u64::MAX;
            }
            let top = acc >> 57;
            if count >= MAX_VARINT_BYTES || (top != 0 && top != 0x7F) {
                return Err(CodecError::violation(Violation::VarintOverflow));
            }
            acc = (acc << 7) | u64::from(byte & 0x7F);
            count += 1;
            if byte & 0x80 != 0 {
                self.pending_acc = 0;
                self.pending_count = 0;
                return Ok(acc as i64);
            }
        }
    }

    /// Read an unsigned 32-bit varint, range-checked.
    pub fn read_u32(&mut self) -> Result<u32, CodecError> {
        u32::try_from(self.read_u64()?)
            .map_err(|_| CodecError::violation(Violation::VarintOverflow))
    }

    /// Read a signed 32-bit varint, range-checked.
    pub fn read_i32(&mut self) -> Result<i32, CodecError> {
        i32::try_from(self.read_i64()?)
            .map_err(|_| CodecError::violation(Violation::VarintOverflow))
    }

    /// Optional unsigned varint: wire `0` is null, anything else shifts
    /// down by one.
    pub fn read_u64_optional(&mut self) -> Result<Option<u64>, CodecError> {
        let raw = self.read_u64()?;
        Ok(raw.checked_sub(1))
    }

    /// Optional unsigned 32-bit varint.
    pub fn read_u32_optional(&mut self) -> Result<Option<u32>, CodecError> {
        match self.read_u64_optional()? {
            None => Ok(None),
            Some(v) => u32::try_from(v)
                .map(Some)
                .map_err(|_| CodecError::violation(Violation::VarintOverflow)),
        }
    }

    /// Optional signed varint: wire `0` is null, positive values shift
    /// down by one, negatives pass through.
    pub fn read_i64_optional(&mut self) -> Result<Option<i64>, CodecError> {
        let raw = self.read_i64()?;
        Ok(match raw {
            0 => None,
            v if v > 0 => Some(v - 1),
            v => Some(v),
        })
    }

    /// Optional signed 32-bit varint.
    pub fn read_i32_optional(&mut self) -> Result<Option<i32>, CodecError> {
        match self.read_i64_optional()? {
            None => Ok(None),
            Some(v) => i32::try_from(v)
                .map(Some)
                .map_err(|_| CodecError::violation(Violation::VarintOverflow)),
        }
    }

    /// Read a stop-bit ASCII run into `out`, which is cleared first.
    pub fn read_ascii(&mut self, out: &mut Vec<u8>, max_len: u32) -> Result<AsciiWire, CodecError> {
        out.clear();
        let first = self.read_byte()?;
        if first == 0x80 {
            return Ok(AsciiWire::ZeroByte);
        }
        if first == 0x00 {
            let second = self.read_byte()?;
            if second == 0x80 {
                return Ok(AsciiWire::Empty);
            }
            out.push(0x00);
            if second & 0x80 != 0 {
                out.push(second & 0x7F);
                return Ok(AsciiWire::Text);
            }
            out.push(second);
        } else if first & 0x80 != 0 {
            out.push(first & 0x7F);
            return Ok(AsciiWire::Text);
        } else {
            out.push(first);
        }
        loop {
            if out.len() >= max_len as usize {
                return Err(CodecError::violation(Violation::LengthOutOfBounds));
            }
            let byte = self.read_byte()?;
            if byte & 0x80 != 0 {
                out.push(byte & 0x7F);
                return Ok(AsciiWire::Text);
            }
            out.push(byte);
        }
    }

    /// Read exactly `len` raw bytes into `out`, which is cleared first.
    pub fn read_bytes(&mut self, len: usize, out: &mut Vec<u8>) -> Result<(), CodecError> {
        out.clear();
        out.reserve(len);
        let mut remaining = len;
        while remaining > 0 {
            if self.pos == self.limit {
                self.refill()?;
            }
            let take = remaining.min(self.limit - self.pos);
            out.extend_from_slice(&self.buf[self.pos..self.pos + take]);
            self.pos += take;
            remaining -= take;
        }
        Ok(())
    }

    /// Read a group's stop-bit presence-map run and push it on the stack.
    pub fn open_pmap(&mut self, max_bytes: usize) -> Result<(), CodecError> {
        self.pmap_run.clear();
        loop {
            if self.pmap_run.len() == max_bytes {
                return Err(CodecError::violation(Violation::PmapExhausted));
            }
            let byte = self.read_byte()?;
            self.pmap_run.push(byte);
            if byte & 0x80 != 0 {
                break;
            }
        }
        let run = std::mem::take(&mut self.pmap_run);
        let result = self.pmap.open(&run);
        self.pmap_run = run;
        result
    }

    /// Next bit of the innermost presence map.
    #[inline]
    pub fn pop_pmap_bit(&mut self) -> Result<u8, CodecError> {
        self.pmap.pop_bit()
    }

    /// Pop the innermost presence map.
    pub fn close_pmap(&mut self) -> Result<(), CodecError> {
        self.pmap.close()
    }

    /// Current presence-map nesting depth.
    pub fn pmap_depth(&self) -> usize {
        self.pmap.depth()
    }

    /// Abandon all decode state (fatal error path).
    pub fn reset(&mut self) {
        self.pending_acc = 0;
        self.pending_count = 0;
        self.pmap.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::SliceSource;

    fn reader(data: &[u8]) -> PrimitiveReader<SliceSource<'_>> {
        PrimitiveReader::new(SliceSource::new(data), 64, 4, 8, ShutdownFlag::new())
    }

    #[test]
    fn unsigned_canonical_vectors() {
        let mut r = reader(&[0x80, 0xFF, 0x01, 0x80, 0x07, 0xFF]);
        assert_eq!(r.read_u64().unwrap(), 0);
        assert_eq!(r.read_u64().unwrap(), 127);
        assert_eq!(r.read_u64().unwrap(), 128);
        assert_eq!(r.read_u64().unwrap(), 1023);
    }

    #[test]
    fn signed_canonical_vectors() {
        let mut r = reader(&[0x80, 0xBF, 0x00, 0xC0, 0xFF, 0xC0, 0x7F, 0xBF]);
        assert_eq!(r.read_i64().unwrap(), 0);
        assert_eq!(r.read_i64().unwrap(), 63);
        assert_eq!(r.read_i64().unwrap(), 64);
        assert_eq!(r.read_i64().unwrap(), -1);
        assert_eq!(r.read_i64().unwrap(), -64);
        assert_eq!(r.read_i64().unwrap(), -65);
    }

    #[test]
    fn extremes_round_the_64_bit_domain() {
        // u64::MAX: 1 bit + 9×7 bits.
        let max = [0x01, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0x7F, 0xFF];
        assert_eq!(reader(&max).read_u64().unwrap(), u64::MAX);
        // i64::MIN: sign byte then nine groups.
        let min = [0x7F, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80];
        assert_eq!(reader(&min).read_i64().unwrap(), i64::MIN);
    }

    #[test]
    fn truncation_mid_varint_is_end_of_stream() {
        let mut r = reader(&[0x01, 0x7F]);
        match r.read_u64() {
            Err(CodecError::UnexpectedEndOfStream(_)) => {}
            other => panic!("expected end of stream, got {other:?}"),
        }
    }

    #[test]
    fn overflow_is_a_protocol_violation() {
        let bytes = [0x7F; 11];
        match reader(&bytes).read_u64() {
            Err(CodecError::ProtocolViolation {
                violation: Violation::VarintOverflow,
                ..
            }) => {}
            other => panic!("expected overflow, got {other:?}"),
        }
    }

    #[test]
    fn null_shift_rules() {
        let mut r = reader(&[0x80, 0x81, 0x80, 0x81, 0xFF]);
        assert_eq!(r.read_u64_optional().unwrap(), None);
        assert_eq!(r.read_u64_optional().unwrap(), Some(0));
        assert_eq!(r.read_i64_optional().unwrap(), None);
        assert_eq!(r.read_i64_optional().unwrap(), Some(0));
        assert_eq!(r.read_i64_optional().unwrap(), Some(-1));
    }

    #[test]
    fn ascii_wire_forms() {
        let mut out = Vec::new();
        let mut r = reader(&[0x80]);
        assert_eq!(r.read_ascii(&mut out, 16).unwrap(), AsciiWire::ZeroByte);

        let mut r = reader(&[0x00, 0x80]);
        assert_eq!(r.read_ascii(&mut out, 16).unwrap(), AsciiWire::Empty);

        let mut r = reader(&[b'a', b'b', b'c' | 0x80]);
        assert_eq!(r.read_ascii(&mut out, 16).unwrap(), AsciiWire::Text);
        assert_eq!(out, b"abc");
    }

    #[test]
    fn pmap_run_roundtrip_through_reader() {
        // Map bytes 0x2A 0xE0 followed by a varint.
        let mut r = reader(&[0x2A, 0xE0, 0x81]);
        r.open_pmap(4).unwrap();
        assert_eq!(r.pop_pmap_bit().unwrap(), 0);
        assert_eq!(r.pop_pmap_bit().unwrap(), 1);
        assert_eq!(r.read_u64().unwrap(), 1);
        r.close_pmap().unwrap();
    }

    #[test]
    fn byte_offset_tracks_consumption() {
        let mut r = reader(&[0x80, 0x80, 0x80]);
        assert_eq!(r.byte_offset(), 0);
        r.read_u64().unwrap();
        r.read_u64().unwrap();
        assert_eq!(r.byte_offset(), 2);
    }
}
