//! Presence-map stacks for nested groups.
//!
//! A group's map is pushed when the group opens and popped when it closes;
//! the stacks are sized once from the catalog's maximum nesting so steady
//! state allocates nothing per message.

use crate::error::{CodecError, Violation};

const BITS_PER_BYTE: usize = 7;

/// Decode-side stack of open presence maps.
#[derive(Debug)]
pub struct PmapReader {
    data: Vec<u8>,
    frames: Vec<ReadFrame>,
    max_depth: usize,
}

#[derive(Debug)]
struct ReadFrame {
    start: usize,
    bytes: usize,
    cursor: usize,
}

impl PmapReader {
    /// Stack admitting `max_depth` nested groups of up to
    /// `max_pmap_bytes` each.
    pub fn new(max_depth: usize, max_pmap_bytes: usize) -> Self {
        Self {
            data: Vec::with_capacity(max_depth.max(1) * max_pmap_bytes.max(1)),
            frames: Vec::with_capacity(max_depth.max(1)),
            max_depth: max_depth.max(1),
        }
    }

    /// Push a map whose raw stop-bit run is `run`.
    pub fn open(&mut self, run: &[u8]) -> Result<(), CodecError> {
        if self.frames.len() == self.max_depth {
            return Err(CodecError::violation(Violation::PmapDepthExceeded));
        }
        let start = self.data.len();
        self.data.extend_from_slice(run);
        self.frames.push(ReadFrame {
            start,
            bytes: run.len(),
            cursor: 0,
        });
        Ok(())
    }

    /// Read the next bit of the innermost open map.
    #[inline]
    pub fn pop_bit(&mut self) -> Result<u8, CodecError> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| CodecError::violation(Violation::PmapExhausted))?;
        if frame.cursor >= frame.bytes * BITS_PER_BYTE {
            return Err(CodecError::violation(Violation::PmapExhausted));
        }
        let byte = self.data[frame.start + frame.cursor / BITS_PER_BYTE];
        let bit = (byte >> (6 - frame.cursor % BITS_PER_BYTE)) & 1;
        frame.cursor += 1;
        Ok(bit)
    }

    /// Pop the innermost map. Every `open` must be paired with exactly one
    /// `close` by the group that pushed it.
    pub fn close(&mut self) -> Result<(), CodecError> {
        let frame = self
            .frames
            .pop()
            .ok_or_else(|| CodecError::violation(Violation::PmapExhausted))?;
        self.data.truncate(frame.start);
        Ok(())
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Drop all open maps (stream abandon).
    pub fn clear(&mut self) {
        self.data.clear();
        self.frames.clear();
    }
}

/// Encode-side stack of presence maps under construction.
///
/// A map's bytes precede the group body on the wire, but its bits are only
/// known after the body is encoded. Each open map therefore redirects body
/// bytes into a staging buffer; closing the map emits the finished bit run
/// followed by the staged body into the parent scope. Frames are recycled
/// so steady state allocates nothing.
#[derive(Debug, Default)]
pub struct PmapWriter {
    frames: Vec<WriteFrame>,
    spare: Vec<WriteFrame>,
    max_depth: usize,
}

#[derive(Debug, Default)]
struct WriteFrame {
    bits: Vec<u8>,
    bit_len: usize,
    max_bytes: usize,
    body: Vec<u8>,
}

impl PmapWriter {
    /// Stack admitting `max_depth` nested groups.
    pub fn new(max_depth: usize) -> Self {
        Self {
            frames: Vec::with_capacity(max_depth.max(1)),
            spare: Vec::new(),
            max_depth: max_depth.max(1),
        }
    }

    /// Open a map of at most `max_bytes` stop-bit bytes.
    pub fn open(&mut self, max_bytes: usize) -> Result<(), CodecError> {
        if self.frames.len() == self.max_depth {
            return Err(CodecError::violation(Violation::PmapDepthExceeded));
        }
        let mut frame = self.spare.pop().unwrap_or_default();
        frame.bits.clear();
        frame.body.clear();
        frame.bit_len = 0;
        frame.max_bytes = max_bytes.max(1);
        self.frames.push(frame);
        Ok(())
    }

    /// Append one bit to the innermost open map.
    #[inline]
    pub fn push_bit(&mut self, bit: bool) -> Result<(), CodecError> {
        let frame = self
            .frames
            .last_mut()
            .ok_or_else(|| CodecError::violation(Violation::PmapExhausted))?;
        if frame.bit_len == frame.max_bytes * BITS_PER_BYTE {
            return Err(CodecError::violation(Violation::PmapExhausted));
        }
        let byte = frame.bit_len / BITS_PER_BYTE;
        if byte == frame.bits.len() {
            frame.bits.push(0);
        }
        if bit {
            frame.bits[byte] |= 1 << (6 - frame.bit_len % BITS_PER_BYTE);
        }
        frame.bit_len += 1;
        Ok(())
    }

    /// Whether any map is open (body bytes must be staged).
    pub fn is_staging(&self) -> bool {
        !self.frames.is_empty()
    }

    /// Stage a body byte under the innermost open map.
    #[inline]
    pub fn stage(&mut self, byte: u8) {
        if let Some(frame) = self.frames.last_mut() {
            frame.body.push(byte);
        }
    }

    /// Stage a body slice under the innermost open map.
    #[inline]
    pub fn stage_slice(&mut self, bytes: &[u8]) {
        if let Some(frame) = self.frames.last_mut() {
            frame.body.extend_from_slice(bytes);
        }
    }

    /// Close the innermost map, appending its stop-bit run and staged body
    /// to the parent scope: the enclosing map's staging buffer, or `main`
    /// at the outermost level.
    pub fn close(&mut self, main: &mut Vec<u8>) -> Result<(), CodecError> {
        let mut frame = self
            .frames
            .pop()
            .ok_or_else(|| CodecError::violation(Violation::PmapExhausted))?;
        let bytes = frame.bit_len.div_ceil(BITS_PER_BYTE).max(1);
        while frame.bits.len() < bytes {
            frame.bits.push(0);
        }
        frame.bits[bytes - 1] |= 0x80;
        let out = match self.frames.last_mut() {
            Some(parent) => &mut parent.body,
            None => main,
        };
        out.extend_from_slice(&frame.bits[..bytes]);
        out.extend_from_slice(&frame.body);
        self.spare.push(frame);
        Ok(())
    }

    /// Innermost staging buffer, or `None` at the outermost scope.
    pub fn staging_buffer(&mut self) -> Option<&mut Vec<u8>> {
        self.frames.last_mut().map(|frame| &mut frame.body)
    }

    /// Current nesting depth.
    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Drop all open maps (message abandon).
    pub fn clear(&mut self) {
        while let Some(frame) = self.frames.pop() {
            self.spare.push(frame);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_bits_msb_first_across_bytes() {
        let mut pmap = PmapReader::new(2, 4);
        // 0b0101010, then stop byte 0b1100000.
        pmap.open(&[0x2A, 0xE0]).unwrap();
        let bits: Vec<u8> = (0..14).map(|_| pmap.pop_bit().unwrap()).collect();
        assert_eq!(bits, [0, 1, 0, 1, 0, 1, 0, 1, 1, 0, 0, 0, 0, 0]);
        assert!(pmap.pop_bit().is_err());
        pmap.close().unwrap();
    }

    #[test]
    fn nested_maps_are_independent() {
        let mut pmap = PmapReader::new(2, 1);
        pmap.open(&[0xFF]).unwrap();
        assert_eq!(pmap.pop_bit().unwrap(), 1);
        pmap.open(&[0x80]).unwrap();
        assert_eq!(pmap.pop_bit().unwrap(), 0);
        pmap.close().unwrap();
        assert_eq!(pmap.pop_bit().unwrap(), 1);
        pmap.close().unwrap();
        assert!(pmap.open(&[0x80]).is_ok());
    }

    #[test]
    fn depth_limit_enforced() {
        let mut pmap = PmapReader::new(1, 1);
        pmap.open(&[0x80]).unwrap();
        assert!(matches!(
            pmap.open(&[0x80]),
            Err(CodecError::ProtocolViolation {
                violation: Violation::PmapDepthExceeded,
                ..
            })
        ));
    }

    #[test]
    fn writer_emits_stop_bit_run_before_body() {
        let mut pmap = PmapWriter::new(2);
        pmap.open(2).unwrap();
        for bit in [true, false, true] {
            pmap.push_bit(bit).unwrap();
        }
        pmap.stage_slice(&[0xAA, 0xBB]);
        let mut out = Vec::new();
        pmap.close(&mut out).unwrap();
        // Bits 101 -> 0b1010000 with stop: 0xD0; then the staged body.
        assert_eq!(out, [0xD0, 0xAA, 0xBB]);
    }

    #[test]
    fn writer_emits_empty_map_as_single_stop_byte() {
        let mut pmap = PmapWriter::new(1);
        pmap.open(1).unwrap();
        let mut out = Vec::new();
        pmap.close(&mut out).unwrap();
        assert_eq!(out, [0x80]);
    }

    #[test]
    fn nested_writer_maps_compose() {
        let mut pmap = PmapWriter::new(2);
        pmap.open(1).unwrap();
        pmap.push_bit(true).unwrap();
        pmap.stage(0x01);
        pmap.open(1).unwrap();
        pmap.push_bit(false).unwrap();
        pmap.stage(0x02);
        let mut out = Vec::new();
        // The inner map lands in the outer staging buffer, the outer map
        // in `out`.
        pmap.close(&mut out).unwrap();
        assert!(out.is_empty());
        pmap.close(&mut out).unwrap();
        assert_eq!(out, [0xC0, 0x01, 0x80, 0x02]);
    }
}
