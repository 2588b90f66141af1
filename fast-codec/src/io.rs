//! Pluggable byte source/sink seams and the shared shutdown flag.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Why a source read produced no bytes.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// No bytes available right now; retry later.
    #[error("source would block")]
    WouldBlock,
    /// The stream is complete.
    #[error("end of source")]
    Eof,
    /// The underlying transport failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Why a sink write made no progress.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// No room right now; retry later.
    #[error("sink would block")]
    WouldBlock,
    /// The underlying transport failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A byte stream the decoder drains.
pub trait ByteSource {
    /// Read up to `buf.len()` bytes, returning how many were produced.
    /// Never returns `Ok(0)`: exhaustion is [`SourceError::Eof`] and
    /// absence of data is [`SourceError::WouldBlock`].
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError>;
}

/// A byte stream the encoder fills.
pub trait ByteSink {
    /// Write up to `buf.len()` bytes, returning how many were accepted.
    fn write(&mut self, buf: &[u8]) -> Result<usize, SinkError>;

    /// Push any transport buffering downstream.
    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Cooperative cancellation flag shared between a codec and its host.
///
/// Polled at fragment boundaries and at every primitive-codec refill; a
/// raised flag surfaces as [`crate::CodecError::Shutdown`] and is
/// propagated downstream through the ring's end-of-stream sentinel.
#[derive(Debug, Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    /// A fresh, lowered flag.
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the flag.
    pub fn request(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    /// Whether the flag is raised.
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }
}

/// In-memory source over a borrowed byte slice. Used by tests and by
/// hosts that frame their own transport reads.
pub struct SliceSource<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceSource<'a> {
    /// Source reading `data` front to back.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes handed out so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }
}

impl ByteSource for SliceSource<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        if self.pos == self.data.len() {
            return Err(SourceError::Eof);
        }
        let n = buf.len().min(self.data.len() - self.pos);
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

/// Adapter over any [`std::io::Read`], mapping `WouldBlock` and EOF onto
/// the source contract.
pub struct IoSource<R> {
    inner: R,
}

impl<R: std::io::Read> IoSource<R> {
    /// Wrap a reader.
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: std::io::Read> ByteSource for IoSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SourceError> {
        match self.inner.read(buf) {
            Ok(0) => Err(SourceError::Eof),
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(SourceError::WouldBlock),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Err(SourceError::WouldBlock),
            Err(e) => Err(SourceError::Io(e)),
        }
    }
}

/// Growable in-memory sink.
#[derive(Debug, Default)]
pub struct VecSink {
    data: Vec<u8>,
}

impl VecSink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything written so far.
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Take ownership of the written bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

impl ByteSink for VecSink {
    fn write(&mut self, buf: &[u8]) -> Result<usize, SinkError> {
        self.data.extend_from_slice(buf);
        Ok(buf.len())
    }
}

/// Adapter over any [`std::io::Write`].
pub struct IoSink<W> {
    inner: W,
}

impl<W: std::io::Write> IoSink<W> {
    /// Wrap a writer.
    pub fn new(inner: W) -> Self {
        Self { inner }
    }
}

impl<W: std::io::Write> ByteSink for IoSink<W> {
    fn write(&mut self, buf: &[u8]) -> Result<usize, SinkError> {
        match self.inner.write(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Err(SinkError::WouldBlock),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Err(SinkError::WouldBlock),
            Err(e) => Err(SinkError::Io(e)),
        }
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.inner.flush().map_err(SinkError::Io)
    }
}
