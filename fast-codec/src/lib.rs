//! Schema-driven FAST (FIX Adapted for STreaming) codec engine.
//!
//! The engine compiles an XML template catalog into a flat token script and
//! executes it against a byte stream: decoding produces structured message
//! fragments published through a [`fast_ring::DualRing`]; encoding consumes
//! fragments from a ring and emits the compressed byte stream. Compression
//! comes from three cooperating mechanisms:
//!
//! - **presence maps**: bit-vectors saying which fields carry wire bytes;
//! - **field operators**: per-field predictions (constant, default, copy,
//!   increment, delta, tail) backed by dictionary state;
//! - **stop-bit varints**: big-endian integers at 7 data bits per byte.
//!
//! The crate is strictly single-threaded per pipe: one decoder or encoder
//! owns its dictionaries, PMap stacks and heap outright, and talks to its
//! neighbour stage only through the ring.

#![warn(missing_docs)]

pub mod catalog;
mod config;
mod decoder;
mod dictionary;
mod encoder;
mod error;
mod heap;
mod io;
mod primitive;
mod value;

pub use config::{CodecConfig, DebugFlags};
pub use decoder::{DecodeReactor, DecodeState};
pub use dictionary::{Dictionary, ResetEntry, ResetGroup, SlotState};
pub use encoder::{EncodeReactor, MessageWriter};
pub use error::{CatalogError, CodecError, ErrorContext, Violation};
pub use heap::LocalHeap;
pub use io::{ByteSink, ByteSource, IoSink, IoSource, ShutdownFlag, SinkError, SliceSource, SourceError, VecSink};
pub use primitive::{PrimitiveReader, PrimitiveWriter};
pub use value::{absent_int32, absent_int64, ABSENT_INT32, ABSENT_INT64};
