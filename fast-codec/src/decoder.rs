//! Decode reactor: executes the token script against a byte source and
//! publishes structured fragments into the ring.
//!
//! The reactor is a single-threaded state machine. Between messages it
//! waits for a template id (`AwaitTemplate`); inside a message it executes
//! one fragment at a time, suspending only at fragment boundaries. Every
//! `{type, operator, optionality}` combination dispatches through one
//! match arm, mirroring the encoder's table bit for bit.

use fast_ring::RingProducer;
use fast_token::{GroupFlags, OpTag, Token, TypeTag};

use crate::catalog::Catalog;
use crate::config::{CodecConfig, DebugFlags};
use crate::dictionary::{Dictionary, SlotState};
use crate::error::{CodecError, ErrorContext, Violation};
use crate::io::{ByteSource, ShutdownFlag};
use crate::primitive::{AsciiWire, PrimitiveReader};
use crate::value::{absent_int32, absent_int64};

/// Reactor progress, as seen by the host driving it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    /// Between messages, waiting for a template id.
    AwaitTemplate,
    /// Executing the fragment chain of one message.
    InMessage,
    /// Executing sequence body fragments.
    InSequence,
    /// The source is drained and the EOF sentinel is published.
    EndOfStream,
}

#[derive(Debug, Clone, Copy)]
struct SeqFrame {
    body_open: usize,
    body_close: usize,
    remaining: u32,
}

/// What a completed fragment hands back to the driver.
enum FragmentOutcome {
    /// The template's closing bracket was executed.
    MessageEnd,
    /// A sequence body's closing bracket was executed.
    BodyEnd,
    /// The fragment ended at a sequence length of `count` iterations; the
    /// body bracket opens at `body_open`.
    Sequence { body_open: usize, count: u32 },
}

/// The decode side of one codec pipe.
pub struct DecodeReactor<'c, S> {
    catalog: &'c Catalog,
    reader: PrimitiveReader<S>,
    producer: RingProducer,
    dictionary: Dictionary,
    shutdown: ShutdownFlag,
    seq_stack: Vec<SeqFrame>,
    state: DecodeState,
    preamble_bytes: u32,
    debug: DebugFlags,
    preamble: Vec<u8>,
    text_buf: Vec<u8>,
    current_template: Option<i64>,
    last_template: Option<i64>,
    messages: u64,
}

impl<'c, S: ByteSource> DecodeReactor<'c, S> {
    /// Wire a reactor to its catalog, source and ring half.
    pub fn new(
        catalog: &'c Catalog,
        config: &CodecConfig,
        source: S,
        mut producer: RingProducer,
        shutdown: ShutdownFlag,
    ) -> Self {
        let batch_bound = config.max_batch(catalog.max_fragment_slots()) as u32;
        producer.set_batch_publish(config.batch_publish_size.min(batch_bound));
        let reader = PrimitiveReader::new(
            source,
            4096,
            catalog.max_group_depth(),
            catalog.max_pmap_bytes(),
            shutdown.clone(),
        );
        Self {
            catalog,
            reader,
            producer,
            dictionary: catalog.new_dictionary(),
            shutdown,
            seq_stack: Vec::with_capacity(catalog.max_group_depth()),
            state: DecodeState::AwaitTemplate,
            preamble_bytes: config.preamble_bytes,
            debug: config.debug_flags,
            preamble: Vec::with_capacity(4),
            text_buf: Vec::new(),
            current_template: None,
            last_template: None,
            messages: 0,
        }
    }

    /// Messages fully decoded so far.
    pub fn message_count(&self) -> u64 {
        self.messages
    }

    /// Current reactor state.
    pub fn state(&self) -> DecodeState {
        self.state
    }

    /// Decode until the source drains, then publish the EOF sentinel.
    ///
    /// Fatal errors abandon the in-flight fragment, publish EOF so the
    /// downstream stage unblocks, and propagate with full context.
    #[tracing::instrument(name = "decode", skip_all)]
    pub fn run(&mut self) -> Result<u64, CodecError> {
        loop {
            match self.poll_message() {
                Ok(true) => {}
                Ok(false) => return Ok(self.messages),
                Err(e) => {
                    self.producer.abandon_if_open();
                    let _ = self.producer.publish_eof();
                    self.state = DecodeState::EndOfStream;
                    return Err(e.with_context(ErrorContext {
                        template_id: self.current_template.or(self.last_template),
                        byte_offset: Some(self.reader.byte_offset()),
                        ..ErrorContext::default()
                    }));
                }
            }
        }
    }

    /// Decode one whole message. `Ok(false)` is a clean end of stream
    /// (the EOF sentinel is published).
    pub fn poll_message(&mut self) -> Result<bool, CodecError> {
        debug_assert_eq!(self.state, DecodeState::AwaitTemplate);
        if self.shutdown.is_raised() {
            return Err(CodecError::Shutdown);
        }
        if !self.reader.has_more()? {
            self.producer.publish_eof()?;
            self.state = DecodeState::EndOfStream;
            tracing::debug!(messages = self.messages, "source drained");
            return Ok(false);
        }

        let start = self.open_message()?;
        let mut outcome = self.execute_fragment(start, true)?;
        loop {
            match outcome {
                FragmentOutcome::MessageEnd => {
                    self.state = DecodeState::AwaitTemplate;
                    self.last_template = self.current_template.take();
                    self.messages += 1;
                    return Ok(true);
                }
                FragmentOutcome::Sequence { body_open, count } => {
                    let body_close = body_open + self.catalog.token(body_open).instance() as usize;
                    self.seq_stack.push(SeqFrame {
                        body_open,
                        body_close,
                        remaining: count,
                    });
                    self.state = DecodeState::InSequence;
                    outcome = self.advance_sequence()?;
                }
                FragmentOutcome::BodyEnd => {
                    outcome = self.advance_sequence()?;
                }
            }
        }
    }

    /// Read the message prologue: preamble, template id, resets.
    fn open_message(&mut self) -> Result<usize, CodecError> {
        if self.preamble_bytes > 0 {
            let mut buf = std::mem::take(&mut self.preamble);
            self.reader.read_bytes(self.preamble_bytes as usize, &mut buf)?;
            self.preamble = buf;
        }
        let id = i64::from(self.reader.read_u32()?);
        self.current_template = Some(id);
        let start = self
            .catalog
            .template_start(id)
            .ok_or_else(|| CodecError::violation(Violation::UnknownTemplate))?;
        let entry = self
            .catalog
            .template_at(start)
            .expect("start came from the catalog");
        let reset = &self.catalog.reset_groups()[entry.reset_group as usize];
        if !reset.entries.is_empty() {
            self.dictionary.apply_reset(reset);
        }
        tracing::trace!(template = id, start, "open message");
        self.state = DecodeState::InMessage;
        Ok(start)
    }

    /// Execute the fragment starting at `frag_start`: reserve ring space,
    /// decode its token run, close the fragment.
    fn execute_fragment(
        &mut self,
        frag_start: usize,
        is_message_head: bool,
    ) -> Result<FragmentOutcome, CodecError> {
        let preamble_slots = if is_message_head && self.preamble_bytes > 0 {
            1
        } else {
            0
        };
        let slots = self.catalog.fragment_slots(frag_start) + preamble_slots;
        self.producer.begin_fragment(frag_start as i32, slots)?;
        if preamble_slots == 1 {
            let mut word = [0u8; 4];
            word[..self.preamble.len().min(4)]
                .copy_from_slice(&self.preamble[..self.preamble.len().min(4)]);
            self.producer.write_int(i32::from_be_bytes(word));
        }

        let end = frag_start + self.catalog.fragment_script_len(frag_start);
        let mut cursor = frag_start;
        let mut outcome = None;
        while cursor < end {
            let token = self.catalog.token(cursor);
            if self.debug.contains(DebugFlags::TRACE_TOKENS) {
                tracing::trace!(cursor, token = ?token.type_tag(), "execute");
            }
            let step = self.execute_token(token, cursor).map_err(|e| {
                e.with_context(ErrorContext {
                    cursor: Some(cursor),
                    field: Some(token.instance()),
                    ..ErrorContext::default()
                })
            })?;
            match step {
                TokenStep::Plain => cursor += 1,
                TokenStep::Pair => cursor += 2,
                TokenStep::Skip(n) => cursor += n,
                TokenStep::SequenceHead(count) => {
                    debug_assert_eq!(cursor + 1, end, "length ends its fragment");
                    outcome = Some(FragmentOutcome::Sequence {
                        body_open: cursor + 1,
                        count,
                    });
                    cursor += 1;
                }
                TokenStep::CloseTemplate => {
                    outcome = Some(FragmentOutcome::MessageEnd);
                    cursor += 1;
                }
                TokenStep::CloseBody => {
                    outcome = Some(FragmentOutcome::BodyEnd);
                    cursor += 1;
                }
            }
        }
        self.producer.end_fragment();
        Ok(outcome.expect("fragment ends in a close or a sequence length"))
    }

    /// Sequence bookkeeping after a fragment completes: run the next body
    /// iteration, or retire the frame and continue past the sequence.
    fn advance_sequence(&mut self) -> Result<FragmentOutcome, CodecError> {
        loop {
            let Some(frame) = self.seq_stack.last_mut() else {
                // A body close with no frame means a malformed script.
                return Err(CodecError::violation(Violation::UnknownTemplate));
            };
            if frame.remaining > 0 {
                frame.remaining -= 1;
                let body_open = frame.body_open;
                return self.execute_fragment(body_open, false);
            }
            let after = frame.body_close + 1;
            self.seq_stack.pop();
            if self.seq_stack.is_empty() {
                self.state = DecodeState::InMessage;
            }
            let next = self.catalog.token(after);
            if next.type_tag() == TypeTag::Group && next.group_flags().contains(GroupFlags::CLOSE)
            {
                // The sequence ran flush against its enclosing bracket; no
                // continuation fragment exists, so execute the close here.
                if next.group_flags().contains(GroupFlags::PMAP) {
                    self.reader.close_pmap()?;
                }
                if next.group_flags().contains(GroupFlags::TEMPLATE) {
                    return Ok(FragmentOutcome::MessageEnd);
                }
                // Closing an outer body: loop to retire or continue it.
                continue;
            }
            return self.execute_fragment(after, false);
        }
    }

    fn execute_token(&mut self, token: Token, cursor: usize) -> Result<TokenStep, CodecError> {
        match token.type_tag() {
            TypeTag::Group => self.execute_group(token, cursor),
            TypeTag::Dictionary => {
                let group = &self.catalog.reset_groups()[token.instance() as usize];
                self.dictionary.apply_reset(group);
                Ok(TokenStep::Plain)
            }
            TypeTag::GroupLength => {
                let value = self.decode_i32(token)?;
                match value {
                    None => {
                        self.producer.write_int(absent_int32(token));
                        Ok(TokenStep::SequenceHead(0))
                    }
                    Some(v) if v < 0 => Err(CodecError::violation(Violation::VarintOverflow)),
                    Some(v) => {
                        self.producer.write_int(v);
                        Ok(TokenStep::SequenceHead(v as u32))
                    }
                }
            }
            TypeTag::Int32 => {
                let value = self.decode_i32(token)?;
                self.producer
                    .write_int(value.unwrap_or_else(|| absent_int32(token)));
                Ok(TokenStep::Plain)
            }
            TypeTag::Int64 => {
                let value = self.decode_i64(token)?;
                self.producer
                    .write_long(value.unwrap_or_else(|| absent_int64(token)));
                Ok(TokenStep::Plain)
            }
            TypeTag::Decimal => {
                let mantissa_token = self.catalog.token(cursor + 1);
                match self.decode_i32(token)? {
                    None => {
                        self.producer.write_decimal(absent_int32(token), 0);
                    }
                    Some(exponent) => {
                        let mantissa = self
                            .decode_i64(mantissa_token)?
                            .ok_or_else(|| CodecError::violation(Violation::ForbiddenNull))?;
                        self.producer.write_decimal(exponent, mantissa);
                    }
                }
                Ok(TokenStep::Pair)
            }
            TypeTag::Ascii | TypeTag::Utf8 | TypeTag::ByteVec => {
                self.decode_text(token, cursor)?;
                Ok(TokenStep::Plain)
            }
        }
    }

    fn execute_group(&mut self, token: Token, cursor: usize) -> Result<TokenStep, CodecError> {
        let flags = token.group_flags();
        if flags.contains(GroupFlags::OPEN) {
            let fragment_root =
                flags.contains(GroupFlags::TEMPLATE) || self.catalog.is_body_open(cursor);
            if !fragment_root && token.is_optional() {
                // Inline optional group: one presence bit, one ring slot.
                let present = self.reader.pop_pmap_bit()? == 1;
                self.producer.write_int(present as i32);
                if !present {
                    self.fill_absent(cursor + 1, cursor + token.instance() as usize)?;
                    return Ok(TokenStep::Skip(token.instance() as usize + 1));
                }
            }
            if flags.contains(GroupFlags::PMAP) {
                self.reader.open_pmap(self.catalog.max_pmap_bytes())?;
            }
            Ok(TokenStep::Plain)
        } else {
            if flags.contains(GroupFlags::PMAP) {
                self.reader.close_pmap()?;
            }
            if flags.contains(GroupFlags::TEMPLATE) {
                Ok(TokenStep::CloseTemplate)
            } else if self.catalog.is_body_open(cursor - token.instance() as usize) {
                Ok(TokenStep::CloseBody)
            } else {
                // Inline group close within its parent fragment.
                Ok(TokenStep::Plain)
            }
        }
    }

    /// Write absent sentinels for every field slot in `[from, to)`
    /// (an inline group decoded as absent).
    fn fill_absent(&mut self, from: usize, to: usize) -> Result<(), CodecError> {
        let mut pos = from;
        while pos < to {
            let token = self.catalog.token(pos);
            match token.type_tag() {
                TypeTag::Int32 | TypeTag::GroupLength => {
                    self.producer.write_int(absent_int32(token))
                }
                TypeTag::Int64 => {
                    if !token.is_subfield() {
                        self.producer.write_long(absent_int64(token));
                    }
                }
                TypeTag::Decimal => self.producer.write_decimal(absent_int32(token), 0),
                TypeTag::Ascii | TypeTag::Utf8 | TypeTag::ByteVec => {
                    self.producer.write_null_bytes()
                }
                TypeTag::Group => {
                    if token.group_flags().contains(GroupFlags::OPEN) && token.is_optional() {
                        self.producer.write_int(0);
                    }
                }
                TypeTag::Dictionary => {}
            }
            pos += 1;
        }
        Ok(())
    }

    // -- integer operator matrix -------------------------------------------

    fn decode_i32(&mut self, token: Token) -> Result<Option<i32>, CodecError> {
        let slot = token.instance();
        let optional = token.is_optional();
        match token.op() {
            OpTag::None => {
                if optional {
                    match self.reader.read_i32_optional()? {
                        None => Ok(None),
                        Some(v) => {
                            self.dictionary.set_int32(slot, v);
                            Ok(Some(v))
                        }
                    }
                } else {
                    let v = self.reader.read_i32()?;
                    self.dictionary.set_int32(slot, v);
                    Ok(Some(v))
                }
            }
            OpTag::Constant => {
                if optional && self.reader.pop_pmap_bit()? == 0 {
                    return Ok(None);
                }
                let (value, _) = self.dictionary.int32(slot);
                Ok(Some(value))
            }
            OpTag::Default => {
                if self.reader.pop_pmap_bit()? == 0 {
                    let (value, state) = self.dictionary.int32(slot);
                    return match state {
                        SlotState::Assigned => Ok(Some(value)),
                        _ if optional => Ok(None),
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if optional {
                    Ok(self.reader.read_i32_optional()?)
                } else {
                    Ok(Some(self.reader.read_i32()?))
                }
            }
            OpTag::Copy => {
                if self.reader.pop_pmap_bit()? == 0 {
                    let (value, state) = self.dictionary.int32(slot);
                    return match state {
                        SlotState::Assigned => Ok(Some(value)),
                        _ if optional => Ok(None),
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if optional {
                    match self.reader.read_i32_optional()? {
                        None => {
                            self.dictionary.set_int32_null(slot);
                            Ok(None)
                        }
                        Some(v) => {
                            self.dictionary.set_int32(slot, v);
                            Ok(Some(v))
                        }
                    }
                } else {
                    let v = self.reader.read_i32()?;
                    self.dictionary.set_int32(slot, v);
                    Ok(Some(v))
                }
            }
            OpTag::Increment => {
                if self.reader.pop_pmap_bit()? == 0 {
                    let (value, state) = self.dictionary.int32(slot);
                    return match state {
                        SlotState::Assigned => {
                            let next = value.wrapping_add(1);
                            self.dictionary.set_int32(slot, next);
                            Ok(Some(next))
                        }
                        _ if optional => Ok(None),
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if optional {
                    match self.reader.read_i32_optional()? {
                        None => {
                            self.dictionary.set_int32_null(slot);
                            Ok(None)
                        }
                        Some(v) => {
                            self.dictionary.set_int32(slot, v);
                            Ok(Some(v))
                        }
                    }
                } else {
                    let v = self.reader.read_i32()?;
                    self.dictionary.set_int32(slot, v);
                    Ok(Some(v))
                }
            }
            OpTag::Delta => {
                let delta = if optional {
                    match self.reader.read_i64_optional()? {
                        None => return Ok(None),
                        Some(d) => d,
                    }
                } else {
                    self.reader.read_i64()?
                };
                let (base, _) = self.dictionary.int32(slot);
                let value = i32::try_from(i64::from(base).wrapping_add(delta))
                    .map_err(|_| CodecError::violation(Violation::VarintOverflow))?;
                self.dictionary.set_int32(slot, value);
                Ok(Some(value))
            }
            OpTag::Tail => Err(CodecError::violation(Violation::ForbiddenNull)),
        }
    }

    fn decode_i64(&mut self, token: Token) -> Result<Option<i64>, CodecError> {
        let slot = token.instance();
        let optional = token.is_optional();
        match token.op() {
            OpTag::None => {
                if optional {
                    match self.reader.read_i64_optional()? {
                        None => Ok(None),
                        Some(v) => {
                            self.dictionary.set_int64(slot, v);
                            Ok(Some(v))
                        }
                    }
                } else {
                    let v = self.reader.read_i64()?;
                    self.dictionary.set_int64(slot, v);
                    Ok(Some(v))
                }
            }
            OpTag::Constant => {
                if optional && self.reader.pop_pmap_bit()? == 0 {
                    return Ok(None);
                }
                let (value, _) = self.dictionary.int64(slot);
                Ok(Some(value))
            }
            OpTag::Default => {
                if self.reader.pop_pmap_bit()? == 0 {
                    let (value, state) = self.dictionary.int64(slot);
                    return match state {
                        SlotState::Assigned => Ok(Some(value)),
                        _ if optional => Ok(None),
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if optional {
                    Ok(self.reader.read_i64_optional()?)
                } else {
                    Ok(Some(self.reader.read_i64()?))
                }
            }
            OpTag::Copy => {
                if self.reader.pop_pmap_bit()? == 0 {
                    let (value, state) = self.dictionary.int64(slot);
                    return match state {
                        SlotState::Assigned => Ok(Some(value)),
                        _ if optional => Ok(None),
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if optional {
                    match self.reader.read_i64_optional()? {
                        None => {
                            self.dictionary.set_int64_null(slot);
                            Ok(None)
                        }
                        Some(v) => {
                            self.dictionary.set_int64(slot, v);
                            Ok(Some(v))
                        }
                    }
                } else {
                    let v = self.reader.read_i64()?;
                    self.dictionary.set_int64(slot, v);
                    Ok(Some(v))
                }
            }
            OpTag::Increment => {
                if self.reader.pop_pmap_bit()? == 0 {
                    let (value, state) = self.dictionary.int64(slot);
                    return match state {
                        SlotState::Assigned => {
                            let next = value.wrapping_add(1);
                            self.dictionary.set_int64(slot, next);
                            Ok(Some(next))
                        }
                        _ if optional => Ok(None),
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if optional {
                    match self.reader.read_i64_optional()? {
                        None => {
                            self.dictionary.set_int64_null(slot);
                            Ok(None)
                        }
                        Some(v) => {
                            self.dictionary.set_int64(slot, v);
                            Ok(Some(v))
                        }
                    }
                } else {
                    let v = self.reader.read_i64()?;
                    self.dictionary.set_int64(slot, v);
                    Ok(Some(v))
                }
            }
            OpTag::Delta => {
                let delta = if optional {
                    match self.reader.read_i64_optional()? {
                        None => return Ok(None),
                        Some(d) => d,
                    }
                } else {
                    self.reader.read_i64()?
                };
                let (base, _) = self.dictionary.int64(slot);
                let value = base.wrapping_add(delta);
                self.dictionary.set_int64(slot, value);
                Ok(Some(value))
            }
            OpTag::Tail => Err(CodecError::violation(Violation::ForbiddenNull)),
        }
    }

    // -- text operator matrix ----------------------------------------------

    fn max_len(&self, token: Token) -> u32 {
        if token.type_tag() == TypeTag::ByteVec {
            self.catalog.max_byte_vector_len()
        } else {
            self.catalog.max_text_len()
        }
    }

    /// Read one wire text value into `text_buf`. `Ok(false)` means null.
    fn read_text_wire(&mut self, token: Token) -> Result<bool, CodecError> {
        let optional = token.is_optional();
        let max = self.max_len(token);
        if token.type_tag() == TypeTag::Ascii {
            let mut buf = std::mem::take(&mut self.text_buf);
            let wire = self.reader.read_ascii(&mut buf, max);
            self.text_buf = buf;
            match wire? {
                AsciiWire::ZeroByte if optional => Ok(false),
                AsciiWire::ZeroByte | AsciiWire::Empty => {
                    self.text_buf.clear();
                    Ok(true)
                }
                AsciiWire::Text => Ok(true),
            }
        } else {
            let len = if optional {
                match self.reader.read_u32_optional()? {
                    None => return Ok(false),
                    Some(len) => len,
                }
            } else {
                self.reader.read_u32()?
            };
            if len > max {
                return Err(CodecError::violation(Violation::LengthOutOfBounds));
            }
            let mut buf = std::mem::take(&mut self.text_buf);
            let result = self.reader.read_bytes(len as usize, &mut buf);
            self.text_buf = buf;
            result?;
            Ok(true)
        }
    }

    fn put_text_value(&mut self) -> Result<(), CodecError> {
        self.producer.append_bytes(&self.text_buf)?;
        Ok(())
    }

    fn put_dict_text(&mut self, slot: u32) -> Result<(), CodecError> {
        self.producer.append_bytes(self.dictionary.text(slot))?;
        Ok(())
    }

    fn decode_text(&mut self, token: Token, cursor: usize) -> Result<(), CodecError> {
        let slot = token.instance();
        let optional = token.is_optional();
        match token.op() {
            OpTag::None => {
                if self.read_text_wire(token)? {
                    self.dictionary.set_text(slot, &self.text_buf);
                    self.put_text_value()
                } else {
                    self.dictionary.set_text_null(slot);
                    self.producer.write_null_bytes();
                    Ok(())
                }
            }
            OpTag::Constant => {
                let idx = self
                    .catalog
                    .constant_index(cursor)
                    .ok_or_else(|| CodecError::violation(Violation::UnknownTemplate))?;
                if optional && self.reader.pop_pmap_bit()? == 0 {
                    self.producer.write_null_bytes();
                    return Ok(());
                }
                let len = self.catalog.constant(idx as usize).len() as i32;
                self.producer.write_const_ref(idx, len);
                Ok(())
            }
            OpTag::Default => {
                if self.reader.pop_pmap_bit()? == 0 {
                    return match self.dictionary.text_state(slot) {
                        SlotState::Assigned => self.put_dict_text(slot),
                        _ if optional => {
                            self.producer.write_null_bytes();
                            Ok(())
                        }
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if self.read_text_wire(token)? {
                    self.put_text_value()
                } else {
                    self.producer.write_null_bytes();
                    Ok(())
                }
            }
            OpTag::Copy => {
                if self.reader.pop_pmap_bit()? == 0 {
                    return match self.dictionary.text_state(slot) {
                        SlotState::Assigned => self.put_dict_text(slot),
                        _ if optional => {
                            self.producer.write_null_bytes();
                            Ok(())
                        }
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if self.read_text_wire(token)? {
                    self.dictionary.set_text(slot, &self.text_buf);
                    self.put_text_value()
                } else {
                    self.dictionary.set_text_null(slot);
                    self.producer.write_null_bytes();
                    Ok(())
                }
            }
            OpTag::Delta => {
                let sub = if optional {
                    match self.reader.read_i32_optional()? {
                        None => {
                            self.producer.write_null_bytes();
                            return Ok(());
                        }
                        Some(s) => s,
                    }
                } else {
                    self.reader.read_i32()?
                };
                self.read_text_diff(token)?;
                let len = self.dictionary.text(slot).len();
                if sub >= 0 {
                    let sub = sub as usize;
                    if sub > len {
                        return Err(CodecError::violation(Violation::LengthOutOfBounds));
                    }
                    self.dictionary.set_text_tail(slot, &self.text_buf, len - sub);
                } else {
                    let cut = (-(sub as i64) - 1) as usize;
                    if cut > len {
                        return Err(CodecError::violation(Violation::LengthOutOfBounds));
                    }
                    self.dictionary.set_text_head(slot, &self.text_buf, len - cut);
                }
                self.put_dict_text(slot)
            }
            OpTag::Tail => {
                if self.reader.pop_pmap_bit()? == 0 {
                    return match self.dictionary.text_state(slot) {
                        SlotState::Assigned => self.put_dict_text(slot),
                        _ if optional => {
                            self.producer.write_null_bytes();
                            Ok(())
                        }
                        _ => Err(CodecError::violation(Violation::ForbiddenNull)),
                    };
                }
                if self.read_text_wire(token)? {
                    let tail_len = self.text_buf.len();
                    let len = self.dictionary.text(slot).len();
                    let prefix = len.saturating_sub(tail_len);
                    self.dictionary.set_text_tail(slot, &self.text_buf, prefix);
                    self.put_dict_text(slot)
                } else {
                    self.dictionary.set_text_null(slot);
                    self.producer.write_null_bytes();
                    Ok(())
                }
            }
            OpTag::Increment => Err(CodecError::violation(Violation::ForbiddenNull)),
        }
    }

    /// Delta diffs are always value-form on the wire, even for optional
    /// fields (nullness was already decided by the subtraction length).
    fn read_text_diff(&mut self, token: Token) -> Result<(), CodecError> {
        let max = self.max_len(token);
        if token.type_tag() == TypeTag::Ascii {
            let mut buf = std::mem::take(&mut self.text_buf);
            let wire = self.reader.read_ascii(&mut buf, max);
            self.text_buf = buf;
            if matches!(wire?, AsciiWire::ZeroByte | AsciiWire::Empty) {
                self.text_buf.clear();
            }
        } else {
            let len = self.reader.read_u32()?;
            if len > max {
                return Err(CodecError::violation(Violation::LengthOutOfBounds));
            }
            let mut buf = std::mem::take(&mut self.text_buf);
            let result = self.reader.read_bytes(len as usize, &mut buf);
            self.text_buf = buf;
            result?;
        }
        Ok(())
    }
}

enum TokenStep {
    Plain,
    Pair,
    Skip(usize),
    SequenceHead(u32),
    CloseTemplate,
    CloseBody,
}
