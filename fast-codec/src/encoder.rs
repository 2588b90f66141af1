//! Encode reactor: consumes structured fragments from the ring and emits
//! the compressed byte stream, plus the host-facing [`MessageWriter`] that
//! produces those fragments.
//!
//! Every operator arm is the exact mirror of the decode side: it consults
//! the same dictionary state, consumes the same presence-map bits, and
//! updates slots under the same rules. Any asymmetry between the two
//! matrices desynchronizes the stream silently, so the arms are kept in
//! the same order as in `decoder.rs` for side-by-side review.

use fast_ring::{RingConsumer, RingProducer, EOF_SLOTS};
use fast_token::{GroupFlags, OpTag, Token, TypeTag};

use crate::catalog::Catalog;
use crate::config::CodecConfig;
use crate::dictionary::{Dictionary, SlotState};
use crate::error::{CodecError, ErrorContext, Violation};
use crate::io::{ByteSink, ShutdownFlag};
use crate::primitive::PrimitiveWriter;
use crate::value::{absent_int32, absent_int64};

#[derive(Debug, Clone, Copy)]
struct SeqFrame {
    body_open: usize,
    body_close: usize,
    remaining: u32,
}

enum FragmentOutcome {
    MessageEnd,
    BodyEnd,
    Sequence { body_open: usize, count: u32 },
}

/// The encode side of one codec pipe.
pub struct EncodeReactor<'c, S> {
    catalog: &'c Catalog,
    writer: PrimitiveWriter<S>,
    consumer: RingConsumer,
    dictionary: Dictionary,
    shutdown: ShutdownFlag,
    seq_stack: Vec<SeqFrame>,
    preamble_bytes: u32,
    text_buf: Vec<u8>,
    current_template: Option<i64>,
    messages: u64,
}

impl<'c, S: ByteSink> EncodeReactor<'c, S> {
    /// Wire a reactor to its catalog, sink and ring half.
    pub fn new(
        catalog: &'c Catalog,
        config: &CodecConfig,
        sink: S,
        mut consumer: RingConsumer,
        shutdown: ShutdownFlag,
    ) -> Self {
        let batch_bound = config.max_batch(catalog.max_fragment_slots()) as u32;
        consumer.set_batch_release(config.batch_release_size.min(batch_bound));
        let writer = PrimitiveWriter::new(sink, 4096, catalog.max_group_depth(), shutdown.clone());
        Self {
            catalog,
            writer,
            consumer,
            dictionary: catalog.new_dictionary(),
            shutdown,
            seq_stack: Vec::with_capacity(catalog.max_group_depth()),
            preamble_bytes: config.preamble_bytes,
            text_buf: Vec::new(),
            current_template: None,
            messages: 0,
        }
    }

    /// Messages fully encoded so far.
    pub fn message_count(&self) -> u64 {
        self.messages
    }

    /// Bytes emitted so far.
    pub fn position(&self) -> u64 {
        self.writer.position()
    }

    /// Hand back the sink after the stream completes.
    pub fn into_sink(self) -> S {
        self.writer.into_sink()
    }

    /// Encode until the EOF sentinel arrives, then flush.
    #[tracing::instrument(name = "encode", skip_all)]
    pub fn run(&mut self) -> Result<u64, CodecError> {
        loop {
            match self.poll_message() {
                Ok(true) => {}
                Ok(false) => return Ok(self.messages),
                Err(e) => {
                    self.writer.abandon_pmaps();
                    return Err(e.with_context(ErrorContext {
                        template_id: self.current_template,
                        ..ErrorContext::default()
                    }));
                }
            }
        }
    }

    /// Encode one whole message. `Ok(false)` means the EOF sentinel was
    /// consumed and the sink is flushed.
    pub fn poll_message(&mut self) -> Result<bool, CodecError> {
        let idx = self.await_fragment_header()?;
        if RingConsumer::is_eof(idx) {
            self.await_fragment(EOF_SLOTS)?;
            self.consumer.release_fragment();
            self.writer.flush()?;
            tracing::debug!(messages = self.messages, "eof sentinel consumed");
            return Ok(false);
        }

        let start = idx as usize;
        let entry = self
            .catalog
            .template_at(start)
            .ok_or_else(|| CodecError::violation(Violation::UnknownTemplate))?;
        let id = i64::from(entry.id);
        self.current_template = Some(id);
        let reset_group = entry.reset_group as usize;
        let reset = &self.catalog.reset_groups()[reset_group];
        if !reset.entries.is_empty() {
            self.dictionary.apply_reset(reset);
        }

        let mut outcome = self.execute_fragment(start, true, id)?;
        loop {
            match outcome {
                FragmentOutcome::MessageEnd => {
                    self.current_template = None;
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
                    outcome = self.advance_sequence()?;
                }
                FragmentOutcome::BodyEnd => {
                    outcome = self.advance_sequence()?;
                }
            }
        }
    }

    /// Spin (with yield) until the next fragment header is published.
    fn await_fragment_header(&mut self) -> Result<i32, CodecError> {
        loop {
            if let Some(idx) = self.consumer.try_peek() {
                return Ok(idx);
            }
            if self.shutdown.is_raised() {
                return Err(CodecError::Shutdown);
            }
            std::thread::yield_now();
        }
    }

    fn await_fragment(&mut self, slots: usize) -> Result<(), CodecError> {
        loop {
            if self.consumer.begin_fragment(slots) {
                return Ok(());
            }
            if self.shutdown.is_raised() {
                return Err(CodecError::Shutdown);
            }
            std::thread::yield_now();
        }
    }

    fn execute_fragment(
        &mut self,
        frag_start: usize,
        is_message_head: bool,
        template_id: i64,
    ) -> Result<FragmentOutcome, CodecError> {
        let preamble_slots = if is_message_head && self.preamble_bytes > 0 {
            1
        } else {
            0
        };
        let slots = self.catalog.fragment_slots(frag_start) + preamble_slots;
        self.await_fragment(slots)?;
        if is_message_head {
            if preamble_slots == 1 {
                let word = self.consumer.read_int();
                self.writer.write_bytes(&word.to_be_bytes());
            }
            self.writer.write_u32(template_id as u32);
        }

        let end = frag_start + self.catalog.fragment_script_len(frag_start);
        let mut cursor = frag_start;
        let mut outcome = None;
        while cursor < end {
            let token = self.catalog.token(cursor);
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
        self.consumer.release_fragment();
        Ok(outcome.expect("fragment ends in a close or a sequence length"))
    }

    fn advance_sequence(&mut self) -> Result<FragmentOutcome, CodecError> {
        loop {
            let Some(frame) = self.seq_stack.last_mut() else {
                return Err(CodecError::violation(Violation::UnknownTemplate));
            };
            if frame.remaining > 0 {
                frame.remaining -= 1;
                let body_open = frame.body_open;
                let template_id = self.current_template.unwrap_or_default();
                return self.execute_fragment(body_open, false, template_id);
            }
            let after = frame.body_close + 1;
            self.seq_stack.pop();
            let next = self.catalog.token(after);
            if next.type_tag() == TypeTag::Group && next.group_flags().contains(GroupFlags::CLOSE)
            {
                if next.group_flags().contains(GroupFlags::PMAP) {
                    self.writer.close_pmap()?;
                }
                if next.group_flags().contains(GroupFlags::TEMPLATE) {
                    return Ok(FragmentOutcome::MessageEnd);
                }
                continue;
            }
            let template_id = self.current_template.unwrap_or_default();
            return self.execute_fragment(after, false, template_id);
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
                let raw = self.consumer.read_int();
                let value = (raw != absent_int32(token)).then_some(raw);
                if let Some(v) = value {
                    if v < 0 {
                        return Err(CodecError::violation(Violation::VarintOverflow));
                    }
                }
                self.encode_i32(token, value)?;
                Ok(TokenStep::SequenceHead(value.unwrap_or(0) as u32))
            }
            TypeTag::Int32 => {
                let raw = self.consumer.read_int();
                let value = (raw != absent_int32(token)).then_some(raw);
                self.encode_i32(token, value)?;
                Ok(TokenStep::Plain)
            }
            TypeTag::Int64 => {
                let raw = self.consumer.read_long();
                let value = (raw != absent_int64(token)).then_some(raw);
                self.encode_i64(token, value)?;
                Ok(TokenStep::Plain)
            }
            TypeTag::Decimal => {
                let mantissa_token = self.catalog.token(cursor + 1);
                let (exp_raw, mant_raw) = self.consumer.read_decimal();
                if exp_raw == absent_int32(token) {
                    self.encode_i32(token, None)?;
                } else {
                    self.encode_i32(token, Some(exp_raw))?;
                    self.encode_i64(mantissa_token, Some(mant_raw))?;
                }
                Ok(TokenStep::Pair)
            }
            TypeTag::Ascii | TypeTag::Utf8 | TypeTag::ByteVec => {
                self.encode_text(token)?;
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
                let present = self.consumer.read_int() != 0;
                self.writer.push_pmap_bit(present)?;
                if !present {
                    self.consume_absent(cursor + 1, cursor + token.instance() as usize);
                    return Ok(TokenStep::Skip(token.instance() as usize + 1));
                }
            }
            if flags.contains(GroupFlags::PMAP) {
                self.writer.open_pmap(self.catalog.max_pmap_bytes())?;
            }
            Ok(TokenStep::Plain)
        } else {
            if flags.contains(GroupFlags::PMAP) {
                self.writer.close_pmap()?;
            }
            if flags.contains(GroupFlags::TEMPLATE) {
                Ok(TokenStep::CloseTemplate)
            } else if self.catalog.is_body_open(cursor - token.instance() as usize) {
                Ok(TokenStep::CloseBody)
            } else {
                Ok(TokenStep::Plain)
            }
        }
    }

    /// Drain the ring slots of an absent inline group.
    fn consume_absent(&mut self, from: usize, to: usize) {
        let mut pos = from;
        while pos < to {
            let token = self.catalog.token(pos);
            match token.type_tag() {
                TypeTag::Int32 | TypeTag::GroupLength => {
                    let _ = self.consumer.read_int();
                }
                TypeTag::Int64 => {
                    if !token.is_subfield() {
                        let _ = self.consumer.read_long();
                    }
                }
                TypeTag::Decimal => {
                    let _ = self.consumer.read_decimal();
                }
                TypeTag::Ascii | TypeTag::Utf8 | TypeTag::ByteVec => {
                    let _ = self.consumer.read_bytes_meta();
                }
                TypeTag::Group => {
                    if token.group_flags().contains(GroupFlags::OPEN) && token.is_optional() {
                        let _ = self.consumer.read_int();
                    }
                }
                TypeTag::Dictionary => {}
            }
            pos += 1;
        }
    }

    // -- integer operator matrix (encode) ----------------------------------

    fn encode_i32(&mut self, token: Token, value: Option<i32>) -> Result<(), CodecError> {
        let slot = token.instance();
        let optional = token.is_optional();
        match token.op() {
            OpTag::None => match value {
                Some(v) => {
                    if optional {
                        self.writer.write_i64_optional(Some(i64::from(v)))?;
                    } else {
                        self.writer.write_i32(v);
                    }
                    self.dictionary.set_int32(slot, v);
                    Ok(())
                }
                None if optional => self.writer.write_i64_optional(None),
                None => Err(CodecError::violation(Violation::ForbiddenNull)),
            },
            OpTag::Constant => {
                if optional {
                    self.writer.push_pmap_bit(value.is_some())?;
                } else if value.is_none() {
                    return Err(CodecError::violation(Violation::ForbiddenNull));
                }
                Ok(())
            }
            OpTag::Default => {
                let (dv, state) = self.dictionary.int32(slot);
                let matches_default = match value {
                    Some(v) => state == SlotState::Assigned && v == dv,
                    None => state != SlotState::Assigned,
                };
                if matches_default {
                    return self.writer.push_pmap_bit(false);
                }
                self.writer.push_pmap_bit(true)?;
                match value {
                    Some(v) if optional => self.writer.write_i64_optional(Some(i64::from(v))),
                    Some(v) => {
                        self.writer.write_i32(v);
                        Ok(())
                    }
                    None if optional => self.writer.write_i64_optional(None),
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Copy => {
                let (dv, state) = self.dictionary.int32(slot);
                let reusable = match value {
                    Some(v) => state == SlotState::Assigned && v == dv,
                    None => state != SlotState::Assigned,
                };
                if reusable {
                    if value.is_none() && !optional {
                        return Err(CodecError::violation(Violation::ForbiddenNull));
                    }
                    return self.writer.push_pmap_bit(false);
                }
                self.writer.push_pmap_bit(true)?;
                match value {
                    Some(v) => {
                        if optional {
                            self.writer.write_i64_optional(Some(i64::from(v)))?;
                        } else {
                            self.writer.write_i32(v);
                        }
                        self.dictionary.set_int32(slot, v);
                        Ok(())
                    }
                    None if optional => {
                        self.writer.write_i64_optional(None)?;
                        self.dictionary.set_int32_null(slot);
                        Ok(())
                    }
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Increment => {
                let (dv, state) = self.dictionary.int32(slot);
                match value {
                    Some(v) if state == SlotState::Assigned && v == dv.wrapping_add(1) => {
                        self.writer.push_pmap_bit(false)?;
                        self.dictionary.set_int32(slot, v);
                        Ok(())
                    }
                    Some(v) => {
                        self.writer.push_pmap_bit(true)?;
                        if optional {
                            self.writer.write_i64_optional(Some(i64::from(v)))?;
                        } else {
                            self.writer.write_i32(v);
                        }
                        self.dictionary.set_int32(slot, v);
                        Ok(())
                    }
                    None if state != SlotState::Assigned => {
                        if !optional {
                            return Err(CodecError::violation(Violation::ForbiddenNull));
                        }
                        self.writer.push_pmap_bit(false)
                    }
                    None if optional => {
                        self.writer.push_pmap_bit(true)?;
                        self.writer.write_i64_optional(None)?;
                        self.dictionary.set_int32_null(slot);
                        Ok(())
                    }
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Delta => match value {
                Some(v) => {
                    let (base, _) = self.dictionary.int32(slot);
                    let delta = i64::from(v).wrapping_sub(i64::from(base));
                    if optional {
                        self.writer.write_i64_optional(Some(delta))?;
                    } else {
                        self.writer.write_i64(delta);
                    }
                    self.dictionary.set_int32(slot, v);
                    Ok(())
                }
                None if optional => self.writer.write_i64_optional(None),
                None => Err(CodecError::violation(Violation::ForbiddenNull)),
            },
            OpTag::Tail => Err(CodecError::violation(Violation::ForbiddenNull)),
        }
    }

    fn encode_i64(&mut self, token: Token, value: Option<i64>) -> Result<(), CodecError> {
        let slot = token.instance();
        let optional = token.is_optional();
        match token.op() {
            OpTag::None => match value {
                Some(v) => {
                    if optional {
                        self.writer.write_i64_optional(Some(v))?;
                    } else {
                        self.writer.write_i64(v);
                    }
                    self.dictionary.set_int64(slot, v);
                    Ok(())
                }
                None if optional => self.writer.write_i64_optional(None),
                None => Err(CodecError::violation(Violation::ForbiddenNull)),
            },
            OpTag::Constant => {
                if optional {
                    self.writer.push_pmap_bit(value.is_some())?;
                } else if value.is_none() {
                    return Err(CodecError::violation(Violation::ForbiddenNull));
                }
                Ok(())
            }
            OpTag::Default => {
                let (dv, state) = self.dictionary.int64(slot);
                let matches_default = match value {
                    Some(v) => state == SlotState::Assigned && v == dv,
                    None => state != SlotState::Assigned,
                };
                if matches_default {
                    return self.writer.push_pmap_bit(false);
                }
                self.writer.push_pmap_bit(true)?;
                match value {
                    Some(v) if optional => self.writer.write_i64_optional(Some(v)),
                    Some(v) => {
                        self.writer.write_i64(v);
                        Ok(())
                    }
                    None if optional => self.writer.write_i64_optional(None),
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Copy => {
                let (dv, state) = self.dictionary.int64(slot);
                let reusable = match value {
                    Some(v) => state == SlotState::Assigned && v == dv,
                    None => state != SlotState::Assigned,
                };
                if reusable {
                    if value.is_none() && !optional {
                        return Err(CodecError::violation(Violation::ForbiddenNull));
                    }
                    return self.writer.push_pmap_bit(false);
                }
                self.writer.push_pmap_bit(true)?;
                match value {
                    Some(v) => {
                        if optional {
                            self.writer.write_i64_optional(Some(v))?;
                        } else {
                            self.writer.write_i64(v);
                        }
                        self.dictionary.set_int64(slot, v);
                        Ok(())
                    }
                    None if optional => {
                        self.writer.write_i64_optional(None)?;
                        self.dictionary.set_int64_null(slot);
                        Ok(())
                    }
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Increment => {
                let (dv, state) = self.dictionary.int64(slot);
                match value {
                    Some(v) if state == SlotState::Assigned && v == dv.wrapping_add(1) => {
                        self.writer.push_pmap_bit(false)?;
                        self.dictionary.set_int64(slot, v);
                        Ok(())
                    }
                    Some(v) => {
                        self.writer.push_pmap_bit(true)?;
                        if optional {
                            self.writer.write_i64_optional(Some(v))?;
                        } else {
                            self.writer.write_i64(v);
                        }
                        self.dictionary.set_int64(slot, v);
                        Ok(())
                    }
                    None if state != SlotState::Assigned => {
                        if !optional {
                            return Err(CodecError::violation(Violation::ForbiddenNull));
                        }
                        self.writer.push_pmap_bit(false)
                    }
                    None if optional => {
                        self.writer.push_pmap_bit(true)?;
                        self.writer.write_i64_optional(None)?;
                        self.dictionary.set_int64_null(slot);
                        Ok(())
                    }
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Delta => match value {
                Some(v) => {
                    let (base, _) = self.dictionary.int64(slot);
                    let delta = v.wrapping_sub(base);
                    if optional {
                        self.writer.write_i64_optional(Some(delta))?;
                    } else {
                        self.writer.write_i64(delta);
                    }
                    self.dictionary.set_int64(slot, v);
                    Ok(())
                }
                None if optional => self.writer.write_i64_optional(None),
                None => Err(CodecError::violation(Violation::ForbiddenNull)),
            },
            OpTag::Tail => Err(CodecError::violation(Violation::ForbiddenNull)),
        }
    }

    // -- text operator matrix (encode) -------------------------------------

    /// Pull the fragment's `{meta, length}` pair, copying any blob payload
    /// into `text_buf`. Returns `None` for an absent field.
    fn take_text(&mut self) -> Option<()> {
        let (meta, len) = self.consumer.read_bytes_meta();
        if RingConsumer::is_null_bytes(len) {
            return None;
        }
        self.text_buf.clear();
        if meta < 0 {
            let idx = (-meta - 1) as usize;
            self.text_buf.extend_from_slice(self.catalog.constant(idx));
        } else {
            let slices = self.consumer.blob_bytes(meta, len as usize);
            self.text_buf.extend_from_slice(slices.first);
            self.text_buf.extend_from_slice(slices.second);
        }
        Some(())
    }

    fn write_text_wire(&mut self, token: Token, null: bool) -> Result<(), CodecError> {
        let optional = token.is_optional();
        if token.type_tag() == TypeTag::Ascii {
            if null {
                debug_assert!(optional);
                self.writer.write_ascii_zero_byte();
            } else if self.text_buf.is_empty() {
                if optional {
                    self.writer.write_ascii_empty();
                } else {
                    self.writer.write_ascii_zero_byte();
                }
            } else {
                self.writer.write_ascii(&self.text_buf);
            }
        } else if null {
            debug_assert!(optional);
            self.writer.write_u64_optional(None)?;
        } else {
            let len = self.text_buf.len() as u64;
            if optional {
                self.writer.write_u64_optional(Some(len))?;
            } else {
                self.writer.write_u64(len);
            }
            self.writer.write_bytes(&self.text_buf);
        }
        Ok(())
    }

    fn encode_text(&mut self, token: Token) -> Result<(), CodecError> {
        let slot = token.instance();
        let optional = token.is_optional();
        let value = self.take_text();
        match token.op() {
            OpTag::None => match value {
                Some(()) => {
                    self.dictionary.set_text(slot, &self.text_buf);
                    self.write_text_wire(token, false)
                }
                None if optional => {
                    self.dictionary.set_text_null(slot);
                    self.write_text_wire(token, true)
                }
                None => Err(CodecError::violation(Violation::ForbiddenNull)),
            },
            OpTag::Constant => {
                if optional {
                    self.writer.push_pmap_bit(value.is_some())?;
                } else if value.is_none() {
                    return Err(CodecError::violation(Violation::ForbiddenNull));
                }
                Ok(())
            }
            OpTag::Default => {
                let state = self.dictionary.text_state(slot);
                let matches_default = match value {
                    Some(()) => {
                        state == SlotState::Assigned && self.dictionary.text(slot) == self.text_buf
                    }
                    None => state != SlotState::Assigned,
                };
                if matches_default {
                    return self.writer.push_pmap_bit(false);
                }
                self.writer.push_pmap_bit(true)?;
                match value {
                    Some(()) => self.write_text_wire(token, false),
                    None if optional => self.write_text_wire(token, true),
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Copy => {
                let state = self.dictionary.text_state(slot);
                let reusable = match value {
                    Some(()) => {
                        state == SlotState::Assigned && self.dictionary.text(slot) == self.text_buf
                    }
                    None => state != SlotState::Assigned,
                };
                if reusable {
                    if value.is_none() && !optional {
                        return Err(CodecError::violation(Violation::ForbiddenNull));
                    }
                    return self.writer.push_pmap_bit(false);
                }
                self.writer.push_pmap_bit(true)?;
                match value {
                    Some(()) => {
                        self.dictionary.set_text(slot, &self.text_buf);
                        self.write_text_wire(token, false)
                    }
                    None if optional => {
                        self.dictionary.set_text_null(slot);
                        self.write_text_wire(token, true)
                    }
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Delta => match value {
                Some(()) => self.encode_text_delta(token, slot, optional),
                None if optional => self.writer.write_i64_optional(None),
                None => Err(CodecError::violation(Violation::ForbiddenNull)),
            },
            OpTag::Tail => {
                let state = self.dictionary.text_state(slot);
                let reusable = match value {
                    Some(()) => {
                        state == SlotState::Assigned && self.dictionary.text(slot) == self.text_buf
                    }
                    None => state != SlotState::Assigned,
                };
                if reusable {
                    if value.is_none() && !optional {
                        return Err(CodecError::violation(Violation::ForbiddenNull));
                    }
                    return self.writer.push_pmap_bit(false);
                }
                self.writer.push_pmap_bit(true)?;
                match value {
                    Some(()) => self.encode_text_tail(token, slot),
                    None if optional => {
                        self.dictionary.set_text_null(slot);
                        self.write_text_wire(token, true)
                    }
                    None => Err(CodecError::violation(Violation::ForbiddenNull)),
                }
            }
            OpTag::Increment => Err(CodecError::violation(Violation::ForbiddenNull)),
        }
    }

    /// Emit the shorter of a tail diff and a head diff against the
    /// previous value, then store the new one.
    fn encode_text_delta(
        &mut self,
        token: Token,
        slot: u32,
        optional: bool,
    ) -> Result<(), CodecError> {
        let prev = self.dictionary.text(slot);
        let next = &self.text_buf;
        let prefix = common_prefix(prev, next);
        let suffix = common_suffix(prev, next);
        let tail_sub = prev.len() - prefix;
        let head_sub = prev.len() - suffix;
        let (sub, diff_start, diff_end) = if prev.len() - prefix <= prev.len() - suffix {
            (tail_sub as i64, prefix, next.len())
        } else {
            (-(head_sub as i64) - 1, 0, next.len() - suffix)
        };
        if optional {
            self.writer.write_i64_optional(Some(sub))?;
        } else {
            self.writer.write_i32(
                i32::try_from(sub)
                    .map_err(|_| CodecError::violation(Violation::LengthOutOfBounds))?,
            );
        }
        let diff = &self.text_buf[diff_start..diff_end];
        if token.type_tag() == TypeTag::Ascii {
            if diff.is_empty() {
                self.writer.write_ascii_zero_byte();
            } else {
                self.writer.write_ascii(diff);
            }
        } else {
            self.writer.write_u32(diff.len() as u32);
            self.writer.write_bytes(diff);
        }
        self.dictionary.set_text(slot, &self.text_buf);
        Ok(())
    }

    /// Emit the differing tail against the previous value. The operator
    /// cannot express a value shorter than the previous one, so that case
    /// is refused rather than encoded wrong.
    fn encode_text_tail(&mut self, token: Token, slot: u32) -> Result<(), CodecError> {
        let state = self.dictionary.text_state(slot);
        let prev_len = self.dictionary.text(slot).len();
        let next_len = self.text_buf.len();
        let prefix = if state == SlotState::Assigned && next_len == prev_len {
            common_prefix(self.dictionary.text(slot), &self.text_buf)
        } else if next_len >= prev_len {
            0
        } else {
            return Err(CodecError::violation(Violation::LengthOutOfBounds));
        };
        let tail = &self.text_buf[prefix..];
        if token.type_tag() == TypeTag::Ascii {
            if tail.is_empty() {
                self.writer.write_ascii_zero_byte();
            } else {
                self.writer.write_ascii(tail);
            }
        } else {
            self.writer.write_u32(tail.len() as u32);
            self.writer.write_bytes(tail);
        }
        self.dictionary.set_text(slot, &self.text_buf);
        Ok(())
    }
}

fn common_prefix(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

fn common_suffix(a: &[u8], b: &[u8]) -> usize {
    a.iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count()
}

enum TokenStep {
    Plain,
    Pair,
    Skip(usize),
    SequenceHead(u32),
    CloseTemplate,
    CloseBody,
}

// ---------------------------------------------------------------------------

/// Host-facing producer facade: writes whole messages into the ring in
/// script order, managing fragment boundaries (and sequence iteration
/// fragments) so the host only supplies field values.
pub struct MessageWriter<'c> {
    catalog: &'c Catalog,
    producer: RingProducer,
    preamble_bytes: u32,
    cursor: usize,
    frag_end: usize,
    seq_stack: Vec<WriterFrame>,
    in_message: bool,
}

#[derive(Debug, Clone, Copy)]
struct WriterFrame {
    body_open: usize,
    body_close: usize,
    remaining: u32,
}

impl<'c> MessageWriter<'c> {
    /// Wrap the ring's producer half.
    pub fn new(catalog: &'c Catalog, config: &CodecConfig, mut producer: RingProducer) -> Self {
        producer.set_batch_publish(config.batch_publish_size);
        Self {
            catalog,
            producer,
            preamble_bytes: config.preamble_bytes,
            cursor: 0,
            frag_end: 0,
            seq_stack: Vec::new(),
            in_message: false,
        }
    }

    /// Begin a message of the given wire template id; `preamble` is the
    /// pass-through word when the pipe carries one.
    pub fn begin_message(&mut self, template_id: i64, preamble: i32) -> Result<(), CodecError> {
        debug_assert!(!self.in_message, "previous message still open");
        let start = self
            .catalog
            .template_start(template_id)
            .ok_or_else(|| CodecError::violation(Violation::UnknownTemplate))?;
        let preamble_slots = usize::from(self.preamble_bytes > 0);
        let slots = self.catalog.fragment_slots(start) + preamble_slots;
        self.producer.begin_fragment(start as i32, slots)?;
        if preamble_slots == 1 {
            self.producer.write_int(preamble);
        }
        self.cursor = start;
        self.frag_end = start + self.catalog.fragment_script_len(start);
        self.in_message = true;
        self.skip_structural()?;
        Ok(())
    }

    /// Write an int32 field (`None` = absent).
    pub fn write_int32(&mut self, value: Option<i32>) -> Result<(), CodecError> {
        let token = self.expect(TypeTag::Int32)?;
        self.producer
            .write_int(value.unwrap_or_else(|| absent_int32(token)));
        self.advance()
    }

    /// Write an int64 field.
    pub fn write_int64(&mut self, value: Option<i64>) -> Result<(), CodecError> {
        let token = self.expect(TypeTag::Int64)?;
        self.producer
            .write_long(value.unwrap_or_else(|| absent_int64(token)));
        self.advance()
    }

    /// Write a decimal field as `(exponent, mantissa)`.
    pub fn write_decimal(&mut self, value: Option<(i32, i64)>) -> Result<(), CodecError> {
        let token = self.expect(TypeTag::Decimal)?;
        match value {
            Some((exponent, mantissa)) => self.producer.write_decimal(exponent, mantissa),
            None => self.producer.write_decimal(absent_int32(token), 0),
        }
        // The mantissa token is consumed together with the exponent.
        self.cursor += 2;
        self.finish_step()
    }

    /// Write a text or byte-vector field.
    pub fn write_text(&mut self, value: Option<&[u8]>) -> Result<(), CodecError> {
        let token = self.current_token()?;
        if !token.type_tag().is_text_or_bytes() {
            return Err(CodecError::violation(Violation::UnknownTemplate));
        }
        match value {
            None => self.producer.write_null_bytes(),
            Some(bytes) => {
                if let Some(idx) = self.catalog.constant_index(self.cursor) {
                    self.producer
                        .write_const_ref(idx, self.catalog.constant(idx as usize).len() as i32);
                } else {
                    self.producer.append_bytes(bytes)?;
                }
            }
        }
        self.advance()
    }

    /// Write a sequence length (`None` = absent optional sequence) and
    /// move into the first body iteration.
    pub fn write_sequence_len(&mut self, len: Option<u32>) -> Result<(), CodecError> {
        let token = self.expect(TypeTag::GroupLength)?;
        match len {
            Some(n) => self.producer.write_int(n as i32),
            None => self.producer.write_int(absent_int32(token)),
        }
        self.cursor += 1;
        debug_assert_eq!(self.cursor, self.frag_end, "length closes its fragment");
        self.producer.end_fragment();
        let body_open = self.cursor;
        let body_close = body_open + self.catalog.token(body_open).instance() as usize;
        self.seq_stack.push(WriterFrame {
            body_open,
            body_close,
            remaining: len.unwrap_or(0),
        });
        self.next_body_or_continue()
    }

    /// Declare an optional inline group present or absent.
    pub fn write_group_present(&mut self, present: bool) -> Result<(), CodecError> {
        let token = self.current_token()?;
        if token.type_tag() != TypeTag::Group || !token.is_optional() {
            return Err(CodecError::violation(Violation::UnknownTemplate));
        }
        self.producer.write_int(present as i32);
        if present {
            self.cursor += 1;
        } else {
            self.fill_absent(self.cursor + 1, self.cursor + token.instance() as usize);
            self.cursor += token.instance() as usize + 1;
        }
        self.finish_step()
    }

    /// Whether the message opened by `begin_message` is fully written.
    pub fn message_done(&self) -> bool {
        !self.in_message
    }

    /// Force-publish completed fragments.
    pub fn publish(&mut self) {
        self.producer.publish();
    }

    /// Publish the end-of-stream sentinel.
    pub fn publish_eof(&mut self) -> Result<(), CodecError> {
        debug_assert!(!self.in_message);
        self.producer.publish_eof()?;
        Ok(())
    }

    fn current_token(&self) -> Result<Token, CodecError> {
        if !self.in_message || self.cursor >= self.frag_end {
            return Err(CodecError::violation(Violation::UnknownTemplate));
        }
        Ok(self.catalog.token(self.cursor))
    }

    fn expect(&self, ty: TypeTag) -> Result<Token, CodecError> {
        let token = self.current_token()?;
        if token.type_tag() != ty {
            return Err(CodecError::violation(Violation::UnknownTemplate));
        }
        Ok(token)
    }

    fn advance(&mut self) -> Result<(), CodecError> {
        self.cursor += 1;
        self.finish_step()
    }

    /// After a field lands: skip structural tokens and settle fragment
    /// boundaries.
    fn finish_step(&mut self) -> Result<(), CodecError> {
        self.skip_structural()
    }

    fn skip_structural(&mut self) -> Result<(), CodecError> {
        loop {
            if self.cursor < self.frag_end {
                let token = self.catalog.token(self.cursor);
                match token.type_tag() {
                    TypeTag::Group => {
                        let flags = token.group_flags();
                        if flags.contains(GroupFlags::OPEN)
                            && token.is_optional()
                            && !flags.contains(GroupFlags::TEMPLATE)
                            && !self.catalog.is_body_open(self.cursor)
                        {
                            // Host must declare presence explicitly.
                            return Ok(());
                        }
                        self.cursor += 1;
                    }
                    TypeTag::Dictionary => self.cursor += 1,
                    _ => return Ok(()),
                }
                continue;
            }
            // Fragment boundary.
            let last = self.catalog.token(self.frag_end - 1);
            if last.type_tag() == TypeTag::GroupLength {
                // write_sequence_len owns this transition.
                return Ok(());
            }
            debug_assert_eq!(last.type_tag(), TypeTag::Group);
            self.producer.end_fragment();
            if last.group_flags().contains(GroupFlags::TEMPLATE) {
                self.in_message = false;
                return Ok(());
            }
            // A body iteration finished.
            return self.next_body_or_continue();
        }
    }

    fn next_body_or_continue(&mut self) -> Result<(), CodecError> {
        loop {
            let Some(frame) = self.seq_stack.last_mut() else {
                return Err(CodecError::violation(Violation::UnknownTemplate));
            };
            if frame.remaining > 0 {
                frame.remaining -= 1;
                let body_open = frame.body_open;
                let slots = self.catalog.fragment_slots(body_open);
                self.producer.begin_fragment(body_open as i32, slots)?;
                self.cursor = body_open + 1;
                self.frag_end = body_open + self.catalog.fragment_script_len(body_open);
                return self.skip_structural();
            }
            let after = frame.body_close + 1;
            self.seq_stack.pop();
            let next = self.catalog.token(after);
            if next.type_tag() == TypeTag::Group && next.group_flags().contains(GroupFlags::CLOSE)
            {
                if next.group_flags().contains(GroupFlags::TEMPLATE) {
                    self.in_message = false;
                    return Ok(());
                }
                continue;
            }
            let slots = self.catalog.fragment_slots(after);
            self.producer.begin_fragment(after as i32, slots)?;
            self.cursor = after;
            self.frag_end = after + self.catalog.fragment_script_len(after);
            return self.skip_structural();
        }
    }

    fn fill_absent(&mut self, from: usize, to: usize) {
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
    }
}
