//! Compiled template catalogs.
//!
//! A catalog is the executable form of a set of FAST templates: a flat
//! token script, per-template script windows, dictionary layout and reset
//! rules, the byte-constant pool, and the fragment tables the ring sides
//! share. Build one from template XML with [`CatalogBuilder`] or rehydrate
//! one from its binary image with [`Catalog::from_bytes`].

mod binary;
mod hash;
mod loader;

pub use hash::LongHashTable;
pub use loader::CatalogBuilder;

use fast_token::{
    slot_width, GroupFlags, OpTag, RawToken, Token, TypeTag, FRAGMENT_HEADER_SLOTS,
    FRAGMENT_TRAILER_SLOTS,
};

use crate::dictionary::{Dictionary, ResetGroup};
use crate::error::CatalogError;

/// One template's window into the script.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateEntry {
    /// Wire template id.
    pub id: u32,
    /// First token (the opening group bracket).
    pub start: u32,
    /// One past the closing bracket.
    pub limit: u32,
    /// Index of this template's reset group in [`Catalog::reset_groups`].
    pub reset_group: u32,
}

/// A compiled, executable template set.
#[derive(Debug)]
pub struct Catalog {
    script: Vec<RawToken>,
    tokens: Vec<Token>,
    templates: Vec<TemplateEntry>,
    reset_groups: Vec<ResetGroup>,
    constants: Vec<Vec<u8>>,
    max_pmap_bytes: u32,
    max_text_len: u32,
    max_byte_vector_len: u32,
    int32_slots: u32,
    int64_slots: u32,
    text_slots: u32,
    // Derived at finalize; never serialized.
    starts: LongHashTable,
    fragment_slots: Vec<u32>,
    fragment_script_len: Vec<u32>,
    text_const_idx: Vec<i32>,
    max_group_depth: u32,
}

impl Catalog {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn assemble(
        script: Vec<RawToken>,
        templates: Vec<TemplateEntry>,
        reset_groups: Vec<ResetGroup>,
        constants: Vec<Vec<u8>>,
        max_pmap_bytes: u32,
        max_text_len: u32,
        max_byte_vector_len: u32,
        int32_slots: u32,
        int64_slots: u32,
        text_slots: u32,
    ) -> Result<Self, CatalogError> {
        let mut catalog = Self {
            script,
            tokens: Vec::new(),
            templates,
            reset_groups,
            constants,
            max_pmap_bytes,
            max_text_len,
            max_byte_vector_len,
            int32_slots,
            int64_slots,
            text_slots,
            starts: LongHashTable::with_bits(1),
            fragment_slots: Vec::new(),
            fragment_script_len: Vec::new(),
            text_const_idx: Vec::new(),
            max_group_depth: 0,
        };
        catalog.finalize()?;
        Ok(catalog)
    }

    /// Rebuild every derived table from the serialized core. Shared by the
    /// XML and binary construction paths so both yield identical catalogs.
    fn finalize(&mut self) -> Result<(), CatalogError> {
        if self.reset_groups.is_empty() {
            return Err(CatalogError::Truncated);
        }
        self.tokens = self
            .script
            .iter()
            .enumerate()
            .map(|(pos, raw)| Token::unpack(*raw).map_err(|_| CatalogError::InvalidToken(pos)))
            .collect::<Result<_, _>>()?;

        let table_bits = (usize::BITS - (self.templates.len() * 2).leading_zeros()).max(4);
        let mut starts = LongHashTable::with_bits(table_bits);
        for template in &self.templates {
            starts.insert(i64::from(template.id), i64::from(template.start));
        }
        self.starts = starts;

        // Pool indices for constant-operator text fields, in declaration
        // order; must match the loader's pool push order exactly.
        self.text_const_idx = vec![-1; self.script.len()];
        let mut next_const = 0i32;
        for (pos, token) in self.tokens.iter().enumerate() {
            if token.type_tag().is_text_or_bytes() && token.op() == OpTag::Constant {
                self.text_const_idx[pos] = next_const;
                next_const += 1;
            }
        }
        if next_const as usize != self.constants.len() {
            return Err(CatalogError::Truncated);
        }

        self.fragment_slots = vec![0; self.script.len()];
        self.fragment_script_len = vec![0; self.script.len()];
        self.max_group_depth = 0;
        for i in 0..self.templates.len() {
            let template = self.templates[i].clone();
            let start = template.start as usize;
            let limit = template.limit as usize;
            let open = self
                .tokens
                .get(start)
                .ok_or(CatalogError::InvalidToken(start))?;
            let bracket = open.group_flags();
            if open.type_tag() != TypeTag::Group
                || !bracket.contains(GroupFlags::OPEN)
                || !bracket.contains(GroupFlags::TEMPLATE)
                || start + open.instance() as usize != limit - 1
            {
                return Err(CatalogError::InvalidToken(start));
            }
            self.analyze_group(start, 1)?;
        }
        Ok(())
    }

    /// Walk the group opening at `open_pos`, recording its fragment chain.
    ///
    /// A fragment runs from its start position to the next sequence-length
    /// token (inclusive) or to the group's closing bracket; each sequence
    /// body is its own fragment chain rooted at the body bracket.
    fn analyze_group(&mut self, open_pos: usize, depth: u32) -> Result<(), CatalogError> {
        self.max_group_depth = self.max_group_depth.max(depth);
        let close_pos = open_pos + self.tokens[open_pos].instance() as usize;
        if close_pos >= self.tokens.len() {
            return Err(CatalogError::InvalidToken(open_pos));
        }
        let mut frag_start = open_pos;
        let mut slots = FRAGMENT_HEADER_SLOTS + FRAGMENT_TRAILER_SLOTS;
        let mut inline_depth = 0u32;
        let mut pos = open_pos + 1;
        while pos <= close_pos {
            let token = self.tokens[pos];
            match token.type_tag() {
                TypeTag::Group => {
                    let flags = token.group_flags();
                    if flags.contains(GroupFlags::OPEN) {
                        inline_depth += 1;
                        self.max_group_depth = self.max_group_depth.max(depth + inline_depth);
                        // Optional inline groups carry a presence slot so
                        // the encode side can reproduce absence exactly.
                        if token.is_optional() {
                            slots += 1;
                        }
                    } else if inline_depth == 0 {
                        break;
                    } else {
                        inline_depth -= 1;
                    }
                    pos += 1;
                }
                TypeTag::GroupLength => {
                    slots += slot_width(TypeTag::GroupLength);
                    self.record_fragment(frag_start, slots, pos + 1 - frag_start)?;
                    let body_open = pos + 1;
                    let body = self
                        .tokens
                        .get(body_open)
                        .copied()
                        .ok_or(CatalogError::InvalidToken(pos))?;
                    if body.type_tag() != TypeTag::Group
                        || !body.group_flags().contains(GroupFlags::OPEN)
                    {
                        return Err(CatalogError::InvalidToken(body_open));
                    }
                    let body_close = body_open + body.instance() as usize;
                    self.analyze_group(body_open, depth + 1)?;
                    pos = body_close + 1;
                    frag_start = pos;
                    slots = FRAGMENT_HEADER_SLOTS + FRAGMENT_TRAILER_SLOTS;
                }
                TypeTag::Dictionary => {
                    if token.instance() as usize >= self.reset_groups.len() {
                        return Err(CatalogError::InvalidToken(pos));
                    }
                    pos += 1;
                }
                field => {
                    let decimal_pair_ok = field != TypeTag::Decimal
                        || self
                            .tokens
                            .get(pos + 1)
                            .is_some_and(|t| t.type_tag() == TypeTag::Int64 && t.is_subfield());
                    if !decimal_pair_ok {
                        return Err(CatalogError::InvalidToken(pos));
                    }
                    if !token.is_subfield() {
                        slots += slot_width(field);
                    }
                    pos += 1;
                }
            }
        }
        // Trailing fragment, unless the sequence ended flush against the
        // closing bracket.
        if frag_start < close_pos || frag_start == open_pos {
            self.record_fragment(frag_start, slots, close_pos + 1 - frag_start)?;
        }
        Ok(())
    }

    fn record_fragment(
        &mut self,
        start: usize,
        slots: usize,
        script_len: usize,
    ) -> Result<(), CatalogError> {
        let entry = self
            .fragment_slots
            .get_mut(start)
            .ok_or(CatalogError::InvalidToken(start))?;
        *entry = slots as u32;
        self.fragment_script_len[start] = script_len as u32;
        Ok(())
    }

    /// The packed token script.
    pub fn script(&self) -> &[RawToken] {
        &self.script
    }

    /// Unpacked token at `pos`.
    #[inline]
    pub fn token(&self, pos: usize) -> Token {
        self.tokens[pos]
    }

    /// Number of tokens in the script.
    pub fn script_len(&self) -> usize {
        self.script.len()
    }

    /// Templates in declaration order.
    pub fn templates(&self) -> &[TemplateEntry] {
        &self.templates
    }

    /// Script start for a wire template id.
    pub fn template_start(&self, id: i64) -> Option<usize> {
        self.starts.get(id).map(|start| start as usize)
    }

    /// The template whose window contains script position `pos`.
    pub fn template_at(&self, pos: usize) -> Option<&TemplateEntry> {
        self.templates
            .iter()
            .find(|t| (t.start as usize..t.limit as usize).contains(&pos))
    }

    /// Whether the group bracket at `pos` opens a sequence body (it
    /// immediately follows the sequence's length token).
    #[inline]
    pub fn is_body_open(&self, pos: usize) -> bool {
        pos > 0 && self.tokens[pos - 1].type_tag() == TypeTag::GroupLength
    }

    /// Slab slots (header and trailer included) of the fragment starting
    /// at script position `pos`.
    #[inline]
    pub fn fragment_slots(&self, pos: usize) -> usize {
        self.fragment_slots[pos] as usize
    }

    /// Tokens consumed by the fragment starting at script position `pos`.
    #[inline]
    pub fn fragment_script_len(&self, pos: usize) -> usize {
        self.fragment_script_len[pos] as usize
    }

    /// Largest fragment in the catalog, for ring sizing.
    pub fn max_fragment_slots(&self) -> usize {
        self.fragment_slots.iter().copied().max().unwrap_or(0) as usize
    }

    /// Byte constant `idx` from the pool.
    pub fn constant(&self, idx: usize) -> &[u8] {
        &self.constants[idx]
    }

    /// Constant-pool index of the constant text field at script position
    /// `pos`, if it is one.
    #[inline]
    pub fn constant_index(&self, pos: usize) -> Option<u32> {
        match self.text_const_idx.get(pos) {
            Some(&idx) if idx >= 0 => Some(idx as u32),
            _ => None,
        }
    }

    /// The byte-constant pool, in field declaration order.
    pub fn constants(&self) -> &[Vec<u8>] {
        &self.constants
    }

    /// Reset groups; index 0 is the full stream-initial state.
    pub fn reset_groups(&self) -> &[ResetGroup] {
        &self.reset_groups
    }

    /// The full initial dictionary state.
    pub fn stream_reset(&self) -> &ResetGroup {
        &self.reset_groups[0]
    }

    /// Upper bound on one presence map's byte run.
    pub fn max_pmap_bytes(&self) -> usize {
        self.max_pmap_bytes as usize
    }

    /// Deepest group nesting anywhere in the catalog.
    pub fn max_group_depth(&self) -> usize {
        self.max_group_depth as usize
    }

    /// Byte bound for text fields.
    pub fn max_text_len(&self) -> u32 {
        self.max_text_len
    }

    /// Byte bound for byte-vector fields.
    pub fn max_byte_vector_len(&self) -> u32 {
        self.max_byte_vector_len
    }

    /// A dictionary sized for this catalog, initialized to the stream
    /// state.
    pub fn new_dictionary(&self) -> Dictionary {
        let mut dictionary = Dictionary::new(
            self.int32_slots as usize,
            self.int64_slots as usize,
            self.text_slots as usize,
            self.max_text_len.clamp(16, 256) as usize,
        );
        dictionary.apply_reset(self.stream_reset());
        dictionary
    }

    pub(crate) fn dictionary_sizes(&self) -> (u32, u32, u32) {
        (self.int32_slots, self.int64_slots, self.text_slots)
    }
}
