//! Template XML to catalog compilation.
//!
//! The loader consumes template XML as an in-memory byte slice (file I/O
//! belongs to the host), builds a small element tree from the quick-xml
//! event stream, and emits the token script template by template. Token
//! emission is strictly declaration-ordered, so identical XML yields an
//! identical catalog on every load and platform.

use itertools::Itertools;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;

use fast_token::{pmap_bits, GroupFlags, OpTag, Token, TypeTag};

use crate::catalog::{Catalog, TemplateEntry};
use crate::config::CodecConfig;
use crate::dictionary::{ResetEntry, ResetGroup, SlotState};
use crate::error::{CatalogError, CodecError};

/// Compiles template XML into a [`Catalog`].
#[derive(Debug, Clone)]
pub struct CatalogBuilder {
    max_text_len: u32,
    max_byte_vector_len: u32,
}

impl Default for CatalogBuilder {
    fn default() -> Self {
        Self {
            max_text_len: 256,
            max_byte_vector_len: 4096,
        }
    }
}

impl CatalogBuilder {
    /// Builder with default field bounds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder taking its field bounds from a pipe configuration.
    pub fn from_config(config: &CodecConfig) -> Self {
        Self {
            max_text_len: config.max_text_len,
            max_byte_vector_len: config.max_byte_vector_len,
        }
    }

    /// Compile `xml` (a `<templates>` document) into a catalog.
    pub fn load_xml(&self, xml: &[u8]) -> Result<Catalog, CodecError> {
        let root = parse_tree(xml)?;
        let templates_node = root
            .children
            .iter()
            .find(|n| n.name == "templates")
            .ok_or_else(|| CatalogError::BadAttribute {
                element: "templates".into(),
                detail: "document has no <templates> root".into(),
            })?;

        let mut emitter = Emitter::default();
        emitter.reset_groups.push(ResetGroup {
            name: "global".into(),
            entries: Vec::new(),
        });
        let mut templates = Vec::new();
        for node in &templates_node.children {
            if node.name != "template" {
                continue;
            }
            templates.push(emitter.emit_template(node)?);
        }
        tracing::debug!(
            templates = %templates.iter().map(|t| t.id).join(","),
            tokens = emitter.tokens.len(),
            max_pmap_bytes = emitter.max_pmap_bytes,
            "compiled template catalog"
        );

        let script = emitter.tokens.iter().map(|t| t.pack()).collect();
        let mut reset_groups = emitter.reset_groups;
        reset_groups[0].entries = emitter.global_entries;
        let catalog = Catalog::assemble(
            script,
            templates,
            reset_groups,
            emitter.constants,
            emitter.max_pmap_bytes,
            self.max_text_len,
            self.max_byte_vector_len,
            emitter.int32_next,
            emitter.int64_next,
            emitter.text_next,
        )?;
        Ok(catalog)
    }
}

// ---------------------------------------------------------------------------
// XML element tree

#[derive(Debug, Default)]
struct Node {
    name: String,
    attrs: Vec<(String, String)>,
    children: Vec<Node>,
}

impl Node {
    fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    fn required_attr(&self, key: &str) -> Result<&str, CatalogError> {
        self.attr(key).ok_or_else(|| CatalogError::BadAttribute {
            element: self.name.clone(),
            detail: format!("missing `{key}`"),
        })
    }

    fn is_optional(&self) -> bool {
        self.attr("presence") == Some("optional")
    }
}

fn node_from(start: &BytesStart<'_>) -> Result<Node, CatalogError> {
    let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
    let mut attrs = Vec::new();
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::InvalidAttr)?;
        let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
        let value = attr.unescape_value()?.into_owned();
        attrs.push((key, value));
    }
    Ok(Node {
        name,
        attrs,
        children: Vec::new(),
    })
}

fn parse_tree(xml: &[u8]) -> Result<Node, CatalogError> {
    let mut reader = Reader::from_reader(xml);
    reader.trim_text(true);
    let mut buf = Vec::new();
    let mut stack = vec![Node::default()];
    loop {
        match reader.read_event_into(&mut buf)? {
            Event::Start(start) => stack.push(node_from(&start)?),
            Event::Empty(start) => {
                let node = node_from(&start)?;
                stack.last_mut().expect("root").children.push(node);
            }
            Event::End(_) => {
                let node = stack.pop().expect("balanced");
                stack.last_mut().expect("root").children.push(node);
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    if stack.len() != 1 {
        return Err(CatalogError::BadAttribute {
            element: "templates".into(),
            detail: "document ends with unclosed elements".into(),
        });
    }
    Ok(stack.pop().expect("root"))
}

// ---------------------------------------------------------------------------
// Token emission

#[derive(Debug, Default)]
struct Emitter {
    tokens: Vec<Token>,
    /// `(open position, pmap bits)` per open group.
    group_stack: Vec<(usize, u32)>,
    int32_next: u32,
    int64_next: u32,
    text_next: u32,
    global_entries: Vec<ResetEntry>,
    reset_groups: Vec<ResetGroup>,
    /// Index of the current template's scoped group, when its dictionary
    /// is not global.
    scoped_group: Option<usize>,
    constants: Vec<Vec<u8>>,
    max_pmap_bytes: u32,
}

impl Emitter {
    fn emit_template(&mut self, node: &Node) -> Result<TemplateEntry, CodecError> {
        let id: u32 = node
            .required_attr("id")?
            .parse()
            .map_err(|_| CatalogError::BadAttribute {
                element: "template".into(),
                detail: "non-numeric `id`".into(),
            })?;
        let template_group = self.reset_groups.len();
        self.reset_groups.push(ResetGroup {
            name: format!("template:{id}"),
            entries: Vec::new(),
        });

        let dictionary = node.attr("dictionary").unwrap_or("global");
        let named_group = match dictionary {
            "global" => None,
            "template" => {
                self.scoped_group = Some(template_group);
                None
            }
            name if name.starts_with("template:") => {
                return Err(CatalogError::DictionaryNameCollision(name.into()).into());
            }
            name => {
                let idx = self.named_group(name);
                self.scoped_group = Some(idx);
                Some(idx)
            }
        };

        let start = self.tokens.len();
        self.open_group(GroupFlags::TEMPLATE);
        if let Some(idx) = named_group {
            self.tokens.push(Token::dictionary(idx as u32));
        }
        for field in &node.children {
            self.emit_field(field)?;
        }
        self.close_group(GroupFlags::TEMPLATE, false)?;
        self.scoped_group = None;

        Ok(TemplateEntry {
            id,
            start: start as u32,
            limit: self.tokens.len() as u32,
            reset_group: template_group as u32,
        })
    }

    fn named_group(&mut self, name: &str) -> usize {
        if let Some(idx) = self.reset_groups.iter().position(|g| g.name == name) {
            return idx;
        }
        self.reset_groups.push(ResetGroup {
            name: name.into(),
            entries: Vec::new(),
        });
        self.reset_groups.len() - 1
    }

    fn open_group(&mut self, flags: GroupFlags) {
        let pos = self.tokens.len();
        self.tokens.push(Token::group(flags | GroupFlags::OPEN, 0));
        self.group_stack.push((pos, 0));
    }

    fn close_group(&mut self, flags: GroupFlags, optional: bool) -> Result<(), CodecError> {
        let (open_pos, bits) = self.group_stack.pop().expect("balanced groups");
        let span = (self.tokens.len() - open_pos) as u32;
        if span > Token::MAX_INSTANCE {
            return Err(CatalogError::InstanceOverflow.into());
        }
        let mut full = flags;
        if bits > 0 {
            full |= GroupFlags::PMAP;
            self.max_pmap_bytes = self.max_pmap_bytes.max(bits.div_ceil(7));
        }
        let mut open = Token::group(full | GroupFlags::OPEN, span);
        let mut close = Token::group(full | GroupFlags::CLOSE, span);
        if optional {
            open = open.as_optional();
            close = close.as_optional();
        }
        self.tokens[open_pos] = open;
        self.tokens.push(close);
        Ok(())
    }

    fn add_pmap_bits(&mut self, bits: u32) {
        if let Some((_, count)) = self.group_stack.last_mut() {
            *count += bits;
        }
    }

    fn emit_field(&mut self, node: &Node) -> Result<(), CodecError> {
        match node.name.as_str() {
            "int32" | "uInt32" => self.emit_int32(node, TypeTag::Int32),
            "int64" | "uInt64" => self.emit_int64(node),
            "string" => {
                let ty = if node.attr("charset") == Some("unicode") {
                    TypeTag::Utf8
                } else {
                    TypeTag::Ascii
                };
                self.emit_text(node, ty)
            }
            "byteVector" => self.emit_text(node, TypeTag::ByteVec),
            "decimal" => self.emit_decimal(node),
            "sequence" => self.emit_sequence(node),
            "group" => self.emit_group(node),
            other => Err(CatalogError::UndefinedField(other.into()).into()),
        }
    }

    fn emit_int32(&mut self, node: &Node, ty: TypeTag) -> Result<(), CodecError> {
        let (op, value) = operator_of(node)?;
        validate_int_op(node, op, value.as_deref())?;
        let optional = node.is_optional();
        let slot = self.int32_next;
        self.int32_next += 1;
        let value = match value {
            Some(text) => Some(parse_i64(node, &text)? as i32),
            None => None,
        };
        self.push_reset(ResetEntry::Int32 {
            slot,
            value: value.unwrap_or(0),
            state: if value.is_some() {
                SlotState::Assigned
            } else {
                SlotState::Undefined
            },
        });
        self.add_pmap_bits(pmap_bits(op, optional));
        self.push_token(Token::field(ty, op, optional, slot))
    }

    fn emit_int64(&mut self, node: &Node) -> Result<(), CodecError> {
        let (op, value) = operator_of(node)?;
        validate_int_op(node, op, value.as_deref())?;
        let optional = node.is_optional();
        let slot = self.alloc_int64(node, value.as_deref())?;
        self.add_pmap_bits(pmap_bits(op, optional));
        self.push_token(Token::field(TypeTag::Int64, op, optional, slot))
    }

    fn alloc_int64(&mut self, node: &Node, value: Option<&str>) -> Result<u32, CodecError> {
        let slot = self.int64_next;
        self.int64_next += 1;
        let value = match value {
            Some(text) => Some(parse_i64(node, text)?),
            None => None,
        };
        self.push_reset(ResetEntry::Int64 {
            slot,
            value: value.unwrap_or(0),
            state: if value.is_some() {
                SlotState::Assigned
            } else {
                SlotState::Undefined
            },
        });
        Ok(slot)
    }

    fn emit_text(&mut self, node: &Node, ty: TypeTag) -> Result<(), CodecError> {
        let (op, value) = operator_of(node)?;
        validate_text_op(node, op)?;
        let optional = node.is_optional();
        let slot = self.text_next;
        self.text_next += 1;
        if op == OpTag::Constant {
            let text = value.clone().ok_or_else(|| CatalogError::BadAttribute {
                element: node.name.clone(),
                detail: "constant operator requires `value`".into(),
            })?;
            self.constants.push(text.into_bytes());
        }
        self.push_reset(ResetEntry::Text {
            slot,
            value: value.map(String::into_bytes),
        });
        self.add_pmap_bits(pmap_bits(op, optional));
        self.push_token(Token::field(ty, op, optional, slot))
    }

    fn emit_decimal(&mut self, node: &Node) -> Result<(), CodecError> {
        let optional = node.is_optional();
        let exponent = node.children.iter().find(|n| n.name == "exponent");
        let mantissa = node.children.iter().find(|n| n.name == "mantissa");
        let ((exp_op, exp_value), (mant_op, mant_value)) = match (exponent, mantissa) {
            (Some(exp), Some(mant)) => (operator_of(exp)?, operator_of(mant)?),
            (None, None) => {
                // A single operator child applies to both subfields.
                let shared = operator_of(node)?;
                ((shared.0, shared.1), (shared.0, None))
            }
            _ => {
                let name = node.attr("name").unwrap_or("decimal").to_string();
                return Err(CatalogError::DecimalSubfieldMissing(name).into());
            }
        };

        validate_int_op(node, exp_op, exp_value.as_deref())?;
        validate_int_op(node, mant_op, mant_value.as_deref())?;

        let exp_slot = self.int32_next;
        self.int32_next += 1;
        let exp_value = match exp_value {
            Some(text) => Some(parse_i64(node, &text)? as i32),
            None => None,
        };
        self.push_reset(ResetEntry::Int32 {
            slot: exp_slot,
            value: exp_value.unwrap_or(0),
            state: if exp_value.is_some() {
                SlotState::Assigned
            } else {
                SlotState::Undefined
            },
        });
        let mant_slot = self.alloc_int64(node, mant_value.as_deref())?;

        self.add_pmap_bits(pmap_bits(exp_op, optional) + pmap_bits(mant_op, false));
        self.push_token(Token::field(TypeTag::Decimal, exp_op, optional, exp_slot))?;
        self.push_token(Token::field(TypeTag::Int64, mant_op, false, mant_slot).as_subfield())
    }

    fn emit_sequence(&mut self, node: &Node) -> Result<(), CodecError> {
        let optional = node.is_optional();
        let length = node
            .children
            .first()
            .filter(|n| n.name == "length")
            .ok_or_else(|| CatalogError::BadAttribute {
                element: "sequence".into(),
                detail: "first child must be <length>".into(),
            })?;
        let (op, value) = operator_of(length)?;
        validate_int_op(length, op, value.as_deref())?;
        let slot = self.int32_next;
        self.int32_next += 1;
        let value = match value {
            Some(text) => Some(parse_i64(length, &text)? as i32),
            None => None,
        };
        self.push_reset(ResetEntry::Int32 {
            slot,
            value: value.unwrap_or(0),
            state: if value.is_some() {
                SlotState::Assigned
            } else {
                SlotState::Undefined
            },
        });
        self.add_pmap_bits(pmap_bits(op, optional));
        self.push_token(Token::field(TypeTag::GroupLength, op, optional, slot))?;

        self.open_group(GroupFlags::empty());
        for field in &node.children[1..] {
            self.emit_field(field)?;
        }
        self.close_group(GroupFlags::empty(), false)
    }

    fn emit_group(&mut self, node: &Node) -> Result<(), CodecError> {
        let optional = node.is_optional();
        if optional {
            // Group presence itself takes one bit in the enclosing map.
            self.add_pmap_bits(1);
        }
        self.open_group(GroupFlags::empty());
        for field in &node.children {
            self.emit_field(field)?;
        }
        self.close_group(GroupFlags::empty(), optional)
    }

    fn push_token(&mut self, token: Token) -> Result<(), CodecError> {
        if token.instance() >= Token::MAX_INSTANCE
            || self.int32_next > Token::MAX_INSTANCE
            || self.int64_next > Token::MAX_INSTANCE
            || self.text_next > Token::MAX_INSTANCE
        {
            return Err(CatalogError::InstanceOverflow.into());
        }
        self.tokens.push(token);
        Ok(())
    }

    fn push_reset(&mut self, entry: ResetEntry) {
        if let Some(idx) = self.scoped_group {
            self.reset_groups[idx].entries.push(entry.clone());
        }
        self.global_entries.push(entry);
    }
}

/// Operators valid on integer (and decimal subfield) shapes.
fn validate_int_op(node: &Node, op: OpTag, value: Option<&str>) -> Result<(), CodecError> {
    if op == OpTag::Tail {
        return Err(CatalogError::BadAttribute {
            element: node.name.clone(),
            detail: "tail operator is only valid on text fields".into(),
        }
        .into());
    }
    if op == OpTag::Constant && value.is_none() {
        return Err(CatalogError::BadAttribute {
            element: node.name.clone(),
            detail: "constant operator requires `value`".into(),
        }
        .into());
    }
    Ok(())
}

/// Operators valid on text and byte-vector shapes.
fn validate_text_op(node: &Node, op: OpTag) -> Result<(), CodecError> {
    if op == OpTag::Increment {
        return Err(CatalogError::BadAttribute {
            element: node.name.clone(),
            detail: "increment operator is only valid on integer fields".into(),
        }
        .into());
    }
    Ok(())
}

fn operator_of(node: &Node) -> Result<(OpTag, Option<String>), CodecError> {
    for child in &node.children {
        let op = match child.name.as_str() {
            "constant" => OpTag::Constant,
            "default" => OpTag::Default,
            "copy" => OpTag::Copy,
            "increment" => OpTag::Increment,
            "delta" => OpTag::Delta,
            "tail" => OpTag::Tail,
            _ => continue,
        };
        return Ok((op, child.attr("value").map(str::to_owned)));
    }
    Ok((OpTag::None, None))
}

fn parse_i64(node: &Node, text: &str) -> Result<i64, CodecError> {
    text.parse::<i64>()
        .or_else(|_| text.parse::<u64>().map(|v| v as i64))
        .map_err(|_| {
            CatalogError::BadAttribute {
                element: node.name.clone(),
                detail: format!("non-numeric value `{text}`"),
            }
            .into()
        })
}
