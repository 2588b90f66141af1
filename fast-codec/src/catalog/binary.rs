//! Catalog binary image: build once from XML, reload anywhere.
//!
//! All multi-byte fields are little-endian. The image stores only the
//! serialized core (header, tokens, template windows, reset groups,
//! constants, bounds, dictionary sizes); every derived table is recomputed
//! on load so the XML and binary paths cannot drift apart.

use crate::catalog::{Catalog, TemplateEntry};
use crate::dictionary::{ResetEntry, ResetGroup, SlotState};
use crate::error::CatalogError;

const MAGIC: &[u8; 8] = b"FASTCAT0";
const VERSION: u32 = 2;

const KIND_INT32: u8 = 0;
const KIND_INT64: u8 = 1;
const KIND_TEXT: u8 = 2;

impl Catalog {
    /// Serialize to the portable binary image.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CatalogError> {
        let mut out = Vec::with_capacity(1024);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&(self.templates().len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.script_len() as u32).to_le_bytes());
        out.extend_from_slice(&(self.max_pmap_bytes() as u32).to_le_bytes());

        for raw in self.script() {
            out.extend_from_slice(&raw.to_le_bytes());
        }
        for template in self.templates() {
            out.extend_from_slice(&template.id.to_le_bytes());
            out.extend_from_slice(&template.start.to_le_bytes());
            out.extend_from_slice(&template.limit.to_le_bytes());
        }

        let groups = self.reset_groups();
        out.extend_from_slice(&(groups.len() as u32).to_le_bytes());
        for group in groups {
            write_str(&mut out, &group.name)?;
            out.extend_from_slice(&(group.entries.len() as u32).to_le_bytes());
            for entry in &group.entries {
                write_entry(&mut out, entry)?;
            }
        }

        out.extend_from_slice(&(self.constants().len() as u32).to_le_bytes());
        for constant in self.constants() {
            write_blob(&mut out, constant)?;
        }

        out.extend_from_slice(&self.max_text_len().to_le_bytes());
        out.extend_from_slice(&self.max_byte_vector_len().to_le_bytes());
        let (int32_slots, int64_slots, text_slots) = self.dictionary_sizes();
        out.extend_from_slice(&int32_slots.to_le_bytes());
        out.extend_from_slice(&int64_slots.to_le_bytes());
        out.extend_from_slice(&text_slots.to_le_bytes());
        Ok(out)
    }

    /// Rebuild a catalog from its binary image.
    pub fn from_bytes(image: &[u8]) -> Result<Self, CatalogError> {
        let mut cur = Cursor::new(image);
        if cur.take(8)? != MAGIC {
            return Err(CatalogError::BadMagic);
        }
        let version = cur.u32()?;
        if version != VERSION {
            return Err(CatalogError::UnsupportedVersion(version));
        }
        let template_count = cur.u32()? as usize;
        let script_len = cur.u32()? as usize;
        let max_pmap_bytes = cur.u32()?;

        let mut script = Vec::with_capacity(script_len);
        for _ in 0..script_len {
            script.push(cur.u32()?);
        }
        let mut windows = Vec::with_capacity(template_count);
        for _ in 0..template_count {
            let id = cur.u32()?;
            let start = cur.u32()?;
            let limit = cur.u32()?;
            windows.push((id, start, limit));
        }

        let group_count = cur.u32()? as usize;
        let mut reset_groups = Vec::with_capacity(group_count);
        for _ in 0..group_count {
            let name = cur.string()?;
            let entry_count = cur.u32()? as usize;
            let mut entries = Vec::with_capacity(entry_count);
            for _ in 0..entry_count {
                entries.push(cur.entry()?);
            }
            reset_groups.push(ResetGroup { name, entries });
        }

        let constant_count = cur.u32()? as usize;
        let mut constants = Vec::with_capacity(constant_count);
        for _ in 0..constant_count {
            constants.push(cur.blob()?);
        }

        let max_text_len = cur.u32()?;
        let max_byte_vector_len = cur.u32()?;
        let int32_slots = cur.u32()?;
        let int64_slots = cur.u32()?;
        let text_slots = cur.u32()?;

        let templates = windows
            .into_iter()
            .map(|(id, start, limit)| {
                let name = format!("template:{id}");
                let reset_group = reset_groups
                    .iter()
                    .position(|g| g.name == name)
                    .ok_or(CatalogError::Truncated)?;
                Ok(TemplateEntry {
                    id,
                    start,
                    limit,
                    reset_group: reset_group as u32,
                })
            })
            .collect::<Result<Vec<_>, CatalogError>>()?;

        Catalog::assemble(
            script,
            templates,
            reset_groups,
            constants,
            max_pmap_bytes,
            max_text_len,
            max_byte_vector_len,
            int32_slots,
            int64_slots,
            text_slots,
        )
    }
}

fn write_str(out: &mut Vec<u8>, text: &str) -> Result<(), CatalogError> {
    write_blob(out, text.as_bytes())
}

fn write_blob(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), CatalogError> {
    let len = u16::try_from(bytes.len()).map_err(|_| CatalogError::InstanceOverflow)?;
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn write_entry(out: &mut Vec<u8>, entry: &ResetEntry) -> Result<(), CatalogError> {
    let slot16 = |slot: u32| u16::try_from(slot).map_err(|_| CatalogError::InstanceOverflow);
    match entry {
        ResetEntry::Int32 { slot, value, state } => {
            out.push(KIND_INT32);
            out.extend_from_slice(&slot16(*slot)?.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
            out.push(state_byte(*state));
        }
        ResetEntry::Int64 { slot, value, state } => {
            out.push(KIND_INT64);
            out.extend_from_slice(&slot16(*slot)?.to_le_bytes());
            out.extend_from_slice(&value.to_le_bytes());
            out.push(state_byte(*state));
        }
        ResetEntry::Text { slot, value } => {
            out.push(KIND_TEXT);
            out.extend_from_slice(&slot16(*slot)?.to_le_bytes());
            match value {
                None => out.push(0),
                Some(bytes) => {
                    out.push(1);
                    write_blob(out, bytes)?;
                }
            }
        }
    }
    Ok(())
}

fn state_byte(state: SlotState) -> u8 {
    match state {
        SlotState::Undefined => 0,
        SlotState::Assigned => 1,
        SlotState::Null => 2,
    }
}

fn state_from(byte: u8) -> Result<SlotState, CatalogError> {
    match byte {
        0 => Ok(SlotState::Undefined),
        1 => Ok(SlotState::Assigned),
        2 => Ok(SlotState::Null),
        _ => Err(CatalogError::Truncated),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], CatalogError> {
        let end = self.pos.checked_add(len).ok_or(CatalogError::Truncated)?;
        let slice = self.data.get(self.pos..end).ok_or(CatalogError::Truncated)?;
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self) -> Result<u8, CatalogError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CatalogError> {
        let bytes = self.take(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn u32(&mut self) -> Result<u32, CatalogError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn i32(&mut self) -> Result<i32, CatalogError> {
        Ok(self.u32()? as i32)
    }

    fn i64(&mut self) -> Result<i64, CatalogError> {
        let bytes: [u8; 8] = self.take(8)?.try_into().map_err(|_| CatalogError::Truncated)?;
        Ok(i64::from_le_bytes(bytes))
    }

    fn blob(&mut self) -> Result<Vec<u8>, CatalogError> {
        let len = self.u16()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    fn string(&mut self) -> Result<String, CatalogError> {
        String::from_utf8(self.blob()?).map_err(|_| CatalogError::Truncated)
    }

    fn entry(&mut self) -> Result<ResetEntry, CatalogError> {
        match self.u8()? {
            KIND_INT32 => {
                let slot = u32::from(self.u16()?);
                let value = self.i32()?;
                let state = state_from(self.u8()?)?;
                Ok(ResetEntry::Int32 { slot, value, state })
            }
            KIND_INT64 => {
                let slot = u32::from(self.u16()?);
                let value = self.i64()?;
                let state = state_from(self.u8()?)?;
                Ok(ResetEntry::Int64 { slot, value, state })
            }
            KIND_TEXT => {
                let slot = u32::from(self.u16()?);
                let value = match self.u8()? {
                    0 => None,
                    1 => Some(self.blob()?),
                    _ => return Err(CatalogError::Truncated),
                };
                Ok(ResetEntry::Text { slot, value })
            }
            _ => Err(CatalogError::Truncated),
        }
    }
}
