//! Operator dictionaries: per-instance previous values and reset rules.

use crate::heap::LocalHeap;

/// What a dictionary slot currently holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlotState {
    /// Never assigned since the last applicable reset.
    #[default]
    Undefined,
    /// Holds a concrete value.
    Assigned,
    /// Known to be null (optional fields only).
    Null,
}

/// One slot's reset action, precomputed by the catalog loader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResetEntry {
    /// Restore an int32 slot.
    Int32 {
        /// Slot index.
        slot: u32,
        /// Initial value (meaningful when `state` is `Assigned`).
        value: i32,
        /// Initial state.
        state: SlotState,
    },
    /// Restore an int64 slot.
    Int64 {
        /// Slot index.
        slot: u32,
        /// Initial value (meaningful when `state` is `Assigned`).
        value: i64,
        /// Initial state.
        state: SlotState,
    },
    /// Restore a text slot.
    Text {
        /// Slot index.
        slot: u32,
        /// Initial bytes, or `None` for undefined.
        value: Option<Vec<u8>>,
    },
}

/// A named set of reset actions executed on message boundaries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResetGroup {
    /// Scope name (`global`, `template:<id>`, or a declared name).
    pub name: String,
    /// Slot actions, in catalog order.
    pub entries: Vec<ResetEntry>,
}

/// The three parallel dictionaries of one codec instance.
///
/// Slot index comes from the token's instance field. The arrays are sized
/// by the catalog (`max(instance) + 1` per type) and never shared between
/// codec instances.
#[derive(Debug)]
pub struct Dictionary {
    int32: Vec<i32>,
    int32_state: Vec<SlotState>,
    int64: Vec<i64>,
    int64_state: Vec<SlotState>,
    text: LocalHeap,
    text_state: Vec<SlotState>,
}

impl Dictionary {
    /// Dictionary with the given slot counts; text slots start at
    /// `text_capacity` bytes each.
    pub fn new(int32_slots: usize, int64_slots: usize, text_slots: usize, text_capacity: usize) -> Self {
        Self {
            int32: vec![0; int32_slots],
            int32_state: vec![SlotState::Undefined; int32_slots],
            int64: vec![0; int64_slots],
            int64_state: vec![SlotState::Undefined; int64_slots],
            text: LocalHeap::new(text_slots, text_capacity),
            text_state: vec![SlotState::Undefined; text_slots],
        }
    }

    /// Current int32 value and state.
    #[inline]
    pub fn int32(&self, slot: u32) -> (i32, SlotState) {
        (self.int32[slot as usize], self.int32_state[slot as usize])
    }

    /// Assign an int32 slot.
    #[inline]
    pub fn set_int32(&mut self, slot: u32, value: i32) {
        self.int32[slot as usize] = value;
        self.int32_state[slot as usize] = SlotState::Assigned;
    }

    /// Mark an int32 slot null.
    #[inline]
    pub fn set_int32_null(&mut self, slot: u32) {
        self.int32_state[slot as usize] = SlotState::Null;
    }

    /// Current int64 value and state.
    #[inline]
    pub fn int64(&self, slot: u32) -> (i64, SlotState) {
        (self.int64[slot as usize], self.int64_state[slot as usize])
    }

    /// Assign an int64 slot.
    #[inline]
    pub fn set_int64(&mut self, slot: u32, value: i64) {
        self.int64[slot as usize] = value;
        self.int64_state[slot as usize] = SlotState::Assigned;
    }

    /// Mark an int64 slot null.
    #[inline]
    pub fn set_int64_null(&mut self, slot: u32) {
        self.int64_state[slot as usize] = SlotState::Null;
    }

    /// Current text state.
    #[inline]
    pub fn text_state(&self, slot: u32) -> SlotState {
        self.text_state[slot as usize]
    }

    /// Current text bytes (meaningful when assigned).
    #[inline]
    pub fn text(&self, slot: u32) -> &[u8] {
        self.text.get(slot as usize)
    }

    /// Assign a text slot.
    pub fn set_text(&mut self, slot: u32, bytes: &[u8]) {
        self.text.set(slot as usize, bytes);
        self.text_state[slot as usize] = SlotState::Assigned;
    }

    /// Replace a text slot's suffix, keeping `common_prefix` bytes.
    pub fn set_text_tail(&mut self, slot: u32, source: &[u8], common_prefix: usize) {
        self.text.set_tail(slot as usize, source, common_prefix);
        self.text_state[slot as usize] = SlotState::Assigned;
    }

    /// Replace a text slot's front, keeping `common_suffix` bytes.
    pub fn set_text_head(&mut self, slot: u32, source: &[u8], common_suffix: usize) {
        self.text.set_head(slot as usize, source, common_suffix);
        self.text_state[slot as usize] = SlotState::Assigned;
    }

    /// Mark a text slot null.
    pub fn set_text_null(&mut self, slot: u32) {
        self.text_state[slot as usize] = SlotState::Null;
    }

    /// Apply one reset group.
    pub fn apply_reset(&mut self, group: &ResetGroup) {
        for entry in &group.entries {
            match entry {
                ResetEntry::Int32 { slot, value, state } => {
                    self.int32[*slot as usize] = *value;
                    self.int32_state[*slot as usize] = *state;
                }
                ResetEntry::Int64 { slot, value, state } => {
                    self.int64[*slot as usize] = *value;
                    self.int64_state[*slot as usize] = *state;
                }
                ResetEntry::Text { slot, value } => match value {
                    Some(bytes) => {
                        self.text.set(*slot as usize, bytes);
                        self.text_state[*slot as usize] = SlotState::Assigned;
                    }
                    None => {
                        self.text.clear(*slot as usize);
                        self.text_state[*slot as usize] = SlotState::Undefined;
                    }
                },
            }
        }
    }
}
