//! Per-instance byte storage backing the string operators.
//!
//! Copy, delta and tail operators need the previous value of every text
//! field. All of them live in one flat backing array with per-slot
//! `(start, length, capacity)` records; a slot that outgrows its capacity
//! is relocated to the free tail region, and the array is compacted when
//! the dead space left behind eats the headroom.

/// Gap-buffer byte heap with fixed slot identity.
#[derive(Debug)]
pub struct LocalHeap {
    data: Vec<u8>,
    slots: Vec<Slot>,
    /// Start of the free tail region.
    free: usize,
    scratch: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    start: usize,
    len: usize,
    cap: usize,
}

impl LocalHeap {
    /// Heap with `slot_count` slots of `slot_capacity` initial bytes each.
    pub fn new(slot_count: usize, slot_capacity: usize) -> Self {
        let cap = slot_capacity.max(8);
        let slots: Vec<Slot> = (0..slot_count)
            .map(|i| Slot {
                start: i * cap,
                len: 0,
                cap,
            })
            .collect();
        let free = slot_count * cap;
        Self {
            // Half again as much as the slots claim, so early growth does
            // not immediately compact.
            data: vec![0; free + free / 2 + cap],
            slots,
            free,
            scratch: Vec::new(),
        }
    }

    /// Number of slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Current bytes of `idx`.
    pub fn get(&self, idx: usize) -> &[u8] {
        let slot = self.slots[idx];
        &self.data[slot.start..slot.start + slot.len]
    }

    /// A sub-range view of `idx`.
    pub fn get_range(&self, idx: usize, offset: usize, len: usize) -> &[u8] {
        let slot = self.slots[idx];
        debug_assert!(offset + len <= slot.len);
        &self.data[slot.start + offset..slot.start + offset + len]
    }

    /// Byte length of `idx`.
    pub fn len(&self, idx: usize) -> usize {
        self.slots[idx].len
    }

    /// Whether `idx` holds zero bytes.
    pub fn is_empty(&self, idx: usize) -> bool {
        self.slots[idx].len == 0
    }

    /// Whether `idx` equals `bytes`.
    pub fn equals(&self, idx: usize, bytes: &[u8]) -> bool {
        self.get(idx) == bytes
    }

    /// Replace the contents of `idx`.
    pub fn set(&mut self, idx: usize, bytes: &[u8]) {
        if bytes.len() > self.slots[idx].cap {
            self.relocate(idx, bytes.len(), 0);
        }
        let slot = self.slots[idx];
        self.data[slot.start..slot.start + bytes.len()].copy_from_slice(bytes);
        self.slots[idx].len = bytes.len();
    }

    /// Keep the first `common_prefix` bytes of `idx` and replace the rest
    /// with `source`.
    pub fn set_tail(&mut self, idx: usize, source: &[u8], common_prefix: usize) {
        debug_assert!(common_prefix <= self.slots[idx].len);
        let new_len = common_prefix + source.len();
        if new_len > self.slots[idx].cap {
            self.relocate(idx, new_len, common_prefix);
        }
        let slot = self.slots[idx];
        self.data[slot.start + common_prefix..slot.start + new_len].copy_from_slice(source);
        self.slots[idx].len = new_len;
    }

    /// Keep the last `common_suffix` bytes of `idx` and replace the front
    /// with `source`.
    pub fn set_head(&mut self, idx: usize, source: &[u8], common_suffix: usize) {
        let slot = self.slots[idx];
        debug_assert!(common_suffix <= slot.len);
        let new_len = source.len() + common_suffix;
        self.scratch.clear();
        self.scratch
            .extend_from_slice(&self.data[slot.start + slot.len - common_suffix..slot.start + slot.len]);
        if new_len > slot.cap {
            self.relocate(idx, new_len, 0);
        }
        let slot = self.slots[idx];
        self.data[slot.start..slot.start + source.len()].copy_from_slice(source);
        self.data[slot.start + source.len()..slot.start + new_len].copy_from_slice(&self.scratch);
        self.slots[idx].len = new_len;
    }

    /// Empty the slot.
    pub fn clear(&mut self, idx: usize) {
        self.slots[idx].len = 0;
    }

    /// Move `idx` to a fresh region of at least `needed` bytes, keeping
    /// its first `preserve` bytes.
    fn relocate(&mut self, idx: usize, needed: usize, preserve: usize) {
        let new_cap = needed.max(self.slots[idx].cap * 2);
        if self.free + new_cap > self.data.len()
            || self.data.len() - self.free < self.data.len() / 8
        {
            self.compact(new_cap);
        }
        let old = self.slots[idx];
        let start = self.free;
        self.data.copy_within(old.start..old.start + preserve, start);
        self.slots[idx] = Slot {
            start,
            len: preserve,
            cap: new_cap,
        };
        self.free += new_cap;
    }

    /// Rewrite every slot tightly at the front of a (possibly larger)
    /// backing array, retiring dead regions.
    fn compact(&mut self, extra: usize) {
        let live: usize = self.slots.iter().map(|slot| slot.cap).sum();
        let new_len = ((live + extra) * 2).max(self.data.len()).next_power_of_two();
        let mut new_data = vec![0; new_len];
        let mut cursor = 0;
        for slot in &mut self.slots {
            new_data[cursor..cursor + slot.len]
                .copy_from_slice(&self.data[slot.start..slot.start + slot.len]);
            slot.start = cursor;
            cursor += slot.cap;
        }
        self.data = new_data;
        self.free = cursor;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get() {
        let mut heap = LocalHeap::new(4, 8);
        heap.set(0, b"alpha");
        heap.set(1, b"beta");
        assert_eq!(heap.get(0), b"alpha");
        assert_eq!(heap.get(1), b"beta");
        assert_eq!(heap.get_range(0, 1, 3), b"lph");
    }

    #[rstest::rstest]
    #[case(b"abcdef".as_slice(), b"XY".as_slice(), 4, b"abcdXY".as_slice())]
    #[case(b"abcdef", b"", 6, b"abcdef")]
    #[case(b"abcdef", b"Z", 0, b"Z")]
    #[case(b"", b"new", 0, b"new")]
    fn tail_replacement_keeps_prefix(
        #[case] initial: &[u8],
        #[case] source: &[u8],
        #[case] prefix: usize,
        #[case] expected: &[u8],
    ) {
        let mut heap = LocalHeap::new(2, 8);
        heap.set(0, initial);
        heap.set_tail(0, source, prefix);
        assert_eq!(heap.get(0), expected);
    }

    #[test]
    fn consecutive_tail_writes_compose() {
        let mut heap = LocalHeap::new(2, 8);
        heap.set(0, b"abcdef");
        heap.set_tail(0, b"XY", 4);
        // The second write computes against the new value.
        heap.set_tail(0, b"Z", 5);
        assert_eq!(heap.get(0), b"abcdXZ");
    }

    #[test]
    fn head_replacement_keeps_suffix() {
        let mut heap = LocalHeap::new(2, 8);
        heap.set(0, b"abcdef");
        heap.set_head(0, b"XY", 3);
        assert_eq!(heap.get(0), b"XYdef");
    }

    #[test]
    fn growth_relocates_and_preserves() {
        let mut heap = LocalHeap::new(3, 8);
        heap.set(0, b"12345678");
        heap.set(1, b"keep");
        heap.set_tail(0, b"ABCDEFGHIJKL", 8);
        assert_eq!(heap.get(0), b"12345678ABCDEFGHIJKL");
        assert_eq!(heap.get(1), b"keep");
    }

    #[test]
    fn repeated_growth_compacts_without_losing_slots() {
        let mut heap = LocalHeap::new(4, 8);
        for round in 0..64 {
            let payload = vec![b'a' + (round % 26) as u8; 8 + round as usize];
            heap.set(round as usize % 4, &payload);
            assert_eq!(heap.get(round as usize % 4), payload.as_slice());
        }
        // All four slots still intact after many relocations.
        for idx in 0..4 {
            assert!(heap.len(idx) > 0);
        }
    }
}
