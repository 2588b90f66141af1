//! Precomputed per-type and per-operator lookup tables.

use crate::tag::{OpTag, TypeTag};

/// Slab slots occupied by the fragment header (the message index).
pub const FRAGMENT_HEADER_SLOTS: usize = 1;

/// Slab slots occupied by the fragment trailer (blob bytes consumed).
pub const FRAGMENT_TRAILER_SLOTS: usize = 1;

/// Slab slots a field of the given type occupies in a ring fragment.
///
/// Longs are two slots MSB-first, decimals are exponent plus a two-slot
/// mantissa, and blob-backed types are a `{meta, length}` pair.
pub const fn slot_width(ty: TypeTag) -> usize {
    match ty {
        TypeTag::Int32 | TypeTag::GroupLength => 1,
        TypeTag::Int64 => 2,
        TypeTag::Decimal => 3,
        TypeTag::Ascii | TypeTag::Utf8 | TypeTag::ByteVec => 2,
        TypeTag::Group | TypeTag::Dictionary => 0,
    }
}

/// Presence-map bits one field with this operator consumes.
pub const fn pmap_bits(op: OpTag, optional: bool) -> u32 {
    match op {
        OpTag::None | OpTag::Delta => 0,
        OpTag::Constant => optional as u32,
        OpTag::Default | OpTag::Copy | OpTag::Increment | OpTag::Tail => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Token;
    use strum::IntoEnumIterator;

    #[test]
    fn pmap_table_matches_token_method() {
        for ty in TypeTag::iter().filter(|t| t.is_field()) {
            for op in OpTag::iter() {
                for optional in [false, true] {
                    let token = Token::field(ty, op, optional, 0);
                    assert_eq!(
                        pmap_bits(op, optional) == 1,
                        token.uses_pmap_bit(),
                        "{ty:?}/{op:?}/{optional}"
                    );
                }
            }
        }
    }

    #[test]
    fn structural_tokens_take_no_slots() {
        assert_eq!(slot_width(TypeTag::Group), 0);
        assert_eq!(slot_width(TypeTag::Dictionary), 0);
    }
}
