//! The 32-bit packed token and its unpacked view.

use crate::tag::{GroupFlags, InvalidToken, OpTag, TypeTag};

/// Wire-of-catalog form of a token.
pub type RawToken = u32;

const TYPE_SHIFT: u32 = 27;
const OP_SHIFT: u32 = 23;
const OP_MASK: u32 = 0x0F;
const OPTIONAL_BIT: u32 = 1 << 22;
const ABSENT_BIT: u32 = 1 << 21;
const SUBFIELD_BIT: u32 = 1 << 20;
const INSTANCE_MASK: u32 = 0x000F_FFFF;

/// A catalog script entry.
///
/// Packed layout, MSB first:
///
/// ```text
/// | type:5 | op:4 | optional:1 | absent:1 | subfield:1 | instance:20 |
/// ```
///
/// For `Group` tokens the operator nibble holds [`GroupFlags`] and the
/// instance field holds the token distance to the matching bracket. For
/// every other type the instance field is a dictionary slot index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Token {
    ty: TypeTag,
    op: u8,
    optional: bool,
    absent_override: bool,
    subfield: bool,
    instance: u32,
}

impl Token {
    /// Largest encodable instance index.
    pub const MAX_INSTANCE: u32 = INSTANCE_MASK;

    /// A field token: wire type, operator, optionality and dictionary slot.
    ///
    /// Instance indices above [`Self::MAX_INSTANCE`] are truncated by the
    /// packed form, so the catalog loader must reject them first.
    pub const fn field(ty: TypeTag, op: OpTag, optional: bool, instance: u32) -> Self {
        Self {
            ty,
            op: op as u8,
            optional,
            absent_override: false,
            subfield: false,
            instance: instance & INSTANCE_MASK,
        }
    }

    /// A group bracket spanning `span` tokens to its partner.
    pub const fn group(flags: GroupFlags, span: u32) -> Self {
        Self {
            ty: TypeTag::Group,
            op: flags.bits(),
            optional: false,
            absent_override: false,
            subfield: false,
            instance: span & INSTANCE_MASK,
        }
    }

    /// A dictionary reset marker referencing `reset_group`.
    pub const fn dictionary(reset_group: u32) -> Self {
        Self {
            ty: TypeTag::Dictionary,
            op: OpTag::None as u8,
            optional: false,
            absent_override: false,
            subfield: false,
            instance: reset_group & INSTANCE_MASK,
        }
    }

    /// Mark this token as the mantissa half of a decimal pair.
    pub const fn as_subfield(mut self) -> Self {
        self.subfield = true;
        self
    }

    /// Mark this token optional (group brackets of optional groups).
    pub const fn as_optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Mark this token as using the catalog's configured absent sentinel.
    pub const fn with_absent_override(mut self) -> Self {
        self.absent_override = true;
        self
    }

    /// Base type.
    pub const fn type_tag(&self) -> TypeTag {
        self.ty
    }

    /// Operator, for field tokens.
    ///
    /// Group tokens keep flags in the operator nibble; calling this on one
    /// returns whatever operator shares the bit pattern.
    pub fn op(&self) -> OpTag {
        debug_assert!(!matches!(self.ty, TypeTag::Group));
        match OpTag::try_from(self.op) {
            Ok(op) => op,
            Err(_) => OpTag::None,
        }
    }

    /// Group flags, for `Group` tokens.
    pub const fn group_flags(&self) -> GroupFlags {
        GroupFlags::from_bits_truncate(self.op)
    }

    /// Whether the field is optional on the wire.
    pub const fn is_optional(&self) -> bool {
        self.optional
    }

    /// Whether the catalog's configured absent sentinel replaces the
    /// default null representation for this field.
    pub const fn absent_override(&self) -> bool {
        self.absent_override
    }

    /// Whether this token is the mantissa half of a decimal pair.
    pub const fn is_subfield(&self) -> bool {
        self.subfield
    }

    /// Dictionary slot index, or bracket span for group tokens.
    pub const fn instance(&self) -> u32 {
        self.instance
    }

    /// Dense dispatch index: `(type << 4 | op) << 1 | optional`.
    pub const fn dispatch_index(&self) -> usize {
        ((((self.ty as usize) << 4) | self.op as usize) << 1) | self.optional as usize
    }

    /// Whether this token consumes a presence-map bit, on both the decode
    /// and the encode side. The table is fixed by the protocol; encoder
    /// and decoder desynchronize silently if they ever disagree.
    pub fn uses_pmap_bit(&self) -> bool {
        if !self.ty.is_field() {
            return false;
        }
        match self.op() {
            OpTag::None | OpTag::Delta => false,
            OpTag::Constant => self.optional,
            OpTag::Default | OpTag::Copy | OpTag::Increment | OpTag::Tail => true,
        }
    }

    /// Pack into the 32-bit catalog form.
    pub const fn pack(&self) -> RawToken {
        ((self.ty as u32) << TYPE_SHIFT)
            | (((self.op as u32) & OP_MASK) << OP_SHIFT)
            | if self.optional { OPTIONAL_BIT } else { 0 }
            | if self.absent_override { ABSENT_BIT } else { 0 }
            | if self.subfield { SUBFIELD_BIT } else { 0 }
            | (self.instance & INSTANCE_MASK)
    }

    /// Unpack from the 32-bit catalog form, validating both tags.
    pub fn unpack(raw: RawToken) -> Result<Self, InvalidToken> {
        let ty = TypeTag::try_from((raw >> TYPE_SHIFT) as u8)?;
        let op = ((raw >> OP_SHIFT) & OP_MASK) as u8;
        if !matches!(ty, TypeTag::Group) {
            // Field operators must be a known tag; group flag nibbles are
            // free-form within the four defined bits.
            OpTag::try_from(op)?;
        }
        Ok(Self {
            ty,
            op,
            optional: raw & OPTIONAL_BIT != 0,
            absent_override: raw & ABSENT_BIT != 0,
            subfield: raw & SUBFIELD_BIT != 0,
            instance: raw & INSTANCE_MASK,
        })
    }
}

impl From<Token> for RawToken {
    fn from(token: Token) -> Self {
        token.pack()
    }
}

impl TryFrom<RawToken> for Token {
    type Error = InvalidToken;

    fn try_from(raw: RawToken) -> Result<Self, Self::Error> {
        Self::unpack(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use strum::IntoEnumIterator;

    proptest! {
        #[test]
        fn pack_unpack_identity(raw in 0u32..=u32::MAX) {
            let token = Token::unpack(raw);
            prop_assume!(token.is_ok());
            let token = token.unwrap();
            prop_assert_eq!(token.pack(), raw);
            prop_assert_eq!(Token::unpack(token.pack()).unwrap(), token);
        }
    }

    #[test]
    fn field_tokens_round_trip() {
        for ty in TypeTag::iter() {
            if !ty.is_field() {
                continue;
            }
            for op in OpTag::iter() {
                for optional in [false, true] {
                    for instance in [0, 1, 0x7F, Token::MAX_INSTANCE] {
                        let token = Token::field(ty, op, optional, instance);
                        let back = Token::unpack(token.pack()).unwrap();
                        assert_eq!(back, token);
                        assert_eq!(back.type_tag(), ty);
                        assert_eq!(back.op(), op);
                        assert_eq!(back.is_optional(), optional);
                        assert_eq!(back.instance(), instance);
                    }
                }
            }
        }
    }

    #[test]
    fn group_tokens_keep_flags_and_span() {
        let flags = GroupFlags::OPEN | GroupFlags::PMAP | GroupFlags::TEMPLATE;
        let token = Token::group(flags, 52);
        let back = Token::unpack(token.pack()).unwrap();
        assert_eq!(back.group_flags(), flags);
        assert_eq!(back.instance(), 52);
        assert!(!back.uses_pmap_bit());
    }

    #[test]
    fn subfield_and_absent_bits_survive_packing() {
        let token = Token::field(TypeTag::Int64, OpTag::Delta, false, 7)
            .as_subfield()
            .with_absent_override();
        let back = Token::unpack(token.pack()).unwrap();
        assert!(back.is_subfield());
        assert!(back.absent_override());
    }

    #[rstest::rstest]
    #[case(OpTag::None, false, false)]
    #[case(OpTag::None, true, false)]
    #[case(OpTag::Constant, false, false)]
    #[case(OpTag::Constant, true, true)]
    #[case(OpTag::Default, false, true)]
    #[case(OpTag::Default, true, true)]
    #[case(OpTag::Copy, false, true)]
    #[case(OpTag::Copy, true, true)]
    #[case(OpTag::Increment, false, true)]
    #[case(OpTag::Increment, true, true)]
    #[case(OpTag::Delta, false, false)]
    #[case(OpTag::Delta, true, false)]
    #[case(OpTag::Tail, false, true)]
    #[case(OpTag::Tail, true, true)]
    fn pmap_bit_table_is_the_fast_matrix(
        #[case] op: OpTag,
        #[case] optional: bool,
        #[case] expected: bool,
    ) {
        let token = Token::field(TypeTag::Int32, op, optional, 0);
        assert_eq!(token.uses_pmap_bit(), expected, "{op:?}/{optional}");
    }
}
