//! Type and operator tags carried by every token.

use core::fmt;

/// Failed to unpack a raw token: unknown type tag or operator nibble.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InvalidToken;

impl fmt::Display for InvalidToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid token")
    }
}

#[cfg(feature = "std")]
impl std::error::Error for InvalidToken {}

/// Base type of a field token.
///
/// Optionality is not part of the tag; it is a separate bit in the packed
/// form so that the dispatch index stays `(type << 4 | op) << 1 | optional`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum TypeTag {
    /// 32-bit integer, one slab slot.
    Int32 = 0x00,
    /// 64-bit integer, two slab slots MSB-first.
    Int64 = 0x01,
    /// Scaled decimal: exponent subfield followed by a mantissa subfield.
    Decimal = 0x02,
    /// ASCII text, blob-backed.
    Ascii = 0x03,
    /// UTF-8 text, blob-backed.
    Utf8 = 0x04,
    /// Opaque byte vector, blob-backed.
    ByteVec = 0x05,
    /// Sequence length field; the repeated group follows immediately.
    GroupLength = 0x06,
    /// Group bracket. The operator nibble holds [`GroupFlags`] and the
    /// instance field holds the token distance to the matching bracket.
    Group = 0x07,
    /// Dictionary reset marker; the instance field indexes a reset group.
    Dictionary = 0x08,
}

impl TypeTag {
    /// Number of distinct type tags.
    pub const COUNT: usize = 9;

    /// True for the three blob-backed types.
    pub const fn is_text_or_bytes(self) -> bool {
        matches!(self, Self::Ascii | Self::Utf8 | Self::ByteVec)
    }

    /// True for tokens that describe a wire field rather than script
    /// structure.
    pub const fn is_field(self) -> bool {
        !matches!(self, Self::Group | Self::Dictionary)
    }
}

impl TryFrom<u8> for TypeTag {
    type Error = InvalidToken;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Self::Int32),
            0x01 => Ok(Self::Int64),
            0x02 => Ok(Self::Decimal),
            0x03 => Ok(Self::Ascii),
            0x04 => Ok(Self::Utf8),
            0x05 => Ok(Self::ByteVec),
            0x06 => Ok(Self::GroupLength),
            0x07 => Ok(Self::Group),
            0x08 => Ok(Self::Dictionary),
            _ => Err(InvalidToken),
        }
    }
}

/// Compression operator applied to a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::EnumIter)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum OpTag {
    /// Value always on the wire, no dictionary interaction on encode.
    None = 0x0,
    /// Declared constant; mandatory form never touches the wire.
    Constant = 0x1,
    /// One PMap bit selects the declared default or a fresh wire value.
    Default = 0x2,
    /// One PMap bit selects the previous dictionary value or a fresh one.
    Copy = 0x3,
    /// One PMap bit selects previous-plus-one or a fresh wire value.
    Increment = 0x4,
    /// Signed difference against the dictionary value, no PMap bit.
    Delta = 0x5,
    /// One PMap bit selects reuse or a replaced suffix (strings only).
    Tail = 0x6,
}

impl OpTag {
    /// Number of distinct operator tags.
    pub const COUNT: usize = 7;
}

impl TryFrom<u8> for OpTag {
    type Error = InvalidToken;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Self::None),
            0x1 => Ok(Self::Constant),
            0x2 => Ok(Self::Default),
            0x3 => Ok(Self::Copy),
            0x4 => Ok(Self::Increment),
            0x5 => Ok(Self::Delta),
            0x6 => Ok(Self::Tail),
            _ => Err(InvalidToken),
        }
    }
}

bitflags::bitflags! {
    /// Structure bits carried in the operator nibble of a `Group` token.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct GroupFlags: u8 {
        /// Opening bracket.
        const OPEN = 0b0001;
        /// Closing bracket.
        const CLOSE = 0b0010;
        /// The group carries its own presence map.
        const PMAP = 0b0100;
        /// The group is a template body (message boundary).
        const TEMPLATE = 0b1000;
    }
}
